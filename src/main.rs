//! mission-orchestrator - CLI Entry Point
//!
//! Validates a plan file (JSON or YAML), runs it with the built-in tools and
//! prints the final mission as JSON.
//!
//! Usage: `mission-orchestrator <plan.json|plan.yaml>`

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use mission_orchestrator::{EngineConfig, MissionOrchestrator, MissionStatus, RawPlan, ToolRegistry};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mission_orchestrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Some(plan_path) = std::env::args().nth(1) else {
        bail!("usage: mission-orchestrator <plan.json|plan.yaml>");
    };

    let config = EngineConfig::from_env()?;
    info!(
        "Loaded configuration: workers={}, workspace={}",
        config.workers,
        config.workspace_path.display()
    );

    let registry = Arc::new(ToolRegistry::with_builtins(config.workspace_path.clone())?);
    let plan = load_plan(Path::new(&plan_path))?;
    let orchestrator = MissionOrchestrator::new(config, registry);

    let (result, handle) = orchestrator.submit_and_run(plan).await?;
    let Some(handle) = handle else {
        println!("{}", serde_json::to_string_pretty(&result.errors)?);
        bail!("plan rejected with {} error(s)", result.errors.len());
    };

    let status = tokio::select! {
        status = handle.wait() => status,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling mission {}", handle.mission_id());
            handle.cancel();
            handle.wait().await
        }
    };

    let mission = handle.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&mission)?);

    match status {
        MissionStatus::Completed | MissionStatus::CompletedWithFailures => Ok(()),
        other => bail!("mission {} ended {}", handle.mission_id(), other),
    }
}

fn load_plan(path: &Path) -> anyhow::Result<RawPlan> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan {}", path.display()))?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let plan = if is_yaml {
        RawPlan::from_yaml(&text).context("Invalid YAML plan")?
    } else {
        RawPlan::from_json(&text).context("Invalid JSON plan")?
    };
    Ok(plan)
}
