//! Scriptable tool for exercising the pipeline and orchestrator in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{InvocationContext, Tool, ToolError};

/// One scripted reaction.
pub(crate) enum Step {
    Ok(Value),
    Fail(ToolError),
    Sleep(Duration),
    Panic,
}

/// A tool that replays a script of outcomes, then echoes its arguments.
pub(crate) struct ScriptedTool {
    name: String,
    idempotent: bool,
    schema: Value,
    latency: Option<Duration>,
    script: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
}

impl ScriptedTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            idempotent: true,
            schema: json!({"type": "object"}),
            latency: None,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    /// Sleep this long before every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn then(self, step: Step) -> Self {
        self.script.lock().unwrap().push_back(step);
        self
    }

    pub fn then_fail(self, err: ToolError) -> Self {
        self.then(Step::Fail(err))
    }

    pub fn fail_times(mut self, n: usize, make: impl Fn() -> ToolError) -> Self {
        for _ in 0..n {
            self = self.then_fail(make());
        }
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted test tool"
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    async fn execute(&self, args: Value, ctx: &InvocationContext) -> Result<Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Ok(value)) => Ok(value),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Sleep(d)) => {
                tokio::time::sleep(d).await;
                Ok(json!({"slept_ms": d.as_millis() as u64}))
            }
            Some(Step::Panic) => panic!("scripted panic in {}", self.name),
            None => Ok(json!({"echo": args, "task": ctx.task_id.as_str(), "attempt": ctx.attempt})),
        }
    }
}
