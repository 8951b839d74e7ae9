//! Tool invocation pipeline.
//!
//! One attempt runs five stages, each usable on its own:
//!
//! 1. [`resolve`](ToolInvocationPipeline::resolve) the tool name
//! 2. [`validate_args`](ToolInvocationPipeline::validate_args) against its schema
//! 3. [`invoke`](ToolInvocationPipeline::invoke) the handler under breaker and timeout
//! 4. [`process_result`](ToolInvocationPipeline::process_result) into a `TaskResult`
//! 5. [`classify_error`](ToolInvocationPipeline::classify_error) on failure
//!
//! Only `invoke` has side effects, and only `invoke` feeds the breaker.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde_json::Value;

use crate::breaker::CircuitBreakerRegistry;
use crate::mission::TaskResult;
use crate::tools::{ErrorClass, InvocationContext, ToolDescriptor, ToolError, ToolRegistry};

/// A failed attempt with its classification.
#[derive(Debug)]
pub struct InvocationFailure {
    pub error: ToolError,
    pub class: ErrorClass,
}

impl InvocationFailure {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self.error, ToolError::CircuitOpen { .. })
    }
}

impl std::fmt::Display for InvocationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.error, self.class)
    }
}

/// Everything an attempt produced.
#[derive(Debug)]
pub struct Invocation {
    pub outcome: Result<TaskResult, InvocationFailure>,
    /// Wall time spent in the handler call
    pub latency_ms: u64,
}

pub struct ToolInvocationPipeline {
    registry: Arc<ToolRegistry>,
    breakers: CircuitBreakerRegistry,
    max_result_bytes: usize,
}

impl ToolInvocationPipeline {
    pub fn new(
        registry: Arc<ToolRegistry>,
        breakers: CircuitBreakerRegistry,
        max_result_bytes: usize,
    ) -> Self {
        Self {
            registry,
            breakers,
            max_result_bytes,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Run all stages for one attempt.
    pub async fn run(&self, tool_name: &str, args: &Value, ctx: &InvocationContext) -> Invocation {
        let started = Instant::now();
        let descriptor = match self.resolve(tool_name) {
            Ok(d) => d,
            Err(error) => {
                return Invocation {
                    outcome: Err(self.fail(None, error)),
                    latency_ms: 0,
                }
            }
        };

        let outcome = match Self::validate_args(&descriptor, args) {
            Ok(normalized) => match self.invoke(&descriptor, normalized, ctx).await {
                Ok(raw) => Ok(self.process_result(raw)),
                Err(error) => Err(self.fail(Some(&descriptor), error)),
            },
            Err(error) => Err(self.fail(Some(&descriptor), error)),
        };

        Invocation {
            outcome,
            latency_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn fail(&self, descriptor: Option<&ToolDescriptor>, error: ToolError) -> InvocationFailure {
        let class = Self::classify_error(descriptor, &error);
        InvocationFailure { error, class }
    }

    /// Stage 1: look the tool up.
    pub fn resolve(&self, tool_name: &str) -> Result<Arc<ToolDescriptor>, ToolError> {
        self.registry.resolve(tool_name)
    }

    /// Stage 2: check arguments, returning them with defaults filled in.
    pub fn validate_args(descriptor: &ToolDescriptor, args: &Value) -> Result<Value, ToolError> {
        descriptor
            .schema()
            .validate(args)
            .map_err(|fields| ToolError::InvalidArguments {
                tool: descriptor.name().to_string(),
                fields,
            })
    }

    /// Stage 3: call the handler.
    ///
    /// Rejected with `CircuitOpen` without calling the handler while the
    /// tool's breaker is open. The attempt is bounded by `ctx.timeout` and a
    /// panicking handler is reported as `Panicked`.
    pub async fn invoke(
        &self,
        descriptor: &ToolDescriptor,
        args: Value,
        ctx: &InvocationContext,
    ) -> Result<Value, ToolError> {
        let breaker = self.breakers.breaker_for(descriptor.name()).await;
        let admission = breaker
            .try_acquire()
            .await
            .map_err(|retry_in| ToolError::CircuitOpen {
                tool: descriptor.name().to_string(),
                retry_in,
            })?;

        let call = AssertUnwindSafe(descriptor.handler().execute(args, ctx)).catch_unwind();
        let result = match tokio::time::timeout(ctx.timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(ToolError::Panicked {
                tool: descriptor.name().to_string(),
                message: panic_message(panic.as_ref()),
            }),
            Err(_) => Err(ToolError::Timeout {
                tool: descriptor.name().to_string(),
                timeout: ctx.timeout,
            }),
        };

        match &result {
            Ok(_) => breaker.record_success(admission).await,
            Err(_) => breaker.record_failure(admission).await,
        }
        result
    }

    /// Stage 4: wrap raw handler output, truncating oversized results.
    ///
    /// Oversized strings are cut at a character boundary; any other oversized
    /// value is replaced by its truncated JSON text.
    pub fn process_result(&self, raw: Value) -> TaskResult {
        let size_bytes = serde_json::to_vec(&raw).map(|v| v.len()).unwrap_or(0);
        if size_bytes <= self.max_result_bytes {
            return TaskResult {
                output: raw,
                size_bytes,
                truncated: false,
            };
        }

        let text = match raw {
            Value::String(s) => s,
            other => other.to_string(),
        };
        TaskResult {
            output: Value::String(truncate_at_char_boundary(&text, self.max_result_bytes)),
            size_bytes,
            truncated: true,
        }
    }

    /// Stage 5: classify a failure.
    ///
    /// A timeout of a non-idempotent tool is Permanent: the call may have
    /// taken effect, so repeating it is not safe.
    pub fn classify_error(descriptor: Option<&ToolDescriptor>, error: &ToolError) -> ErrorClass {
        match error {
            ToolError::UnknownTool(_) | ToolError::InvalidArguments { .. } => ErrorClass::Permanent,
            ToolError::Execution { class, .. } => *class,
            ToolError::Timeout { .. } => match descriptor {
                Some(d) if !d.is_idempotent() => ErrorClass::Permanent,
                _ => ErrorClass::Transient,
            },
            ToolError::CircuitOpen { .. } => ErrorClass::Transient,
            ToolError::Panicked { .. } | ToolError::Other(_) => ErrorClass::Unknown,
        }
    }
}

fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::mission::{MissionId, TaskId};
    use crate::tools::testing::{ScriptedTool, Step};
    use serde_json::json;
    use std::time::Duration;

    fn ctx(timeout: Duration) -> InvocationContext {
        InvocationContext::new(MissionId::new(), TaskId::from("t1"), 1, timeout)
    }

    fn pipeline_with(tool: Arc<ScriptedTool>) -> ToolInvocationPipeline {
        let registry = ToolRegistry::new();
        registry.register_tool(tool).unwrap();
        ToolInvocationPipeline::new(
            Arc::new(registry),
            CircuitBreakerRegistry::new(BreakerConfig::default()),
            1024,
        )
    }

    #[tokio::test]
    async fn test_success_passes_normalized_args() {
        let tool = Arc::new(ScriptedTool::new("echo").with_schema(json!({
            "type": "object",
            "properties": {"n": {"type": "integer", "default": 2}}
        })));
        let pipeline = pipeline_with(tool.clone());

        let inv = pipeline.run("echo", &json!({}), &ctx(Duration::from_secs(1))).await;
        let result = inv.outcome.unwrap();
        assert_eq!(result.output["echo"], json!({"n": 2}));
        assert!(!result.truncated);
        assert_eq!(tool.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_args_are_permanent() {
        let tool = Arc::new(ScriptedTool::new("strict").with_schema(json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        })));
        let pipeline = pipeline_with(tool.clone());

        let inv = pipeline.run("nope", &json!({}), &ctx(Duration::from_secs(1))).await;
        let failure = inv.outcome.unwrap_err();
        assert!(matches!(failure.error, ToolError::UnknownTool(_)));
        assert_eq!(failure.class, ErrorClass::Permanent);

        let inv = pipeline.run("strict", &json!({"path": 3}), &ctx(Duration::from_secs(1))).await;
        let failure = inv.outcome.unwrap_err();
        assert!(matches!(failure.error, ToolError::InvalidArguments { .. }));
        assert_eq!(failure.class, ErrorClass::Permanent);
        assert_eq!(tool.calls(), 0);
    }

    #[tokio::test]
    async fn test_breaker_stops_calling_handler() {
        let tool = Arc::new(ScriptedTool::new("search").fail_times(10, || ToolError::transient("503")));
        let pipeline = pipeline_with(tool.clone());

        for _ in 0..5 {
            let failure = pipeline
                .run("search", &json!({}), &ctx(Duration::from_secs(1)))
                .await
                .outcome
                .unwrap_err();
            assert_eq!(failure.class, ErrorClass::Transient);
        }

        let failure = pipeline
            .run("search", &json!({}), &ctx(Duration::from_secs(1)))
            .await
            .outcome
            .unwrap_err();
        assert!(failure.is_circuit_open());
        assert_eq!(failure.class, ErrorClass::Transient);
        assert_eq!(tool.calls(), 5);
    }

    #[tokio::test]
    async fn test_timeout_class_depends_on_idempotency() {
        let slow = Arc::new(ScriptedTool::new("slow").then(Step::Sleep(Duration::from_secs(5))));
        let failure = pipeline_with(slow)
            .run("slow", &json!({}), &ctx(Duration::from_millis(20)))
            .await
            .outcome
            .unwrap_err();
        assert!(matches!(failure.error, ToolError::Timeout { .. }));
        assert_eq!(failure.class, ErrorClass::Transient);

        let slow_write = Arc::new(
            ScriptedTool::new("slow_write")
                .non_idempotent()
                .then(Step::Sleep(Duration::from_secs(5))),
        );
        let failure = pipeline_with(slow_write)
            .run("slow_write", &json!({}), &ctx(Duration::from_millis(20)))
            .await
            .outcome
            .unwrap_err();
        assert_eq!(failure.class, ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let tool = Arc::new(ScriptedTool::new("boom").then(Step::Panic));
        let failure = pipeline_with(tool)
            .run("boom", &json!({}), &ctx(Duration::from_secs(1)))
            .await
            .outcome
            .unwrap_err();
        assert!(matches!(failure.error, ToolError::Panicked { .. }));
        assert_eq!(failure.class, ErrorClass::Unknown);
    }

    #[test]
    fn test_process_result_truncates() {
        let pipeline = ToolInvocationPipeline::new(
            Arc::new(ToolRegistry::new()),
            CircuitBreakerRegistry::default(),
            8,
        );
        let small = pipeline.process_result(json!("abc"));
        assert_eq!(small.output, json!("abc"));
        assert!(!small.truncated);

        let big = pipeline.process_result(json!("héllo wörld, long text"));
        assert!(big.truncated);
        assert!(big.output.as_str().unwrap().len() <= 8);

        let obj = pipeline.process_result(json!({"content": "0123456789"}));
        assert!(obj.truncated);
        assert_eq!(obj.output, json!("{\"conten"));
    }

    #[test]
    fn test_classification_table() {
        let classify = |e: ToolError| ToolInvocationPipeline::classify_error(None, &e);
        assert_eq!(
            classify(ToolError::rate_limited("slow", None)),
            ErrorClass::RateLimited
        );
        assert_eq!(
            classify(ToolError::Other(anyhow::anyhow!("???"))),
            ErrorClass::Unknown
        );
        assert_eq!(
            classify(ToolError::CircuitOpen {
                tool: "x".into(),
                retry_in: Duration::from_secs(1)
            }),
            ErrorClass::Transient
        );
    }
}
