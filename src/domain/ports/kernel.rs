//! Kernel port: typed domain handlers behind the registry.

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::errors::{WorkerError, WorkerResult};
use crate::domain::models::kernel::KernelDescriptor;

/// Context handed to a kernel with each routed intent.
#[derive(Debug, Clone, Default)]
pub struct IntentContext {
    pub correlation_id: Option<Uuid>,
    pub inputs: Map<String, Value>,
}

impl IntentContext {
    pub fn with_inputs(inputs: Map<String, Value>) -> Self {
        Self {
            correlation_id: None,
            inputs,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// A typed domain handler selected per intent by the registry.
#[async_trait]
pub trait Kernel: Send + Sync {
    /// Static description: name, domain, intent patterns, version.
    fn descriptor(&self) -> KernelDescriptor;

    /// Handle a routed intent; failures are structured worker errors.
    async fn handle(&self, intent: &str, ctx: IntentContext) -> WorkerResult<Value>;
}

/// Interpret a kernel result as a verification verdict.
///
/// A verification passes when the result is boolean `true` or an object
/// with `"ok": true`.
pub fn result_is_ok(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Object(map) => map.get("ok").and_then(Value::as_bool).unwrap_or(false),
        _ => false,
    }
}

/// Helper for kernels rejecting intents outside their patterns.
pub fn unsupported_intent(kernel: &str, intent: &str) -> WorkerError {
    WorkerError::fatal(
        crate::domain::errors::WorkerErrorKind::PreconditionViolation,
        format!("kernel {kernel} does not support intent {intent}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_is_ok() {
        assert!(result_is_ok(&json!(true)));
        assert!(result_is_ok(&json!({"ok": true, "port": 8002})));
        assert!(!result_is_ok(&json!({"ok": false})));
        assert!(!result_is_ok(&json!({"port": 8002})));
        assert!(!result_is_ok(&json!("yes")));
    }
}
