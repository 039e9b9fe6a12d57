//! Builtin kernels registered at boot.
//!
//! The self-healing kernel is the hands of the healing pipeline: playbook
//! steps route `probe.*` remediations and `verify.*` predicates through it
//! onto the system probe.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::domain::errors::{WorkerError, WorkerErrorKind, WorkerResult};
use crate::domain::models::incident::FailureMode;
use crate::domain::models::kernel::{KernelDescriptor, KernelDomain};
use crate::domain::ports::kernel::{unsupported_intent, IntentContext, Kernel};
use crate::domain::ports::probe::SystemProbe;

/// Kernel backing the `probe.*` and `verify.*` intent families.
pub struct SelfHealingKernel {
    probe: Arc<dyn SystemProbe>,
}

impl SelfHealingKernel {
    pub fn new(probe: Arc<dyn SystemProbe>) -> Self {
        Self { probe }
    }

    async fn verify(&self, intent: &str, ctx: &IntentContext) -> WorkerResult<Value> {
        match intent {
            "verify.scan_clear" => {
                let category = ctx
                    .inputs
                    .get("category")
                    .and_then(Value::as_str)
                    .and_then(FailureMode::from_str)
                    .ok_or_else(|| {
                        WorkerError::fatal(
                            WorkerErrorKind::PreconditionViolation,
                            "verify.scan_clear requires a known category",
                        )
                    })?;
                let clear = self.probe.scan(category).await.is_empty();
                Ok(json!({ "ok": clear, "category": category.as_str() }))
            }
            "verify.port_free" => {
                let port = ctx
                    .inputs
                    .get("port")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        WorkerError::fatal(
                            WorkerErrorKind::PreconditionViolation,
                            "verify.port_free requires a port",
                        )
                    })? as u16;
                let free = self.probe.port_is_free(port).await;
                Ok(json!({ "ok": free, "port": port }))
            }
            other => Err(unsupported_intent("self-healing", other)),
        }
    }
}

#[async_trait]
impl Kernel for SelfHealingKernel {
    fn descriptor(&self) -> KernelDescriptor {
        KernelDescriptor::new("self-healing", KernelDomain::SelfHealing)
            .with_capability("remediation")
            .with_capability("verification")
            .with_intent_pattern("probe")
            .with_intent_pattern("verify")
    }

    async fn handle(&self, intent: &str, ctx: IntentContext) -> WorkerResult<Value> {
        if intent.starts_with("verify.") {
            return self.verify(intent, &ctx).await;
        }
        if intent.starts_with("probe.") {
            return self
                .probe
                .remediate(intent, &ctx.inputs)
                .await
                .map_err(|reason| WorkerError::transient(WorkerErrorKind::Unavailable, reason));
        }
        Err(unsupported_intent("self-healing", intent))
    }
}

/// Read-only infrastructure kernel: health snapshots and stats queries.
/// Exists so the registry always has a T0-routable kernel for inspection
/// intents, exercising the read-only governance path.
pub struct InfrastructureKernel;

#[async_trait]
impl Kernel for InfrastructureKernel {
    fn descriptor(&self) -> KernelDescriptor {
        KernelDescriptor::new("infrastructure", KernelDomain::Infrastructure)
            .with_capability("inspection")
            .with_intent_pattern("inspect")
            .with_intent_pattern("stats")
    }

    async fn handle(&self, intent: &str, _ctx: IntentContext) -> WorkerResult<Value> {
        match intent {
            "inspect.ping" => Ok(json!({ "ok": true })),
            "stats.uptime" => Ok(json!({ "ok": true })),
            other => Err(unsupported_intent("infrastructure", other)),
        }
    }
}
