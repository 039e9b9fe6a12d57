//! Typed kernel registry with health gating and intent routing.
//!
//! Routing picks the kernel whose intent patterns yield the longest
//! specific match; ties break on health (healthy > degraded), then higher
//! version, then lexicographic name. Down kernels are skipped unless the
//! caller forces the route.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tracing::{info, instrument};

use crate::domain::errors::{DomainError, DomainResult, WorkerResult};
use crate::domain::models::kernel::{KernelDescriptor, KernelHealth};
use crate::domain::ports::kernel::{IntentContext, Kernel};
use crate::services::publisher::{PublishOpts, UnifiedPublisher};

struct Registered {
    descriptor: KernelDescriptor,
    handler: Arc<dyn Kernel>,
}

/// The kernel registry service.
pub struct KernelRegistry {
    kernels: RwLock<HashMap<String, Registered>>,
    publisher: Option<Arc<UnifiedPublisher>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self {
            kernels: RwLock::new(HashMap::new()),
            publisher: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<UnifiedPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Register a kernel under its descriptor's name.
    #[instrument(skip(self, handler))]
    pub async fn register(&self, handler: Arc<dyn Kernel>) -> DomainResult<()> {
        let descriptor = handler.descriptor();
        if descriptor.name.is_empty() {
            return Err(DomainError::ValidationFailed("kernel name is empty".to_string()));
        }
        if descriptor.intent_patterns.is_empty() {
            return Err(DomainError::ValidationFailed(format!(
                "kernel {} declares no intent patterns",
                descriptor.name
            )));
        }
        let name = descriptor.name.clone();
        info!(kernel = %name, domain = descriptor.domain.as_str(), "kernel registered");

        self.kernels.write().await.insert(
            name.clone(),
            Registered {
                descriptor: descriptor.clone(),
                handler,
            },
        );

        if let Some(publisher) = &self.publisher {
            let mut payload = Map::new();
            payload.insert("name".to_string(), json!(name));
            payload.insert("domain".to_string(), json!(descriptor.domain.as_str()));
            payload.insert("version".to_string(), json!(descriptor.version));
            publisher
                .publish_typed(
                    crate::domain::models::event::EventType::KernelRegistered,
                    payload,
                    "kernel_registry",
                    PublishOpts::default(),
                )
                .await?;
        }
        Ok(())
    }

    /// Remove a kernel (shutdown only).
    pub async fn deregister(&self, name: &str) -> DomainResult<()> {
        self.kernels
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DomainError::KernelNotRegistered(name.to_string()))
    }

    /// Route an intent to the best matching kernel.
    pub async fn route(&self, intent: &str, force: bool) -> DomainResult<Arc<dyn Kernel>> {
        let kernels = self.kernels.read().await;
        let best = kernels
            .values()
            .filter(|r| force || r.descriptor.health != KernelHealth::Down)
            .filter_map(|r| r.descriptor.match_specificity(intent).map(|s| (s, r)))
            .max_by(|(spec_a, a), (spec_b, b)| {
                spec_a
                    .cmp(spec_b)
                    .then_with(|| {
                        a.descriptor
                            .health
                            .routing_rank()
                            .cmp(&b.descriptor.health.routing_rank())
                    })
                    .then_with(|| a.descriptor.version.cmp(&b.descriptor.version))
                    // max_by keeps the later of equal elements; invert the
                    // name ordering so the lexicographically smaller wins.
                    .then_with(|| b.descriptor.name.cmp(&a.descriptor.name))
            });
        best.map(|(_, r)| Arc::clone(&r.handler))
            .ok_or_else(|| DomainError::NoKernelForIntent(intent.to_string()))
    }

    /// Route and invoke in one step.
    pub async fn dispatch(&self, intent: &str, ctx: IntentContext) -> DomainResult<WorkerResult<Value>> {
        let kernel = self.route(intent, false).await?;
        Ok(kernel.handle(intent, ctx).await)
    }

    /// Health snapshot of every registered kernel.
    pub async fn health(&self) -> HashMap<String, KernelHealth> {
        self.kernels
            .read()
            .await
            .iter()
            .map(|(name, r)| (name.clone(), r.descriptor.health))
            .collect()
    }

    /// Update a kernel's health (called by probes); publishes the change.
    pub async fn set_health(&self, name: &str, health: KernelHealth) -> DomainResult<()> {
        {
            let mut kernels = self.kernels.write().await;
            let entry = kernels
                .get_mut(name)
                .ok_or_else(|| DomainError::KernelNotRegistered(name.to_string()))?;
            if entry.descriptor.health == health {
                return Ok(());
            }
            entry.descriptor.health = health;
        }
        if let Some(publisher) = &self.publisher {
            let mut payload = Map::new();
            payload.insert("name".to_string(), json!(name));
            payload.insert("health".to_string(), json!(health.as_str()));
            publisher
                .publish_typed(
                    crate::domain::models::event::EventType::KernelHealthChanged,
                    payload,
                    "kernel_registry",
                    PublishOpts::default(),
                )
                .await?;
        }
        Ok(())
    }

    pub async fn descriptors(&self) -> Vec<KernelDescriptor> {
        self.kernels
            .read()
            .await
            .values()
            .map(|r| r.descriptor.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.kernels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.kernels.read().await.is_empty()
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
