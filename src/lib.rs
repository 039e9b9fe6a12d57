//! Grace control plane.
//!
//! A boot-ordered supervisor over a fleet of cooperating subsystems:
//! - hash-chained immutable audit log and unified event publisher
//! - in-process event bus with bounded, severity-aware queues
//! - tiered governance gate with expiring approvals
//! - typed kernel registry with health-gated intent routing
//! - trigger mesh mapping events to declarative healing playbooks
//! - HTM task scheduler with SLAs, retries, and cooperative cancellation
//! - guardian/healer watchdog pair and the healing orchestrator
//! - meta-loop proposing governed, versioned configuration revisions

pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::errors::{DomainError, DomainResult, WorkerError, WorkerErrorKind, WorkerResult};
pub use domain::models::GraceConfig;
pub use services::boot::{BootError, BootOrchestrator, BootState, ControlPlane};
