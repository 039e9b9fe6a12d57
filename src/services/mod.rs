//! Control-plane services.
//!
//! Layered upward-only: the audit log, bus, and publisher at the bottom;
//! governance and the kernel registry above them; the trigger mesh,
//! playbooks, and HTM scheduler next; the guardian, healer, healing
//! orchestrator, meta-loop, and boot orchestrator on top.

pub mod audit_log;
pub mod boot;
pub mod builtin_kernels;
pub mod event_bus;
pub mod governance;
pub mod guardian;
pub mod healer;
pub mod healing_orchestrator;
pub mod htm_scheduler;
pub mod incident_log;
pub mod kernel_registry;
pub mod meta_loop;
pub mod playbook_registry;
pub mod publisher;
pub mod trigger_mesh;

pub use audit_log::{chain_hash, AuditFilter, AuditLog, AuditRecord, ChainVerification, GENESIS_HASH};
pub use boot::{BootError, BootOrchestrator, BootPhase, BootState, ControlPlane, BOOT_PHASES};
pub use builtin_kernels::{InfrastructureKernel, SelfHealingKernel};
pub use event_bus::{longest_prefix_match, prefix_matches, EventBus, EventStream, SeenIds};
pub use governance::GovernanceGate;
pub use guardian::Guardian;
pub use healer::Healer;
pub use healing_orchestrator::{
    HealingConfig, HealingOrchestrator, PlaybookRunner, PLAYBOOK_TASK_KIND,
};
pub use htm_scheduler::{HtmScheduler, TaskExecutor};
pub use incident_log::{IncidentLog, IncidentStats, ModeStats};
pub use kernel_registry::KernelRegistry;
pub use meta_loop::{ConfigStore, MetaLoop, REVISION_ACTION_TYPE};
pub use playbook_registry::{builtin_playbooks, rank_candidates, required_tier, PlaybookRegistry};
pub use publisher::{PublishOpts, UnifiedPublisher};
pub use trigger_mesh::{TriggerMesh, TriggerMeshConfig};
