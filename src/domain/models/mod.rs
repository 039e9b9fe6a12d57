//! Domain models
//!
//! Pure domain entities with business logic and validation rules.
//! These models are framework-agnostic and contain no infrastructure
//! concerns.

pub mod config;
pub mod event;
pub mod governance;
pub mod incident;
pub mod kernel;
pub mod playbook;
pub mod revision;
pub mod task;

pub use config::{
    BusConfig, GovernanceConfig, GraceConfig, GuardianConfig, HtmConfig, LoggingConfig,
    MetaLoopConfig, PathsConfig,
};
pub use event::{canonical_json, Event, EventSeverity, EventType, TriggerEvent};
pub use governance::{
    ActionContext, DecisionKind, GovernanceDecision, GovernanceTier, ProposedAction,
};
pub use incident::{ActionTaken, FailureMode, Incident, IncidentStatus};
pub use kernel::{KernelDescriptor, KernelDomain, KernelHealth};
pub use playbook::{
    AutonomyTier, PayloadPredicate, Playbook, PlaybookStep, RiskLevel, TriggerMatch, Verification,
};
pub use revision::{ConfigRevision, SettingChange};
pub use task::{HtmTask, RetryPolicy, TaskPriority, TaskState, TaskTimes};
