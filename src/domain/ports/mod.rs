//! Domain ports
//!
//! Interface seams between the control plane and the world: clocks,
//! system probes, kernels, and approval surfaces. Null/in-memory
//! implementations live beside their traits for tests and CI mode.

pub mod approvals;
pub mod clock;
pub mod kernel;
pub mod probe;

pub use approvals::{
    ApprovalChannel, ApprovalRequest, ApprovalVerdict, ManualApprovalChannel, NullApprovalChannel,
};
pub use clock::{Clock, DeterministicClock, SystemClock};
pub use kernel::{result_is_ok, unsupported_intent, IntentContext, Kernel};
pub use probe::{Detection, InMemoryProbe, SystemProbe};
