//! Network and system probing infrastructure.

pub mod probes;

pub use probes::LinuxProbe;
