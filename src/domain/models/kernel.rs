//! Kernel descriptor model.
//!
//! Kernels are typed domain handlers plugged into the registry and selected
//! per intent. Health is probed at runtime; unhealthy kernels are skipped
//! during routing unless forced.

use serde::{Deserialize, Serialize};

/// Domains a kernel may claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KernelDomain {
    Memory,
    Core,
    Code,
    Governance,
    Verification,
    Intelligence,
    Infrastructure,
    Federation,
    Ml,
    SelfHealing,
    Librarian,
    CodingAgent,
}

impl KernelDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Core => "core",
            Self::Code => "code",
            Self::Governance => "governance",
            Self::Verification => "verification",
            Self::Intelligence => "intelligence",
            Self::Infrastructure => "infrastructure",
            Self::Federation => "federation",
            Self::Ml => "ml",
            Self::SelfHealing => "self-healing",
            Self::Librarian => "librarian",
            Self::CodingAgent => "coding-agent",
        }
    }
}

/// Health of a registered kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelHealth {
    Healthy,
    Degraded,
    Down,
}

impl KernelHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Down => "down",
        }
    }

    /// Routing preference: healthy beats degraded beats down.
    pub fn routing_rank(&self) -> u8 {
        match self {
            Self::Healthy => 2,
            Self::Degraded => 1,
            Self::Down => 0,
        }
    }
}

/// Static description of a kernel held by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelDescriptor {
    pub name: String,
    pub domain: KernelDomain,
    pub capabilities: Vec<String>,
    pub health: KernelHealth,
    /// Dotted intent prefixes this kernel serves; longest match wins.
    pub intent_patterns: Vec<String>,
    pub version: u32,
}

impl KernelDescriptor {
    pub fn new(name: impl Into<String>, domain: KernelDomain) -> Self {
        Self {
            name: name.into(),
            domain,
            capabilities: Vec::new(),
            health: KernelHealth::Healthy,
            intent_patterns: Vec::new(),
            version: 1,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_intent_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.intent_patterns.push(pattern.into());
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// The length of the longest pattern matching `intent`, if any.
    ///
    /// A pattern matches when it equals the intent or is a dotted prefix
    /// of it (`net.port` matches `net.port.release`).
    pub fn match_specificity(&self, intent: &str) -> Option<usize> {
        self.intent_patterns
            .iter()
            .filter(|p| {
                intent == p.as_str()
                    || (intent.len() > p.len()
                        && intent.starts_with(p.as_str())
                        && intent.as_bytes()[p.len()] == b'.')
            })
            .map(String::len)
            .max()
    }
}
