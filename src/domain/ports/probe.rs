//! System probe port.
//!
//! The guardian's eyes and hands: scanning for the eight watchdog failure
//! categories and carrying out the low-level remediations playbook steps
//! map to. Production uses the Linux `/proc`-backed probe; tests and CI use
//! the in-memory probe.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use crate::domain::models::event::EventSeverity;
use crate::domain::models::incident::FailureMode;

/// A single issue surfaced by a scan.
#[derive(Debug, Clone)]
pub struct Detection {
    pub failure_mode: FailureMode,
    pub severity: EventSeverity,
    /// What the issue is about: `pid:123`, `port:8002`, `iface:eth0`.
    pub subject: Option<String>,
    pub detail: String,
}

impl Detection {
    pub fn new(failure_mode: FailureMode, severity: EventSeverity, detail: impl Into<String>) -> Self {
        Self {
            failure_mode,
            severity,
            subject: None,
            detail: detail.into(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// Scanning and remediation surface used by guardian, healer, and the
/// self-healing kernel.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    /// Whether `port` can currently be bound.
    async fn port_is_free(&self, port: u16) -> bool;

    /// First bindable port in `[start, end)`.
    async fn find_free_port(&self, start: u16, end: u16) -> Option<u16> {
        for port in start..end {
            if self.port_is_free(port).await {
                return Some(port);
            }
        }
        None
    }

    /// Scan one failure category.
    async fn scan(&self, mode: FailureMode) -> Vec<Detection>;

    /// Scan every category in the given order.
    async fn scan_all(&self, modes: &[FailureMode]) -> Vec<Detection> {
        let mut all = Vec::new();
        for mode in modes {
            all.extend(self.scan(*mode).await);
        }
        all
    }

    /// Execute a named low-level remediation (`probe.kill_process`,
    /// `probe.release_port`, ...). Returns a result object for
    /// verification predicates; `Err` carries an operator-readable reason.
    async fn remediate(&self, action: &str, inputs: &Map<String, Value>) -> Result<Value, String>;
}

/// Mutable world state behind the in-memory probe.
#[derive(Debug, Default)]
struct FakeWorld {
    /// Ports currently bound, with the owning pid when known.
    bound_ports: HashMap<u16, Option<i32>>,
    /// Pids in zombie state.
    zombies: HashSet<i32>,
    time_wait_count: usize,
    close_wait_count: usize,
    ephemeral_usage_ratio: f64,
    fd_usage_ratio: f64,
    flapping_interfaces: HashSet<String>,
    dns_healthy: bool,
}

/// Deterministic in-memory probe for tests and CI mode.
///
/// Remediations mutate the fake world so a re-scan after healing observes
/// the remediated state, which is exactly what the healer's confirmation
/// pass relies on.
pub struct InMemoryProbe {
    world: Mutex<FakeWorld>,
}

impl InMemoryProbe {
    pub fn new() -> Self {
        Self {
            world: Mutex::new(FakeWorld {
                dns_healthy: true,
                ..FakeWorld::default()
            }),
        }
    }

    /// Bind a port owned by `pid` (None for an anonymous holder).
    pub async fn seed_bound_port(&self, port: u16, pid: Option<i32>) {
        self.world.lock().await.bound_ports.insert(port, pid);
    }

    /// Register a zombie process.
    pub async fn seed_zombie(&self, pid: i32) {
        self.world.lock().await.zombies.insert(pid);
    }

    pub async fn seed_time_wait(&self, count: usize) {
        self.world.lock().await.time_wait_count = count;
    }

    pub async fn seed_close_wait(&self, count: usize) {
        self.world.lock().await.close_wait_count = count;
    }

    pub async fn seed_fd_usage(&self, ratio: f64) {
        self.world.lock().await.fd_usage_ratio = ratio;
    }

    pub async fn seed_ephemeral_usage(&self, ratio: f64) {
        self.world.lock().await.ephemeral_usage_ratio = ratio;
    }

    pub async fn seed_interface_flap(&self, iface: impl Into<String>) {
        self.world.lock().await.flapping_interfaces.insert(iface.into());
    }

    pub async fn seed_dns_broken(&self) {
        self.world.lock().await.dns_healthy = false;
    }
}

impl Default for InMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn input_u64(inputs: &Map<String, Value>, key: &str) -> Option<u64> {
    inputs.get(key).and_then(Value::as_u64)
}

#[async_trait]
impl SystemProbe for InMemoryProbe {
    async fn port_is_free(&self, port: u16) -> bool {
        !self.world.lock().await.bound_ports.contains_key(&port)
    }

    async fn scan(&self, mode: FailureMode) -> Vec<Detection> {
        let world = self.world.lock().await;
        match mode {
            FailureMode::ZombieProcess => world
                .zombies
                .iter()
                .map(|pid| {
                    let holds_port = world
                        .bound_ports
                        .iter()
                        .find(|(_, owner)| **owner == Some(*pid))
                        .map(|(port, _)| *port);
                    let mut d = Detection::new(
                        FailureMode::ZombieProcess,
                        EventSeverity::Error,
                        match holds_port {
                            Some(port) => format!("defunct pid {pid} still holds port {port}"),
                            None => format!("defunct pid {pid}"),
                        },
                    )
                    .with_subject(format!("pid:{pid}"));
                    if let Some(port) = holds_port {
                        d.subject = Some(format!("pid:{pid},port:{port}"));
                    }
                    d
                })
                .collect(),
            FailureMode::PortInUse => Vec::new(),
            FailureMode::TimeWaitBuildup => {
                if world.time_wait_count > 1024 {
                    vec![Detection::new(
                        mode,
                        EventSeverity::Warn,
                        format!("{} sockets in TIME_WAIT", world.time_wait_count),
                    )]
                } else {
                    Vec::new()
                }
            }
            FailureMode::CloseWaitLeak => {
                if world.close_wait_count > 128 {
                    vec![Detection::new(
                        mode,
                        EventSeverity::Warn,
                        format!("{} sockets stuck in CLOSE_WAIT", world.close_wait_count),
                    )]
                } else {
                    Vec::new()
                }
            }
            FailureMode::EphemeralPortExhaustion => {
                if world.ephemeral_usage_ratio > 0.9 {
                    vec![Detection::new(
                        mode,
                        EventSeverity::Error,
                        format!(
                            "ephemeral port range {:.0}% used",
                            world.ephemeral_usage_ratio * 100.0
                        ),
                    )]
                } else {
                    Vec::new()
                }
            }
            FailureMode::FdPressure => {
                if world.fd_usage_ratio > 0.9 {
                    vec![Detection::new(
                        mode,
                        EventSeverity::Error,
                        format!("file descriptors {:.0}% of limit", world.fd_usage_ratio * 100.0),
                    )]
                } else {
                    Vec::new()
                }
            }
            FailureMode::InterfaceFlap => world
                .flapping_interfaces
                .iter()
                .map(|iface| {
                    Detection::new(mode, EventSeverity::Warn, format!("interface {iface} flapping"))
                        .with_subject(format!("iface:{iface}"))
                })
                .collect(),
            FailureMode::DnsFailure => {
                if world.dns_healthy {
                    Vec::new()
                } else {
                    vec![Detection::new(
                        mode,
                        EventSeverity::Error,
                        "resolver returned no answers".to_string(),
                    )]
                }
            }
        }
    }

    async fn remediate(&self, action: &str, inputs: &Map<String, Value>) -> Result<Value, String> {
        let mut world = self.world.lock().await;
        match action {
            "probe.kill_process" => {
                let pid = input_u64(inputs, "pid").ok_or("missing pid")? as i32;
                if !world.zombies.remove(&pid) {
                    return Err(format!("pid {pid} is not defunct"));
                }
                // Reaping the process releases any port it still held.
                world.bound_ports.retain(|_, owner| *owner != Some(pid));
                Ok(serde_json::json!({ "ok": true, "pid": pid }))
            }
            "probe.release_port" => {
                let port = input_u64(inputs, "port").ok_or("missing port")? as u16;
                world.bound_ports.remove(&port);
                Ok(serde_json::json!({ "ok": true, "port": port }))
            }
            "probe.reap_close_wait" => {
                let reaped = world.close_wait_count;
                world.close_wait_count = 0;
                Ok(serde_json::json!({ "ok": true, "reaped": reaped }))
            }
            "probe.tune_time_wait_reuse" => {
                world.time_wait_count = 0;
                Ok(serde_json::json!({ "ok": true }))
            }
            "probe.widen_ephemeral_range" => {
                world.ephemeral_usage_ratio /= 2.0;
                Ok(serde_json::json!({ "ok": true }))
            }
            "probe.shed_descriptors" => {
                world.fd_usage_ratio /= 2.0;
                Ok(serde_json::json!({ "ok": true }))
            }
            "probe.reprobe_interface" => {
                let iface = inputs
                    .get("iface")
                    .and_then(Value::as_str)
                    .ok_or("missing iface")?;
                world.flapping_interfaces.remove(iface);
                Ok(serde_json::json!({ "ok": true, "iface": iface }))
            }
            "probe.flush_dns" => {
                world.dns_healthy = true;
                Ok(serde_json::json!({ "ok": true }))
            }
            other => Err(format!("unknown probe action: {other}")),
        }
    }
}
