//! Immutable, hash-chained audit log.
//!
//! Append-only JSONL, one record per line:
//! `{"ts":..., "event":{...}, "prev_hash":"…", "this_hash":"…", "signer":"…"}`
//! with `this_hash = SHA-256(canonical({prev_hash, event}))`. A single
//! writer task owns the file; appends are batched and flushed together.
//! Tampering is detected by re-hashing the chain; a mismatch raises the
//! degraded flag while writes continue.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::event::{canonical_json, Event};

/// Hash of the empty chain head.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// One line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: DateTime<Utc>,
    pub event: Event,
    pub prev_hash: String,
    pub this_hash: String,
    /// Component that published the recorded event.
    pub signer: String,
}

/// Compute the chain hash for an event following `prev_hash`.
pub fn chain_hash(prev_hash: &str, event: &Event) -> DomainResult<String> {
    let body = serde_json::json!({
        "prev_hash": prev_hash,
        "event": event,
    });
    let canonical = canonical_json(&body);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Filter for querying audit records.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Dotted event-type prefix.
    pub type_prefix: Option<String>,
    pub source: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.type_prefix = Some(prefix.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(ref prefix) = self.type_prefix {
            if !crate::services::event_bus::prefix_matches(prefix, record.event.event_type.as_str())
            {
                return false;
            }
        }
        if let Some(ref source) = self.source {
            if &record.event.source != source {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.ts < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.ts > until {
                return false;
            }
        }
        true
    }
}

/// Outcome of verifying a chain on disk.
#[derive(Debug, Clone)]
pub struct ChainVerification {
    pub records: usize,
    /// First broken line (1-based) and what went wrong, if anything.
    pub broken_at: Option<(usize, String)>,
}

impl ChainVerification {
    pub fn is_intact(&self) -> bool {
        self.broken_at.is_none()
    }
}

struct AppendCmd {
    event: Event,
    ack: oneshot::Sender<DomainResult<String>>,
}

/// The audit log service. Cloneable handle; the writer task is the single
/// owner of the file.
pub struct AuditLog {
    path: PathBuf,
    tx: mpsc::Sender<AppendCmd>,
    degraded: Arc<AtomicBool>,
    writer: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AuditLog {
    /// Open (or create) the log and start the writer task.
    ///
    /// The chain head is recovered from the last line of an existing file.
    pub async fn open(path: impl AsRef<Path>) -> DomainResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let head = match Self::read_records(&path).await {
            Ok(records) => records
                .last()
                .map(|r| r.this_hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_string()),
            Err(_) => GENESIS_HASH.to_string(),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, rx) = mpsc::channel::<AppendCmd>(1024);
        let writer = tokio::spawn(writer_loop(file, head, rx));

        Ok(Self {
            path,
            tx,
            degraded: Arc::new(AtomicBool::new(false)),
            writer: tokio::sync::Mutex::new(Some(writer)),
        })
    }

    /// Append an event to the chain; resolves once the record is flushed.
    pub async fn append(&self, event: &Event) -> DomainResult<String> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(AppendCmd {
                event: event.clone(),
                ack,
            })
            .await
            .map_err(|_| DomainError::ValidationFailed("audit writer stopped".to_string()))?;
        ack_rx
            .await
            .map_err(|_| DomainError::ValidationFailed("audit writer dropped ack".to_string()))?
    }

    /// All records currently on disk.
    pub async fn snapshot(&self) -> DomainResult<Vec<AuditRecord>> {
        Self::read_records(&self.path).await
    }

    /// Records matching a filter, oldest first.
    pub async fn query(&self, filter: AuditFilter) -> DomainResult<Vec<AuditRecord>> {
        let mut records: Vec<AuditRecord> = Self::read_records(&self.path)
            .await?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        if let Some(limit) = filter.limit {
            let excess = records.len().saturating_sub(limit);
            records.drain(..excess);
        }
        Ok(records)
    }

    /// Re-hash the whole chain on disk.
    pub async fn verify(&self) -> DomainResult<ChainVerification> {
        let verification = Self::verify_chain(&self.path).await?;
        if !verification.is_intact() {
            self.degraded.store(true, Ordering::Release);
        }
        Ok(verification)
    }

    /// Verify an arbitrary chain file without opening a writer on it.
    pub async fn verify_chain(path: impl AsRef<Path>) -> DomainResult<ChainVerification> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(ChainVerification {
                records: 0,
                broken_at: None,
            });
        }

        let file = File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut prev = GENESIS_HASH.to_string();
        let mut line_no = 0usize;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            line_no += 1;
            let record: AuditRecord = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    return Ok(ChainVerification {
                        records: line_no,
                        broken_at: Some((line_no, format!("unparseable record: {e}"))),
                    })
                }
            };
            if record.prev_hash != prev {
                return Ok(ChainVerification {
                    records: line_no,
                    broken_at: Some((line_no, "prev_hash does not match chain head".to_string())),
                });
            }
            let expected = chain_hash(&record.prev_hash, &record.event)?;
            if record.this_hash != expected {
                return Ok(ChainVerification {
                    records: line_no,
                    broken_at: Some((line_no, "this_hash mismatch".to_string())),
                });
            }
            prev = record.this_hash;
        }

        Ok(ChainVerification {
            records: line_no,
            broken_at: None,
        })
    }

    /// Whether tampering was detected since startup. Writes continue in
    /// degraded mode; the flag is surfaced through `audit.chain.broken`.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::Release);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop the writer after draining queued appends.
    pub async fn shutdown(&self) {
        let handle = { self.writer.lock().await.take() };
        if let Some(handle) = handle {
            // Wait for queued appends to drain, then stop the loop.
            let _ = tokio::time::timeout(std::time::Duration::from_secs(2), async {
                while self.tx.capacity() != self.tx.max_capacity() {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            })
            .await;
            handle.abort();
        }
    }

    async fn read_records(path: &Path) -> DomainResult<Vec<AuditRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line)
                .map_err(|e| DomainError::SerializationError(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Single-writer loop: drain a batch, write every line, flush once, ack.
async fn writer_loop(file: File, mut head: String, mut rx: mpsc::Receiver<AppendCmd>) {
    let mut out = BufWriter::new(file);
    let mut batch: Vec<AppendCmd> = Vec::with_capacity(64);

    loop {
        batch.clear();
        let n = rx.recv_many(&mut batch, 64).await;
        if n == 0 {
            break;
        }

        let mut acks = Vec::with_capacity(batch.len());
        for cmd in batch.drain(..) {
            match write_record(&mut out, &mut head, &cmd.event).await {
                Ok(hash) => acks.push((cmd.ack, Ok(hash))),
                Err(e) => {
                    error!(error = %e, "audit append failed");
                    acks.push((cmd.ack, Err(e)));
                }
            }
        }
        if let Err(e) = out.flush().await {
            error!(error = %e, "audit flush failed");
        }
        for (ack, result) in acks {
            let _ = ack.send(result);
        }
    }
    let _ = out.flush().await;
    info!("audit writer drained");
}

async fn write_record(
    out: &mut BufWriter<File>,
    head: &mut String,
    event: &Event,
) -> DomainResult<String> {
    let this_hash = chain_hash(head, event)?;
    let record = AuditRecord {
        ts: event.timestamp,
        event: event.clone(),
        prev_hash: head.clone(),
        this_hash: this_hash.clone(),
        signer: event.source.clone(),
    };
    let line = serde_json::to_string(&record)?;
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    *head = this_hash.clone();
    Ok(this_hash)
}
