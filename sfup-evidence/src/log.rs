//! Hash-chained event store
//!
//! Invariants:
//! - `seq` strictly increases from 0 (the genesis event).
//! - `event_hash = H(seq ∥ ts ∥ type ∥ actor ∥ subject ∥ prev_hash)` with
//!   length-prefixed string fields.
//! - `chain_hash = H(prev_hash ∥ event_hash)`.
//! - The genesis event has `prev_hash = 0`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sfup_common::ErrorKind;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

/// Chain hash length in bytes.
const HASH_LEN: usize = 32;

/// Evidence log errors.
#[derive(Debug, Error)]
pub enum EvidenceError {
    /// Disk I/O failed (disk full, permissions, lost file).
    #[error("evidence I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An event line failed to parse.
    #[error("malformed evidence event at line {line}: {source}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// Parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// The chain hash recomputation diverged from the stored value.
    #[error("evidence chain mismatch at sequence {sequence}: expected {expected}, actual {actual}")]
    ChainMismatch {
        /// First sequence number whose hashes do not verify.
        sequence: u64,
        /// Hash recomputed from the event fields (hex).
        expected: String,
        /// Hash stored in the log (hex).
        actual: String,
    },

    /// The log refused a write after an integrity failure.
    #[error("evidence log is halted after an integrity failure; resolve and reopen")]
    Halted,

    /// The requested sequence number does not exist.
    #[error("evidence event {0} not found")]
    NotFound(u64),

    /// The writer task is gone or its queue is full.
    #[error("evidence writer unavailable: {0}")]
    WriterUnavailable(String),
}

impl EvidenceError {
    /// Maps onto the workspace-wide error kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EvidenceError::ChainMismatch { .. } | EvidenceError::Halted => ErrorKind::Integrity,
            EvidenceError::Malformed { .. } | EvidenceError::NotFound(_) => ErrorKind::Validation,
            EvidenceError::Io(_) | EvidenceError::WriterUnavailable(_) => ErrorKind::Resource,
        }
    }
}

/// Recorded operation categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A worker sealed an update package.
    PackageSealed,
    /// The aggregator accepted a package into a round.
    PackageAccepted,
    /// The aggregator rejected a package.
    PackageRejected,
    /// A round changed state.
    RoundStateChanged,
    /// A round published its model delta.
    RoundPublished,
    /// A round failed.
    RoundFailed,
    /// An outlier was excluded by the MAD filter.
    OutlierExcluded,
    /// A key was generated.
    KeyGenerated,
    /// A key was activated.
    KeyActivated,
    /// A key was rotated.
    KeyRotated,
    /// A key was revoked.
    KeyRevoked,
    /// A worker exhausted its privacy budget.
    BudgetExhausted,
    /// The evaluation gate rejected an aggregate.
    GateFailed,
}

impl EventType {
    fn as_str(self) -> &'static str {
        match self {
            EventType::PackageSealed => "package_sealed",
            EventType::PackageAccepted => "package_accepted",
            EventType::PackageRejected => "package_rejected",
            EventType::RoundStateChanged => "round_state_changed",
            EventType::RoundPublished => "round_published",
            EventType::RoundFailed => "round_failed",
            EventType::OutlierExcluded => "outlier_excluded",
            EventType::KeyGenerated => "key_generated",
            EventType::KeyActivated => "key_activated",
            EventType::KeyRotated => "key_rotated",
            EventType::KeyRevoked => "key_revoked",
            EventType::BudgetExhausted => "budget_exhausted",
            EventType::GateFailed => "gate_failed",
        }
    }
}

/// One persisted evidence event, exactly the wire JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceEvent {
    /// Strictly increasing sequence number; genesis is 0.
    pub seq: u64,
    /// Milliseconds since the Unix epoch.
    pub ts: u64,
    /// Operation category.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Component that performed the operation.
    pub actor: String,
    /// Object the operation concerned (package, round, key...).
    pub subject: String,
    /// Chain hash of the previous event, hex; all zeros for genesis.
    pub prev_hash_hex: String,
    /// `H(seq ∥ ts ∥ type ∥ actor ∥ subject ∥ prev_hash)`, hex.
    pub event_hash_hex: String,
    /// `H(prev_hash ∥ event_hash)`, hex.
    pub chain_hash_hex: String,
}

impl EvidenceEvent {
    /// Recomputes the event hash from the stored fields.
    fn compute_event_hash(&self, prev_hash: &[u8; HASH_LEN]) -> [u8; HASH_LEN] {
        hash_event_fields(
            self.seq,
            self.ts,
            self.event_type,
            &self.actor,
            &self.subject,
            prev_hash,
        )
    }
}

fn hash_event_fields(
    seq: u64,
    ts: u64,
    event_type: EventType,
    actor: &str,
    subject: &str,
    prev_hash: &[u8; HASH_LEN],
) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(seq.to_be_bytes());
    hasher.update(ts.to_be_bytes());
    for field in [event_type.as_str(), actor, subject] {
        hasher.update((field.len() as u16).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.update(prev_hash);
    hasher.finalize().into()
}

fn chain_hash(prev_hash: &[u8; HASH_LEN], event_hash: &[u8; HASH_LEN]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(event_hash);
    hasher.finalize().into()
}

/// Append-only hash-chained log, one JSON event per line, with a companion
/// `.idx` file of big-endian byte offsets indexed by sequence number.
pub struct EvidenceLog {
    path: PathBuf,
    file: File,
    idx_file: File,
    next_seq: u64,
    last_chain: [u8; HASH_LEN],
    /// Sequence → byte offset, mirroring the `.idx` file.
    offsets: Vec<u64>,
    /// Sequence numbers per event type for bounded-time queries.
    type_index: HashMap<EventType, Vec<u64>>,
    halted: bool,
}

impl EvidenceLog {
    /// Opens (or creates) a log at `path`, replaying existing events to
    /// restore the chain head and the indexes.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EvidenceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let idx_path = Self::idx_path(&path);

        let mut next_seq = 0u64;
        let mut last_chain = [0u8; HASH_LEN];
        let mut offsets = Vec::new();
        let mut type_index: HashMap<EventType, Vec<u64>> = HashMap::new();

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let mut offset = 0u64;
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                let event: EvidenceEvent =
                    serde_json::from_str(&line).map_err(|source| EvidenceError::Malformed {
                        line: line_no + 1,
                        source,
                    })?;
                offsets.push(offset);
                type_index.entry(event.event_type).or_default().push(event.seq);
                last_chain = decode_hash(&event.chain_hash_hex, event.seq)?;
                next_seq = event.seq + 1;
                offset += line.len() as u64 + 1;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut idx_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&idx_path)?;
        // Rebuild the index file from the replayed offsets so a stale or
        // missing sidecar never survives an open.
        idx_file.set_len(0)?;
        idx_file.seek(SeekFrom::Start(0))?;
        for off in &offsets {
            idx_file.write_all(&off.to_be_bytes())?;
        }
        idx_file.sync_data()?;

        debug!(path = %path.display(), events = next_seq, "evidence log opened");

        Ok(Self {
            path,
            file,
            idx_file,
            next_seq,
            last_chain,
            offsets,
            type_index,
            halted: false,
        })
    }

    /// Path of the companion index file.
    pub fn idx_path(log_path: &Path) -> PathBuf {
        let mut p = log_path.as_os_str().to_owned();
        p.push(".idx");
        PathBuf::from(p)
    }

    /// Number of events in the log.
    pub fn len(&self) -> u64 {
        self.next_seq
    }

    /// True when the log holds no events.
    pub fn is_empty(&self) -> bool {
        self.next_seq == 0
    }

    /// Chain hash of the latest event.
    pub fn head(&self) -> [u8; HASH_LEN] {
        self.last_chain
    }

    /// Whether writes are halted after an integrity failure.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Appends one event, fsyncing the log before returning.
    pub fn append(
        &mut self,
        event_type: EventType,
        actor: &str,
        subject: &str,
    ) -> Result<EvidenceEvent, EvidenceError> {
        if self.halted {
            return Err(EvidenceError::Halted);
        }

        let seq = self.next_seq;
        let ts = now_ms();
        let prev_hash = self.last_chain;
        let event_hash = hash_event_fields(seq, ts, event_type, actor, subject, &prev_hash);
        let chain = chain_hash(&prev_hash, &event_hash);

        let event = EvidenceEvent {
            seq,
            ts,
            event_type,
            actor: actor.to_string(),
            subject: subject.to_string(),
            prev_hash_hex: hex::encode(prev_hash),
            event_hash_hex: hex::encode(event_hash),
            chain_hash_hex: hex::encode(chain),
        };

        let line = serde_json::to_string(&event).map_err(|source| EvidenceError::Malformed {
            line: seq as usize + 1,
            source,
        })?;
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.sync_data()?;

        self.idx_file.seek(SeekFrom::End(0))?;
        self.idx_file.write_all(&offset.to_be_bytes())?;
        self.idx_file.sync_data()?;

        self.offsets.push(offset);
        self.type_index.entry(event_type).or_default().push(seq);
        self.next_seq = seq + 1;
        self.last_chain = chain;

        Ok(event)
    }

    /// Reads one event by sequence number through the offset index.
    pub fn event_by_seq(&self, seq: u64) -> Result<EvidenceEvent, EvidenceError> {
        let offset = *self
            .offsets
            .get(seq as usize)
            .ok_or(EvidenceError::NotFound(seq))?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        serde_json::from_str(line.trim_end()).map_err(|source| EvidenceError::Malformed {
            line: seq as usize + 1,
            source,
        })
    }

    /// Sequence numbers of all events of a type, oldest first.
    pub fn seqs_by_type(&self, event_type: EventType) -> &[u64] {
        self.type_index
            .get(&event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Walks the whole chain from genesis, recomputing every hash.
    ///
    /// Returns the number of verified events. On the first mismatch the log
    /// halts further writes and reports `(sequence, expected, actual)`.
    pub fn verify_chain(&mut self) -> Result<u64, EvidenceError> {
        match verify_file(&self.path) {
            Ok(count) => Ok(count),
            Err(e) => {
                if matches!(e, EvidenceError::ChainMismatch { .. }) {
                    warn!("evidence chain verification failed; halting writes");
                    self.halted = true;
                }
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for EvidenceLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvidenceLog")
            .field("path", &self.path)
            .field("events", &self.next_seq)
            .field("halted", &self.halted)
            .finish_non_exhaustive()
    }
}

/// Reads and parses all events from a log file without verification.
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<EvidenceEvent>, EvidenceError> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let mut events = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line).map_err(|source| {
            EvidenceError::Malformed {
                line: line_no + 1,
                source,
            }
        })?);
    }
    Ok(events)
}

/// Verifies a log file from genesis. Returns the verified event count.
pub fn verify_file(path: impl AsRef<Path>) -> Result<u64, EvidenceError> {
    let events = read_events(path)?;
    let mut prev = [0u8; HASH_LEN];
    for (i, event) in events.iter().enumerate() {
        if event.seq != i as u64 {
            return Err(EvidenceError::ChainMismatch {
                sequence: i as u64,
                expected: format!("seq {i}"),
                actual: format!("seq {}", event.seq),
            });
        }
        let stored_prev = decode_hash(&event.prev_hash_hex, event.seq)?;
        if stored_prev != prev {
            return Err(EvidenceError::ChainMismatch {
                sequence: event.seq,
                expected: hex::encode(prev),
                actual: event.prev_hash_hex.clone(),
            });
        }
        let expected_event_hash = event.compute_event_hash(&prev);
        let stored_event_hash = decode_hash(&event.event_hash_hex, event.seq)?;
        if stored_event_hash != expected_event_hash {
            return Err(EvidenceError::ChainMismatch {
                sequence: event.seq,
                expected: hex::encode(expected_event_hash),
                actual: event.event_hash_hex.clone(),
            });
        }
        let expected_chain = chain_hash(&prev, &expected_event_hash);
        let stored_chain = decode_hash(&event.chain_hash_hex, event.seq)?;
        if stored_chain != expected_chain {
            return Err(EvidenceError::ChainMismatch {
                sequence: event.seq,
                expected: hex::encode(expected_chain),
                actual: event.chain_hash_hex.clone(),
            });
        }
        prev = expected_chain;
    }
    Ok(events.len() as u64)
}

fn decode_hash(hex_str: &str, seq: u64) -> Result<[u8; HASH_LEN], EvidenceError> {
    let bytes = hex::decode(hex_str).map_err(|_| EvidenceError::ChainMismatch {
        sequence: seq,
        expected: "valid hex hash".to_string(),
        actual: hex_str.to_string(),
    })?;
    bytes.try_into().map_err(|_| EvidenceError::ChainMismatch {
        sequence: seq,
        expected: format!("{HASH_LEN}-byte hash"),
        actual: hex_str.to_string(),
    })
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
