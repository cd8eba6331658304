//! Tamper-evident evidence log for SFUP
//!
//! Every state transition at a worker or the aggregator appends one event to
//! a hash-chained append-only log. Each event hashes its own fields together
//! with the previous event's chain hash, so removing or mutating any event
//! breaks verification at exactly that index.
//!
//! Persistence is one JSON event per line with a companion `.idx` file
//! mapping sequence numbers to byte offsets for bounded-time lookup.
//! Appends fsync before returning. Writes are serialized through
//! [`writer::EvidenceWriter`]; readers open the file independently and never
//! block the writer.

pub mod log;
pub mod writer;

pub use log::{read_events, verify_file, EventType, EvidenceError, EvidenceEvent, EvidenceLog};
pub use writer::{EvidenceHandle, EvidenceWriter};
