//! Single-writer evidence task
//!
//! All appends from aggregator threads funnel through one bounded MPSC
//! channel into a task that owns the [`EvidenceLog`]. This is the
//! serialization point the log requires; a full queue surfaces as a
//! `Resource` error (backpressure) instead of blocking crypto paths.

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use crate::log::{EventType, EvidenceError, EvidenceEvent, EvidenceLog};

/// Commands accepted by the writer task.
enum Command {
    Append {
        event_type: EventType,
        actor: String,
        subject: String,
        reply: oneshot::Sender<Result<EvidenceEvent, EvidenceError>>,
    },
    Verify {
        reply: oneshot::Sender<Result<u64, EvidenceError>>,
    },
    Shutdown,
}

/// Cloneable handle for appending evidence from any task.
#[derive(Clone)]
pub struct EvidenceHandle {
    tx: mpsc::Sender<Command>,
}

impl EvidenceHandle {
    /// Appends an event, waiting for the durable write to complete.
    ///
    /// Fails closed: an I/O or integrity error from the log is returned to
    /// the caller, which must stop the operation it was recording.
    pub async fn append(
        &self,
        event_type: EventType,
        actor: impl Into<String>,
        subject: impl Into<String>,
    ) -> Result<EvidenceEvent, EvidenceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Append {
                event_type,
                actor: actor.into(),
                subject: subject.into(),
                reply,
            })
            .await
            .map_err(|_| EvidenceError::WriterUnavailable("writer task stopped".to_string()))?;
        rx.await
            .map_err(|_| EvidenceError::WriterUnavailable("writer dropped reply".to_string()))?
    }

    /// Appends without waiting for the result; queue-full is surfaced as a
    /// `Resource` error immediately.
    pub fn try_append(
        &self,
        event_type: EventType,
        actor: impl Into<String>,
        subject: impl Into<String>,
    ) -> Result<(), EvidenceError> {
        let (reply, _rx) = oneshot::channel();
        self.tx
            .try_send(Command::Append {
                event_type,
                actor: actor.into(),
                subject: subject.into(),
                reply,
            })
            .map_err(|e| EvidenceError::WriterUnavailable(e.to_string()))
    }

    /// Runs full-chain verification on the writer task.
    pub async fn verify(&self) -> Result<u64, EvidenceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Verify { reply })
            .await
            .map_err(|_| EvidenceError::WriterUnavailable("writer task stopped".to_string()))?;
        rx.await
            .map_err(|_| EvidenceError::WriterUnavailable("writer dropped reply".to_string()))?
    }

    /// Asks the writer task to stop after draining queued commands.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

/// The writer task wrapper.
pub struct EvidenceWriter;

impl EvidenceWriter {
    /// Spawns the single-writer task over an opened log.
    ///
    /// `capacity` bounds the command queue; senders see backpressure when
    /// the log cannot keep up.
    pub fn spawn(
        mut log: EvidenceLog,
        capacity: usize,
    ) -> (EvidenceHandle, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(async move {
            info!("evidence writer task started");
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Append {
                        event_type,
                        actor,
                        subject,
                        reply,
                    } => {
                        let result = log.append(event_type, &actor, &subject);
                        if let Err(e) = &result {
                            // Fail closed: an append failure halts the
                            // aggregator, so make sure it is visible even if
                            // the caller went away.
                            error!(error = %e, "evidence append failed");
                        }
                        let _ = reply.send(result);
                    }
                    Command::Verify { reply } => {
                        let _ = reply.send(log.verify_chain());
                    }
                    Command::Shutdown => break,
                }
            }
            info!(events = log.len(), "evidence writer task stopped");
        });
        (EvidenceHandle { tx }, handle)
    }
}
