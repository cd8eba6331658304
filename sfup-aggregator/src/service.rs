//! Aggregator service task
//!
//! One task per key id owns the round state machine and consumes a bounded
//! receive queue; a full queue surfaces as backpressure to the transport
//! layer. Rounds run strictly sequentially: round `r+1` opens only after
//! round `r` reaches PUBLISHED or FAILED. Deadlines flush a quorate round
//! into the filter/sum path and fail a non-quorate one. Evidence append
//! failures halt the service (fail-closed).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use sfup_common::{
    AggregationWeights, KeyId, ModelDelta, OperatingEnvelope, RoundNumber, TensorSchema, WorkerId,
};
use sfup_crypto::{HybridPublicKey, N2heCipher, N2heParams, SecretKey, SecurityLevel};
use sfup_evidence::{EventType, EvidenceHandle};
use sfup_keys::KeyProvider;

use crate::delta_store::DeltaStore;
use crate::error::{AggregatorError, AggregatorResult};
use crate::gate::{EvaluationGate, GateMetrics, GateThresholds};
use crate::metrics::{MetricsCollector, RoundMetrics};
use crate::outlier::MadFilter;
use crate::recover::{kl_divergence_proxy, recover_delta};
use crate::round::{RoundPhase, RoundState, RoundStatusReport};
use crate::sum::sum_ciphertexts;
use crate::validate::PackageValidator;

/// Static configuration of one aggregator instance.
pub struct AggregatorConfig {
    /// Operating limits.
    pub envelope: OperatingEnvelope,
    /// Parameter shapes for the deployment.
    pub schema: TensorSchema,
    /// LWE security level (fixes the ciphertext dimension).
    pub security_level: SecurityLevel,
    /// Key the aggregator serves.
    pub key_id: KeyId,
    /// Published worker identities for signature checks.
    pub identities: BTreeMap<WorkerId, HybridPublicKey>,
    /// Aggregation weights; `None` means uniform over survivors.
    pub weights: Option<AggregationWeights>,
    /// Evaluation gate thresholds.
    pub gate_thresholds: GateThresholds,
    /// Receive queue capacity; the backpressure bound.
    pub queue_capacity: usize,
    /// First round number to collect.
    pub first_round: RoundNumber,
    /// Deltas retained for control-plane queries.
    pub delta_retention: usize,
}

impl AggregatorConfig {
    /// Gate thresholds taken from the envelope's delta/KL limits.
    pub fn default_gate(envelope: &OperatingEnvelope) -> GateThresholds {
        GateThresholds {
            min_success_rate: 0.0,
            max_kl_divergence: envelope.max_kl,
            max_delta_norm: envelope.max_delta_norm,
            require_monotone_loss: false,
        }
    }
}

/// Outcome of a submit call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Package accepted into the current round.
    Accepted,
    /// Package rejected; the reason mirrors the evidence record.
    Rejected(String),
}

enum Message {
    Submit {
        bytes: Vec<u8>,
        reply: oneshot::Sender<SubmitOutcome>,
    },
    CloseRound {
        reply: oneshot::Sender<AggregatorResult<ModelDelta>>,
    },
    RoundStatus {
        round: Option<RoundNumber>,
        reply: oneshot::Sender<Option<RoundStatusReport>>,
    },
    ModelDelta {
        round: RoundNumber,
        reply: oneshot::Sender<Option<ModelDelta>>,
    },
    Shutdown,
}

/// Cloneable control-plane handle to a running aggregator task.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<Message>,
}

impl AggregatorHandle {
    /// Submits raw package bytes.
    ///
    /// A full queue returns `Backpressure` immediately, which the transport
    /// maps to its retry-later response.
    pub async fn submit(&self, bytes: Vec<u8>) -> AggregatorResult<SubmitOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .try_send(Message::Submit { bytes, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => AggregatorError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => AggregatorError::ServiceUnavailable,
            })?;
        rx.await.map_err(|_| AggregatorError::ServiceUnavailable)
    }

    /// Drives the current round through filter, sum, decrypt and gate.
    pub async fn close_round(&self) -> AggregatorResult<ModelDelta> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::CloseRound { reply })
            .await
            .map_err(|_| AggregatorError::ServiceUnavailable)?;
        rx.await.map_err(|_| AggregatorError::ServiceUnavailable)?
    }

    /// Control-plane status of the current round.
    pub async fn round_status(&self) -> AggregatorResult<RoundStatusReport> {
        self.round_status_of(None)
            .await?
            .ok_or(AggregatorError::ServiceUnavailable)
    }

    /// Control-plane status of a specific round, current or past.
    pub async fn round_status_of(
        &self,
        round: Option<RoundNumber>,
    ) -> AggregatorResult<Option<RoundStatusReport>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::RoundStatus { round, reply })
            .await
            .map_err(|_| AggregatorError::ServiceUnavailable)?;
        rx.await.map_err(|_| AggregatorError::ServiceUnavailable)
    }

    /// Published delta for a round, if retained.
    pub async fn model_delta(&self, round: RoundNumber) -> AggregatorResult<Option<ModelDelta>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::ModelDelta { round, reply })
            .await
            .map_err(|_| AggregatorError::ServiceUnavailable)?;
        rx.await.map_err(|_| AggregatorError::ServiceUnavailable)
    }

    /// Stops the task after the current message.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Message::Shutdown).await;
    }
}

/// The aggregator service.
pub struct AggregatorService {
    config: AggregatorConfig,
    validator: PackageValidator,
    params: N2heParams,
    keys: Box<dyn KeyProvider + Send>,
    evidence: EvidenceHandle,
    round: RoundState,
    past_rounds: BTreeMap<RoundNumber, RoundStatusReport>,
    delta_store: DeltaStore,
    metrics: MetricsCollector,
    gate: EvaluationGate,
    round_opened_at: Instant,
    last_round_closed_at: Option<Instant>,
    halted: bool,
}

impl AggregatorService {
    /// Spawns the service task, returning its control-plane handle.
    pub fn spawn(
        config: AggregatorConfig,
        keys: Box<dyn KeyProvider + Send>,
        evidence: EvidenceHandle,
    ) -> AggregatorResult<(AggregatorHandle, tokio::task::JoinHandle<()>)> {
        let params = N2heParams::new(config.security_level, config.envelope.mu)?
            .with_noise_budget_constant(config.envelope.noise_budget_constant);
        let validator = PackageValidator::new(
            config.envelope.clone(),
            config.security_level.n_lwe(),
            config.identities.clone(),
        );
        let round = RoundState::new(
            config.key_id.clone(),
            config.first_round,
            config.envelope.quorum_threshold,
            Duration::from_secs(config.envelope.round_timeout_secs),
        );
        let gate = EvaluationGate::new(config.gate_thresholds.clone());
        let delta_store = DeltaStore::new(config.delta_retention);
        let capacity = config.queue_capacity.max(1);

        let mut service = Self {
            config,
            validator,
            params,
            keys,
            evidence,
            round,
            past_rounds: BTreeMap::new(),
            delta_store,
            metrics: MetricsCollector::new(),
            gate,
            round_opened_at: Instant::now(),
            last_round_closed_at: None,
            halted: false,
        };

        let (tx, mut rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(async move {
            info!(key_id = %service.config.key_id, "aggregator service started");
            let mut deadline_check = tokio::time::interval(Duration::from_millis(250));
            loop {
                tokio::select! {
                    message = rx.recv() => {
                        match message {
                            Some(Message::Submit { bytes, reply }) => {
                                let outcome = service.handle_submit(bytes).await;
                                let _ = reply.send(outcome);
                            }
                            Some(Message::CloseRound { reply }) => {
                                let result = service.run_aggregation().await;
                                let _ = reply.send(result);
                            }
                            Some(Message::RoundStatus { round, reply }) => {
                                let report = match round {
                                    None => Some(service.round.status()),
                                    Some(r) if r == service.round.round => {
                                        Some(service.round.status())
                                    }
                                    Some(r) => service.past_rounds.get(&r).cloned(),
                                };
                                let _ = reply.send(report);
                            }
                            Some(Message::ModelDelta { round, reply }) => {
                                let delta = service
                                    .delta_store
                                    .get(&service.config.key_id, round)
                                    .ok()
                                    .cloned();
                                let _ = reply.send(delta);
                            }
                            Some(Message::Shutdown) | None => break,
                        }
                    }
                    _ = deadline_check.tick() => {
                        service.handle_deadline().await;
                    }
                }
            }
            info!(key_id = %service.config.key_id, "aggregator service stopped");
        });

        Ok((AggregatorHandle { tx }, handle))
    }

    async fn record_evidence(&mut self, event_type: EventType, subject: String) {
        if let Err(e) = self.evidence.append(event_type, "aggregator", subject).await {
            // Fail closed: without a durable evidence trail nothing else may
            // proceed.
            error!(error = %e, "evidence append failed; halting aggregator");
            self.halted = true;
            self.round.fail("evidence log unavailable");
        }
    }

    async fn handle_submit(&mut self, bytes: Vec<u8>) -> SubmitOutcome {
        if self.halted {
            return SubmitOutcome::Rejected("aggregator halted".to_string());
        }
        if self.round.phase().is_terminal() {
            self.open_next_round();
        }
        if self.round.is_timed_out() {
            self.handle_deadline().await;
            if self.round.phase().is_terminal() {
                self.open_next_round();
            }
        }

        // Cadence floor: packages for the next round are refused until the
        // minimum inter-round interval has elapsed.
        if let Some(closed_at) = self.last_round_closed_at {
            let floor = Duration::from_secs(self.config.envelope.min_round_interval_secs);
            if closed_at.elapsed() < floor {
                return SubmitOutcome::Rejected(
                    "minimum round interval not yet elapsed".to_string(),
                );
            }
        }

        let key_meta = match self.keys.lookup(&self.config.key_id) {
            Ok((meta, _)) => meta,
            Err(e) => {
                warn!(error = %e, "key lookup failed during validation");
                return SubmitOutcome::Rejected(e.to_string());
            }
        };

        let package = match self.validator.validate(&bytes, &key_meta) {
            Ok(package) => package,
            Err(e) => {
                self.record_evidence(
                    EventType::PackageRejected,
                    format!("round={}: {e}", self.round.round),
                )
                .await;
                return SubmitOutcome::Rejected(e.to_string());
            }
        };

        // An empty payload can never help reach a meaningful quorum.
        if package.payload.is_empty() {
            let worker = package.header.worker_id.clone();
            self.record_evidence(
                EventType::PackageRejected,
                format!("round={}: empty package from {worker}", self.round.round),
            )
            .await;
            return SubmitOutcome::Rejected("empty package".to_string());
        }

        let worker = package.header.worker_id.clone();
        match self.round.accept(package) {
            Ok(()) => {
                self.record_evidence(
                    EventType::PackageAccepted,
                    format!("round={} worker={worker}", self.round.round),
                )
                .await;
                SubmitOutcome::Accepted
            }
            Err(e) => {
                self.record_evidence(
                    EventType::PackageRejected,
                    format!("round={} worker={worker}: {e}", self.round.round),
                )
                .await;
                SubmitOutcome::Rejected(e.to_string())
            }
        }
    }

    async fn handle_deadline(&mut self) {
        if self.halted || self.round.phase().is_terminal() || !self.round.is_timed_out() {
            return;
        }
        if self.round.quorum_reached() {
            info!(round = %self.round.round, "deadline with quorum; flushing round");
            if let Err(e) = self.run_aggregation().await {
                warn!(round = %self.round.round, error = %e, "deadline aggregation failed");
            }
        } else {
            warn!(round = %self.round.round, "deadline without quorum; round failed");
            self.round.fail("deadline reached below quorum");
            self.record_evidence(
                EventType::RoundFailed,
                format!("round={}: deadline below quorum", self.round.round),
            )
            .await;
            self.finish_round(false, 0, 0.0).await;
        }
    }

    async fn run_aggregation(&mut self) -> AggregatorResult<ModelDelta> {
        if self.halted {
            return Err(AggregatorError::ServiceUnavailable);
        }
        let accepted = self.round.received_count();
        if !self.round.quorum_reached() {
            let required = self.config.envelope.quorum_threshold;
            self.round.fail("quorum not reached");
            self.record_evidence(
                EventType::RoundFailed,
                format!("round={}: quorum {accepted}/{required}", self.round.round),
            )
            .await;
            self.finish_round(false, 0, 0.0).await;
            return Err(AggregatorError::QuorumNotReached {
                got: accepted,
                required,
            });
        }

        match self.aggregate_quorate().await {
            Ok(delta) => Ok(delta),
            Err(e) => {
                self.round.fail(e.to_string());
                self.record_evidence(
                    EventType::RoundFailed,
                    format!("round={}: {e}", self.round.round),
                )
                .await;
                self.finish_round(false, 0, 0.0).await;
                Err(e)
            }
        }
    }

    async fn aggregate_quorate(&mut self) -> AggregatorResult<ModelDelta> {
        let round_number = self.round.round;
        let accepted = self.round.received_count();

        // MAD outlier rejection over ciphertext-free metadata.
        let reports: BTreeMap<WorkerId, f64> = self
            .round
            .packages()
            .iter()
            .map(|(worker, package)| {
                (
                    worker.clone(),
                    package.manifest.safety_stats.gradient_l2_pre_clip,
                )
            })
            .collect();
        let outcome = MadFilter::new(self.config.envelope.mad_k).filter(&reports);
        for worker in &outcome.excluded {
            self.record_evidence(
                EventType::OutlierExcluded,
                format!("round={round_number} worker={worker}"),
            )
            .await;
        }
        let excluded = outcome.excluded.clone();
        self.round.exclude(&excluded);
        self.round.advance(RoundPhase::Filtered)?;
        self.record_evidence(
            EventType::RoundStateChanged,
            format!("round={round_number} phase=FILTERED"),
        )
        .await;

        if !self.round.quorum_reached() {
            return Err(AggregatorError::QuorumNotReached {
                got: self.round.received_count(),
                required: self.config.envelope.quorum_threshold,
            });
        }

        // Homomorphic sum across survivors.
        let weights = self.config.weights.clone().unwrap_or_else(|| {
            AggregationWeights::uniform(self.round.packages().keys().cloned())
        });
        let summed = sum_ciphertexts(
            &self.params,
            &self.config.schema,
            self.round.packages(),
            &weights,
        )?;
        self.round.advance(RoundPhase::Summed)?;

        // Decrypt with material unwrapped for this operation only.
        let (_, material) = self.keys.lookup(&self.config.key_id)?;
        let secret = SecretKey::from_bytes(&self.params, &material.secret)?;
        let cipher = N2heCipher::new(self.params, secret)?;
        let delta = recover_delta(&cipher, &summed, self.config.key_id.clone(), round_number)?;
        self.round.advance(RoundPhase::Decrypted)?;

        // Evaluation gate against the previous delta.
        let delta_norm = delta.l2_norm();
        let kl = self
            .delta_store
            .latest(&self.config.key_id)
            .map(|previous| kl_divergence_proxy(&delta, previous))
            .unwrap_or(0.0);
        let current = GateMetrics {
            success_rate: summed.contributors.len() as f64 / accepted as f64,
            kl_divergence: kl,
            delta_norm,
            loss: 0.0,
        };
        let decision = self.gate.evaluate(&current, None);
        if !decision.passed {
            self.record_evidence(
                EventType::GateFailed,
                format!("round={round_number}: {:?}", decision.failures),
            )
            .await;
            return Err(AggregatorError::GateFailed {
                failures: decision.failures,
            });
        }
        self.round.advance(RoundPhase::Gated)?;

        // Publish.
        self.round.advance(RoundPhase::Published)?;
        self.delta_store.store(delta.clone(), now_ms());
        self.record_evidence(
            EventType::RoundPublished,
            format!(
                "round={round_number} participants={} delta_norm={delta_norm:.6}",
                summed.contributors.len()
            ),
        )
        .await;

        let contributors = summed.contributors.clone();
        self.metrics.record_round(
            RoundMetrics {
                round: round_number,
                accepted,
                excluded_outliers: excluded.len(),
                contributors: contributors.len(),
                published: true,
                delta_norm,
                duration_ms: self.round_opened_at.elapsed().as_millis() as u64,
            },
            &contributors,
            &excluded,
        );
        self.open_next_round();

        info!(
            round = %round_number,
            participants = contributors.len(),
            delta_norm,
            "round published"
        );
        Ok(delta)
    }

    async fn finish_round(&mut self, published: bool, contributors: usize, delta_norm: f64) {
        self.metrics.record_round(
            RoundMetrics {
                round: self.round.round,
                accepted: self.round.received_count(),
                excluded_outliers: 0,
                contributors,
                published,
                delta_norm,
                duration_ms: self.round_opened_at.elapsed().as_millis() as u64,
            },
            &[],
            &[],
        );
        self.open_next_round();
    }

    fn open_next_round(&mut self) {
        self.past_rounds
            .insert(self.round.round, self.round.status());
        self.last_round_closed_at = Some(Instant::now());
        let next = self.round.round.next();
        self.round = RoundState::new(
            self.config.key_id.clone(),
            next,
            self.config.envelope.quorum_threshold,
            Duration::from_secs(self.config.envelope.round_timeout_secs),
        );
        self.round_opened_at = Instant::now();
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
