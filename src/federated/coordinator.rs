//! Execution of a single fit-then-evaluate round.
//!
//! The coordinator selects participants, sends each the same parameter
//! snapshot, waits for answers until every selected participant has
//! replied or the phase deadline passes, enforces quorum and commits the
//! aggregated parameters exactly once. Evaluation then runs against the
//! freshly committed model; its failure never rolls the commit back.

use crate::core::{now, Error, Phase, Result};
use crate::federated::aggregator::{Aggregation, EvaluationAggregate};
use crate::federated::config::{StrategyConfig, TrainingConfig};
use crate::federated::participant::{MetricMap, ParticipantResult, Update};
use crate::federated::registry::{ParticipantHandle, ParticipantRegistry};
use crate::federated::selection::ClientSampler;
use crate::federated::state::GlobalModelState;
use crate::federated::summary::{
    EvaluationStatus, FailureKind, ParticipantFailure, RoundError, RoundStatus, RoundSummary,
};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Answers gathered from one phase.
struct Collected<T> {
    /// `(participant id, answer)`, sorted by id
    successes: Vec<(String, T)>,
    failures: Vec<ParticipantFailure>,
}

/// Outcome of the evaluation sub-phase.
struct EvaluationReport {
    status: EvaluationStatus,
    evaluated_by: usize,
    aggregate: Option<EvaluationAggregate>,
    failures: Vec<ParticipantFailure>,
}

/// Drives one round against a registry.
#[derive(Debug)]
pub struct RoundCoordinator {
    strategy: StrategyConfig,
    aggregation: Aggregation,
    sampler: ClientSampler,
}

impl RoundCoordinator {
    /// Create a coordinator with weighted-average aggregation.
    pub fn new(strategy: StrategyConfig) -> Result<Self> {
        strategy.validate()?;
        let sampler = ClientSampler::new(strategy.sampling_seed);
        Ok(Self {
            strategy,
            aggregation: Aggregation::default(),
            sampler,
        })
    }

    /// Use different aggregation functions.
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn strategy(&self) -> &StrategyConfig {
        &self.strategy
    }

    /// Run fit and evaluation for `round_index`.
    ///
    /// On error `state` is untouched. On success it has advanced by exactly
    /// one version.
    #[tracing::instrument(name = "round", skip_all, fields(round = round_index))]
    pub async fn run_round(
        &self,
        state: &mut GlobalModelState,
        registry: &ParticipantRegistry,
        round_index: u64,
    ) -> std::result::Result<RoundSummary, RoundError> {
        let started_at = now();
        let version_before = state.version();
        let fail = |error: Error, fit_selected: usize, failures: Vec<ParticipantFailure>| {
            RoundError {
                round_index,
                error,
                fit_selected,
                failures,
                model_version: version_before,
                started_at,
            }
        };

        let available = registry.snapshot().await;
        if available.len() < self.strategy.min_available_clients {
            warn!(
                available = available.len(),
                required = self.strategy.min_available_clients,
                "not enough participants to start round"
            );
            return Err(fail(
                Error::InsufficientParticipants {
                    available: available.len(),
                    required: self.strategy.min_available_clients,
                },
                0,
                Vec::new(),
            ));
        }

        let target = self.strategy.fit_sample_size(available.len());
        let selected = self.sampler.select(&available, target, round_index, Phase::Fit);
        let fit_selected = selected.len();
        debug!(selected = fit_selected, available = available.len(), "fit phase starting");

        let parameters = state.snapshot();
        let config = TrainingConfig::for_fit(round_index, &self.strategy);
        let Collected {
            successes,
            mut failures,
        } = collect(
            selected,
            Phase::Fit,
            self.strategy.round_timeout(),
            move |participant: ParticipantHandle| {
                let parameters = parameters.clone();
                let config = config.clone();
                async move { participant.fit(parameters, config).await }
            },
        )
        .await;

        if successes.len() < self.strategy.min_fit_clients {
            warn!(
                succeeded = successes.len(),
                required = self.strategy.min_fit_clients,
                failed = failures.len(),
                "fit quorum not met"
            );
            return Err(fail(
                Error::QuorumNotMet {
                    phase: Phase::Fit,
                    succeeded: successes.len(),
                    required: self.strategy.min_fit_clients,
                },
                fit_selected,
                failures,
            ));
        }

        for (id, update) in &successes {
            if let Err(err) = state.parameters().check_shapes(update.parameters()) {
                error!(participant = %id, error = %err, "update does not match global shapes");
                return Err(fail(err, fit_selected, failures));
            }
            if !update.parameters().is_finite() {
                let err = Error::InvalidUpdate(format!("{} sent non-finite parameters", id));
                error!(participant = %id, "update contains NaN or infinity");
                return Err(fail(err, fit_selected, failures));
            }
        }

        let updates: Vec<Update> = successes.into_iter().map(|(_, u)| u).collect();
        let aggregated = match self.aggregation.parameters(&updates) {
            Ok(parameters) => parameters,
            Err(err) => {
                error!(error = %err, "parameter aggregation aborted");
                return Err(fail(err, fit_selected, failures));
            }
        };
        let fit_metrics = match self.aggregation.fit_metrics(&updates) {
            Ok(metrics) => self.retain_recognized(metrics),
            Err(err) => {
                error!(error = %err, "fit metric aggregation aborted");
                return Err(fail(err, fit_selected, failures));
            }
        };
        if let Err(err) = state.commit(aggregated, round_index) {
            error!(error = %err, "aggregated parameters rejected by global state");
            return Err(fail(err, fit_selected, failures));
        }

        let participants_used = updates.len();
        let fingerprint = state.fingerprint();
        info!(
            participants = participants_used,
            version = state.version(),
            fingerprint = %fingerprint.short(),
            "global model committed"
        );

        let evaluation = self.evaluate(state, registry, round_index).await;
        let (loss, metrics) = match evaluation.aggregate {
            Some(aggregate) => (Some(aggregate.loss), aggregate.metrics),
            None => (None, MetricMap::new()),
        };
        failures.extend(evaluation.failures);

        Ok(RoundSummary {
            round_index,
            status: RoundStatus::Committed,
            participants_used,
            fit_selected,
            evaluation: evaluation.status,
            evaluated_by: evaluation.evaluated_by,
            loss,
            metrics,
            fit_metrics,
            failures,
            model_version: state.version(),
            model_fingerprint: Some(fingerprint),
            started_at,
            finished_at: now(),
        })
    }

    /// Evaluate the committed parameters. Never fails the round.
    async fn evaluate(
        &self,
        state: &GlobalModelState,
        registry: &ParticipantRegistry,
        round_index: u64,
    ) -> EvaluationReport {
        let not_evaluated = |status: EvaluationStatus, failures: Vec<ParticipantFailure>| {
            EvaluationReport {
                status,
                evaluated_by: 0,
                aggregate: None,
                failures,
            }
        };

        if !self.strategy.evaluation_enabled() {
            return not_evaluated(EvaluationStatus::Skipped, Vec::new());
        }

        // Fresh snapshot: participants may have left since the fit phase.
        let available = registry.snapshot().await;
        if available.len() < self.strategy.min_available_clients {
            let err = Error::InsufficientParticipants {
                available: available.len(),
                required: self.strategy.min_available_clients,
            };
            warn!(error = %err, "evaluation skipped");
            return not_evaluated(
                EvaluationStatus::Failed {
                    reason: err.to_string(),
                },
                Vec::new(),
            );
        }

        let target = self.strategy.evaluate_sample_size(available.len());
        let selected = self
            .sampler
            .select(&available, target, round_index, Phase::Evaluate);
        debug!(selected = selected.len(), "evaluation phase starting");

        let parameters = state.snapshot();
        let config = TrainingConfig::for_evaluate(round_index, &self.strategy);
        let Collected {
            successes,
            failures,
        } = collect(
            selected,
            Phase::Evaluate,
            self.strategy.round_timeout(),
            move |participant: ParticipantHandle| {
                let parameters = parameters.clone();
                let config = config.clone();
                async move { participant.evaluate(parameters, config).await }
            },
        )
        .await;

        if successes.len() < self.strategy.min_evaluate_clients {
            let err = Error::QuorumNotMet {
                phase: Phase::Evaluate,
                succeeded: successes.len(),
                required: self.strategy.min_evaluate_clients,
            };
            warn!(error = %err, "evaluation not aggregated");
            return not_evaluated(
                EvaluationStatus::Failed {
                    reason: err.to_string(),
                },
                failures,
            );
        }

        let evaluated_by = successes.len();
        let results: Vec<_> = successes.into_iter().map(|(_, r)| r).collect();
        match self.aggregation.evaluations(&results) {
            Ok(mut aggregate) => {
                aggregate.metrics = self.retain_recognized(std::mem::take(&mut aggregate.metrics));
                info!(
                    loss = aggregate.loss,
                    evaluated_by,
                    "evaluation aggregated"
                );
                EvaluationReport {
                    status: EvaluationStatus::Aggregated,
                    evaluated_by,
                    aggregate: Some(aggregate),
                    failures,
                }
            }
            Err(err) => {
                error!(error = %err, "evaluation aggregation aborted");
                not_evaluated(
                    EvaluationStatus::Failed {
                        reason: err.to_string(),
                    },
                    failures,
                )
            }
        }
    }

    /// Drop metric names outside the recognized set (empty set keeps all).
    fn retain_recognized(&self, mut metrics: MetricMap) -> MetricMap {
        if !self.strategy.recognized_metrics.is_empty() {
            metrics.retain(|name, _| self.strategy.recognized_metrics.contains(name));
        }
        metrics
    }
}

/// Call every participant concurrently and gather answers until all have
/// replied or `timeout` elapses.
///
/// Each call runs in its own task. Tasks still running at the deadline are
/// detached, not cancelled; whatever they return later is dropped.
async fn collect<T, F, Fut>(
    participants: Vec<ParticipantHandle>,
    phase: Phase,
    timeout: Duration,
    call: F,
) -> Collected<T>
where
    T: Send + 'static,
    F: Fn(ParticipantHandle) -> Fut,
    Fut: Future<Output = ParticipantResult<T>> + Send + 'static,
{
    let started = tokio::time::Instant::now();
    // Saturate rather than overflow for effectively unbounded timeouts.
    let deadline = started
        .checked_add(timeout)
        .unwrap_or_else(|| started + Duration::from_secs(u32::MAX as u64));
    let mut outstanding: BTreeSet<String> =
        participants.iter().map(|p| p.id().to_string()).collect();

    let mut pending: FuturesUnordered<_> = participants
        .into_iter()
        .map(|participant| {
            let id = participant.id().to_string();
            let task = tokio::spawn(call(participant));
            async move { (id, task.await) }
        })
        .collect();

    let mut successes = Vec::new();
    let mut failures = Vec::new();

    loop {
        match tokio::time::timeout_at(deadline, pending.next()).await {
            Ok(Some((id, joined))) => {
                outstanding.remove(&id);
                match joined {
                    Ok(Ok(answer)) => successes.push((id, answer)),
                    Ok(Err(err)) => {
                        warn!(participant = %id, %phase, error = %err, "participant failed");
                        failures.push(ParticipantFailure::new(
                            &id,
                            phase,
                            FailureKind::Error(err.to_string()),
                        ));
                    }
                    Err(err) => {
                        warn!(participant = %id, %phase, error = %err, "participant task aborted");
                        failures.push(ParticipantFailure::new(
                            &id,
                            phase,
                            FailureKind::Aborted(err.to_string()),
                        ));
                    }
                }
            }
            Ok(None) => break,
            Err(_) => {
                for id in &outstanding {
                    warn!(participant = %id, %phase, "participant timed out");
                    failures.push(ParticipantFailure::new(id, phase, FailureKind::Timeout));
                }
                break;
            }
        }
    }

    // Completion order is racy; aggregation order must not be.
    successes.sort_by(|a, b| a.0.cmp(&b.0));

    Collected {
        successes,
        failures,
    }
}
