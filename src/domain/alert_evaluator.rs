//! Alert evaluator.
//!
//! One run: fetch active alerts, list instruments once, then for each alert
//! check every instrument on a bounded pool of scoped worker threads.
//!
//! Per instrument:
//! 1. resolve the alert field (unavailable: skip the instrument)
//! 2. compare against the threshold
//! 3. true: atomic record-if-not-triggered in the store
//! 4. false: re-arm, so the next true observation fires again
//!
//! Storage calls are retried with capped exponential backoff. Exhausted retries
//! become run-level warnings and the run moves on; events already written
//! stay written. The run stops taking new instruments once the deadline
//! passes, and a retry never sleeps past it.

use crate::domain::alert::{Alert, AlertEvent, TriggerOutcome};
use crate::domain::condition_eval::{compare_numbers, DEFAULT_EPSILON};
use crate::domain::error::ScreenwatchError;
use crate::domain::field_registry::FieldRegistry;
use crate::domain::instrument::Instrument;
use crate::domain::metric_resolver::MetricResolver;
use crate::ports::alert_store_port::AlertStorePort;
use crate::ports::metric_port::MetricPort;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound for `[evaluator] retry_attempts`.
pub const MAX_RETRY_ATTEMPTS: u32 = 10;
/// Longest single sleep between storage retries.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatorConfig {
    pub workers: usize,
    pub deadline: Duration,
    pub retry_attempts: u32,
    pub retry_base: Duration,
    pub epsilon: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            deadline: Duration::from_secs(300),
            retry_attempts: 3,
            retry_base: Duration::from_millis(100),
            epsilon: DEFAULT_EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    NewTrigger,
    AlreadyTriggered,
}

/// One true observation and what the store did with it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub alert_id: i64,
    pub instrument_id: i64,
    pub triggered_value: f64,
    pub status: EventStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub alerts_evaluated: usize,
    pub instruments_checked: usize,
    pub new_events: Vec<AlertEvent>,
    pub already_triggered: usize,
    pub unavailable: usize,
    pub skipped_alerts: usize,
    pub storage_failures: usize,
    pub deadline_exceeded: bool,
    pub events: Vec<EventRecord>,
    pub warnings: Vec<String>,
}

impl EvaluationReport {
    fn absorb(&mut self, other: EvaluationReport) {
        self.alerts_evaluated += other.alerts_evaluated;
        self.instruments_checked += other.instruments_checked;
        self.new_events.extend(other.new_events);
        self.already_triggered += other.already_triggered;
        self.unavailable += other.unavailable;
        self.skipped_alerts += other.skipped_alerts;
        self.storage_failures += other.storage_failures;
        self.deadline_exceeded |= other.deadline_exceeded;
        self.events.extend(other.events);
        self.warnings.extend(other.warnings);
    }

    fn record_failure(&mut self, alert_id: i64, instrument_id: i64, error: ScreenwatchError) {
        match error {
            ScreenwatchError::DeadlineExceeded { .. } => self.deadline_exceeded = true,
            _ => self.storage_failures += 1,
        }
        self.warnings
            .push(format!("alert {alert_id} instrument {instrument_id}: {error}"));
    }
}

pub struct AlertEvaluator<'a, S: AlertStorePort + ?Sized, M: MetricPort + ?Sized> {
    store: &'a S,
    resolver: MetricResolver<'a, M>,
    config: EvaluatorConfig,
}

impl<'a, S: AlertStorePort + ?Sized, M: MetricPort + ?Sized> AlertEvaluator<'a, S, M> {
    pub fn new(store: &'a S, metrics: &'a M, registry: &'a FieldRegistry, config: EvaluatorConfig) -> Self {
        Self {
            store,
            resolver: MetricResolver::new(registry, metrics),
            config,
        }
    }

    /// Fails only when the alerts or the instrument list cannot be fetched.
    pub fn run(&self) -> Result<EvaluationReport, ScreenwatchError> {
        let deadline = Instant::now() + self.config.deadline;
        let alerts = self.with_retry("fetch active alerts", deadline, || self.store.active_alerts())?;
        let instruments = self.with_retry("list instruments", deadline, || {
            self.resolver.port().list_instruments()
        })?;
        info!(
            alerts = alerts.len(),
            instruments = instruments.len(),
            workers = self.config.workers,
            "starting alert evaluation run"
        );

        let mut report = EvaluationReport::default();
        for alert in &alerts {
            if Instant::now() >= deadline {
                report.deadline_exceeded = true;
                break;
            }
            if let Err(e) = alert.validate(self.resolver.registry()) {
                warn!(alert_id = alert.id, error = %e, "skipping invalid alert");
                report.skipped_alerts += 1;
                report.warnings.push(e.to_string());
                continue;
            }
            report.absorb(self.evaluate_alert(alert, &instruments, deadline));
            report.alerts_evaluated += 1;
        }

        if report.deadline_exceeded {
            warn!("evaluation deadline exceeded, remaining checks aborted");
            report
                .warnings
                .push(format!("deadline of {:?} exceeded", self.config.deadline));
        }
        report.new_events.sort_by_key(|e| (e.alert_id, e.instrument_id));
        report.events.sort_by_key(|e| (e.alert_id, e.instrument_id));

        info!(
            alerts_evaluated = report.alerts_evaluated,
            instruments_checked = report.instruments_checked,
            new_events = report.new_events.len(),
            already_triggered = report.already_triggered,
            unavailable = report.unavailable,
            storage_failures = report.storage_failures,
            "alert evaluation run finished"
        );
        Ok(report)
    }

    fn evaluate_alert(&self, alert: &Alert, instruments: &[Instrument], deadline: Instant) -> EvaluationReport {
        let next = &AtomicUsize::new(0);
        let workers = self.config.workers.clamp(1, instruments.len().max(1));

        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(move || {
                        let mut partial = EvaluationReport::default();
                        loop {
                            let Some(instrument) = instruments.get(next.fetch_add(1, Ordering::Relaxed)) else {
                                break;
                            };
                            if Instant::now() >= deadline {
                                partial.deadline_exceeded = true;
                                break;
                            }
                            self.check_instrument(alert, instrument.id, deadline, &mut partial);
                        }
                        partial
                    })
                })
                .collect();

            let mut merged = EvaluationReport::default();
            for handle in handles {
                match handle.join() {
                    Ok(partial) => merged.absorb(partial),
                    Err(_) => {
                        error!(alert_id = alert.id, "evaluation worker panicked");
                        merged.warnings.push(format!("alert {}: evaluation worker panicked", alert.id));
                    }
                }
            }
            merged
        })
    }

    fn check_instrument(
        &self,
        alert: &Alert,
        instrument_id: i64,
        deadline: Instant,
        report: &mut EvaluationReport,
    ) {
        report.instruments_checked += 1;

        let value = match self.resolver.resolve_number(instrument_id, &alert.field) {
            Ok(v) => v,
            Err(ScreenwatchError::MetricUnavailable { .. }) => {
                debug!(alert_id = alert.id, instrument_id, field = %alert.field, "metric unavailable");
                report.unavailable += 1;
                return;
            }
            Err(e) => {
                warn!(alert_id = alert.id, instrument_id, error = %e, "metric resolution failed, skipping instrument");
                report.unavailable += 1;
                report
                    .warnings
                    .push(format!("alert {} instrument {instrument_id}: {e}", alert.id));
                return;
            }
        };

        if !compare_numbers(value, alert.operator, alert.threshold, self.config.epsilon) {
            if let Err(e) = self.with_retry("rearm", deadline, || self.store.rearm(alert.id, instrument_id)) {
                report.record_failure(alert.id, instrument_id, e);
            }
            return;
        }

        let outcome = self.with_retry("record trigger", deadline, || {
            self.store.record_trigger(alert.id, instrument_id, value, Utc::now())
        });
        match outcome {
            Ok(TriggerOutcome::Triggered(event)) => {
                info!(
                    alert_id = alert.id,
                    instrument_id,
                    value,
                    threshold = alert.threshold,
                    "alert triggered"
                );
                report.events.push(EventRecord {
                    alert_id: alert.id,
                    instrument_id,
                    triggered_value: value,
                    status: EventStatus::NewTrigger,
                });
                report.new_events.push(event);
            }
            Ok(TriggerOutcome::AlreadyTriggered) => {
                debug!(alert_id = alert.id, instrument_id, "already triggered, not recorded again");
                report.already_triggered += 1;
                report.events.push(EventRecord {
                    alert_id: alert.id,
                    instrument_id,
                    triggered_value: value,
                    status: EventStatus::AlreadyTriggered,
                });
            }
            Err(e) => report.record_failure(alert.id, instrument_id, e),
        }
    }

    /// Retries transient failures, sleeping `retry_base * 2^(attempt-1)`
    /// (capped at [`MAX_BACKOFF`]) between attempts. Exhaustion is reported
    /// as `Storage`; a sleep that would end at or after `deadline` is not
    /// taken and the call fails with `DeadlineExceeded`.
    fn with_retry<T>(
        &self,
        operation: &str,
        deadline: Instant,
        mut call: impl FnMut() -> Result<T, ScreenwatchError>,
    ) -> Result<T, ScreenwatchError> {
        let attempts = self.config.retry_attempts.clamp(1, MAX_RETRY_ATTEMPTS);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match call() {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt < attempts => {
                    let delay = backoff(self.config.retry_base, attempt);
                    if Instant::now() + delay >= deadline {
                        warn!(operation, attempt, error = %e, "deadline reached, giving up on storage call");
                        return Err(ScreenwatchError::DeadlineExceeded {
                            operation: operation.to_string(),
                            attempts: attempt,
                        });
                    }
                    warn!(operation, attempt, error = %e, "storage call failed, retrying");
                    thread::sleep(delay);
                }
                Err(e) => {
                    error!(operation, attempts = attempt, error = %e, "storage call failed after retries");
                    return Err(ScreenwatchError::Storage {
                        reason: format!("{operation}: {e}"),
                        attempts: attempt,
                    });
                }
            }
        }
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(MAX_BACKOFF)
}
