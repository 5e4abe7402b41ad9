//! Alert persistence port trait.

use crate::domain::alert::{Alert, AlertEvent, AlertSummary, NewAlert, TriggerOutcome};
use crate::domain::error::ScreenwatchError;
use chrono::{DateTime, Utc};

/// Alert definitions, the append-only event log and per-pair trigger state.
///
/// Implementations must be shareable across evaluator worker threads.
pub trait AlertStorePort: Sync {
    /// Stores an already validated definition as active and returns it with its id.
    fn create_alert(&self, alert: &NewAlert) -> Result<Alert, ScreenwatchError>;

    fn get_alert(&self, alert_id: i64) -> Result<Option<Alert>, ScreenwatchError>;

    /// All alerts, active or not, ordered by id, with their trigger history.
    fn list_alerts(&self) -> Result<Vec<AlertSummary>, ScreenwatchError>;

    fn active_alerts(&self) -> Result<Vec<Alert>, ScreenwatchError>;

    /// Errors with `AlertNotFound` for an unknown id.
    fn deactivate_alert(&self, alert_id: i64) -> Result<(), ScreenwatchError>;

    /// Removes the alert with its events and trigger state.
    fn delete_alert(&self, alert_id: i64) -> Result<(), ScreenwatchError>;

    /// Atomically marks `(alert_id, instrument_id)` as triggered and appends
    /// an event, unless the pair is already in its triggered state. A single
    /// storage operation: concurrent callers for the same pair record at most
    /// one event between re-arms.
    fn record_trigger(
        &self,
        alert_id: i64,
        instrument_id: i64,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<TriggerOutcome, ScreenwatchError>;

    /// Clears the triggered state so the next true observation fires again.
    /// Returns whether a state existed.
    fn rearm(&self, alert_id: i64, instrument_id: i64) -> Result<bool, ScreenwatchError>;

    /// Events of one alert, oldest first.
    fn events_for_alert(&self, alert_id: i64) -> Result<Vec<AlertEvent>, ScreenwatchError>;
}
