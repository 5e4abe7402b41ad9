//! Alert definitions and trigger events.
//!
//! An alert is a single snapshot-field comparison applied to every
//! instrument. Alerts are never deactivated by the evaluator; a trigger only
//! records an event.

use crate::domain::condition::Operator;
use crate::domain::error::ScreenwatchError;
use crate::domain::field_registry::{FieldRegistry, ValueType};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: i64,
    pub field: String,
    #[serde(serialize_with = "serialize_operator")]
    pub operator: Operator,
    pub threshold: f64,
    pub active: bool,
}

/// Alert definition before the store assigns an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub field: String,
    pub operator: Operator,
    pub threshold: f64,
}

impl NewAlert {
    pub fn new(field: &str, operator: Operator, threshold: f64) -> Self {
        Self {
            field: field.to_string(),
            operator,
            threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub alert_id: i64,
    pub instrument_id: i64,
    pub triggered_value: f64,
    pub triggered_at: DateTime<Utc>,
}

/// Result of the atomic check-and-record step for one (alert, instrument).
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Triggered(AlertEvent),
    /// The pair is still in its triggered state; nothing was written.
    AlreadyTriggered,
}

impl TriggerOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            TriggerOutcome::Triggered(_) => "new_trigger",
            TriggerOutcome::AlreadyTriggered => "already_triggered",
        }
    }
}

/// Alert listing row with trigger history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertSummary {
    #[serde(flatten)]
    pub alert: Alert,
    pub trigger_count: u64,
    pub last_triggered: Option<DateTime<Utc>>,
}

fn serialize_operator<S: serde::Serializer>(op: &Operator, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(op.token())
}

/// Field must be a registered numeric snapshot field, the operator a single
/// comparison and the threshold finite. `alert_id` is 0 for unsaved alerts.
pub fn validate_alert(
    registry: &FieldRegistry,
    alert_id: i64,
    field: &str,
    operator: Operator,
    threshold: f64,
) -> Result<(), ScreenwatchError> {
    let invalid = |reason: String| ScreenwatchError::AlertInvalid { alert_id, reason };

    let spec = registry
        .get(field)
        .ok_or_else(|| invalid(format!("unsupported field '{field}'")))?;
    if spec.value_type != ValueType::Number {
        return Err(invalid(format!("field '{}' is not numeric", spec.name)));
    }
    if spec.is_time_series() {
        return Err(invalid(format!(
            "field '{}' is a time series; alerts take snapshot fields only",
            spec.name
        )));
    }
    if !operator.is_comparison() {
        return Err(invalid(format!("operator '{operator}' is not a single comparison")));
    }
    if !threshold.is_finite() {
        return Err(invalid(format!("threshold {threshold} is not finite")));
    }
    Ok(())
}

impl NewAlert {
    pub fn validate(&self, registry: &FieldRegistry) -> Result<(), ScreenwatchError> {
        validate_alert(registry, 0, &self.field, self.operator, self.threshold)
    }
}

impl Alert {
    pub fn validate(&self, registry: &FieldRegistry) -> Result<(), ScreenwatchError> {
        validate_alert(registry, self.id, &self.field, self.operator, self.threshold)
    }
}
