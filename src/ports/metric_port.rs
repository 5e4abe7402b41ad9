//! Metric access port trait.

use crate::domain::condition::Scalar;
use crate::domain::error::ScreenwatchError;
use crate::domain::field_registry::{FieldSpec, SchemaLayout};
use crate::domain::instrument::Instrument;

/// Row source behind the metric resolver and the evaluators.
///
/// `field` always comes from the registry, so implementations may use its
/// table and column names in query text. `Ok(None)` means the instrument has
/// no value for the field.
pub trait MetricPort: Sync {
    fn list_instruments(&self) -> Result<Vec<Instrument>, ScreenwatchError>;

    /// Current value of a snapshot field, or the most recent period of a
    /// time-series field.
    fn latest_value(
        &self,
        instrument_id: i64,
        field: &FieldSpec,
        layout: &SchemaLayout,
    ) -> Result<Option<Scalar>, ScreenwatchError>;

    /// Up to `periods` values of a time-series field, most recent first.
    fn recent_values(
        &self,
        instrument_id: i64,
        field: &FieldSpec,
        layout: &SchemaLayout,
        periods: usize,
    ) -> Result<Vec<Option<Scalar>>, ScreenwatchError>;
}
