//! Metric resolver.
//!
//! Resolves one field for one instrument by name, through the registry.
//! Alerts use snapshot fields only; a time-series field resolves to its most
//! recent period, the same as a windowless condition leaf.

use crate::domain::condition::Scalar;
use crate::domain::error::ScreenwatchError;
use crate::domain::field_registry::{FieldRegistry, FieldSpec};
use crate::ports::metric_port::MetricPort;

pub struct MetricResolver<'a, M: MetricPort + ?Sized> {
    registry: &'a FieldRegistry,
    port: &'a M,
}

impl<'a, M: MetricPort + ?Sized> MetricResolver<'a, M> {
    pub fn new(registry: &'a FieldRegistry, port: &'a M) -> Self {
        Self { registry, port }
    }

    pub fn registry(&self) -> &'a FieldRegistry {
        self.registry
    }

    pub fn port(&self) -> &'a M {
        self.port
    }

    fn spec(&self, instrument_id: i64, field: &str) -> Result<&'a FieldSpec, ScreenwatchError> {
        self.registry
            .get(field)
            .ok_or_else(|| ScreenwatchError::MetricUnavailable {
                instrument_id,
                field: field.to_string(),
            })
    }

    /// `MetricUnavailable` when the field is unknown or has no value for the
    /// instrument; other errors are source failures.
    pub fn resolve(&self, instrument_id: i64, field: &str) -> Result<Scalar, ScreenwatchError> {
        let spec = self.spec(instrument_id, field)?;
        self.port
            .latest_value(instrument_id, spec, self.registry.layout())?
            .ok_or_else(|| ScreenwatchError::MetricUnavailable {
                instrument_id,
                field: spec.name.clone(),
            })
    }

    /// Like [`resolve`](Self::resolve) but the value must be a finite number.
    pub fn resolve_number(&self, instrument_id: i64, field: &str) -> Result<f64, ScreenwatchError> {
        match self.resolve(instrument_id, field)? {
            Scalar::Number(n) if n.is_finite() => Ok(n),
            _ => Err(ScreenwatchError::MetricUnavailable {
                instrument_id,
                field: field.to_string(),
            }),
        }
    }

    /// The `periods` most recent values, most recent first. Missing periods
    /// shorten the list; missing values inside a period are `None`.
    pub fn history(
        &self,
        instrument_id: i64,
        field: &str,
        periods: usize,
    ) -> Result<Vec<Option<Scalar>>, ScreenwatchError> {
        let spec = self.spec(instrument_id, field)?;
        if !spec.is_time_series() {
            return Ok(vec![self.port.latest_value(instrument_id, spec, self.registry.layout())?]);
        }
        let mut values = self
            .port
            .recent_values(instrument_id, spec, self.registry.layout(), periods)?;
        values.truncate(periods);
        Ok(values)
    }
}
