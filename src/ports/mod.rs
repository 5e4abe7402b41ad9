//! Port traits at the I/O seams.

pub mod alert_store_port;
pub mod config_port;
pub mod metric_port;
