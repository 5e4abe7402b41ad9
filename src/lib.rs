//! screenwatch: instrument screening conditions and database-wide alerts.
//!
//! Hexagonal architecture: domain logic in [`domain`], port traits in [`ports`],
//! concrete implementations in [`adapters`].

#[cfg(not(any(feature = "sqlite", feature = "postgres")))]
compile_error!("screenwatch needs the `sqlite` or `postgres` feature");

pub mod domain;
pub mod ports;
pub mod adapters;
pub mod cli;
