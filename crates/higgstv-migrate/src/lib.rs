//! One-shot copy of a HiggsTV document store into the relational store.

pub mod coerce;
pub mod engine;
pub mod error;
pub mod exports;
pub mod report;

pub use engine::MigrationEngine;
pub use error::{MigrateError, Result};
pub use report::{EntityStats, MigrationReport, UnmappedReference, Verification};
