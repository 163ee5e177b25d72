//! Repository outcome types.
//!
//! Domain rows (`Boundary`, `ForecastWarning`) live in `crate::model`; this
//! module only describes what a write did or why it failed.

use thiserror::Error;

/// Whether an upsert created a row or overwrote an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertOutcome::Inserted => "ADD",
            UpsertOutcome::Updated => "UPDATE",
        }
    }
}

/// Counts for one committed boundary-set transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: u64,
    pub updated: u64,
}

impl UpsertSummary {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Forecast references a gid with no boundary row.
    #[error("boundary {gid} does not exist")]
    UnknownBoundary { gid: String },
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}
