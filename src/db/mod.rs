//! Database module: row models and SQL repositories.
//!
//! - `model`: outcome and view types returned by repositories.
//! - `repo`: SQL-only functions over the boundary and warning tables.
//!
//! Callers import from `dustwarning::db`; the repository API and its models
//! are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{StoreError, UpsertOutcome, UpsertSummary};
