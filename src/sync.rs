//! Incremental warning synchronization.
//!
//! One call to [`Synchronizer::run`] is one sync run:
//!
//! 1. read the cursor; the target init date is the day after it, or today
//!    (in the configured timezone) when nothing has been synced yet;
//! 2. do nothing before the configured local cutoff time;
//! 3. per boundary-set, fetch every configured offset and validate all
//!    features before touching the database;
//! 4. upsert that boundary-set's triples in one transaction;
//! 5. advance the cursor only after every boundary-set committed.
//!
//! Any fetch or validation failure aborts the run without moving the cursor.
//! Boundary-sets committed earlier in the same run stay committed; upserts
//! overwrite, so the retry on the next run converges to the same rows.

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::config::{BoundarySetConfig, Config, ConfigError};
use crate::cursor::{CursorError, CursorStore};
use crate::db::{self, Pool, StoreError, UpsertSummary};
use crate::model::{midnight, Boundary, WarningTriple};
use crate::source::{Feature, FetchError, ForecastSource};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("forecast not published yet: {url}")]
    FetchNotFound { url: String },
    #[error("fetch failed: {0}")]
    FetchTransport(FetchError),
    #[error("no features published at {url}")]
    EmptyFeatureCollection { url: String },
    #[error("feature #{index} from {url} is incomplete: {reason}")]
    IncompleteFeatureData {
        url: String,
        index: usize,
        reason: String,
    },
    #[error("forecast references unknown boundary {gid}")]
    ForeignKeyViolation { gid: String },
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("cursor error: {0}")]
    Cursor(#[from] CursorError),
    #[error("forecast offset {offset} is out of range")]
    InvalidOffset { offset: i64 },
}

/// Coarse classification callers can match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    NotFound,
    Transport,
    Empty,
    Incomplete,
    ForeignKey,
    Database,
    Cursor,
    Config,
}

impl SyncError {
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            SyncError::FetchNotFound { .. } => SyncErrorKind::NotFound,
            SyncError::FetchTransport(_) => SyncErrorKind::Transport,
            SyncError::EmptyFeatureCollection { .. } => SyncErrorKind::Empty,
            SyncError::IncompleteFeatureData { .. } => SyncErrorKind::Incomplete,
            SyncError::ForeignKeyViolation { .. } => SyncErrorKind::ForeignKey,
            SyncError::Database(_) => SyncErrorKind::Database,
            SyncError::Cursor(_) => SyncErrorKind::Cursor,
            SyncError::InvalidOffset { .. } => SyncErrorKind::Config,
        }
    }
}

impl From<FetchError> for SyncError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::NotFound { url } => SyncError::FetchNotFound { url },
            other => SyncError::FetchTransport(other),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownBoundary { gid } => SyncError::ForeignKeyViolation { gid },
            StoreError::Sqlx(e) => SyncError::Database(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub init_date: NaiveDate,
    pub boundary_sets: usize,
    pub inserted: u64,
    pub updated: u64,
}

#[derive(Debug)]
pub enum SyncOutcome {
    /// Ran before the local cutoff; nothing fetched, cursor untouched.
    Gated { target: NaiveDate, local_time: NaiveTime },
    Completed(SyncReport),
    Aborted { target: NaiveDate, error: SyncError },
}

impl SyncOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SyncOutcome::Completed(_))
    }

    pub fn error(&self) -> Option<&SyncError> {
        match self {
            SyncOutcome::Aborted { error, .. } => Some(error),
            _ => None,
        }
    }
}

pub struct Synchronizer {
    pool: Pool,
    source: Arc<dyn ForecastSource>,
    cursor: CursorStore,
    boundaries: Vec<BoundarySetConfig>,
    offsets: Vec<i64>,
    tz: Tz,
    cutoff: Option<NaiveTime>,
}

impl Synchronizer {
    pub fn from_config(
        cfg: &Config,
        pool: Pool,
        source: Arc<dyn ForecastSource>,
    ) -> Result<Self, ConfigError> {
        crate::config::validate(cfg)?;
        Ok(Self {
            pool,
            source,
            cursor: CursorStore::new(cfg.state_file()),
            boundaries: cfg.boundaries.clone(),
            offsets: cfg.sync.offsets.clone(),
            tz: cfg.sync.tz()?,
            cutoff: cfg.sync.cutoff_time()?,
        })
    }

    pub fn cursor(&self) -> &CursorStore {
        &self.cursor
    }

    /// Day after the cursor, or local today when the cursor is empty.
    ///
    /// Advances by a single day per run no matter how far behind the cursor is.
    pub fn next_target(&self, now: DateTime<Utc>) -> NaiveDate {
        match self.cursor.read() {
            Some(last) => last
                .checked_add_days(Days::new(1))
                .unwrap_or(last),
            None => now.with_timezone(&self.tz).date_naive(),
        }
    }

    /// Local time of day when the run is still before the publication cutoff.
    pub fn gated_at(&self, now: DateTime<Utc>) -> Option<NaiveTime> {
        let cutoff = self.cutoff?;
        let local = now.with_timezone(&self.tz).time();
        (local < cutoff).then_some(local)
    }

    pub async fn run(&self) -> SyncOutcome {
        self.run_at(Utc::now()).await
    }

    #[instrument(skip(self))]
    pub async fn run_at(&self, now: DateTime<Utc>) -> SyncOutcome {
        let target = self.next_target(now);

        if let Some(local_time) = self.gated_at(now) {
            info!(%target, %local_time, "before publication cutoff; skipping run");
            return SyncOutcome::Gated { target, local_time };
        }

        let outcome = match self.sync_date(target).await {
            Ok(report) => SyncOutcome::Completed(report),
            Err(error) => SyncOutcome::Aborted { target, error },
        };
        log_outcome(&outcome);
        outcome
    }

    async fn sync_date(&self, target: NaiveDate) -> Result<SyncReport, SyncError> {
        let init_date = midnight(target);
        let mut report = SyncReport {
            init_date: target,
            boundary_sets: 0,
            inserted: 0,
            updated: 0,
        };

        for set in &self.boundaries {
            let triples = self.collect_boundary_set(set, target).await?;
            let summary: UpsertSummary =
                db::upsert_boundary_set(&self.pool, &set.iso, init_date, &triples).await?;
            info!(
                iso = %set.iso,
                inserted = summary.inserted,
                updated = summary.updated,
                "boundary set committed"
            );
            report.boundary_sets += 1;
            report.inserted += summary.inserted;
            report.updated += summary.updated;
        }

        self.cursor.write(target)?;
        Ok(report)
    }

    /// Fetch and validate every offset of one boundary-set.
    async fn collect_boundary_set(
        &self,
        set: &BoundarySetConfig,
        target: NaiveDate,
    ) -> Result<Vec<WarningTriple>, SyncError> {
        let date_str = target.format("%Y%m%d").to_string();
        let mut values: BTreeMap<(String, NaiveDateTime), Option<i64>> = BTreeMap::new();

        for &offset in &self.offsets {
            let url = set.render_url(&date_str, offset);
            info!(iso = %set.iso, date = %date_str, offset, "fetching warnings");
            let collection = self.source.fetch(&url).await?;
            if collection.is_empty() {
                return Err(SyncError::EmptyFeatureCollection { url });
            }

            let forecast_date = u64::try_from(offset)
                .ok()
                .and_then(|days| target.checked_add_days(Days::new(days)))
                .map(midnight)
                .ok_or(SyncError::InvalidOffset { offset })?;
            for triple in features_to_triples(set, &url, &collection.features, forecast_date)? {
                values.insert((triple.gid, triple.forecast_date), triple.value);
            }
        }

        Ok(values
            .into_iter()
            .map(|((gid, forecast_date), value)| WarningTriple {
                gid,
                forecast_date,
                value,
            })
            .collect())
    }
}

/// Turn one offset's features into triples; the first incomplete feature fails the batch.
pub fn features_to_triples(
    set: &BoundarySetConfig,
    url: &str,
    features: &[Feature],
    forecast_date: NaiveDateTime,
) -> Result<Vec<WarningTriple>, SyncError> {
    features
        .iter()
        .enumerate()
        .map(|(index, feature)| -> Result<WarningTriple, SyncError> {
            let incomplete = |reason: String| SyncError::IncompleteFeatureData {
                url: url.to_string(),
                index,
                reason,
            };

            let id = feature.property(&set.id_field);
            let name = feature.property(&set.name_field);
            let source_id = match (id, name) {
                (None, None) => {
                    return Err(incomplete(format!(
                        "missing both '{}' and '{}'",
                        set.id_field, set.name_field
                    )))
                }
                (None, Some(_)) => {
                    return Err(incomplete(format!("missing '{}'", set.id_field)));
                }
                (Some(id), _) => source_id_of(id).ok_or_else(|| {
                    incomplete(format!("'{}' is not a usable id: {id}", set.id_field))
                })?,
            };
            let value = severity_value(feature.property("value"))
                .map_err(|v| incomplete(format!("'value' is not an integer: {v}")))?;

            Ok(WarningTriple {
                gid: Boundary::make_gid(&set.iso, &source_id),
                forecast_date,
                value,
            })
        })
        .collect()
}

fn source_id_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Severity passes through untouched; null stays null.
///
/// Numeric strings are accepted as the database would cast them. Values that
/// do not fit an i64 are rejected rather than saturated.
fn severity_value(value: Option<&Value>) -> Result<Option<i64>, &Value> {
    let Some(value) = value else {
        return Ok(None);
    };
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(Some(i));
            }
            if n.is_u64() {
                return Err(value);
            }
            match n.as_f64() {
                Some(f) if f.is_finite() && f.fract() == 0.0 => {
                    integral_f64(f).map(Some).ok_or(value)
                }
                _ => Err(value),
            }
        }
        Value::String(s) => s.trim().parse::<i64>().map(Some).map_err(|_| value),
        _ => Err(value),
    }
}

fn integral_f64(f: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, which is already out of range.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    (f >= -LIMIT && f < LIMIT).then_some(f as i64)
}

fn log_outcome(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Gated { .. } => {}
        SyncOutcome::Completed(report) => info!(
            init_date = %report.init_date,
            boundary_sets = report.boundary_sets,
            inserted = report.inserted,
            updated = report.updated,
            "done fetching warnings; cursor advanced"
        ),
        SyncOutcome::Aborted { target, error } => match error.kind() {
            SyncErrorKind::NotFound | SyncErrorKind::Empty => {
                info!(%target, %error, "warnings not available yet; cursor unchanged")
            }
            SyncErrorKind::Transport | SyncErrorKind::Incomplete => {
                warn!(%target, %error, "sync aborted; cursor unchanged")
            }
            SyncErrorKind::ForeignKey
            | SyncErrorKind::Database
            | SyncErrorKind::Cursor
            | SyncErrorKind::Config => {
                error!(%target, %error, "sync failed; cursor unchanged")
            }
        },
    }
}
