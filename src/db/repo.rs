use super::model::{StoreError, UpsertOutcome, UpsertSummary};
use crate::model::{Boundary, ForecastWarning, WarningTriple};
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow, SqliteSynchronous,
};
use sqlx::{Executor, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use tracing::{debug, instrument};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL with full sync; forecast rows reference boundaries, so enforce FKs.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePool::connect_with(options)
        .await
        .context("failed to open database")?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Insert a boundary or overwrite its identity and geometry.
#[instrument(skip_all, fields(gid = %boundary.gid))]
pub async fn upsert_boundary(
    conn: &mut SqliteConnection,
    boundary: &Boundary,
) -> Result<UpsertOutcome, StoreError> {
    let exists = boundary_exists(&mut *conn, &boundary.gid).await?;
    if exists {
        sqlx::query("UPDATE boundaries SET country_iso = ?, name = ?, geometry = ? WHERE gid = ?")
            .bind(&boundary.country_iso)
            .bind(&boundary.name)
            .bind(&boundary.geometry)
            .bind(&boundary.gid)
            .execute(&mut *conn)
            .await?;
        Ok(UpsertOutcome::Updated)
    } else {
        sqlx::query("INSERT INTO boundaries (gid, country_iso, name, geometry) VALUES (?, ?, ?, ?)")
            .bind(&boundary.gid)
            .bind(&boundary.country_iso)
            .bind(&boundary.name)
            .bind(&boundary.geometry)
            .execute(&mut *conn)
            .await?;
        Ok(UpsertOutcome::Inserted)
    }
}

pub async fn boundary_exists<'e, E>(executor: E, gid: &str) -> Result<bool, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM boundaries WHERE gid = ?")
        .bind(gid)
        .fetch_optional(executor)
        .await?;
    Ok(found.is_some())
}

pub async fn find_forecast<'e, E>(
    executor: E,
    gid: &str,
    init_date: NaiveDateTime,
    forecast_date: NaiveDateTime,
) -> Result<Option<ForecastWarning>, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        "SELECT id, gid, init_date, forecast_date, value FROM dust_warnings WHERE gid = ? AND init_date = ? AND forecast_date = ?",
    )
    .bind(gid)
    .bind(init_date)
    .bind(forecast_date)
    .fetch_optional(executor)
    .await?;
    Ok(row.as_ref().map(warning_from_row))
}

/// Overwrite the value stored for `(gid, init_date, forecast_date)` or insert it.
///
/// The gid must already exist in `boundaries`.
pub async fn upsert_forecast(
    conn: &mut SqliteConnection,
    init_date: NaiveDateTime,
    triple: &WarningTriple,
) -> Result<UpsertOutcome, StoreError> {
    if !boundary_exists(&mut *conn, &triple.gid).await? {
        return Err(StoreError::UnknownBoundary {
            gid: triple.gid.clone(),
        });
    }

    let existing = find_forecast(&mut *conn, &triple.gid, init_date, triple.forecast_date).await?;
    let outcome = match existing {
        Some(row) => {
            sqlx::query("UPDATE dust_warnings SET value = ? WHERE id = ?")
                .bind(triple.value)
                .bind(row.id)
                .execute(&mut *conn)
                .await?;
            UpsertOutcome::Updated
        }
        None => {
            sqlx::query(
                "INSERT INTO dust_warnings (gid, init_date, forecast_date, value) VALUES (?, ?, ?, ?)",
            )
            .bind(&triple.gid)
            .bind(init_date)
            .bind(triple.forecast_date)
            .bind(triple.value)
            .execute(&mut *conn)
            .await
            .map_err(|err| classify_insert_error(err, &triple.gid))?;
            UpsertOutcome::Inserted
        }
    };
    debug!(gid = %triple.gid, forecast_date = %triple.forecast_date, outcome = outcome.as_str(), "warning upserted");
    Ok(outcome)
}

fn classify_insert_error(err: sqlx::Error, gid: &str) -> StoreError {
    let is_fk = err
        .as_database_error()
        .map(|db| db.is_foreign_key_violation())
        .unwrap_or(false);
    if is_fk {
        StoreError::UnknownBoundary {
            gid: gid.to_string(),
        }
    } else {
        StoreError::Sqlx(err)
    }
}

/// Upsert every triple of one boundary-set in a single transaction.
///
/// Any failure rolls back the whole set; earlier sets stay committed.
#[instrument(skip(pool, triples), fields(count = triples.len()))]
pub async fn upsert_boundary_set(
    pool: &Pool,
    iso: &str,
    init_date: NaiveDateTime,
    triples: &[WarningTriple],
) -> Result<UpsertSummary, StoreError> {
    let mut tx = pool.begin().await?;
    let mut summary = UpsertSummary::default();
    for triple in triples {
        let outcome = upsert_forecast(&mut tx, init_date, triple).await?;
        summary.record(outcome);
    }
    tx.commit().await?;
    Ok(summary)
}

pub async fn latest_init_date(pool: &Pool) -> Result<Option<NaiveDateTime>> {
    let latest = sqlx::query_scalar::<_, NaiveDateTime>(
        "SELECT init_date FROM dust_warnings ORDER BY init_date DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(latest)
}

pub async fn warnings_for_init_date(
    pool: &Pool,
    init_date: NaiveDateTime,
) -> Result<Vec<ForecastWarning>> {
    let rows = sqlx::query(
        "SELECT id, gid, init_date, forecast_date, value FROM dust_warnings WHERE init_date = ? ORDER BY gid, forecast_date",
    )
    .bind(init_date)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(warning_from_row).collect())
}

pub async fn count_warnings(pool: &Pool) -> Result<i64> {
    let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dust_warnings")
        .fetch_one(pool)
        .await?;
    Ok(n)
}

fn warning_from_row(row: &SqliteRow) -> ForecastWarning {
    ForecastWarning {
        id: row.get("id"),
        gid: row.get("gid"),
        init_date: row.get("init_date"),
        forecast_date: row.get("forecast_date"),
        value: row.get("value"),
    }
}
