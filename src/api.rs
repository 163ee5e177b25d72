//! Read-side queries served to map clients.
use anyhow::Result;
use chrono::{Days, NaiveDateTime};

use crate::db::{self, Pool};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Forecast-horizon timestamps around the most recent init date:
/// the day before, the init date itself and the day after.
/// Empty when nothing has been synced yet.
pub async fn available_dates(pool: &Pool) -> Result<Vec<String>> {
    Ok(db::latest_init_date(pool)
        .await?
        .map(horizon_dates)
        .unwrap_or_default())
}

pub fn horizon_dates(init_date: NaiveDateTime) -> Vec<String> {
    let before = init_date.checked_sub_days(Days::new(1));
    let after = init_date.checked_add_days(Days::new(1));
    [before, Some(init_date), after]
        .into_iter()
        .flatten()
        .map(|d| d.format(TIMESTAMP_FORMAT).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::midnight;
    use chrono::NaiveDate;

    #[test]
    fn horizon_spans_three_days() {
        let init = midnight(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(
            horizon_dates(init),
            vec![
                "2024-02-29T00:00:00.000Z",
                "2024-03-01T00:00:00.000Z",
                "2024-03-02T00:00:00.000Z",
            ]
        );
    }
}
