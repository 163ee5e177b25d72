use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Administrative subdivision a forecast value is attached to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Boundary {
    pub gid: String,
    pub country_iso: String,
    pub name: String,
    /// GeoJSON geometry document.
    pub geometry: String,
}

impl Boundary {
    /// Boundary ids are namespaced by the boundary-set ISO code.
    pub fn make_gid(iso: &str, source_id: &str) -> String {
        format!("{iso}_{source_id}")
    }
}

/// Stored forecast row; unique per `(gid, init_date, forecast_date)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForecastWarning {
    pub id: i64,
    pub gid: String,
    pub init_date: NaiveDateTime,
    pub forecast_date: NaiveDateTime,
    pub value: Option<i64>,
}

impl ForecastWarning {
    pub fn severity(&self) -> Severity {
        Severity::from_value(self.value)
    }
}

/// One validated feed value, ready to be upserted for a sync run's init date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarningTriple {
    pub gid: String,
    pub forecast_date: NaiveDateTime,
    pub value: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Severity {
    Normal,
    High,
    VeryHigh,
    ExtremelyHigh,
    Unknown,
}

impl Severity {
    pub fn from_value(value: Option<i64>) -> Self {
        match value {
            Some(0) => Severity::Normal,
            Some(1) => Severity::High,
            Some(2) => Severity::VeryHigh,
            Some(3) => Severity::ExtremelyHigh,
            _ => Severity::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Normal => "Normal",
            Severity::High => "High",
            Severity::VeryHigh => "Very High",
            Severity::ExtremelyHigh => "Extremely High",
            Severity::Unknown => "Unknown",
        }
    }
}

/// Midnight of `date`; every init and forecast date is stored at this resolution.
pub fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN)
}
