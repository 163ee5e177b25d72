//! Configuration loader and validator for the dust-warning synchronizer.
use chrono::NaiveTime;
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Placeholders understood by `BoundarySetConfig::render_url`.
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder regex"));

const DATE_PLACEHOLDER: &str = "date_str";
const DAY_PLACEHOLDER: &str = "day_val";
const STATE_FILE: &str = "state.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub sync: SyncSettings,
    pub boundaries: Vec<BoundarySetConfig>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub state_dir: String,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Database {
    #[serde(default)]
    pub url: Option<String>,
}

/// Forecast feed transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl Default for Source {
    fn default() -> Self {
        Self {
            verify_tls: default_verify_tls(),
            timeout_seconds: None,
        }
    }
}

/// Sync run settings: which horizons to fetch and when upstream publishes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSettings {
    #[serde(default = "default_offsets")]
    pub offsets: Vec<i64>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Local wall-clock time (`HH:MM`) before which a run is a no-op.
    #[serde(default)]
    pub cutoff: Option<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            offsets: default_offsets(),
            timezone: default_timezone(),
            cutoff: None,
        }
    }
}

/// One country/region whose subdivisions carry forecast values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoundarySetConfig {
    pub iso: String,
    pub id_field: String,
    pub name_field: String,
    pub geojson_url_template: String,
}

fn default_verify_tls() -> bool {
    true
}

fn default_offsets() -> Vec<i64> {
    vec![0, 1, 2]
}

fn default_timezone() -> String {
    "Europe/Madrid".to_string()
}

impl BoundarySetConfig {
    /// Fill `{date_str}` (YYYYMMDD) and `{day_val}` into the feed URL template.
    pub fn render_url(&self, date_str: &str, day_val: i64) -> String {
        PLACEHOLDER
            .replace_all(&self.geojson_url_template, |caps: &regex::Captures<'_>| {
                match &caps[1] {
                    DATE_PLACEHOLDER => date_str.to_string(),
                    DAY_PLACEHOLDER => day_val.to_string(),
                    _ => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

impl SyncSettings {
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| invalid(format!("sync.timezone '{}' is not a known timezone", self.timezone)))
    }

    pub fn cutoff_time(&self) -> Result<Option<NaiveTime>, ConfigError> {
        match self.cutoff.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => NaiveTime::parse_from_str(raw, "%H:%M")
                .map(Some)
                .map_err(|_| invalid(format!("sync.cutoff '{raw}' must be HH:MM"))),
        }
    }
}

impl Source {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

impl Config {
    /// Ensure required directories exist (creates data and state dirs if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        for dir in [&self.app.data_dir, &self.app.state_dir] {
            if dir.trim().is_empty() {
                continue;
            }
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Location of the cursor document.
    pub fn state_file(&self) -> PathBuf {
        Path::new(&self.app.state_dir).join(STATE_FILE)
    }

    /// `DATABASE_URL` wins over `database.url`, which wins over the data dir default.
    pub fn database_url(&self) -> String {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            return url;
        }
        self.database
            .url
            .clone()
            .unwrap_or_else(|| format!("sqlite://{}/dustwarning.db", self.app.data_dir))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    parse(&content)
}

/// Parse and validate a YAML document.
pub fn parse(content: &str) -> Result<Config, ConfigError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.state_dir.trim().is_empty() {
        return Err(invalid("app.state_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.source.timeout_seconds == Some(0) {
        return Err(invalid("source.timeout_seconds must be > 0 when set"));
    }

    if cfg.sync.offsets.is_empty() {
        return Err(invalid("sync.offsets must list at least one offset"));
    }
    let mut seen = HashSet::new();
    for offset in &cfg.sync.offsets {
        if *offset < 0 {
            return Err(invalid("sync.offsets must be >= 0"));
        }
        if !seen.insert(*offset) {
            return Err(invalid(format!("sync.offsets contains duplicate {offset}")));
        }
    }
    cfg.sync.tz()?;
    cfg.sync.cutoff_time()?;

    if cfg.boundaries.is_empty() {
        return Err(invalid("boundaries must list at least one boundary set"));
    }
    let mut isos = HashSet::new();
    for (i, b) in cfg.boundaries.iter().enumerate() {
        if !(2..=3).contains(&b.iso.len()) || !b.iso.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(invalid(format!("boundaries[{i}].iso must be a 2 or 3 letter code")));
        }
        if !isos.insert(b.iso.to_ascii_uppercase()) {
            return Err(invalid(format!("boundaries[{i}].iso '{}' is duplicated", b.iso)));
        }
        if b.id_field.trim().is_empty() {
            return Err(invalid(format!("boundaries[{i}].id_field must be non-empty")));
        }
        if b.name_field.trim().is_empty() {
            return Err(invalid(format!("boundaries[{i}].name_field must be non-empty")));
        }
        validate_template(i, &b.geojson_url_template)?;
    }

    Ok(())
}

fn validate_template(i: usize, template: &str) -> Result<(), ConfigError> {
    let names: HashSet<&str> = PLACEHOLDER
        .captures_iter(template)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    for required in [DATE_PLACEHOLDER, DAY_PLACEHOLDER] {
        if !names.contains(required) {
            return Err(invalid(format!(
                "boundaries[{i}].geojson_url_template must contain {{{required}}}"
            )));
        }
    }
    if let Some(unknown) = names
        .iter()
        .find(|n| **n != DATE_PLACEHOLDER && **n != DAY_PLACEHOLDER)
    {
        return Err(invalid(format!(
            "boundaries[{i}].geojson_url_template has unknown placeholder {{{unknown}}}"
        )));
    }
    Ok(())
}

/// Returns an example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  state_dir: "./data/state"
  poll_interval_ms: 600000

source:
  verify_tls: true
  timeout_seconds: 60

sync:
  offsets: [0, 1, 2]
  timezone: "Europe/Madrid"
  cutoff: "12:05"

boundaries:
  - iso: "ESP"
    id_field: "NATCODE"
    name_field: "NAMEUNIT"
    geojson_url_template: "https://example.org/dust/{date_str}/esp_d{day_val}.geojson"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.sync.offsets, vec![0, 1, 2]);
        assert!(cfg.source.verify_tls);
        assert_eq!(cfg.sync.cutoff_time().unwrap(), NaiveTime::from_hms_opt(12, 5, 0));
    }

    #[test]
    fn defaults_apply_when_sections_missing() {
        let cfg = parse(
            r#"app:
  data_dir: "./d"
  state_dir: "./s"
  poll_interval_ms: 10
boundaries:
  - iso: "MAR"
    id_field: "id"
    name_field: "name"
    geojson_url_template: "http://x/{date_str}/{day_val}"
"#,
        )
        .unwrap();
        assert!(cfg.source.verify_tls);
        assert_eq!(cfg.source.timeout(), None);
        assert_eq!(cfg.sync.offsets, vec![0, 1, 2]);
        assert_eq!(cfg.sync.tz().unwrap(), chrono_tz::Europe::Madrid);
        assert_eq!(cfg.sync.cutoff_time().unwrap(), None);
    }

    #[test]
    fn render_url_fills_placeholders() {
        let cfg = example_cfg();
        let url = cfg.boundaries[0].render_url("20240301", 2);
        assert_eq!(url, "https://example.org/dust/20240301/esp_d2.geojson");
    }

    #[test]
    fn invalid_offsets() {
        let mut cfg = example_cfg();
        cfg.sync.offsets = vec![];
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("sync.offsets")));

        let mut cfg = example_cfg();
        cfg.sync.offsets = vec![0, 1, 1];
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("duplicate")));

        let mut cfg = example_cfg();
        cfg.sync.offsets = vec![-1];
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_timezone_and_cutoff() {
        let mut cfg = example_cfg();
        cfg.sync.timezone = "Mars/Olympus".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("timezone")));

        let mut cfg = example_cfg();
        cfg.sync.cutoff = Some("noon".into());
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("cutoff")));
    }

    #[test]
    fn invalid_boundary_sets() {
        let mut cfg = example_cfg();
        cfg.boundaries.clear();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.boundaries[0].iso = "E".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("iso")));

        let mut cfg = example_cfg();
        cfg.boundaries[0].id_field = " ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("id_field")));

        let mut cfg = example_cfg();
        cfg.boundaries[0].geojson_url_template = "http://x/{date_str}".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("day_val")));

        let mut cfg = example_cfg();
        cfg.boundaries[0].geojson_url_template = "http://x/{date_str}/{day_val}/{zoom}".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("zoom")));

        let mut cfg = example_cfg();
        let dup = cfg.boundaries[0].clone();
        cfg.boundaries.push(dup);
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("duplicated")));
    }

    #[test]
    fn ensure_dirs_creates_data_and_state_dirs() {
        let td = tempdir().unwrap();
        let mut cfg = example_cfg();
        cfg.app.data_dir = td.path().join("data").to_string_lossy().to_string();
        cfg.app.state_dir = td.path().join("state").to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(td.path().join("data").exists());
        assert!(td.path().join("state").exists());
        assert_eq!(cfg.state_file(), td.path().join("state").join("state.json"));
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.boundaries[0].iso, "ESP");
    }
}
