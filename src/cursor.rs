//! Durable `last_update` cursor.
//!
//! The cursor is a small JSON document (`{"last_update": "2024-03-01T00:00:00"}`)
//! that records the most recent init date synced completely. Writes go to a
//! temporary sibling that is fsynced and then renamed over the target, so a
//! reader sees either the previous document or the new one.
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

const LAST_UPDATE: &str = "last_update";

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cursor I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cursor encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

fn io_err(path: &Path, source: std::io::Error) -> CursorError {
    CursorError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the persisted cursor date.
    ///
    /// A missing file is created empty. Malformed content is replaced by an
    /// empty document and reported as "never synced". An I/O failure is
    /// reported as "never synced" but leaves the file alone.
    pub fn read(&self) -> Option<NaiveDate> {
        let doc = match self.load_document() {
            Ok(doc) => doc,
            Err(CursorError::Encode(err)) => {
                warn!(%err, path = %self.path.display(), "cursor malformed; resetting");
                self.reset();
                return None;
            }
            Err(err) => {
                warn!(%err, path = %self.path.display(), "cursor unreadable");
                return None;
            }
        };
        match doc.get(LAST_UPDATE) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => match parse_cursor_date(s) {
                Some(date) => Some(date),
                None => {
                    warn!(value = %s, "cursor date malformed; resetting");
                    self.reset();
                    None
                }
            },
            Some(other) => {
                warn!(value = %other, "cursor value is not a string; resetting");
                self.reset();
                None
            }
        }
    }

    /// Atomically replace `last_update`, keeping any other keys in the document.
    pub fn write(&self, date: NaiveDate) -> Result<(), CursorError> {
        let mut doc = match self.load_document() {
            Ok(doc) => doc,
            Err(CursorError::Encode(_)) => Map::new(),
            Err(err) => return Err(err),
        };
        doc.insert(
            LAST_UPDATE.to_string(),
            Value::String(crate::model::midnight(date).format("%Y-%m-%dT%H:%M:%S").to_string()),
        );
        self.write_document(&doc)
    }

    fn reset(&self) {
        if let Err(err) = self.write_document(&empty_document()) {
            warn!(?err, path = %self.path.display(), "failed to reset cursor");
        }
    }

    fn load_document(&self) -> Result<Map<String, Value>, CursorError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "creating cursor file");
            self.write_document(&Map::new())?;
        }
        let raw = fs::read(&self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(serde_json::from_slice::<Map<String, Value>>(&raw)?)
    }

    fn write_document(&self, doc: &Map<String, Value>) -> Result<(), CursorError> {
        let body = serde_json::to_string_pretty(doc)?;
        atomic_write(&self.path, body.as_bytes())
    }
}

fn empty_document() -> Map<String, Value> {
    let mut doc = Map::new();
    doc.insert(LAST_UPDATE.to_string(), Value::String(String::new()));
    doc
}

/// Accepts `YYYY-MM-DD` and `YYYY-MM-DDTHH:MM:SS[.f]`.
fn parse_cursor_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.date());
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local().date());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

/// Write `contents` to `target` via a fsynced temp file in the same directory
/// followed by a rename. The previous file's permissions (and on unix its
/// owner) are carried over to the replacement.
pub fn atomic_write(target: &Path, contents: &[u8]) -> Result<(), CursorError> {
    write_via_temp(target, contents, |_| Ok(()))
}

/// `before_rename` runs once the temp file is durable and may abort the write.
fn write_via_temp<F>(target: &Path, contents: &[u8], before_rename: F) -> Result<(), CursorError>
where
    F: FnOnce(&Path) -> std::io::Result<()>,
{
    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

    let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| io_err(&dir, e))?;
    if let Ok(meta) = fs::metadata(target) {
        fs::set_permissions(tmp.path(), meta.permissions()).map_err(|e| io_err(tmp.path(), e))?;
        copy_owner(&meta, tmp.path());
    }
    tmp.write_all(contents).map_err(|e| io_err(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| io_err(tmp.path(), e))?;
    before_rename(tmp.path()).map_err(|e| io_err(tmp.path(), e))?;

    // The temp file is removed on drop if the rename fails.
    tmp.persist(target).map_err(|e| io_err(target, e.error))?;
    Ok(())
}

#[cfg(unix)]
fn copy_owner(meta: &fs::Metadata, path: &Path) {
    use std::os::unix::fs::MetadataExt;
    // Only root may hand a file to another user; an unprivileged chown to
    // ourselves is a no-op, so failures are only logged.
    if let Err(err) = std::os::unix::fs::chown(path, Some(meta.uid()), Some(meta.gid())) {
        debug!(?err, path = %path.display(), "could not copy cursor ownership");
    }
}

#[cfg(not(unix))]
fn copy_owner(_meta: &fs::Metadata, _path: &Path) {}
