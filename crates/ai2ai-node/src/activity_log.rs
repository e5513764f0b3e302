//! Daily-rotating JSONL activity log.
//!
//! One line per logged event, appended to
//! `logs/ai2ai-<YYYY-MM-DD>.jsonl`. The writer rotates when the UTC
//! date changes; the retention sweep deletes files older than 30
//! days. This log is the protocol-mandated audit trail — diagnostic
//! logging stays on `tracing`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ai2ai_types::{Ai2AiError, Result};
use chrono::{NaiveDate, Utc};
use serde_json::Value;

/// Log files older than this many days are deleted by the sweep.
pub const LOG_RETENTION_DAYS: i64 = 30;

/// File name prefix.
const LOG_PREFIX: &str = "ai2ai-";

// ---------------------------------------------------------------------------
// ActivityLog
// ---------------------------------------------------------------------------

/// Append-only audit log with daily rotation.
pub struct ActivityLog {
    dir: PathBuf,
    current: Mutex<Option<(NaiveDate, fs::File)>>,
}

impl ActivityLog {
    /// Opens the log rooted at `<data_dir>/logs/`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("logs");
        fs::create_dir_all(&dir).map_err(|e| Ai2AiError::Storage {
            reason: format!("failed to create {}: {e}", dir.display()),
        })?;
        Ok(Self {
            dir,
            current: Mutex::new(None),
        })
    }

    /// Appends one event line, stamped with the current time.
    pub fn record(&self, kind: &str, detail: Value) -> Result<()> {
        let now = Utc::now();
        let line = serde_json::json!({
            "ts": now.to_rfc3339(),
            "kind": kind,
            "detail": detail,
        });

        let mut current = self.current.lock().map_err(|e| Ai2AiError::Internal {
            reason: format!("activity log lock poisoned: {e}"),
        })?;

        let today = now.date_naive();
        let needs_rotate = match &*current {
            Some((date, _)) => *date != today,
            None => true,
        };

        if needs_rotate {
            let path = self.dir.join(format!("{LOG_PREFIX}{today}.jsonl"));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| Ai2AiError::Storage {
                    reason: format!("failed to open {}: {e}", path.display()),
                })?;
            *current = Some((today, file));
        }

        if let Some((_, file)) = current.as_mut() {
            writeln!(file, "{line}").map_err(|e| Ai2AiError::Storage {
                reason: format!("failed to append activity log line: {e}"),
            })?;
        }
        Ok(())
    }

    /// Deletes log files older than [`LOG_RETENTION_DAYS`]. Returns
    /// the number removed.
    pub fn sweep_retention(&self) -> Result<usize> {
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(LOG_RETENTION_DAYS);
        let entries = fs::read_dir(&self.dir).map_err(|e| Ai2AiError::Storage {
            reason: format!("failed to list {}: {e}", self.dir.display()),
        })?;

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(date) = log_file_date(&path) else {
                continue;
            };
            if date < cutoff {
                if fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Extracts the date from `ai2ai-YYYY-MM-DD.jsonl`, if the name fits.
fn log_file_date(path: &Path) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let date_part = name.strip_prefix(LOG_PREFIX)?.strip_suffix(".jsonl")?;
    date_part.parse().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
