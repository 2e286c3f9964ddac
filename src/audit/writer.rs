//! Per-run JSONL event log writer.

use std::{
    fs::{self, OpenOptions},
    io::{BufRead, BufReader, ErrorKind, Write},
    path::PathBuf,
    sync::Mutex,
};

use tracing::warn;

use super::{EventLogger, RunEvent};
use crate::persistence::run_store::LOGS_DIR;
use crate::persistence::RunStore;
use crate::{AppError, Result};

const EVENTS_FILE: &str = "events.jsonl";

/// Appends one JSON object per line to `<run_dir>/logs/events.jsonl`.
///
/// Writes are serialized through a mutex so concurrent task runners never
/// interleave partial lines.
pub struct JsonlEventWriter {
    store: RunStore,
    write_lock: Mutex<()>,
}

impl JsonlEventWriter {
    /// Construct a writer that logs into the run directories of `store`.
    #[must_use]
    pub fn new(store: RunStore) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    fn events_path(&self, run_id: &str) -> Result<PathBuf> {
        Ok(self.store.run_dir(run_id)?.join(LOGS_DIR).join(EVENTS_FILE))
    }

    /// Read back every event recorded for a run, oldest first.
    ///
    /// Malformed lines are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the log exists but cannot be read.
    pub fn read_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        let path = self.events_path(run_id)?;
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(AppError::Io(format!(
                    "failed to open event log {}: {err}",
                    path.display()
                )))
            }
        };

        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunEvent>(&line) {
                Ok(event) => events.push(event),
                Err(err) => warn!(run_id, %err, "skipping malformed event log line"),
            }
        }
        Ok(events)
    }
}

impl EventLogger for JsonlEventWriter {
    fn log_event(&self, event: RunEvent) -> Result<()> {
        let path = self.events_path(&event.run_id)?;
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| AppError::Io("event writer mutex poisoned".to_owned()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                AppError::Io(format!(
                    "failed to create event log directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                AppError::Io(format!("failed to open event log {}: {e}", path.display()))
            })?;
        file.write_all(line.as_bytes())
            .map_err(|e| AppError::Io(format!("event log write failed: {e}")))?;
        Ok(())
    }
}
