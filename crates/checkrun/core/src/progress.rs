// Checkrun
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use checkrun_common::{PROGRESS_FILE_NAME, ProgressRecord, Stage};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{error, warn};

/// Receives stage progress as a run advances.
pub trait ProgressSink: Send + Sync {
    fn report(&self, stage: Stage, done: usize, total: usize, started_at: DateTime<Utc>);
}

/// Discards progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _stage: Stage, _done: usize, _total: usize, _started_at: DateTime<Utc>) {}
}

/// Rewrites `<results_dir>/progress.nsa_metadata` atomically on every report.
///
/// Reports may arrive from many threads at once. Writes are serialized and
/// each goes through its own temporary file in the results directory.
#[derive(Debug, Clone)]
pub struct FileProgressSink {
    results_dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileProgressSink {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.results_dir.join(PROGRESS_FILE_NAME)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let _guard = self.write_lock.lock();
        let mut tmp = NamedTempFile::new_in(&self.results_dir)?;
        tmp.write_all(bytes)?;
        tmp.persist(path).map_err(|err| err.error)?;
        Ok(())
    }
}

impl ProgressSink for FileProgressSink {
    fn report(&self, stage: Stage, done: usize, total: usize, started_at: DateTime<Utc>) {
        if !self.results_dir.is_dir() {
            warn!(dir = %self.results_dir.display(), "Results directory does not exist, progress not written");
            return;
        }
        let record = ProgressRecord::new(stage, done, total, started_at);
        let bytes = match serde_json::to_vec(&record) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(error = %err, "Failed to encode progress");
                return;
            }
        };
        if let Err(err) = self.write_atomic(&self.path(), &bytes) {
            error!(path = %self.path().display(), error = %err, "Failed to write progress");
        }
    }
}
