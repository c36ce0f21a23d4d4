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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const PROGRESS_FILE_NAME: &str = "progress.nsa_metadata";

/// Analysis stages, in the order a run passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Stage {
    CompileCommands = 0,
    Preprocess = 1,
    Ctu = 2,
    Stu = 3,
    Analysis = 4,
    End = 5,
}

impl Stage {
    pub fn id(self) -> u8 {
        self as u8
    }
}

/// Record consumed by the external progress reporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub stage_id: u8,
    /// Integer percentage, e.g. `"42%"`
    pub done_ratio: String,
    pub started_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn new(stage: Stage, done: usize, total: usize, started_at: DateTime<Utc>) -> Self {
        Self {
            stage_id: stage.id(),
            done_ratio: percent_string(done, total),
            started_at,
        }
    }
}

/// Integer percentage of `done` over `total`; an empty stage counts as complete.
pub fn percent_string(done: usize, total: usize) -> String {
    let percent = if total == 0 { 100 } else { done * 100 / total };
    format!("{percent}%")
}

/// `1m2.345s` style rendering used in progress log lines.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}.{millis:03}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}.{millis:03}s")
    } else {
        format!("{seconds}.{millis:03}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_string() {
        assert_eq!(percent_string(1, 3), "33%");
        assert_eq!(percent_string(3, 3), "100%");
        assert_eq!(percent_string(0, 0), "100%");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(1_500)), "1.500s");
        assert_eq!(format_elapsed(Duration::from_millis(62_005)), "1m2.005s");
        assert_eq!(format_elapsed(Duration::from_secs(3_661)), "1h1m1.000s");
    }

    #[test]
    fn test_record_json_shape() {
        let record = ProgressRecord::new(Stage::Analysis, 1, 4, Utc::now());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["stage_id"], 4);
        assert_eq!(json["done_ratio"], "25%");
        assert!(json["started_at"].is_string());
    }
}
