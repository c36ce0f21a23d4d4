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

use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Shared interrupt signal for a run.
///
/// # Thread Safety
/// - `AtomicBool` carries the flag so hot-path checks never lock
/// - `Mutex<Option<String>>` holds the first cancellation reason
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cancels the token. Only the first call takes effect; returns whether it was this one.
    pub fn cancel(&self, reason: &str) -> bool {
        let mut slot = self.reason.lock();
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        *slot = Some(reason.to_string());
        true
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}
