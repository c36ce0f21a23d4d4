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

//! Polled resident-memory ceiling for hosts without cgroup v2.
//!
//! Only the direct child is measured. Descendants it forks are not
//! accounted, which is the price of not having kernel support.

use super::containment::{Containment, ContainmentError, ContainmentResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::warn;

pub struct MemoryWatchdog {
    limits_kb: Mutex<HashMap<String, u64>>,
    system: Mutex<System>,
    /// Last sample time per pid, tagged with the pid's label
    last_sample: Mutex<HashMap<u32, (String, Instant)>>,
    sample_interval: Duration,
}

impl MemoryWatchdog {
    pub fn new(sample_interval: Duration) -> Self {
        Self {
            limits_kb: Mutex::new(HashMap::new()),
            system: Mutex::new(System::new()),
            last_sample: Mutex::new(HashMap::new()),
            sample_interval,
        }
    }

    pub fn limit_kb(&self, label: &str) -> Option<u64> {
        self.limits_kb.lock().get(label).copied()
    }

    fn resident_kb(&self, pid: u32) -> Option<u64> {
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock();
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, ProcessRefreshKind::nothing().with_memory());
        system.process(pid).map(|process| process.memory() / 1024)
    }

    fn due(&self, label: &str, pid: u32) -> bool {
        let now = Instant::now();
        let mut last = self.last_sample.lock();
        match last.get(&pid) {
            Some((_, at)) if now.duration_since(*at) < self.sample_interval => false,
            _ => {
                last.insert(pid, (label.to_string(), now));
                true
            }
        }
    }

    pub fn tracked_pids(&self) -> usize {
        self.last_sample.lock().len()
    }
}

impl Default for MemoryWatchdog {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

impl std::fmt::Debug for MemoryWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryWatchdog").field("limits_kb", &*self.limits_kb.lock()).field("sample_interval", &self.sample_interval).finish()
    }
}

impl Containment for MemoryWatchdog {
    fn prepare(&self, label: &str, mem_kb: u64) -> ContainmentResult<()> {
        self.limits_kb.lock().insert(label.to_string(), mem_kb);
        Ok(())
    }

    fn place(&self, label: &str, _pid: u32) -> ContainmentResult<()> {
        if self.limits_kb.lock().contains_key(label) {
            Ok(())
        } else {
            Err(ContainmentError::UnknownGroup(label.to_string()))
        }
    }

    fn exceeded(&self, label: &str, pid: u32) -> bool {
        let Some(limit) = self.limit_kb(label) else {
            return false;
        };
        if !self.due(label, pid) {
            return false;
        }
        match self.resident_kb(pid) {
            Some(resident) if resident > limit => {
                warn!(label, pid, resident_kb = resident, limit_kb = limit, "Process exceeded memory ceiling");
                self.last_sample.lock().remove(&pid);
                true
            }
            Some(_) => false,
            None => {
                self.last_sample.lock().remove(&pid);
                false
            }
        }
    }

    fn remove(&self, label: &str) -> ContainmentResult<()> {
        self.limits_kb.lock().remove(label);
        self.last_sample.lock().retain(|_, (owner, _)| owner != label);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "watchdog"
    }
}
