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

use serde::{Deserialize, Serialize};
use std::fmt;

/// Amount of CPU and memory a checker invocation holds while it runs.
///
/// Memory is expressed in kilobytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub cpu_units: u64,
    pub mem_kb: u64,
}

impl ResourceQuota {
    pub const fn new(cpu_units: u64, mem_kb: u64) -> Self {
        Self { cpu_units, mem_kb }
    }

    /// Returns the quota with its memory share scaled by `factor`.
    ///
    /// CPU units are left untouched; only memory escalates on retry.
    pub fn scale_memory(self, factor: f64) -> Self {
        Self {
            cpu_units: self.cpu_units,
            mem_kb: (self.mem_kb as f64 * factor) as u64,
        }
    }

    pub fn fits_within(&self, other: &ResourceQuota) -> bool {
        self.cpu_units <= other.cpu_units && self.mem_kb <= other.mem_kb
    }
}

impl fmt::Display for ResourceQuota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cpu, {} KB", self.cpu_units, self.mem_kb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_memory_keeps_cpu() {
        let quota = ResourceQuota::new(2, 1000);
        let scaled = quota.scale_memory(1.5);
        assert_eq!(scaled.cpu_units, 2);
        assert_eq!(scaled.mem_kb, 1500);
    }

    #[test]
    fn test_fits_within() {
        let total = ResourceQuota::new(4, 4096);
        assert!(ResourceQuota::new(4, 4096).fits_within(&total));
        assert!(!ResourceQuota::new(5, 1).fits_within(&total));
        assert!(!ResourceQuota::new(1, 4097).fits_within(&total));
    }
}
