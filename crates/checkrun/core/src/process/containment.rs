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

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContainmentError {
    #[error("Cannot determine own containment group: {0}")]
    SelfGroup(String),
    #[error("Containment group {0} was never prepared")]
    UnknownGroup(String),
    #[error("Failed to update {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type ContainmentResult<T> = Result<T, ContainmentError>;

/// Places child processes under a memory ceiling.
///
/// A group is keyed by the task label. `prepare` may be called again for
/// the same label with a new ceiling before a retry.
pub trait Containment: Send + Sync + fmt::Debug {
    /// Creates the group for `label` if needed and sets its ceiling.
    fn prepare(&self, label: &str, mem_kb: u64) -> ContainmentResult<()>;

    /// Moves a suspended child into the group.
    fn place(&self, label: &str, pid: u32) -> ContainmentResult<()>;

    /// Polled while the child runs. `true` means the child must be killed.
    fn exceeded(&self, _label: &str, _pid: u32) -> bool {
        false
    }

    /// Tears the group down once no process is left in it.
    fn remove(&self, _label: &str) -> ContainmentResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

/// Runs children without any ceiling.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContainment;

impl Containment for NoContainment {
    fn prepare(&self, _label: &str, _mem_kb: u64) -> ContainmentResult<()> {
        Ok(())
    }

    fn place(&self, _label: &str, _pid: u32) -> ContainmentResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}
