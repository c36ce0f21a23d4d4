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

//! cgroup v2 memory containment.
//!
//! Layout under the group the supervisor was started in:
//!
//! ```text
//! <parent>/
//!   cgroup.subtree_control      "+memory"
//!   checkrun_supervisor/        supervisor pid and its parent
//!   <task label>/               one per rule task
//!     memory.max                quota in bytes
//!     memory.swap.max           0
//!     cgroup.procs              checker processes
//! ```
//!
//! The supervisor must leave `<parent>` before memory control can be
//! delegated to its children (no internal processes rule).

use super::containment::{Containment, ContainmentError, ContainmentResult};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const SUPERVISOR_GROUP: &str = "checkrun_supervisor";

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ContainmentError + '_ {
    move |source| ContainmentError::Io { path: path.to_path_buf(), source }
}

fn append_line(path: &Path, value: &str) -> ContainmentResult<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path).map_err(io_err(path))?;
    file.write_all(value.as_bytes()).map_err(io_err(path))
}

fn write_value(path: &Path, value: &str) -> ContainmentResult<()> {
    std::fs::write(path, value).map_err(io_err(path))
}

/// Extracts the unified-hierarchy path from `/proc/<pid>/cgroup` contents.
pub fn parse_self_cgroup(content: &str) -> Option<&str> {
    content.lines().find_map(|line| line.strip_prefix("0::")).map(str::trim)
}

#[derive(Debug)]
pub struct CgroupV2 {
    mount: PathBuf,
    proc_cgroup: PathBuf,
    /// Parent of the supervisor leaf, set once initialized
    parent: Mutex<Option<PathBuf>>,
}

impl CgroupV2 {
    pub fn new(mount: impl Into<PathBuf>) -> Self {
        Self::with_proc_file(mount, "/proc/self/cgroup")
    }

    pub fn with_proc_file(mount: impl Into<PathBuf>, proc_cgroup: impl Into<PathBuf>) -> Self {
        Self {
            mount: mount.into(),
            proc_cgroup: proc_cgroup.into(),
            parent: Mutex::new(None),
        }
    }

    /// Whether `mount` looks like a cgroup v2 hierarchy this process belongs to.
    pub fn is_available(mount: &Path) -> bool {
        mount.join("cgroup.controllers").is_file()
            && std::fs::read_to_string("/proc/self/cgroup")
                .map(|content| parse_self_cgroup(&content).is_some())
                .unwrap_or(false)
    }

    pub fn self_group_path(&self) -> ContainmentResult<PathBuf> {
        let content = std::fs::read_to_string(&self.proc_cgroup).map_err(io_err(&self.proc_cgroup))?;
        let relative = parse_self_cgroup(&content).ok_or_else(|| ContainmentError::SelfGroup(format!("no unified hierarchy entry in {}", self.proc_cgroup.display())))?;
        Ok(self.mount.join(relative.trim_start_matches('/')))
    }

    /// Moves the supervisor into its own leaf and enables memory control
    /// for sibling groups. Idempotent.
    pub fn init(&self) -> ContainmentResult<PathBuf> {
        let mut parent_slot = self.parent.lock();
        if let Some(parent) = parent_slot.as_ref() {
            return Ok(parent.clone());
        }

        let mut parent = self.self_group_path()?;
        if parent.file_name().is_some_and(|name| name == SUPERVISOR_GROUP) {
            parent.pop();
        }

        let leaf = parent.join(SUPERVISOR_GROUP);
        std::fs::create_dir_all(&leaf).map_err(io_err(&leaf))?;

        let procs = leaf.join("cgroup.procs");
        // SAFETY: getppid has no preconditions.
        let ppid = unsafe { libc::getppid() };
        append_line(&procs, &ppid.to_string())?;
        append_line(&procs, &std::process::id().to_string())?;

        append_line(&parent.join("cgroup.subtree_control"), "+memory")?;

        info!(group = %parent.display(), "Initialized memory containment");
        *parent_slot = Some(parent.clone());
        Ok(parent)
    }

    pub fn group_path(&self, label: &str) -> ContainmentResult<PathBuf> {
        Ok(self.init()?.join(label))
    }
}

impl Containment for CgroupV2 {
    fn prepare(&self, label: &str, mem_kb: u64) -> ContainmentResult<()> {
        let group = self.group_path(label)?;
        std::fs::create_dir_all(&group).map_err(io_err(&group))?;

        write_value(&group.join("memory.swap.max"), "0")?;
        write_value(&group.join("memory.max"), &(mem_kb * 1024).to_string())?;

        info!(label, mem_kb, "Memory ceiling set");
        Ok(())
    }

    fn place(&self, label: &str, pid: u32) -> ContainmentResult<()> {
        let group = self.group_path(label)?;
        if !group.is_dir() {
            return Err(ContainmentError::UnknownGroup(label.to_string()));
        }
        append_line(&group.join("cgroup.procs"), &pid.to_string())?;
        debug!(label, pid, "Placed process in memory group");
        Ok(())
    }

    fn remove(&self, label: &str) -> ContainmentResult<()> {
        let group = self.group_path(label)?;
        if group.is_dir() {
            if let Err(source) = std::fs::remove_dir(&group) {
                warn!(label, error = %source, "Failed to remove memory group");
                return Err(ContainmentError::Io { path: group, source });
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "cgroup2"
    }
}
