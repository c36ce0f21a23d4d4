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

//! Scoped child-process execution.
//!
//! With memory limiting on, every child is started, suspended, placed in
//! its task's containment group and resumed, so nothing it allocates
//! escapes the ceiling. A wall-clock deadline races the child; when it
//! fires, the child's whole process group is killed.

mod cgroup;
mod containment;
mod watchdog;

pub use cgroup::*;
pub use containment::*;
pub use watchdog::*;

use checkrun_common::{AnalysisConfig, CheckerKind};
use std::io::{PipeReader, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{label} timed out: over {} minutes", .timeout.as_secs() / 60)]
    TimedOut { label: String, timeout: Duration, output: Vec<u8> },
    #[error("{label} was killed")]
    Killed { label: String, output: Vec<u8> },
    #[error("{label} terminated by signal {signal}")]
    Signaled { label: String, signal: i32, output: Vec<u8> },
    #[error("{label} exited with status {code}")]
    Exited { label: String, code: i32, output: Vec<u8> },
    #[error("Containment failed: {0}")]
    Containment(#[from] ContainmentError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    /// Killed by the memory ceiling or the wall-clock deadline.
    pub fn is_resource_kill(&self) -> bool {
        matches!(self, ProcessError::TimedOut { .. } | ProcessError::Killed { .. })
    }

    /// Whatever the child printed before failing.
    pub fn output(&self) -> &[u8] {
        match self {
            ProcessError::TimedOut { output, .. } | ProcessError::Killed { output, .. } | ProcessError::Signaled { output, .. } | ProcessError::Exited { output, .. } => output,
            _ => &[],
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessError::Exited { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type ProcessResult<T> = Result<T, ProcessError>;

/// Per-invocation execution limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecLimits {
    pub limit_memory: bool,
    pub timeout_normal: Option<Duration>,
    pub timeout_oom: Option<Duration>,
    pub memory_hungry: bool,
}

impl ExecLimits {
    pub fn for_checker(config: &AnalysisConfig, kind: CheckerKind) -> Self {
        let minutes = |m: u64| (m > 0).then(|| Duration::from_secs(m.saturating_mul(60)));
        Self {
            limit_memory: config.memory_limiting(),
            timeout_normal: minutes(config.timeout_normal_minutes),
            timeout_oom: minutes(config.timeout_oom_minutes),
            memory_hungry: config.checkers.profile(kind).memory_hungry,
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    /// The longer budget only applies to memory-hungry checkers running contained.
    pub fn effective_timeout(&self) -> Option<Duration> {
        if self.limit_memory && self.memory_hungry { self.timeout_oom } else { self.timeout_normal }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    Inherit,
    Combined,
    Stdout,
}

struct Finished {
    status: ExitStatus,
    output: Vec<u8>,
    timed_out: bool,
}

fn signal(pid: i32, sig: libc::c_int) -> std::io::Result<()> {
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid, sig) } == 0 { Ok(()) } else { Err(std::io::Error::last_os_error()) }
}

/// Kills whatever the exited child left running in its process group.
///
/// Background descendants would otherwise hold the output pipe open and
/// keep the caller blocked past its deadline.
fn reap_group(child: &Child, label: &str) {
    let pgid = child.id() as i32;
    match signal(-pgid, libc::SIGKILL) {
        Ok(()) => debug!(label, pgid, "Killed processes left in the child's group"),
        Err(err) if err.raw_os_error() == Some(libc::ESRCH) => {}
        Err(err) => warn!(label, pgid, error = %err, "Failed to kill leftover processes"),
    }
}

/// Kills the child's process group, falling back to the child alone.
fn kill_tree(child: &mut Child) {
    let pid = child.id() as i32;
    if signal(-pid, libc::SIGKILL).is_err() {
        let _ = child.kill();
    }
}

#[derive(Debug, Clone)]
pub struct ProcessContext {
    containment: Arc<dyn Containment>,
    poll_interval: Duration,
}

impl ProcessContext {
    pub fn new(containment: Arc<dyn Containment>) -> Self {
        Self {
            containment,
            poll_interval: Duration::from_millis(10),
        }
    }

    pub fn uncontained() -> Self {
        Self::new(Arc::new(NoContainment))
    }

    /// Picks cgroup v2 when the host offers it and falls back to the watchdog.
    pub fn from_config(config: &AnalysisConfig) -> Self {
        if !config.memory_limiting() {
            return Self::uncontained();
        }
        if CgroupV2::is_available(&config.cgroup_root) {
            info!(root = %config.cgroup_root.display(), "Using cgroup v2 memory containment");
            Self::new(Arc::new(CgroupV2::new(&config.cgroup_root)))
        } else {
            warn!("cgroup v2 unavailable, falling back to polled memory watchdog");
            Self::new(Arc::new(MemoryWatchdog::default()))
        }
    }

    pub fn containment(&self) -> &dyn Containment {
        self.containment.as_ref()
    }

    /// Creates or resizes the containment group for `label`.
    pub fn prepare_group(&self, label: &str, mem_kb: u64) -> ProcessResult<()> {
        Ok(self.containment.prepare(label, mem_kb)?)
    }

    pub fn remove_group(&self, label: &str) -> ProcessResult<()> {
        Ok(self.containment.remove(label)?)
    }

    /// Runs `cmd` with inherited stdio and no deadline.
    pub fn run(&self, cmd: Command, label: &str, limit_memory: bool) -> ProcessResult<()> {
        let finished = self.execute(cmd, label, limit_memory, None, Capture::Inherit)?;
        classify(label, finished, None).map(|_| ())
    }

    /// Runs `cmd` capturing stdout and stderr interleaved into one buffer.
    pub fn combined_output(&self, cmd: Command, label: &str, limits: &ExecLimits) -> ProcessResult<Vec<u8>> {
        let timeout = limits.effective_timeout();
        let finished = self.execute(cmd, label, limits.limit_memory, timeout, Capture::Combined)?;
        classify(label, finished, timeout)
    }

    /// Runs `cmd` capturing stdout only; stderr is discarded.
    pub fn stdout_output(&self, cmd: Command, label: &str, limits: &ExecLimits) -> ProcessResult<Vec<u8>> {
        let timeout = limits.effective_timeout();
        let finished = self.execute(cmd, label, limits.limit_memory, timeout, Capture::Stdout)?;
        classify(label, finished, timeout)
    }

    fn execute(&self, mut cmd: Command, label: &str, limit_memory: bool, timeout: Option<Duration>, capture: Capture) -> ProcessResult<Finished> {
        let program = cmd.get_program().to_string_lossy().into_owned();

        let reader = match capture {
            Capture::Inherit => None,
            Capture::Combined => {
                let (reader, writer) = std::io::pipe()?;
                cmd.stdout(Stdio::from(writer.try_clone()?)).stderr(Stdio::from(writer));
                Some(reader)
            }
            Capture::Stdout => {
                let (reader, writer) = std::io::pipe()?;
                cmd.stdout(Stdio::from(writer)).stderr(Stdio::null());
                Some(reader)
            }
        };
        if capture != Capture::Inherit {
            cmd.stdin(Stdio::null());
        }
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn { program: program.clone(), source })?;
        // Close the parent's copies of the write end so the reader sees EOF.
        drop(cmd);
        debug!(label, program, pid = child.id(), "Spawned child");

        let collector = reader.map(|mut reader: PipeReader| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = reader.read_to_end(&mut buf);
                buf
            })
        });

        if limit_memory {
            if let Err(err) = self.contain(&child, label) {
                kill_tree(&mut child);
                let _ = child.wait();
                if let Some(handle) = collector {
                    let _ = handle.join();
                }
                return Err(err);
            }
        }

        let (status, timed_out) = self.wait(&mut child, label, limit_memory, timeout)?;
        reap_group(&child, label);
        let output = match collector {
            Some(handle) => handle.join().unwrap_or_default(),
            None => Vec::new(),
        };

        Ok(Finished { status, output, timed_out })
    }

    /// Suspends the child, moves it into the group and resumes it.
    fn contain(&self, child: &Child, label: &str) -> ProcessResult<()> {
        let pid = child.id();
        if let Err(err) = signal(pid as i32, libc::SIGSTOP) {
            error!(label, pid, error = %err, "Failed to suspend child");
        }
        let placed = self.containment.place(label, pid);
        if let Err(err) = &placed {
            error!(label, pid, containment = self.containment.name(), error = %err, "Failed to place child");
        }
        if let Err(err) = signal(pid as i32, libc::SIGCONT) {
            error!(label, pid, error = %err, "Failed to resume child");
        }
        Ok(placed?)
    }

    fn wait(&self, child: &mut Child, label: &str, limit_memory: bool, timeout: Option<Duration>) -> ProcessResult<(ExitStatus, bool)> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let pid = child.id();

        loop {
            if let Some(status) = child.try_wait()? {
                return Ok((status, false));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(label, pid, "Deadline reached, killing child");
                kill_tree(child);
                let status = child.wait()?;
                return Ok((status, true));
            }
            if limit_memory && self.containment.exceeded(label, pid) {
                kill_tree(child);
                let status = child.wait()?;
                return Ok((status, false));
            }
            thread::sleep(self.poll_interval);
        }
    }
}

fn classify(label: &str, finished: Finished, timeout: Option<Duration>) -> ProcessResult<Vec<u8>> {
    let Finished { status, output, timed_out } = finished;
    let label = label.to_string();

    if timed_out {
        return Err(ProcessError::TimedOut {
            label,
            timeout: timeout.unwrap_or_default(),
            output,
        });
    }
    if status.success() {
        return Ok(output);
    }
    match (status.code(), status.signal()) {
        (_, Some(sig)) if sig == libc::SIGKILL => Err(ProcessError::Killed { label, output }),
        (_, Some(signal)) => Err(ProcessError::Signaled { label, signal, output }),
        (Some(code), None) => Err(ProcessError::Exited { label, code, output }),
        (None, None) => Err(ProcessError::Signaled { label, signal: 0, output }),
    }
}
