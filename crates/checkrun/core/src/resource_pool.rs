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

//! Process-wide CPU and memory admission control.
//!
//! The pool is created once at startup and shared by reference with every
//! worker. All counter mutation happens under one lock, and every change
//! is announced to waiters through the condition variable; waiters always
//! re-check their predicate under the lock before proceeding.

use checkrun_common::{AnalysisConfig, ResourceQuota};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::time::Instant;
use sysinfo::System;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Cpu,
    Memory,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Cpu => f.write_str("cpu"),
            Dimension::Memory => f.write_str("memory"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Request for {requested} {dimension} units exceeds total capacity {total}")]
    Unsatisfiable { dimension: Dimension, requested: u64, total: u64 },
}

pub type ResourceResult<T> = Result<T, ResourceError>;

pub struct ResourcePool {
    total: ResourceQuota,
    available: Mutex<ResourceQuota>,
    changed: Condvar,
}

impl ResourcePool {
    pub fn new(total_cpu: u64, total_mem_kb: u64) -> Self {
        let total = ResourceQuota::new(total_cpu, total_mem_kb);
        Self {
            total,
            available: Mutex::new(total),
            changed: Condvar::new(),
        }
    }

    /// Sizes memory capacity from the host's currently available memory.
    ///
    /// A non-positive `mem_ratio` yields zero memory capacity, which
    /// disables memory limiting for the run.
    pub fn from_system(total_cpu: u64, mem_ratio: f64) -> Self {
        let total_mem_kb = if mem_ratio > 0.0 {
            let mut system = System::new();
            system.refresh_memory();
            ((system.available_memory() / 1024) as f64 * mem_ratio) as u64
        } else {
            0
        };
        debug!(total_cpu, total_mem_kb, "Resource pool sized from system");
        Self::new(total_cpu, total_mem_kb)
    }

    /// One CPU unit per worker, never fewer than the widest parallel
    /// checker needs. Memory capacity only when limiting is on.
    pub fn for_config(config: &AnalysisConfig) -> Self {
        let total_cpu = (config.effective_workers() as u64).max(config.checkers.parallel_jobs);
        if config.memory_limiting() { Self::from_system(total_cpu, config.avail_mem_ratio) } else { Self::new(total_cpu, 0) }
    }

    pub fn total(&self) -> ResourceQuota {
        self.total
    }

    pub fn total_mem(&self) -> u64 {
        self.total.mem_kb
    }

    pub fn available(&self) -> ResourceQuota {
        *self.available.lock()
    }

    fn check_satisfiable(&self, quota: ResourceQuota) -> ResourceResult<()> {
        if quota.cpu_units > self.total.cpu_units {
            return Err(ResourceError::Unsatisfiable {
                dimension: Dimension::Cpu,
                requested: quota.cpu_units,
                total: self.total.cpu_units,
            });
        }
        if quota.mem_kb > self.total.mem_kb {
            return Err(ResourceError::Unsatisfiable {
                dimension: Dimension::Memory,
                requested: quota.mem_kb,
                total: self.total.mem_kb,
            });
        }
        Ok(())
    }

    /// Blocks until `quota` is available, then takes it.
    ///
    /// Fails without blocking when `quota` can never be satisfied.
    pub fn acquire(&self, quota: ResourceQuota, label: &str) -> ResourceResult<()> {
        self.check_satisfiable(quota)?;

        let started = Instant::now();
        let mut available = self.available.lock();
        while !quota.fits_within(&available) {
            self.changed.wait(&mut available);
        }
        available.cpu_units -= quota.cpu_units;
        available.mem_kb -= quota.mem_kb;
        drop(available);

        debug!(label, %quota, waited_ms = started.elapsed().as_millis() as u64, "Acquired resources");
        Ok(())
    }

    /// Takes `quota` only if it is available right now.
    pub fn try_acquire(&self, quota: ResourceQuota) -> ResourceResult<bool> {
        self.check_satisfiable(quota)?;

        let mut available = self.available.lock();
        if !quota.fits_within(&available) {
            return Ok(false);
        }
        available.cpu_units -= quota.cpu_units;
        available.mem_kb -= quota.mem_kb;
        Ok(true)
    }

    /// Same as [`acquire`](Self::acquire) but hands back a guard releasing on drop.
    pub fn acquire_permit(&self, quota: ResourceQuota, label: &str) -> ResourceResult<ResourcePermit<'_>> {
        self.acquire(quota, label)?;
        Ok(ResourcePermit { pool: self, quota })
    }

    pub fn release(&self, quota: ResourceQuota) {
        let mut available = self.available.lock();
        let cpu = available.cpu_units.saturating_add(quota.cpu_units);
        let mem = available.mem_kb.saturating_add(quota.mem_kb);
        if cpu > self.total.cpu_units || mem > self.total.mem_kb {
            warn!(%quota, "Released more resources than were held");
        }
        available.cpu_units = cpu.min(self.total.cpu_units);
        available.mem_kb = mem.min(self.total.mem_kb);
        drop(available);

        // A single wakeup could land on a waiter whose request still does
        // not fit while a smaller one behind it would.
        self.changed.notify_all();
    }
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool").field("total", &self.total).field("available", &self.available()).finish()
    }
}

/// Held quota, returned to the pool when dropped.
#[must_use = "resources are released as soon as the permit is dropped"]
pub struct ResourcePermit<'a> {
    pool: &'a ResourcePool,
    quota: ResourceQuota,
}

impl ResourcePermit<'_> {
    pub fn quota(&self) -> ResourceQuota {
        self.quota
    }
}

impl Drop for ResourcePermit<'_> {
    fn drop(&mut self) {
        self.pool.release(self.quota);
    }
}
