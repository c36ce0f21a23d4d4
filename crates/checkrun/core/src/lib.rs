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

//! Execution core of the checkrun static-analysis orchestrator.
//!
//! Components, leaf to root:
//! - [`resource_pool`]: bounded CPU/memory counters with blocking admission
//! - [`process`]: child process supervision with containment and timeouts
//! - [`checkers`]: the engines a rule can be bound to
//! - [`task_runner`]: runs one rule's checkers, retrying resource kills once
//! - [`worker_pool`]: drains the rule queue with cooperative cancellation
//! - [`ctu`]: builds the per-architecture cross-translation-unit index

pub mod cancellation;
pub mod checkers;
pub mod ctu;
pub mod post_filter;
pub mod process;
pub mod progress;
pub mod resource_pool;
pub mod task_runner;
pub mod worker_pool;

pub use cancellation::CancellationToken;
pub use ctu::{CtuError, CtuIndexBuilder, CtuSummary};
pub use resource_pool::{ResourceError, ResourcePermit, ResourcePool, ResourceResult};
pub use task_runner::{CheckerTaskRunner, RuleError, TaskRunner};
pub use worker_pool::{PoolReport, RuleWorkerPool, TaskResult};
