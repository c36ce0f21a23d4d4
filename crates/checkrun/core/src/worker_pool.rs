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

//! Fixed-size pool draining the rule queue.
//!
//! Topology:
//! - one dispatcher feeding a bounded job channel
//! - `N` workers, each running one rule task at a time
//! - one collector, the only writer of the aggregate
//!
//! Cancellation is checked before every dispatch, before a worker starts
//! a dequeued task and again once the collector has received a result, so
//! nothing finishing after the interrupt enters the aggregate. Workers in
//! the middle of a checker invocation are never interrupted; a rule whose
//! remaining checkers were skipped is dropped as incomplete.

use crate::cancellation::CancellationToken;
use crate::progress::ProgressSink;
use crate::task_runner::{RuleError, TaskRunner};
use checkrun_common::{ResultsList, RuleTask, Stage, format_elapsed, percent_string};
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const COLLECT_POLL: Duration = Duration::from_millis(50);

/// Outcome of one rule task, handed from a worker to the collector.
#[derive(Debug)]
pub struct TaskResult {
    pub rule_name: String,
    pub ruleset: String,
    pub rule_id: String,
    pub severity: Option<String>,
    pub results: ResultsList,
    pub error: Option<RuleError>,
}

/// Best-effort aggregate of a pool run.
#[derive(Debug, Default)]
pub struct PoolReport {
    pub results: ResultsList,
    pub total: usize,
    pub completed: usize,
    /// Rules whose task failed, with the reason
    pub failures: Vec<(String, RuleError)>,
    pub interrupted: bool,
}

impl PoolReport {
    pub fn succeeded(&self) -> usize {
        self.completed - self.failures.len()
    }
}

pub struct RuleWorkerPool {
    workers: usize,
    runner: Arc<dyn TaskRunner>,
    progress: Arc<dyn ProgressSink>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl RuleWorkerPool {
    /// `workers == 0` picks the CPU count.
    pub fn new(workers: usize, runner: Arc<dyn TaskRunner>, progress: Arc<dyn ProgressSink>) -> Self {
        let workers = if workers == 0 { num_cpus::get() } else { workers };
        Self { workers, runner, progress }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs every task, returning whatever was collected before completion or interruption.
    pub fn run(&self, tasks: Vec<RuleTask>, cancel: &CancellationToken) -> PoolReport {
        let total = tasks.len();
        let (job_tx, job_rx) = bounded::<RuleTask>(self.workers);
        let (result_tx, result_rx) = bounded::<TaskResult>(self.workers);
        info!(workers = self.workers, rules = total, "Starting rule analysis");

        thread::scope(|scope| {
            for id in 0..self.workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let runner = Arc::clone(&self.runner);
                thread::Builder::new()
                    .name(format!("rule-worker-{id}"))
                    .spawn_scoped(scope, move || Self::worker_loop(id, runner.as_ref(), job_rx, result_tx, cancel))
                    .map_err(|err| error!(worker = id, error = %err, "Failed to start worker"))
                    .ok();
            }
            drop(job_rx);
            drop(result_tx);

            scope.spawn(move || Self::dispatch(tasks, job_tx, cancel));

            self.collect(result_rx, total, cancel)
        })
    }

    fn dispatch(tasks: Vec<RuleTask>, job_tx: Sender<RuleTask>, cancel: &CancellationToken) {
        for task in tasks {
            if cancel.is_cancelled() {
                debug!("Dispatch stopped by interrupt");
                break;
            }
            if job_tx.send(task).is_err() {
                break;
            }
        }
    }

    fn worker_loop(id: usize, runner: &dyn TaskRunner, job_rx: Receiver<RuleTask>, result_tx: Sender<TaskResult>, cancel: &CancellationToken) {
        while let Ok(task) = job_rx.recv() {
            if cancel.is_cancelled() {
                debug!(worker = id, rule = %task.rule_name, "Skipping queued rule after interrupt");
                continue;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| runner.run(&task, cancel))).unwrap_or_else(|payload| {
                Err(RuleError::Panicked {
                    rule: task.rule_name.clone(),
                    message: panic_message(payload.as_ref()),
                })
            });

            let (results, error) = match outcome {
                Ok(results) => (results, None),
                Err(RuleError::Interrupted(rule)) => {
                    debug!(worker = id, rule = %rule, "Dropping rule cut short by interrupt");
                    continue;
                }
                Err(err) => (ResultsList::new(), Some(err)),
            };
            let result = TaskResult {
                ruleset: task.ruleset().to_string(),
                rule_id: task.rule_id().to_string(),
                severity: task.options.severity.clone(),
                rule_name: task.rule_name,
                results,
                error,
            };
            if result_tx.send(result).is_err() {
                debug!(worker = id, "Collector gone, worker exiting");
                break;
            }
        }
    }

    fn collect(&self, result_rx: Receiver<TaskResult>, total: usize, cancel: &CancellationToken) -> PoolReport {
        let started = Instant::now();
        let started_at = Utc::now();
        let mut report = PoolReport {
            total,
            ..PoolReport::default()
        };

        while report.completed < total {
            if cancel.is_cancelled() {
                Self::interrupted(&mut report, cancel);
                break;
            }
            let result = match result_rx.recv_timeout(COLLECT_POLL) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    if cancel.is_cancelled() {
                        Self::interrupted(&mut report, cancel);
                    }
                    break;
                }
            };
            // A result that lands after the interrupt is not part of the aggregate.
            if cancel.is_cancelled() {
                debug!(rule = %result.rule_name, "Discarding result received after interrupt");
                Self::interrupted(&mut report, cancel);
                break;
            }

            let rule_name = result.rule_name.clone();
            report.completed += 1;
            Self::absorb(&mut report, result);

            info!(
                "Analysis of {} completed ({}, {}/{}) [{}]",
                rule_name,
                percent_string(report.completed, total),
                report.completed,
                total,
                format_elapsed(started.elapsed())
            );
            self.progress.report(Stage::Analysis, report.completed, total, started_at);
        }
        report
    }

    fn interrupted(report: &mut PoolReport, cancel: &CancellationToken) {
        warn!(
            completed = report.completed,
            total = report.total,
            reason = cancel.reason().as_deref().unwrap_or("interrupt"),
            "Analysis interrupted, returning partial results"
        );
        report.interrupted = true;
    }

    fn absorb(report: &mut PoolReport, result: TaskResult) {
        let TaskResult {
            rule_name,
            ruleset,
            rule_id,
            severity,
            results,
            error,
        } = result;

        if let Some(err) = error {
            error!(rule = %rule_name, error = %err, "Rule failed");
            report.failures.push((rule_name, err));
            return;
        }

        for mut finding in results {
            finding.ruleset = Some(ruleset.clone());
            finding.rule_id = Some(rule_id.clone());
            if severity.is_some() {
                finding.severity = severity.clone();
            }
            report.results.push(finding);
        }
    }
}
