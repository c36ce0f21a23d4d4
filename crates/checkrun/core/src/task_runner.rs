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

//! Runs the checkers bound to one rule.
//!
//! Per `(rule, checker)` pair the attempt moves through
//! `Allocated -> Running -> {Succeeded, Failed, ResourceKilled}`. A
//! resource kill goes back to `Allocated` with a larger memory quota, at
//! most `retry.max_retries` times. Resources are held only for the
//! duration of one attempt.

use crate::cancellation::CancellationToken;
use crate::checkers::{Checker, CheckerContext, CheckerRegistry, CheckerResult};
use crate::post_filter;
use crate::process::{ExecLimits, ProcessContext, ProcessError};
use crate::resource_pool::{ResourceError, ResourcePool};
use checkrun_common::{AnalysisConfig, CheckerKind, ResourceQuota, ResultsList, RuleTask};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Failures fatal to a whole rule task.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Failed to acquire resources for {rule}: {source}")]
    Resource {
        rule: String,
        #[source]
        source: ResourceError,
    },
    #[error("Failed to create working directory for {rule}: {source}")]
    WorkDir {
        rule: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to set up memory containment for {rule}: {source}")]
    Containment {
        rule: String,
        #[source]
        source: ProcessError,
    },
    #[error("Rule {0} is bound to no checker")]
    NoCheckers(String),
    #[error("Rule task {rule} panicked: {message}")]
    Panicked { rule: String, message: String },
    /// The run was cancelled before every checker of the rule ran.
    #[error("Rule {0} was interrupted before all checkers ran")]
    Interrupted(String),
}

/// Seam between the worker pool and whatever executes a rule.
pub trait TaskRunner: Send + Sync {
    fn run(&self, task: &RuleTask, cancel: &CancellationToken) -> Result<ResultsList, RuleError>;
}

pub struct CheckerTaskRunner {
    config: Arc<AnalysisConfig>,
    pool: Arc<ResourcePool>,
    process: ProcessContext,
    registry: CheckerRegistry,
}

/// Identity of one rule task's private scratch space.
struct TaskScope<'a> {
    task: &'a RuleTask,
    work_dir: PathBuf,
    label: String,
    limit_memory: bool,
}

impl CheckerTaskRunner {
    pub fn new(config: Arc<AnalysisConfig>, pool: Arc<ResourcePool>, process: ProcessContext, registry: CheckerRegistry) -> Self {
        Self { config, pool, process, registry }
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// Memory share of one checker before any retry escalation.
    pub fn base_memory(&self) -> u64 {
        self.pool.total_mem() / self.config.effective_workers().max(1) as u64
    }

    fn create_work_dir(&self, task: &RuleTask) -> std::io::Result<PathBuf> {
        let basename = Path::new(&task.rule_name).file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "rule".to_string());

        std::fs::create_dir_all(&self.config.results_dir)?;
        let work_dir = tempfile::Builder::new().prefix(&format!("{basename}-")).tempdir_in(&self.config.results_dir)?.keep();
        std::fs::File::create(work_dir.join("results"))?;
        Ok(work_dir)
    }

    /// One `Allocated -> Running -> terminal` pass.
    ///
    /// The outer result carries rule-fatal failures, the inner one the
    /// checker's own outcome.
    fn attempt(&self, scope: &TaskScope<'_>, checker: &dyn Checker, kind: CheckerKind, quota: ResourceQuota) -> Result<CheckerResult<ResultsList>, RuleError> {
        let rule = || scope.task.rule_name.clone();

        if scope.limit_memory {
            self.process.prepare_group(&scope.label, quota.mem_kb).map_err(|source| RuleError::Containment { rule: rule(), source })?;
        }
        let _permit = self.pool.acquire_permit(quota, &scope.label).map_err(|source| RuleError::Resource { rule: rule(), source })?;

        let mut limits = ExecLimits::for_checker(&self.config, kind);
        limits.limit_memory = scope.limit_memory;

        let ctx = CheckerContext {
            task: scope.task.clone(),
            work_dir: scope.work_dir.clone(),
            label: scope.label.clone(),
            quota,
            limits,
            process: self.process.clone(),
            ctu_dir: self.config.ctu_dir(),
        };
        Ok(checker.run(&ctx))
    }

    /// Runs one checker, retrying resource kills with escalated memory.
    fn run_checker(&self, scope: &TaskScope<'_>, checker: &dyn Checker, kind: CheckerKind) -> Result<CheckerResult<ResultsList>, RuleError> {
        let retry = self.config.retry;
        let mem_kb = if scope.limit_memory { self.base_memory() } else { 0 };
        let mut quota = ResourceQuota::new(self.config.checkers.cpu_units(kind), mem_kb);
        let mut retries = 0;

        loop {
            let outcome = self.attempt(scope, checker, kind, quota)?;
            match outcome {
                Err(err) if err.is_resource_kill() && scope.limit_memory && retries < retry.max_retries => {
                    let next = quota.scale_memory(retry.memory_factor);
                    warn!(
                        rule = %scope.task.rule_name,
                        checker = %kind,
                        error = %err,
                        from_kb = quota.mem_kb,
                        to_kb = next.mem_kb,
                        "Checker killed for exhausting resources, retrying with more memory"
                    );
                    quota = next;
                    retries += 1;
                }
                other => return Ok(other),
            }
        }
    }
}

impl TaskRunner for CheckerTaskRunner {
    #[instrument(skip_all, fields(rule = %task.rule_name))]
    fn run(&self, task: &RuleTask, cancel: &CancellationToken) -> Result<ResultsList, RuleError> {
        if task.checkers.is_empty() {
            return Err(RuleError::NoCheckers(task.rule_name.clone()));
        }

        let work_dir = self.create_work_dir(task).map_err(|source| RuleError::WorkDir { rule: task.rule_name.clone(), source })?;
        let label = work_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let scope = TaskScope {
            task,
            work_dir,
            label,
            limit_memory: self.config.memory_limiting() && self.pool.total_mem() > 0,
        };
        info!(label = %scope.label, checkers = ?task.checkers, "Checking rule");

        let mut results = ResultsList::new();
        let outcome = self.run_checkers(&scope, cancel, &mut results);

        if scope.limit_memory {
            if let Err(err) = self.process.remove_group(&scope.label) {
                warn!(label = %scope.label, error = %err, "Memory group left behind");
            }
        }
        outcome?;

        let results = post_filter::finalize(task, results);
        info!(label = %scope.label, findings = results.len(), "Rule finished");
        Ok(results)
    }
}

impl CheckerTaskRunner {
    fn run_checkers(&self, scope: &TaskScope<'_>, cancel: &CancellationToken, results: &mut ResultsList) -> Result<(), RuleError> {
        let task = scope.task;
        for &kind in &task.checkers {
            if cancel.is_cancelled() {
                info!(checker = %kind, "Interrupted, skipping remaining checkers");
                return Err(RuleError::Interrupted(task.rule_name.clone()));
            }

            let checker = match self.registry.get(kind) {
                Ok(checker) => checker,
                Err(err) => {
                    error!(checker = %kind, error = %err, "Checker failed");
                    continue;
                }
            };

            match self.run_checker(scope, checker.as_ref(), kind)? {
                Ok(findings) => {
                    info!(checker = %kind, findings = findings.len(), "Checker reported");
                    post_filter::absorb(task, results, findings);
                    if post_filter::stops_after(task, kind) {
                        break;
                    }
                }
                Err(err) => {
                    error!(checker = %kind, resource_kill = err.is_resource_kill(), error = %err, "Checker failed");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkers::{CheckerError, MockChecker};
    use crate::process::MemoryWatchdog;
    use checkrun_common::Finding;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn killed() -> CheckerError {
        CheckerError::Process(ProcessError::Killed {
            label: "t".to_string(),
            output: Vec::new(),
        })
    }

    fn findings(path: &str, lines: &[u32]) -> ResultsList {
        lines.iter().map(|&l| Finding::new(path, l, "m")).collect::<Vec<_>>().into()
    }

    fn mock(kind: CheckerKind) -> MockChecker {
        let mut mock = MockChecker::new();
        mock.expect_kind().return_const(kind);
        mock
    }

    struct Harness {
        _dir: TempDir,
        runner: CheckerTaskRunner,
    }

    fn harness(limit_memory: bool, pool: ResourcePool, checkers: Vec<MockChecker>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = AnalysisConfig {
            results_dir: dir.path().to_path_buf(),
            num_workers: 2,
            limit_memory,
            ..AnalysisConfig::default()
        };
        let mut registry = CheckerRegistry::new();
        for checker in checkers {
            registry.register(Arc::new(checker));
        }
        let process = ProcessContext::new(Arc::new(MemoryWatchdog::new(Duration::ZERO)));
        Harness {
            runner: CheckerTaskRunner::new(Arc::new(config), Arc::new(pool), process, registry),
            _dir: dir,
        }
    }

    #[test]
    fn test_resource_kill_retried_once_with_larger_quota() {
        let quotas = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&quotas);

        let mut gcc = mock(CheckerKind::Gcc);
        gcc.expect_run().times(2).returning(move |ctx| {
            seen.lock().push(ctx.quota.mem_kb);
            Err(killed())
        });

        let h = harness(true, ResourcePool::new(4, 4000), vec![gcc]);
        let task = RuleTask::new("x/rule_1", vec![CheckerKind::Gcc]);
        let results = h.runner.run(&task, &CancellationToken::new()).unwrap();

        assert!(results.is_empty());
        assert_eq!(*quotas.lock(), vec![2000, 3000]);
        assert_eq!(h.runner.pool().available(), ResourceQuota::new(4, 4000));
    }

    #[test]
    fn test_retry_findings_replace_killed_attempt() {
        let mut calls = 0;
        let mut gcc = mock(CheckerKind::Gcc);
        gcc.expect_run().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 { Err(killed()) } else { Ok(findings("a.c", &[7])) }
        });

        let h = harness(true, ResourcePool::new(4, 4000), vec![gcc]);
        let task = RuleTask::new("x/rule_1", vec![CheckerKind::Gcc]);
        let results = h.runner.run(&task, &CancellationToken::new()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results.results[0].line_number, 7);
    }

    #[test]
    fn test_no_retry_without_memory_limiting() {
        let mut gcc = mock(CheckerKind::Gcc);
        gcc.expect_run().times(1).returning(|ctx| {
            assert_eq!(ctx.quota.mem_kb, 0);
            assert!(!ctx.limits.limit_memory);
            Err(killed())
        });

        let h = harness(false, ResourcePool::new(4, 0), vec![gcc]);
        let task = RuleTask::new("x/rule_1", vec![CheckerKind::Gcc]);
        assert!(h.runner.run(&task, &CancellationToken::new()).unwrap().is_empty());
    }

    #[test]
    fn test_failed_checker_does_not_abort_siblings() {
        let mut gcc = mock(CheckerKind::Gcc);
        gcc.expect_run().times(1).returning(|_| Err(CheckerError::InvalidSpec("broken".to_string())));
        let mut csa = mock(CheckerKind::Csa);
        csa.expect_run().times(1).returning(|_| Ok(findings("b.c", &[2, 1])));
        let mut tidy = mock(CheckerKind::ClangTidy);
        tidy.expect_run().times(1).returning(|_| Ok(findings("a.c", &[9])));

        let h = harness(false, ResourcePool::new(2, 0), vec![gcc, csa, tidy]);
        let task = RuleTask::new("x/rule_1", vec![CheckerKind::Gcc, CheckerKind::Csa, CheckerKind::ClangTidy]);
        let results = h.runner.run(&task, &CancellationToken::new()).unwrap();

        let order: Vec<_> = results.iter().map(|f| f.location()).collect();
        assert_eq!(order, vec![("b.c", 2), ("b.c", 1), ("a.c", 9)]);
    }

    #[test]
    fn test_unregistered_checker_is_skipped() {
        let mut csa = mock(CheckerKind::Csa);
        csa.expect_run().times(1).returning(|_| Ok(findings("a.c", &[1])));

        let h = harness(false, ResourcePool::new(1, 0), vec![csa]);
        let task = RuleTask::new("x/rule_1", vec![CheckerKind::Infer, CheckerKind::Csa]);
        assert_eq!(h.runner.run(&task, &CancellationToken::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_rule_8_1_stops_after_gcc_success() {
        let mut gcc = mock(CheckerKind::Gcc);
        gcc.expect_run().times(1).returning(|_| Ok(ResultsList::new()));
        let mut misra = mock(CheckerKind::Misra);
        misra.expect_run().times(0);

        let h = harness(false, ResourcePool::new(1, 0), vec![gcc, misra]);
        let task = RuleTask::new(post_filter::RULE_8_1, vec![CheckerKind::Gcc, CheckerKind::Misra]);
        h.runner.run(&task, &CancellationToken::new()).unwrap();
    }

    #[test]
    fn test_unsatisfiable_request_is_fatal() {
        let mut infer = mock(CheckerKind::Infer);
        infer.expect_run().times(0);

        // Infer is parallel and asks for `parallel_jobs` CPU units.
        let h = harness(false, ResourcePool::new(1, 0), vec![infer]);
        let task = RuleTask::new("x/rule_1", vec![CheckerKind::Infer]);
        let err = h.runner.run(&task, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, RuleError::Resource { .. }));
    }

    #[test]
    fn test_work_dir_and_label() {
        let labels = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&labels);
        let mut gcc = mock(CheckerKind::Gcc);
        gcc.expect_run().times(1).returning(move |ctx| {
            assert!(ctx.work_dir.join("results").is_file());
            seen.lock().push((ctx.label.clone(), ctx.work_dir.clone()));
            Ok(ResultsList::new())
        });

        let h = harness(false, ResourcePool::new(1, 0), vec![gcc]);
        let task = RuleTask::new("misra_c_2012/rule_9_1", vec![CheckerKind::Gcc]);
        h.runner.run(&task, &CancellationToken::new()).unwrap();

        let (label, work_dir) = labels.lock()[0].clone();
        assert!(label.starts_with("rule_9_1-"));
        assert_eq!(work_dir.file_name().unwrap().to_string_lossy(), label);
        assert!(work_dir.is_dir());
    }

    #[test]
    fn test_cancelled_task_skips_remaining_checkers() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let mut gcc = mock(CheckerKind::Gcc);
        gcc.expect_run().times(1).returning(move |_| {
            trigger.cancel("interrupt");
            Ok(findings("a.c", &[1]))
        });
        let mut csa = mock(CheckerKind::Csa);
        csa.expect_run().times(0);

        let h = harness(false, ResourcePool::new(1, 0), vec![gcc, csa]);
        let task = RuleTask::new("x/rule_1", vec![CheckerKind::Gcc, CheckerKind::Csa]);
        assert!(matches!(h.runner.run(&task, &token), Err(RuleError::Interrupted(rule)) if rule == "x/rule_1"));
    }

    #[test]
    fn test_cancel_during_last_checker_completes_rule() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let mut gcc = mock(CheckerKind::Gcc);
        gcc.expect_run().times(1).returning(move |_| {
            trigger.cancel("interrupt");
            Ok(findings("a.c", &[1]))
        });

        let h = harness(false, ResourcePool::new(1, 0), vec![gcc]);
        let task = RuleTask::new("x/rule_1", vec![CheckerKind::Gcc]);
        assert_eq!(h.runner.run(&task, &token).unwrap().len(), 1);
    }

    #[test]
    fn test_rule_without_checkers() {
        let h = harness(false, ResourcePool::new(1, 0), vec![]);
        let task = RuleTask::new("x/rule_1", vec![]);
        assert!(matches!(h.runner.run(&task, &CancellationToken::new()), Err(RuleError::NoCheckers(_))));
    }
}
