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

//! Rule analysis end to end: catalog, worker pool, task runner, real checker processes.

use crate::test_utils::{config, gcc_like, script, sources};
use checkrun_common::{CheckerKind, ProgressRecord, RuleCatalog, RuleOptions, Stage};
use checkrun_core::checkers::CheckerRegistry;
use checkrun_core::process::{MemoryWatchdog, ProcessContext};
use checkrun_core::progress::{FileProgressSink, NoProgress, ProgressSink};
use checkrun_core::{CancellationToken, CheckerTaskRunner, ResourcePool, RuleWorkerPool};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const GOTO_LINTER: &str = r#"grep -n goto "$1" | sed "s|^\([0-9]*\):.*|$1:\1: warning: goto used|""#;

fn severity(level: &str) -> RuleOptions {
    RuleOptions {
        severity: Some(level.to_string()),
        ..RuleOptions::default()
    }
}

#[test]
fn test_rules_run_through_pool() {
    let dir = tempfile::tempdir().unwrap();
    let build = sources(dir.path(), &[("a.c", "int main() {\n  goto end;\nend:\n  return 0;\n}\n"), ("b.c", "int f(void) { return 1; }\n")]);

    let mut config = config(dir.path(), 2);
    config.checkers.external.insert(CheckerKind::Gcc.as_str().to_string(), gcc_like(script(dir.path(), "gcc", GOTO_LINTER)));
    let config = Arc::new(config);

    let mut catalog = RuleCatalog::default();
    catalog.insert("misra_c_2012/rule_15_1", vec![CheckerKind::Gcc], RuleOptions::default());
    catalog.insert(
        "misra_c_2012/rule_8_1",
        vec![CheckerKind::Gcc, CheckerKind::Builtin],
        RuleOptions {
            pattern: Some(".*".to_string()),
            ..RuleOptions::default()
        },
    );
    catalog.insert(
        "custom/returns",
        vec![CheckerKind::Builtin],
        RuleOptions {
            pattern: Some("return".to_string()),
            ..severity("low")
        },
    );
    catalog.insert("custom/unbound", vec![CheckerKind::Csa], RuleOptions::default());
    let tasks = catalog.tasks(&[], Arc::new(build), Arc::new(Vec::new())).unwrap();

    let runner = CheckerTaskRunner::new(config.clone(), Arc::new(ResourcePool::new(4, 0)), ProcessContext::uncontained(), CheckerRegistry::from_config(&config));
    let pool = RuleWorkerPool::new(2, Arc::new(runner), Arc::new(NoProgress));
    let mut report = pool.run(tasks, &CancellationToken::new());

    assert!(!report.interrupted);
    assert_eq!(report.completed, 4);
    assert!(report.failures.is_empty(), "{:?}", report.failures);

    report.results.sort_by_location();
    let by_rule = |id: &str| report.results.iter().filter(|f| f.rule_id.as_deref() == Some(id)).cloned().collect::<Vec<_>>();

    let gotos = by_rule("rule_15_1");
    assert_eq!(gotos.len(), 1);
    assert!(gotos[0].path.ends_with("a.c"));
    assert_eq!(gotos[0].line_number, 2);
    assert_eq!(gotos[0].error_kind, "warning");
    assert_eq!(gotos[0].ruleset.as_deref(), Some("misra_c_2012"));

    // GCC decided 8.1, so the scanner never ran.
    let decided = by_rule("rule_8_1");
    assert_eq!(decided.len(), 1);
    assert_eq!(decided[0].checker, Some(CheckerKind::Gcc));

    let returns = by_rule("returns");
    assert_eq!(returns.iter().map(|f| f.line_number).collect::<Vec<_>>(), vec![4, 1]);
    assert!(returns.iter().all(|f| f.severity.as_deref() == Some("low")));

    assert!(by_rule("unbound").is_empty());

    let work_dirs: Vec<PathBuf> = std::fs::read_dir(&config.results_dir).unwrap().map(|e| e.unwrap().path()).collect();
    assert_eq!(work_dirs.len(), 4);
    assert!(work_dirs.iter().all(|d| d.join("results").is_file()));
    assert!(work_dirs.iter().any(|d| d.file_name().unwrap().to_string_lossy().starts_with("rule_15_1-")));
}

#[test]
fn test_memory_kill_is_retried_with_larger_quota() {
    let dir = tempfile::tempdir().unwrap();
    let build = sources(dir.path(), &[("a.c", "int x;\n")]);

    let mut config = config(dir.path(), 2);
    config.limit_memory = true;
    // Dies on the first attempt, reports on the second.
    let flaky = script(
        dir.path(),
        "infer",
        r#"if [ -f "$1/attempted" ]; then echo "$1/x.c:7: note: second attempt"; else touch "$1/attempted"; kill -9 $$; fi"#,
    );
    let mut spec = gcc_like(flaky);
    spec.args = vec!["{work_dir}".to_string()];
    spec.scope = checkrun_common::InvocationScope::WholeBuild;
    config.checkers.external.insert(CheckerKind::Infer.as_str().to_string(), spec);
    let config = Arc::new(config);

    let process = ProcessContext::new(Arc::new(MemoryWatchdog::new(Duration::from_millis(50))));
    let runner = CheckerTaskRunner::new(config.clone(), Arc::new(ResourcePool::new(8, 4_000_000)), process, CheckerRegistry::from_config(&config));
    assert_eq!(runner.base_memory(), 2_000_000);

    let mut catalog = RuleCatalog::default();
    catalog.insert("custom/heavy", vec![CheckerKind::Infer], RuleOptions::default());
    let tasks = catalog.tasks(&[], Arc::new(build), Arc::new(Vec::new())).unwrap();

    let report = RuleWorkerPool::new(1, Arc::new(runner), Arc::new(NoProgress)).run(tasks, &CancellationToken::new());

    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results.results[0].line_number, 7);
    assert_eq!(report.results.results[0].error_message, "second attempt");
}

/// Forwards to the file sink and interrupts the run after `after` rules.
struct InterruptAfter {
    inner: FileProgressSink,
    after: usize,
    token: CancellationToken,
}

impl ProgressSink for InterruptAfter {
    fn report(&self, stage: Stage, done: usize, total: usize, started_at: DateTime<Utc>) {
        self.inner.report(stage, done, total, started_at);
        if done == self.after {
            self.token.cancel("interrupt");
        }
    }
}

#[test]
fn test_interrupt_keeps_completed_rules() {
    let dir = tempfile::tempdir().unwrap();
    let build = sources(dir.path(), &[("a.c", "return;\n")]);
    let config = Arc::new(config(dir.path(), 1));
    std::fs::create_dir_all(&config.results_dir).unwrap();

    let mut catalog = RuleCatalog::default();
    for i in 0..10 {
        catalog.insert(
            format!("custom/rule_{i:02}"),
            vec![CheckerKind::Builtin],
            RuleOptions {
                pattern: Some("return".to_string()),
                ..RuleOptions::default()
            },
        );
    }
    let tasks = catalog.tasks(&[], Arc::new(build), Arc::new(Vec::new())).unwrap();

    let token = CancellationToken::new();
    let sink = FileProgressSink::new(&config.results_dir);
    let progress = Arc::new(InterruptAfter {
        inner: sink.clone(),
        after: 2,
        token: token.clone(),
    });
    let runner = CheckerTaskRunner::new(config.clone(), Arc::new(ResourcePool::new(1, 0)), ProcessContext::uncontained(), CheckerRegistry::from_config(&config));
    let report = RuleWorkerPool::new(1, Arc::new(runner), progress).run(tasks, &token);

    assert!(report.interrupted);
    assert_eq!(report.completed, 2);
    assert_eq!(report.results.len(), 2);
    assert_eq!(token.reason().as_deref(), Some("interrupt"));

    let record: ProgressRecord = serde_json::from_slice(&std::fs::read(sink.path()).unwrap()).unwrap();
    assert_eq!(record.stage_id, Stage::Analysis.id());
    assert_eq!(record.done_ratio, "20%");
}
