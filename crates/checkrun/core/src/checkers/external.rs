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

use super::{Checker, CheckerContext, CheckerError, CheckerResult};
use checkrun_common::{BuildAction, CheckerKind, ExternalCheckerSpec, Finding, InvocationScope, ResultsList};
use regex::Regex;
use std::path::Path;
use std::process::Command;
use tracing::{debug, instrument};

/// A checker backed by a configured binary whose diagnostics are
/// recovered from its output line by line.
#[derive(Debug)]
pub struct ExternalChecker {
    kind: CheckerKind,
    spec: ExternalCheckerSpec,
    pattern: Regex,
}

impl ExternalChecker {
    pub fn new(kind: CheckerKind, spec: ExternalCheckerSpec) -> CheckerResult<Self> {
        let pattern = Regex::new(&spec.output_pattern).map_err(|err| CheckerError::InvalidSpec(format!("{kind}: {err}")))?;
        for group in ["path", "line", "message"] {
            if !pattern.capture_names().flatten().any(|name| name == group) {
                return Err(CheckerError::InvalidSpec(format!("{kind}: output pattern lacks group `{group}`")));
            }
        }
        Ok(Self { kind, spec, pattern })
    }

    fn command(&self, ctx: &CheckerContext, action: Option<&BuildAction>) -> Command {
        let mut cmd = Command::new(&self.spec.binary);
        for arg in &self.spec.args {
            match arg.as_str() {
                "{compiler_args}" => {
                    if let Some(action) = action {
                        cmd.args(&action.compiler_args);
                    }
                }
                "{sources}" => {
                    cmd.args(ctx.task.build_actions.iter().map(|a| a.absolute_source()));
                }
                _ => {
                    cmd.arg(expand(arg, ctx, action));
                }
            }
        }
        match action {
            Some(action) => cmd.current_dir(&action.directory),
            None => cmd.current_dir(&ctx.work_dir),
        };
        cmd
    }

    /// Runs one command, tolerating the configured exit codes.
    fn invoke(&self, ctx: &CheckerContext, cmd: Command) -> CheckerResult<Vec<u8>> {
        match ctx.process.combined_output(cmd, &ctx.label, &ctx.limits) {
            Ok(output) => Ok(output),
            Err(err) if err.exit_code().is_some_and(|code| self.spec.accepted_exit_codes.contains(&code)) => Ok(err.output().to_vec()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn parse_output(&self, output: &str, base: &Path) -> ResultsList {
        let mut results = ResultsList::new();
        for line in output.lines() {
            let Some(caps) = self.pattern.captures(line) else {
                continue;
            };
            let (Some(path), Some(line_number), Some(message)) = (caps.name("path"), caps.name("line"), caps.name("message")) else {
                continue;
            };
            let Ok(line_number) = line_number.as_str().parse::<u32>() else {
                continue;
            };
            let path = Path::new(path.as_str());
            let path = if path.is_absolute() { path.to_path_buf() } else { base.join(path) };

            let mut finding = Finding::new(path.to_string_lossy(), line_number, message.as_str().trim()).with_checker(self.kind);
            if let Some(kind) = caps.name("kind") {
                finding = finding.with_kind(kind.as_str());
            }
            results.push(finding);
        }
        results
    }
}

fn expand(template: &str, ctx: &CheckerContext, action: Option<&BuildAction>) -> String {
    let mut out = template
        .replace("{work_dir}", &ctx.work_dir.to_string_lossy())
        .replace("{rule}", &ctx.task.rule_name)
        .replace("{ctu_dir}", &ctx.ctu_dir.to_string_lossy())
        .replace("{jobs}", &ctx.quota.cpu_units.to_string());
    if let Some(action) = action {
        out = out
            .replace("{source}", &action.absolute_source().to_string_lossy())
            .replace("{directory}", &action.directory.to_string_lossy());
    }
    out
}

impl Checker for ExternalChecker {
    fn kind(&self) -> CheckerKind {
        self.kind
    }

    #[instrument(skip(self, ctx), fields(rule = %ctx.task.rule_name, checker = %self.kind))]
    fn run(&self, ctx: &CheckerContext) -> CheckerResult<ResultsList> {
        let mut results = ResultsList::new();
        match self.spec.scope {
            InvocationScope::PerFile => {
                for action in ctx.task.build_actions.iter() {
                    let output = self.invoke(ctx, self.command(ctx, Some(action)))?;
                    results.extend(self.parse_output(&String::from_utf8_lossy(&output), &action.directory));
                }
            }
            InvocationScope::WholeBuild => {
                let output = self.invoke(ctx, self.command(ctx, None))?;
                std::fs::write(ctx.work_dir.join(format!("{}.out", self.kind)), &output)?;
                results = self.parse_output(&String::from_utf8_lossy(&output), &ctx.work_dir);
            }
        }
        debug!(findings = results.len(), "External checker finished");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ExecLimits, ProcessContext};
    use checkrun_common::{ResourceQuota, RuleTask};
    use std::sync::Arc;

    const GCC_PATTERN: &str = r"^(?P<path>[^:]+):(?P<line>\d+):\d+: (?P<kind>warning|error): (?P<message>.*)$";

    fn spec(binary: &str, args: &[&str], scope: InvocationScope) -> ExternalCheckerSpec {
        ExternalCheckerSpec {
            binary: binary.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            scope,
            output_pattern: GCC_PATTERN.to_string(),
            accepted_exit_codes: vec![0, 1],
        }
    }

    fn context(dir: &Path) -> CheckerContext {
        let mut action = BuildAction::new("a.c", dir);
        action.compiler_args = vec!["-DX=1".to_string()];
        let task = RuleTask::new("demo/rule_1", vec![CheckerKind::Gcc]).with_build(Arc::new(vec![action]), Arc::new(vec![]));
        CheckerContext {
            task,
            work_dir: dir.to_path_buf(),
            label: "rule_1-test".to_string(),
            quota: ResourceQuota::new(1, 0),
            limits: ExecLimits::unbounded(),
            process: ProcessContext::uncontained(),
            ctu_dir: dir.join("ctu-dir"),
        }
    }

    #[test]
    fn test_rejects_pattern_without_groups() {
        let mut bad = spec("gcc", &[], InvocationScope::PerFile);
        bad.output_pattern = r"^(?P<path>.*)$".to_string();
        assert!(matches!(ExternalChecker::new(CheckerKind::Gcc, bad), Err(CheckerError::InvalidSpec(_))));
    }

    #[test]
    fn test_parse_output_resolves_relative_paths() {
        let checker = ExternalChecker::new(CheckerKind::Gcc, spec("gcc", &[], InvocationScope::PerFile)).unwrap();
        let output = "a.c:3:5: warning: unused variable\nnoise line\n/abs/b.c:10:1: error: bad\n";
        let results = checker.parse_output(output, Path::new("/w"));

        assert_eq!(results.len(), 2);
        assert_eq!(results.results[0].path, "/w/a.c");
        assert_eq!(results.results[0].line_number, 3);
        assert_eq!(results.results[0].error_kind, "warning");
        assert_eq!(results.results[0].checker, Some(CheckerKind::Gcc));
        assert_eq!(results.results[1].path, "/abs/b.c");
    }

    #[test]
    fn test_per_file_run_expands_templates() {
        let dir = tempfile::tempdir().unwrap();
        let checker = ExternalChecker::new(
            CheckerKind::Gcc,
            spec("/bin/sh", &["-c", "echo \"$0:7:1: warning: $1 $2\"; exit 1", "{source}", "{compiler_args}", "{rule}"], InvocationScope::PerFile),
        )
        .unwrap();

        let results = checker.run(&context(dir.path())).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results.results[0].path, dir.path().join("a.c").to_string_lossy());
        assert_eq!(results.results[0].error_message, "-DX=1 demo/rule_1");
    }

    #[test]
    fn test_whole_build_keeps_raw_output() {
        let dir = tempfile::tempdir().unwrap();
        let checker = ExternalChecker::new(CheckerKind::Gcc, spec("/bin/sh", &["-c", "echo 'x.c:2:1: error: boom'"], InvocationScope::WholeBuild)).unwrap();

        let results = checker.run(&context(dir.path())).unwrap();
        assert_eq!(results.len(), 1);
        assert!(dir.path().join("gcc.out").is_file());
    }

    #[test]
    fn test_unaccepted_exit_code_fails() {
        let dir = tempfile::tempdir().unwrap();
        let checker = ExternalChecker::new(CheckerKind::Gcc, spec("/bin/sh", &["-c", "exit 2"], InvocationScope::WholeBuild)).unwrap();

        let err = checker.run(&context(dir.path())).unwrap_err();
        assert!(matches!(err, CheckerError::Process(_)));
        assert!(!err.is_resource_kill());
    }
}
