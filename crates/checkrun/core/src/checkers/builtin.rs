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
use checkrun_common::{CheckerKind, Finding, ResultsList};
use regex::Regex;
use std::path::PathBuf;

/// In-process line scanner driven by the rule's `pattern` option.
///
/// Scans the task's source files, or the build's sources when the task
/// lists none. A `message` string in the rule options replaces the
/// default diagnostic text.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinScanner;

impl BuiltinScanner {
    fn targets(ctx: &CheckerContext) -> Vec<PathBuf> {
        if ctx.task.source_files.is_empty() {
            ctx.task.build_actions.iter().map(|a| a.absolute_source()).collect()
        } else {
            ctx.task.source_files.to_vec()
        }
    }
}

impl Checker for BuiltinScanner {
    fn kind(&self) -> CheckerKind {
        CheckerKind::Builtin
    }

    fn run(&self, ctx: &CheckerContext) -> CheckerResult<ResultsList> {
        let options = &ctx.task.options;
        let pattern = options
            .pattern
            .as_deref()
            .ok_or_else(|| CheckerError::InvalidSpec(format!("{} has no `pattern` option", ctx.task.rule_name)))?;
        let regex = Regex::new(pattern).map_err(|err| CheckerError::InvalidSpec(err.to_string()))?;
        let message = options
            .extra
            .get("message")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("line matches `{pattern}`"));

        let mut results = ResultsList::new();
        for file in Self::targets(ctx) {
            let bytes = std::fs::read(&file)?;
            let content = String::from_utf8_lossy(&bytes);
            for (idx, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    results.push(Finding::new(file.to_string_lossy(), idx as u32 + 1, message.clone()).with_checker(CheckerKind::Builtin));
                }
            }
        }
        Ok(results)
    }
}
