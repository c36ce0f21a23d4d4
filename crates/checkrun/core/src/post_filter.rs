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

//! Rule-specific policy layered on top of the generic checker loop.

use checkrun_common::{CheckerKind, ResultsList, RuleTask};
use std::collections::HashSet;

/// The clang-based check for 8.1 only matters when GCC could not decide.
pub const RULE_8_1: &str = "misra_c_2012/rule_8_1";
/// Findings inside include guards are opt-in for 2.5.
pub const RULE_2_5: &str = "misra_c_2012/rule_2_5";
pub const OPTIONAL_MARK: &str = "(optional)";

/// Whether the remaining checkers of `task` are skipped once `kind` succeeded.
pub fn stops_after(task: &RuleTask, kind: CheckerKind) -> bool {
    task.rule_name == RULE_8_1 && kind == CheckerKind::Gcc
}

/// Appends one checker's findings to the rule's list.
///
/// With the rule's `dedup` option set, a finding at a location an earlier
/// checker already reported is dropped.
pub fn absorb(task: &RuleTask, rule_results: &mut ResultsList, attempt: ResultsList) {
    if !task.options.dedup {
        rule_results.extend(attempt);
        return;
    }
    let mut seen: HashSet<(String, u32)> = rule_results.iter().map(|f| (f.path.clone(), f.line_number)).collect();
    for finding in attempt {
        if seen.insert((finding.path.clone(), finding.line_number)) {
            rule_results.push(finding);
        }
    }
}

/// Applies whole-rule filters once every checker has run.
pub fn finalize(task: &RuleTask, mut results: ResultsList) -> ResultsList {
    if task.rule_name == RULE_2_5 && !task.options.check_include_guards {
        results.results.retain(|f| !f.error_message.ends_with(OPTIONAL_MARK));
    }
    results
}
