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

use super::{Checker, CheckerContext, CheckerResult};
use checkrun_common::{CheckerKind, ResultsList};
use tracing::debug;

/// Placeholder for rules that have no engine yet.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyChecker;

impl Checker for EmptyChecker {
    fn kind(&self) -> CheckerKind {
        CheckerKind::Empty
    }

    fn run(&self, ctx: &CheckerContext) -> CheckerResult<ResultsList> {
        debug!(rule = %ctx.task.rule_name, "Rule has no checker implementation");
        Ok(ResultsList::new())
    }
}
