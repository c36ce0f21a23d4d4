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

use serde::{Deserialize, Serialize};
use std::fmt;

/// Analysis engines a rule can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckerKind {
    Infer,
    Csa,
    CppcheckBinary,
    CppcheckStu,
    CppcheckCtu,
    ClangTidy,
    Misra,
    ClangSema,
    Gcc,
    LibtoolingStu,
    LibtoolingCtu,
    Builtin,
    Empty,
}

impl CheckerKind {
    pub const ALL: [CheckerKind; 13] = [
        CheckerKind::Infer,
        CheckerKind::Csa,
        CheckerKind::CppcheckBinary,
        CheckerKind::CppcheckStu,
        CheckerKind::CppcheckCtu,
        CheckerKind::ClangTidy,
        CheckerKind::Misra,
        CheckerKind::ClangSema,
        CheckerKind::Gcc,
        CheckerKind::LibtoolingStu,
        CheckerKind::LibtoolingCtu,
        CheckerKind::Builtin,
        CheckerKind::Empty,
    ];

    /// Whether the checker loads other translation units through the CTU index.
    pub fn needs_ctu(self) -> bool {
        matches!(self, CheckerKind::Csa | CheckerKind::Misra)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CheckerKind::Infer => "infer",
            CheckerKind::Csa => "csa",
            CheckerKind::CppcheckBinary => "cppcheck_binary",
            CheckerKind::CppcheckStu => "cppcheck_stu",
            CheckerKind::CppcheckCtu => "cppcheck_ctu",
            CheckerKind::ClangTidy => "clang_tidy",
            CheckerKind::Misra => "misra",
            CheckerKind::ClangSema => "clang_sema",
            CheckerKind::Gcc => "gcc",
            CheckerKind::LibtoolingStu => "libtooling_stu",
            CheckerKind::LibtoolingCtu => "libtooling_ctu",
            CheckerKind::Builtin => "builtin",
            CheckerKind::Empty => "empty",
        }
    }
}

impl fmt::Display for CheckerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_names_match_display() {
        for kind in CheckerKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn test_ctu_consumers() {
        assert!(CheckerKind::Csa.needs_ctu());
        assert!(CheckerKind::Misra.needs_ctu());
        assert!(!CheckerKind::Infer.needs_ctu());
    }
}
