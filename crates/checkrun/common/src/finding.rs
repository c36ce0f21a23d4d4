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

use crate::checker::CheckerKind;
use serde::{Deserialize, Serialize};

/// A single diagnostic reported by a checker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub path: String,
    pub line_number: u32,
    /// Rule-specific error kind, e.g. `MISRA_C_2012_RULE_8_1`.
    #[serde(default)]
    pub error_kind: String,
    pub error_message: String,
    /// Machine-addressable message id, filled in by downstream localization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruleset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checker: Option<CheckerKind>,
}

impl Finding {
    pub fn new(path: impl Into<String>, line_number: u32, error_message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            line_number,
            error_kind: String::new(),
            error_message: error_message.into(),
            message_id: None,
            ruleset: None,
            rule_id: None,
            severity: None,
            checker: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.error_kind = kind.into();
        self
    }

    pub fn with_checker(mut self, checker: CheckerKind) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn location(&self) -> (&str, u32) {
        (&self.path, self.line_number)
    }
}

/// Ordered sequence of findings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsList {
    pub results: Vec<Finding>,
}

impl ResultsList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn push(&mut self, finding: Finding) {
        self.results.push(finding);
    }

    pub fn extend(&mut self, other: ResultsList) {
        self.results.extend(other.results);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Finding> {
        self.results.iter()
    }

    /// Sorts by path, then by line. Stable, so equal locations keep checker order.
    pub fn sort_by_location(&mut self) {
        self.results.sort_by(|a, b| a.path.cmp(&b.path).then(a.line_number.cmp(&b.line_number)));
    }
}

impl From<Vec<Finding>> for ResultsList {
    fn from(results: Vec<Finding>) -> Self {
        Self { results }
    }
}

impl IntoIterator for ResultsList {
    type Item = Finding;
    type IntoIter = std::vec::IntoIter<Finding>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_by_location() {
        let mut list = ResultsList::from(vec![
            Finding::new("b.c", 1, "x"),
            Finding::new("a.c", 9, "y"),
            Finding::new("a.c", 2, "z"),
        ]);
        list.sort_by_location();
        let order: Vec<_> = list.iter().map(|f| f.location()).collect();
        assert_eq!(order, vec![("a.c", 2), ("a.c", 9), ("b.c", 1)]);
    }

    #[test]
    fn test_optional_fields_skipped_in_json() {
        let json = serde_json::to_value(Finding::new("a.c", 1, "m")).unwrap();
        assert!(json.get("ruleset").is_none());
        assert_eq!(json["line_number"], 1);
    }
}
