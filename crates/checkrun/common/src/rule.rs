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

//! Rules, rule options and the catalog binding rules to checkers.

use crate::build::BuildAction;
use crate::checker::CheckerKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read rule catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed rule catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Unknown rule: {0}")]
    UnknownRule(String),
    #[error("Rule {0} is bound to no checker")]
    NoCheckers(String),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Per-rule knobs understood by the runner and the built-in checkers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleOptions {
    /// Overrides the severity stamped on every finding of the rule.
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub check_include_guards: bool,
    /// Drop findings at a location an earlier checker of the rule already reported.
    #[serde(default)]
    pub dedup: bool,
    /// Pattern used by the built-in line scanner.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Arbitrary extra values forwarded to external checker argument templates.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One unit of scheduling work: a rule and everything needed to check it.
#[derive(Debug, Clone)]
pub struct RuleTask {
    pub rule_name: String,
    pub checkers: Vec<CheckerKind>,
    pub options: RuleOptions,
    pub build_actions: Arc<Vec<BuildAction>>,
    pub source_files: Arc<Vec<PathBuf>>,
}

impl RuleTask {
    pub fn new(rule_name: impl Into<String>, checkers: Vec<CheckerKind>) -> Self {
        Self {
            rule_name: rule_name.into(),
            checkers,
            options: RuleOptions::default(),
            build_actions: Arc::new(Vec::new()),
            source_files: Arc::new(Vec::new()),
        }
    }

    pub fn with_options(mut self, options: RuleOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_build(mut self, build_actions: Arc<Vec<BuildAction>>, source_files: Arc<Vec<PathBuf>>) -> Self {
        self.build_actions = build_actions;
        self.source_files = source_files;
        self
    }

    /// `misra_c_2012` for `misra_c_2012/rule_8_1`.
    pub fn ruleset(&self) -> &str {
        self.rule_name.split_once('/').map_or("", |(set, _)| set)
    }

    /// `rule_8_1` for `misra_c_2012/rule_8_1`.
    pub fn rule_id(&self) -> &str {
        self.rule_name.rsplit_once('/').map_or(self.rule_name.as_str(), |(_, id)| id)
    }

    pub fn needs_ctu(&self) -> bool {
        self.checkers.iter().any(|c| c.needs_ctu())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEntry {
    pub checkers: Vec<CheckerKind>,
    #[serde(default)]
    pub options: RuleOptions,
}

/// Mapping `rule name -> ordered checker list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleCatalog {
    pub rules: BTreeMap<String, RuleEntry>,
}

impl RuleCatalog {
    pub fn load_from_file(path: impl AsRef<Path>) -> CatalogResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let catalog: Self = serde_json::from_str(&content)?;
        for (name, entry) in &catalog.rules {
            if entry.checkers.is_empty() {
                return Err(CatalogError::NoCheckers(name.clone()));
            }
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, name: impl Into<String>, checkers: Vec<CheckerKind>, options: RuleOptions) {
        self.rules.insert(name.into(), RuleEntry { checkers, options });
    }

    /// Builds one task per requested rule, sharing the build description.
    ///
    /// An empty request selects every rule in the catalog.
    pub fn tasks(&self, requested: &[String], build_actions: Arc<Vec<BuildAction>>, source_files: Arc<Vec<PathBuf>>) -> CatalogResult<Vec<RuleTask>> {
        let names: Vec<&String> = if requested.is_empty() { self.rules.keys().collect() } else { requested.iter().collect() };

        names
            .into_iter()
            .map(|name| {
                let entry = self.rules.get(name).ok_or_else(|| CatalogError::UnknownRule(name.clone()))?;
                Ok(RuleTask {
                    rule_name: name.clone(),
                    checkers: entry.checkers.clone(),
                    options: entry.options.clone(),
                    build_actions: Arc::clone(&build_actions),
                    source_files: Arc::clone(&source_files),
                })
            })
            .collect()
    }
}
