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

//! Analysis engines and the registry that resolves a [`CheckerKind`] to one.

mod builtin;
mod empty;
mod external;

pub use builtin::*;
pub use empty::*;
pub use external::*;

use crate::process::{ExecLimits, ProcessContext, ProcessError};
use checkrun_common::{AnalysisConfig, CheckerKind, ResourceQuota, ResultsList, RuleTask};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum CheckerError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("No checker registered for {0}")]
    Unavailable(CheckerKind),
    #[error("Malformed output from {checker}: {reason}")]
    Parse { checker: CheckerKind, reason: String },
    #[error("Invalid checker specification: {0}")]
    InvalidSpec(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckerError {
    pub fn is_resource_kill(&self) -> bool {
        matches!(self, CheckerError::Process(err) if err.is_resource_kill())
    }
}

pub type CheckerResult<T> = Result<T, CheckerError>;

/// Everything one checker attempt needs.
#[derive(Debug, Clone)]
pub struct CheckerContext {
    pub task: RuleTask,
    /// Private working directory of the rule task
    pub work_dir: PathBuf,
    /// Task label, also the name of the containment group
    pub label: String,
    pub quota: ResourceQuota,
    pub limits: ExecLimits,
    pub process: ProcessContext,
    pub ctu_dir: PathBuf,
}

#[cfg_attr(test, mockall::automock)]
pub trait Checker: Send + Sync {
    fn kind(&self) -> CheckerKind;

    fn run(&self, ctx: &CheckerContext) -> CheckerResult<ResultsList>;
}

#[derive(Default, Clone)]
pub struct CheckerRegistry {
    checkers: HashMap<CheckerKind, Arc<dyn Checker>>,
}

impl CheckerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the built-in engines plus every external checker the
    /// configuration describes. Specs that fail to compile are skipped.
    pub fn from_config(config: &AnalysisConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(BuiltinScanner));
        registry.register(Arc::new(EmptyChecker));

        for kind in CheckerKind::ALL {
            let Some(spec) = config.checkers.external(kind) else {
                continue;
            };
            match ExternalChecker::new(kind, spec.clone()) {
                Ok(checker) => registry.register(Arc::new(checker)),
                Err(err) => warn!(checker = %kind, error = %err, "Skipping external checker"),
            }
        }
        registry
    }

    pub fn register(&mut self, checker: Arc<dyn Checker>) {
        self.checkers.insert(checker.kind(), checker);
    }

    pub fn get(&self, kind: CheckerKind) -> CheckerResult<Arc<dyn Checker>> {
        self.checkers.get(&kind).cloned().ok_or(CheckerError::Unavailable(kind))
    }

    pub fn kinds(&self) -> impl Iterator<Item = CheckerKind> + '_ {
        self.checkers.keys().copied()
    }
}

impl std::fmt::Debug for CheckerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.kinds().collect();
        kinds.sort();
        f.debug_struct("CheckerRegistry").field("kinds", &kinds).finish()
    }
}
