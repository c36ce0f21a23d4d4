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

//! Build actions: how a single source file is compiled.
//!
//! Build actions are produced by the compile-command parser and are
//! read-only from the point of view of the execution core.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Failed to read build actions from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed build actions in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type BuildResult<T> = Result<T, BuildError>;

fn default_language() -> String {
    "c".to_string()
}

/// Normalized description of one compiler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildAction {
    pub source_file: PathBuf,
    pub directory: PathBuf,
    /// Architecture component of the target triple, when already known.
    #[serde(default)]
    pub arch: Option<String>,
    /// Full `--target=` value passed to the compiler.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub compiler_args: Vec<String>,
    #[serde(default)]
    pub system_includes: Vec<String>,
    #[serde(default = "default_language")]
    pub language: String,
    /// Fallback `-std=` flag appended when the arguments carry none.
    #[serde(default)]
    pub standard: Option<String>,
}

impl BuildAction {
    pub fn new(source_file: impl Into<PathBuf>, directory: impl Into<PathBuf>) -> Self {
        Self {
            source_file: source_file.into(),
            directory: directory.into(),
            arch: None,
            target: None,
            compiler_args: Vec::new(),
            system_includes: Vec::new(),
            language: default_language(),
            standard: None,
        }
    }

    /// Source path resolved against the action's working directory.
    pub fn absolute_source(&self) -> PathBuf {
        if self.source_file.is_absolute() {
            self.source_file.clone()
        } else {
            self.directory.join(&self.source_file)
        }
    }

    pub fn has_std_flag(&self) -> bool {
        self.compiler_args.iter().any(|arg| arg.starts_with("-std") || arg.starts_with("--std"))
    }
}

/// Loads the build action list written by the compile-command parser.
pub fn load_build_actions(path: impl AsRef<Path>) -> BuildResult<Vec<BuildAction>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| BuildError::Io { path: path.to_path_buf(), source })?;
    serde_json::from_str(&content).map_err(|source| BuildError::Parse { path: path.to_path_buf(), source })
}
