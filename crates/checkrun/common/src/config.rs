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

//! Run configuration.
//!
//! Resolution order is: explicit path, then the `CHECKRUN_CONFIG`
//! environment variable, then built-in defaults. Every section is
//! `#[serde(default)]` so a partial file only overrides what it names.

use crate::checker::CheckerKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_ENV_VAR: &str = "CHECKRUN_CONFIG";
pub const CTU_DIR_NAME: &str = "ctu-dir";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// How memory-exhaustion kills are retried.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Multiplier applied to the memory quota before a retry
    pub memory_factor: f64,
    /// Retries allowed per checker after a resource kill
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            memory_factor: 1.5,
            max_retries: 1,
        }
    }
}

/// Scheduling traits of one checker kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerProfile {
    /// Runs its own worker threads and requests `parallel_jobs` CPU units
    pub parallel: bool,
    /// Gets the long timeout budget
    pub memory_hungry: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationScope {
    /// One process per build action.
    #[default]
    PerFile,
    /// One process for the whole build.
    WholeBuild,
}

/// Command line of an external checker binary.
///
/// Argument templates may contain `{source}`, `{directory}`, `{work_dir}`,
/// `{rule}`, `{ctu_dir}` and `{jobs}`. A lone `{compiler_args}` element
/// expands to the build action's compiler arguments, a lone `{sources}`
/// element to every source file of the build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalCheckerSpec {
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub scope: InvocationScope,
    /// Regex with named groups `path`, `line` and `message`, applied per output line.
    pub output_pattern: String,
    #[serde(default = "default_accepted_exit_codes")]
    pub accepted_exit_codes: Vec<i32>,
}

fn default_accepted_exit_codes() -> Vec<i32> {
    vec![0]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    pub clang_bin: String,
    pub extdef_mapping_bin: String,
    /// Extra whitespace-separated options appended to every CTU invocation
    pub system_lib_options: String,
    /// Whitespace-separated `-D` flags mirroring the target GCC's predefined macros
    pub gcc_predefined_macros: String,
    /// CPU units requested by internally parallel checkers
    pub parallel_jobs: u64,
    /// Keyed by checker name, e.g. `infer`
    pub profiles: BTreeMap<String, CheckerProfile>,
    /// Keyed by checker name
    pub external: BTreeMap<String, ExternalCheckerSpec>,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            CheckerKind::Infer.as_str().to_string(),
            CheckerProfile {
                parallel: true,
                memory_hungry: true,
            },
        );

        Self {
            clang_bin: "clang".to_string(),
            extdef_mapping_bin: "clang-extdef-mapping".to_string(),
            system_lib_options: String::new(),
            gcc_predefined_macros: String::new(),
            parallel_jobs: 4,
            profiles,
            external: BTreeMap::new(),
        }
    }
}

impl CheckerConfig {
    pub fn profile(&self, kind: CheckerKind) -> CheckerProfile {
        self.profiles.get(kind.as_str()).copied().unwrap_or_default()
    }

    pub fn external(&self, kind: CheckerKind) -> Option<&ExternalCheckerSpec> {
        self.external.get(kind.as_str())
    }

    /// CPU units one invocation of `kind` holds.
    pub fn cpu_units(&self, kind: CheckerKind) -> u64 {
        if self.profile(kind).parallel { self.parallel_jobs.max(1) } else { 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub results_dir: PathBuf,
    /// Worker threads; 0 picks the CPU count
    pub num_workers: usize,
    /// Place checkers in memory containment groups and retry on kills
    pub limit_memory: bool,
    /// Share of available system memory handed to the pool; negative disables limiting
    pub avail_mem_ratio: f64,
    pub timeout_normal_minutes: u64,
    pub timeout_oom_minutes: u64,
    /// Mount point of the cgroup v2 hierarchy
    pub cgroup_root: PathBuf,
    pub retry: RetryPolicy,
    pub checkers: CheckerConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            num_workers: 0,
            limit_memory: false,
            avail_mem_ratio: 0.9,
            timeout_normal_minutes: 30,
            timeout_oom_minutes: 90,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            retry: RetryPolicy::default(),
            checkers: CheckerConfig::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn resolve_config(cli_config: Option<PathBuf>) -> ConfigResult<Self> {
        if let Some(config_path) = cli_config {
            Self::load_from_file(config_path)
        } else if let Ok(env_config) = std::env::var(CONFIG_ENV_VAR) {
            Self::load_from_file(env_config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.retry.memory_factor.is_nan() || self.retry.memory_factor < 1.0 {
            return Err(ConfigError::Invalid(format!("retry.memory_factor must be at least 1.0, got {}", self.retry.memory_factor)));
        }
        if self.avail_mem_ratio.is_nan() || self.avail_mem_ratio > 1.0 {
            return Err(ConfigError::Invalid(format!("avail_mem_ratio must not exceed 1.0, got {}", self.avail_mem_ratio)));
        }
        Ok(())
    }

    pub fn effective_workers(&self) -> usize {
        if self.num_workers == 0 { num_cpus::get() } else { self.num_workers }
    }

    /// Memory limiting is only on when requested and given a usable share.
    pub fn memory_limiting(&self) -> bool {
        self.limit_memory && self.avail_mem_ratio > 0.0
    }

    pub fn ctu_dir(&self) -> PathBuf {
        self.results_dir.join(CTU_DIR_NAME)
    }
}
