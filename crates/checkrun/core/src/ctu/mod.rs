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

//! Cross-translation-unit index.
//!
//! Two phases over the build:
//! 1. In parallel, per build action: resolve the target architecture,
//!    append the normalized invocation to that architecture's invocation
//!    list and collect the definitions the mapping tool reports.
//! 2. Once every action is done: per architecture, drop names defined in
//!    more than one file and write `externalDefMap.txt`.
//!
//! A failing action is logged and leaves the rest of the index intact.

mod extdef;
mod invocation;

pub use extdef::*;
pub use invocation::*;

use crate::process::{ExecLimits, ProcessContext, ProcessError};
use crate::progress::{NoProgress, ProgressSink};
use checkrun_common::{AnalysisConfig, BuildAction, CheckerKind, Stage, format_elapsed, percent_string};
use chrono::Utc;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

pub const EXTDEF_MAP_NAME: &str = "externalDefMap.txt";

#[derive(Error, Debug)]
pub enum CtuError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No build actions to index")]
    EmptyBuild,
    #[error("Cannot determine target architecture of {0}")]
    ArchUnknown(PathBuf),
    #[error("Malformed mapping line `{line}`: {reason}")]
    Mapping { line: String, reason: String },
    #[error("Failed to encode invocation: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("Failed to start indexing threads: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

pub type CtuResult<T> = Result<T, CtuError>;

/// What one index build produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CtuSummary {
    pub files: usize,
    pub failed: usize,
    /// Surviving entries per architecture
    pub entries: BTreeMap<String, usize>,
    /// Names dropped as ambiguous, across all architectures
    pub ambiguous: usize,
}

/// Wipes and recreates `<results_dir>/ctu-dir`.
pub fn prepare_ctu_dir(ctu_dir: &Path) -> CtuResult<()> {
    match std::fs::remove_dir_all(ctu_dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    std::fs::create_dir_all(ctu_dir)?;
    Ok(())
}

pub struct CtuIndexBuilder {
    config: Arc<AnalysisConfig>,
    process: ProcessContext,
    progress: Arc<dyn ProgressSink>,
    limits: ExecLimits,
}

impl CtuIndexBuilder {
    pub fn new(config: Arc<AnalysisConfig>, process: ProcessContext) -> Self {
        // Indexing tools are never contained, only bounded in time.
        let limits = ExecLimits {
            limit_memory: false,
            ..ExecLimits::for_checker(&config, CheckerKind::Csa)
        };
        Self {
            config,
            process,
            progress: Arc::new(NoProgress),
            limits,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn ctu_dir(&self) -> PathBuf {
        self.config.ctu_dir()
    }

    pub fn build(&self, actions: &[BuildAction]) -> CtuResult<CtuSummary> {
        if actions.is_empty() {
            return Err(CtuError::EmptyBuild);
        }
        let ctu_dir = self.ctu_dir();
        prepare_ctu_dir(&ctu_dir)?;

        let workers = self.config.effective_workers();
        let threads = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("ctu-worker-{i}"))
            .build()?;

        let started = Instant::now();
        let started_at = Utc::now();
        let total = actions.len();
        let done = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let invocations = InvocationList::new(&ctu_dir);
        let merged: Mutex<HashMap<String, Candidates>> = Mutex::new(HashMap::new());
        info!(files = total, workers, "Generating CTU information");

        threads.install(|| {
            actions.par_iter().for_each(|action| {
                match self.index_action(action, &invocations) {
                    Ok((arch, entries)) => merged.lock().entry(arch).or_default().add(entries),
                    Err(err) => {
                        failed.fetch_add(1, Ordering::Relaxed);
                        error!(source = %action.source_file.display(), error = %err, "Failed to generate CTU information");
                    }
                }
                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                info!("{} CTU information generated ({}/{})", percent_string(finished, total), finished, total);
                self.progress.report(Stage::Ctu, finished, total, started_at);
            });
        });
        info!("CTU information generated successfully [{}]", format_elapsed(started.elapsed()));

        let merge_started = Instant::now();
        let mut summary = CtuSummary {
            files: total,
            failed: failed.into_inner(),
            ..CtuSummary::default()
        };
        for (arch, candidates) in merged.into_inner() {
            let names = candidates.len();
            let index = candidates.resolve();
            summary.ambiguous += names - index.len();
            summary.entries.insert(arch.clone(), index.len());

            let dir = ctu_dir.join(&arch);
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join(EXTDEF_MAP_NAME), render_index(&index))?;
            debug!(arch = %arch, entries = index.len(), "Wrote external definition map");
        }
        if summary.ambiguous > 0 {
            warn!(names = summary.ambiguous, "Dropped ambiguous CTU definitions");
        }
        info!("Writing CTU information completed [{}]", format_elapsed(merge_started.elapsed()));
        Ok(summary)
    }

    #[instrument(skip_all, fields(source = %action.source_file.display()))]
    fn index_action(&self, action: &BuildAction, invocations: &InvocationList) -> CtuResult<(String, Vec<CtuEntry>)> {
        let arch = match &action.arch {
            Some(arch) if !arch.is_empty() => arch.clone(),
            _ => self.detect_arch(action)?,
        };

        let source = action.absolute_source();
        invocations.append(&arch, &source, analyzer_invocation(action, &self.config.checkers))?;

        let compile = compile_command(action, &self.config.checkers.clang_bin);
        let mut cmd = Command::new(&self.config.checkers.extdef_mapping_bin);
        cmd.arg(&source).arg("--").args(&compile[1..]).current_dir(&action.directory);
        let label = format!("extdef:{}", action.source_file.display());
        let stdout = self.process.stdout_output(cmd, &label, &self.limits)?;

        let entries = parse_extdef_mapping(&String::from_utf8_lossy(&stdout))?;
        debug!(arch = %arch, definitions = entries.len(), "Collected external definitions");
        Ok((arch, entries))
    }

    fn detect_arch(&self, action: &BuildAction) -> CtuResult<String> {
        let argv = driver_dump_command(action, &self.config.checkers.clang_bin);
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]).current_dir(&action.directory);

        let label = format!("triple:{}", action.source_file.display());
        // A failing driver may still have printed the triple.
        let output = match self.process.combined_output(cmd, &label, &self.limits) {
            Ok(output) => output,
            Err(err) if !err.output().is_empty() => {
                warn!(error = %err, "Driver dump failed, parsing its output anyway");
                err.output().to_vec()
            }
            Err(err) => return Err(err.into()),
        };
        find_arch_in_driver_output(&String::from_utf8_lossy(&output)).ok_or_else(|| CtuError::ArchUnknown(action.source_file.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    /// A driver that reports an x86_64 triple on stderr, and a mapping tool
    /// that defines one shared and one file-specific name per source.
    fn config(dir: &Path) -> AnalysisConfig {
        let mut config = AnalysisConfig {
            results_dir: dir.join("results"),
            num_workers: 3,
            ..AnalysisConfig::default()
        };
        config.checkers.clang_bin = script(dir, "clang", r#"echo '"/usr/bin/clang" "-cc1" "-triple" "x86_64-pc-linux-gnu"' >&2"#);
        config.checkers.extdef_mapping_bin = script(
            dir,
            "extdef",
            r#"name=$(basename "$1" .c)
echo "c:@F@shared $1"
echo "c:@F@only_$name $1"
echo "noise" >&2"#,
        );
        config
    }

    fn actions(dir: &Path, names: &[&str]) -> Vec<BuildAction> {
        names
            .iter()
            .map(|name| {
                std::fs::write(dir.join(name), "int x;\n").unwrap();
                BuildAction::new(*name, dir)
            })
            .collect()
    }

    #[test]
    fn test_build_writes_unambiguous_index() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(config(dir.path()));
        let builder = CtuIndexBuilder::new(config.clone(), ProcessContext::uncontained());

        let summary = builder.build(&actions(dir.path(), &["a.c", "b.c", "c.c"])).unwrap();

        assert_eq!(summary.files, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.ambiguous, 1);
        assert_eq!(summary.entries.get("x86_64"), Some(&3));

        let arch_dir = config.ctu_dir().join("x86_64");
        let index = std::fs::read_to_string(arch_dir.join(EXTDEF_MAP_NAME)).unwrap();
        let lines: Vec<_> = index.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("c:@F@only_a "));
        assert!(lines[0].ends_with("a.c"));
        assert!(!index.contains("shared"));

        let invocations: BTreeMap<String, Vec<String>> = serde_yaml::from_str(&std::fs::read_to_string(arch_dir.join(INVOCATION_LIST_NAME)).unwrap()).unwrap();
        assert_eq!(invocations.len(), 3);
        assert!(invocations.values().all(|argv| argv.iter().any(|arg| arg == "-D__clang_analyzer__")));
    }

    #[test]
    fn test_known_arch_skips_detection() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.checkers.clang_bin = "/nonexistent/clang".to_string();
        let config = Arc::new(config);

        let mut build = actions(dir.path(), &["a.c"]);
        build[0].arch = Some("arm".to_string());
        let summary = CtuIndexBuilder::new(config.clone(), ProcessContext::uncontained()).build(&build).unwrap();

        assert_eq!(summary.entries.get("arm"), Some(&2));
        assert!(config.ctu_dir().join("arm").join(EXTDEF_MAP_NAME).exists());
    }

    #[test]
    fn test_failed_file_does_not_abort() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.checkers.extdef_mapping_bin = script(
            dir.path(),
            "extdef_flaky",
            r#"case "$1" in *bad.c) exit 1;; esac
echo "c:@F@f $1""#,
        );
        let config = Arc::new(config);

        let summary = CtuIndexBuilder::new(config, ProcessContext::uncontained())
            .build(&actions(dir.path(), &["good.c", "bad.c"]))
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.entries.get("x86_64"), Some(&1));
    }

    #[test]
    fn test_unknown_arch_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.checkers.clang_bin = script(dir.path(), "clang_silent", "echo 'clang version 17'");
        let summary = CtuIndexBuilder::new(Arc::new(config), ProcessContext::uncontained())
            .build(&actions(dir.path(), &["a.c"]))
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert!(summary.entries.is_empty());
    }

    #[test]
    fn test_empty_build() {
        let dir = tempfile::tempdir().unwrap();
        let builder = CtuIndexBuilder::new(Arc::new(config(dir.path())), ProcessContext::uncontained());
        assert!(matches!(builder.build(&[]), Err(CtuError::EmptyBuild)));
    }

    #[test]
    fn test_prepare_wipes_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let ctu_dir = dir.path().join("ctu-dir");
        std::fs::create_dir_all(ctu_dir.join("x86_64")).unwrap();
        std::fs::write(ctu_dir.join("x86_64").join(EXTDEF_MAP_NAME), "stale").unwrap();

        prepare_ctu_dir(&ctu_dir).unwrap();

        assert!(ctu_dir.is_dir());
        assert_eq!(std::fs::read_dir(&ctu_dir).unwrap().count(), 0);
    }
}
