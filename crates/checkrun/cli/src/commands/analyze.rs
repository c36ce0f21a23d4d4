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

use crate::AnalyzeArgs;
use anyhow::Context;
use checkrun_common::{AnalysisConfig, ResultsList, RuleCatalog, RuleTask, Stage, load_build_actions};
use checkrun_core::checkers::CheckerRegistry;
use checkrun_core::ctu::CtuIndexBuilder;
use checkrun_core::process::ProcessContext;
use checkrun_core::progress::{FileProgressSink, ProgressSink};
use checkrun_core::{CancellationToken, CheckerTaskRunner, ResourcePool, RuleWorkerPool};
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const RESULTS_FILE_NAME: &str = "results.json";

/// Summary of one `analyze` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisOutcome {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub findings: usize,
    pub interrupted: bool,
    pub results_file: PathBuf,
}

/// Command-line flags win over the configuration file.
pub fn apply_overrides(config: &mut AnalysisConfig, args: &AnalyzeArgs) {
    if let Some(dir) = &args.results_dir {
        config.results_dir = dir.clone();
    }
    if let Some(workers) = args.workers {
        config.num_workers = workers;
    }
    if args.limit_memory {
        config.limit_memory = true;
    }
}

/// Cancels `token` on the first Ctrl-C.
fn spawn_interrupt_listener(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing running rules");
            token.cancel("interrupt");
        }
    })
}

pub async fn run_analysis(mut config: AnalysisConfig, args: AnalyzeArgs) -> anyhow::Result<AnalysisOutcome> {
    apply_overrides(&mut config, &args);
    config.validate()?;

    let token = CancellationToken::new();
    let listener = spawn_interrupt_listener(token.clone());
    let outcome = tokio::task::spawn_blocking(move || analyze(config, &args, &token)).await;
    listener.abort();
    outcome?
}

/// Loads the inputs, builds the CTU index when a rule needs it, runs
/// every rule and writes the sorted findings.
pub fn analyze(config: AnalysisConfig, args: &AnalyzeArgs, cancel: &CancellationToken) -> anyhow::Result<AnalysisOutcome> {
    let started_at = Utc::now();
    std::fs::create_dir_all(&config.results_dir).with_context(|| format!("Failed to create results directory {}", config.results_dir.display()))?;
    let progress: Arc<dyn ProgressSink> = Arc::new(FileProgressSink::new(&config.results_dir));

    let build = Arc::new(load_build_actions(&args.build_actions)?);
    let sources: BTreeSet<PathBuf> = build.iter().map(|action| action.absolute_source()).collect();
    let catalog = RuleCatalog::load_from_file(&args.rules)?;
    let tasks = catalog.tasks(&args.rule, Arc::clone(&build), Arc::new(sources.into_iter().collect()))?;
    info!(rules = tasks.len(), files = build.len(), "Loaded analysis inputs");

    let config = Arc::new(config);
    let process = ProcessContext::from_config(&config);

    if args.no_ctu {
        info!("CTU index disabled");
    } else if tasks.iter().any(RuleTask::needs_ctu) {
        let builder = CtuIndexBuilder::new(Arc::clone(&config), process.clone()).with_progress(Arc::clone(&progress));
        match builder.build(&build) {
            Ok(summary) => info!(files = summary.files, failed = summary.failed, arches = summary.entries.len(), "CTU index ready"),
            Err(err) => error!(error = %err, "Failed to build CTU index, continuing without it"),
        }
    }

    let pool = Arc::new(ResourcePool::for_config(&config));
    info!(cpu = pool.total().cpu_units, mem_kb = pool.total_mem(), "Resource pool ready");
    let runner = CheckerTaskRunner::new(Arc::clone(&config), pool, process, CheckerRegistry::from_config(&config));
    let report = RuleWorkerPool::new(config.effective_workers(), Arc::new(runner), Arc::clone(&progress)).run(tasks, cancel);

    let mut results = report.results;
    results.sort_by_location();
    let results_file = config.results_dir.join(RESULTS_FILE_NAME);
    write_results(&results_file, &results)?;
    progress.report(Stage::End, 1, 1, started_at);

    info!(
        findings = results.len(),
        failed = report.failures.len(),
        file = %results_file.display(),
        "Analysis finished"
    );
    Ok(AnalysisOutcome {
        total: report.total,
        completed: report.completed,
        failed: report.failures.len(),
        findings: results.len(),
        interrupted: report.interrupted,
        results_file,
    })
}

fn write_results(path: &Path, results: &ResultsList) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(results)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}
