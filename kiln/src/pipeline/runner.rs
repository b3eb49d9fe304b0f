// kiln/src/pipeline/runner.rs
//! Plans an install, runs it on the core worker pool and reports progress.
use std::collections::BTreeMap;
use std::sync::Arc;

use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::dependency::ResolutionStatus;
use kiln_common::error::{KilnError, Result};
use kiln_common::formulary::Formulary;
use kiln_common::options::OptionRequest;
use kiln_common::pipeline::{CancellationFlag, PipelineEvent};
use kiln_core::caveats::active_caveats;
use kiln_core::pipeline::{plan_jobs, resolve, JobContext, PlanRequest};
use kiln_core::ProcessBackend;
use kiln_net::CachingFetcher;
use tokio::sync::broadcast;
use tracing::{debug, error, instrument, warn};

const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct PipelineFlags {
    pub build_from_source: bool,
    pub include_test: bool,
    pub force_reinstall: bool,
    pub overwrite: bool,
    pub keep_staging: bool,
    /// Concurrent packages; `None` defers to the configuration.
    pub jobs: Option<usize>,
}

/// Applies the same `--with`/`--without` flags to every named target.
pub fn option_requests(
    targets: &[String],
    with: &[String],
    without: &[String],
) -> BTreeMap<String, OptionRequest> {
    if with.is_empty() && without.is_empty() {
        return BTreeMap::new();
    }
    let mut request = OptionRequest::with_options(with.iter().cloned());
    for option in without {
        request = request.disable(option.clone());
    }
    targets
        .iter()
        .map(|target| (target.clone(), request.clone()))
        .collect()
}

#[instrument(skip_all, fields(targets = ?targets))]
pub async fn run_pipeline(
    targets: &[String],
    options: BTreeMap<String, OptionRequest>,
    config: &Config,
    flags: &PipelineFlags,
) -> Result<()> {
    let formulary = Formulary::new(config);
    let request = PlanRequest {
        targets: targets.to_vec(),
        options,
        include_test: flags.include_test,
        build_from_source: flags.build_from_source,
        force_reinstall: flags.force_reinstall,
    };
    let graph = resolve(config, &formulary, &request)?;

    for name in targets {
        if let Some(node) = graph.resolution_details.get(name) {
            if node.status == ResolutionStatus::Installed {
                println!(
                    "{} {} is already installed with the requested options.",
                    "Warning:".yellow(),
                    name.cyan()
                );
            }
        }
    }

    let jobs = plan_jobs(&graph, targets);
    if jobs.is_empty() {
        debug!("Nothing to install.");
        return Ok(());
    }
    // Caveats are shown for the packages actually installed, once the run ends.
    let caveat_sources: Vec<_> = jobs
        .iter()
        .filter(|job| job.installed_on_request)
        .map(|job| (job.target_id.clone(), job.formula.clone(), job.config.clone()))
        .collect();

    let (event_tx, event_rx) = broadcast::channel::<PipelineEvent>(EVENT_CHANNEL_SIZE);
    let status_handle = tokio::spawn(crate::cli::status::handle_events(event_rx));

    let cancel = CancellationFlag::new();
    let signal_cancel = cancel.clone();
    let signal_handle = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping running builds.");
            signal_cancel.cancel();
        }
    });

    let ctx = JobContext {
        config: config.clone(),
        fetcher: Arc::new(CachingFetcher::new(config)?),
        backend: Arc::new(ProcessBackend),
        event_tx: event_tx.clone(),
        cancel,
        overwrite: flags.overwrite,
        keep_staging: flags.keep_staging,
        jobs: num_cpus::get(),
    };
    let workers = flags.jobs.unwrap_or_else(|| config.worker_count());
    debug!("Running {} jobs on {} workers", jobs.len(), workers);

    let result = tokio::task::spawn_blocking(move || kiln_core::run_pipeline(jobs, ctx, workers))
        .await
        .unwrap_or_else(|join_err| {
            Err(KilnError::Generic(format!("pipeline task failed: {join_err}")))
        });

    signal_handle.abort();
    drop(event_tx);
    if let Err(join_err) = status_handle.await {
        error!("Status task join error: {}", join_err);
    }

    let summary = result?;
    for (name, formula, build_config) in &caveat_sources {
        if !summary.installed.iter().any(|record| &record.name == name) {
            continue;
        }
        let caveats = active_caveats(config, formula, build_config);
        if caveats.is_empty() {
            continue;
        }
        println!("\n{} {}", "==> Caveats for".blue().bold(), name.cyan());
        for caveat in caveats {
            println!("{caveat}");
        }
    }
    Ok(())
}
