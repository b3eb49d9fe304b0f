// kiln-core/src/pipeline/engine.rs
// Dependency-gated dispatch of planned jobs onto a worker pool.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use crossbeam_channel::unbounded;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::InstalledPackageRecord;
use kiln_common::pipeline::{JobAction, PipelineEvent, PlannedJob};
use threadpool::ThreadPool;
use tracing::{debug, error, instrument};

use super::worker::{execute_job, JobContext};
use crate::install::InstallOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineSummary {
    /// Newly installed packages, in completion order.
    pub installed: Vec<InstalledPackageRecord>,
    /// Packages found already installed with identical options.
    pub unchanged: Vec<InstalledPackageRecord>,
    pub duration_secs: f64,
}

type JobResult = (String, JobAction, Result<InstallOutcome>);

/// Runs `jobs` (in dependency order) on `workers` threads.
///
/// A job is dispatched once every in-plan dependency succeeded. After the
/// first failure, or once cancelled, nothing new is dispatched; running jobs
/// finish and everything still pending is reported as skipped. Returns the
/// first error.
#[instrument(skip_all, fields(jobs = jobs.len(), workers = workers))]
pub fn run_pipeline(jobs: Vec<PlannedJob>, ctx: JobContext, workers: usize) -> Result<PipelineSummary> {
    let started = Instant::now();
    let pool = ThreadPool::new(workers.max(1));
    let (result_tx, result_rx) = unbounded::<JobResult>();
    let _ = ctx.event_tx.send(PipelineEvent::PipelineStarted {
        total_jobs: jobs.len(),
    });

    let mut states: HashMap<String, JobState> = jobs
        .iter()
        .map(|job| (job.target_id.clone(), JobState::Pending))
        .collect();
    let mut summary = PipelineSummary::default();
    let mut first_error: Option<KilnError> = None;
    let mut running = 0usize;
    let mut fail_count = 0usize;

    loop {
        if first_error.is_none() && !ctx.cancel.is_cancelled() {
            for job in &jobs {
                if states.get(&job.target_id) != Some(&JobState::Pending) {
                    continue;
                }
                // Dependencies outside the plan are already installed.
                let ready = job.dependencies.iter().all(|dep| {
                    matches!(states.get(dep), None | Some(JobState::Succeeded))
                });
                if !ready {
                    continue;
                }
                states.insert(job.target_id.clone(), JobState::Running);
                running += 1;
                dispatch(&pool, job.clone(), ctx.clone(), result_tx.clone());
            }
        }
        if running == 0 {
            break;
        }

        let Ok((target_id, action, result)) = result_rx.recv() else {
            break;
        };
        running -= 1;
        match result {
            Ok(outcome) => {
                states.insert(target_id.clone(), JobState::Succeeded);
                let _ = ctx.event_tx.send(PipelineEvent::JobSuccess {
                    target_id,
                    action,
                });
                match outcome {
                    InstallOutcome::Installed(record) => summary.installed.push(record),
                    InstallOutcome::AlreadyInstalled(record) => summary.unchanged.push(record),
                }
            }
            Err(e) => {
                error!("[{}] Job failed: {}", target_id, e);
                fail_count += 1;
                states.insert(target_id.clone(), JobState::Failed);
                let _ = ctx
                    .event_tx
                    .send(PipelineEvent::job_failed(target_id, action, &e));
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    pool.join();

    let skip_reason = match &first_error {
        Some(e) => format!("aborted after failure of {}", e.package().unwrap_or("a job")),
        None => "cancelled".to_string(),
    };
    let mut skipped_count = 0usize;
    for job in &jobs {
        if states.get(&job.target_id) == Some(&JobState::Pending) {
            skipped_count += 1;
            let _ = ctx.event_tx.send(PipelineEvent::JobSkipped {
                target_id: job.target_id.clone(),
                reason: skip_reason.clone(),
            });
        }
    }

    summary.duration_secs = started.elapsed().as_secs_f64();
    let _ = ctx.event_tx.send(PipelineEvent::PipelineFinished {
        duration_secs: summary.duration_secs,
        success_count: summary.installed.len() + summary.unchanged.len(),
        fail_count,
        skipped_count,
    });
    debug!(
        "Pipeline finished: {} installed, {} unchanged, {} failed, {} skipped",
        summary.installed.len(),
        summary.unchanged.len(),
        fail_count,
        skipped_count
    );

    if let Some(e) = first_error {
        return Err(e);
    }
    if skipped_count > 0 {
        return Err(KilnError::Cancelled(format!(
            "{skipped_count} package(s) were not installed"
        )));
    }
    Ok(summary)
}

fn dispatch(
    pool: &ThreadPool,
    job: PlannedJob,
    ctx: JobContext,
    result_tx: crossbeam_channel::Sender<JobResult>,
) {
    debug!("[{}] Submitting job to worker pool.", job.target_id);
    let _ = ctx.event_tx.send(PipelineEvent::JobDispatched {
        target_id: job.target_id.clone(),
    });
    pool.execute(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(|| execute_job(&job, &ctx)))
            .unwrap_or_else(|_| {
                Err(KilnError::Generic(format!(
                    "worker panicked while installing {}",
                    job.target_id
                )))
            });
        // The receiver only goes away once the engine has stopped waiting.
        let _ = result_tx.send((job.target_id.clone(), job.action.clone(), result));
    });
}
