// kiln-core/src/pipeline/worker.rs
// Runs one planned job: fetch, stage, build or pour, install.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_aio::fs::remove_dir_all_if_exists;
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_common::keg::KegRegistry;
use kiln_common::pipeline::{CancellationFlag, JobAction, PipelineEvent, PlannedJob};
use kiln_net::Fetcher;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::build::source::{apply_patches, source_request, unpack_source};
use crate::build::{run_steps, BuildBackend, BuildEnvironment, EnvInputs, PlaceholderContext, StepContext};
use crate::install::bottle::{bottle_request, pour_bottle};
use crate::install::{install_keg, InstallOutcome, InstallRequest};
use crate::staging::StagingArea;

/// Shared by every job of one pipeline run.
#[derive(Clone)]
pub struct JobContext {
    pub config: Config,
    pub fetcher: Arc<dyn Fetcher>,
    pub backend: Arc<dyn BuildBackend>,
    pub event_tx: broadcast::Sender<PipelineEvent>,
    pub cancel: CancellationFlag,
    pub overwrite: bool,
    /// Keep staging directories of successful jobs.
    pub keep_staging: bool,
    /// Parallelism handed to each build (`MAKEFLAGS=-jN`).
    pub jobs: usize,
}

impl JobContext {
    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}

/// A staged image ready for the installer.
struct StagedImage {
    image_prefix: PathBuf,
    sha256: String,
    poured_from_bottle: bool,
}

#[instrument(skip_all, fields(job_id = %job.target_id, action = ?job.action))]
pub fn execute_job(job: &PlannedJob, ctx: &JobContext) -> Result<InstallOutcome> {
    ctx.cancel.check(&format!("install of {}", job.target_id))?;
    let version = job.formula.version_str_full();
    let staging = StagingArea::create(&ctx.config, &job.target_id, &version)?;

    match execute_in_staging(job, ctx, &staging) {
        Ok(outcome) => {
            staging.finish(ctx.keep_staging)?;
            Ok(outcome)
        }
        Err(e) => {
            warn!(
                "[{}] Failed; staging directory kept at {}",
                job.target_id,
                staging.path().display()
            );
            ctx.emit(PipelineEvent::LogWarn {
                message: format!(
                    "{}: staging directory kept at {}",
                    job.target_id,
                    staging.path().display()
                ),
            });
            Err(e)
        }
    }
}

fn execute_in_staging(
    job: &PlannedJob,
    ctx: &JobContext,
    staging: &StagingArea,
) -> Result<InstallOutcome> {
    let keg_path = ctx
        .config
        .formula_keg_path(&job.target_id, &job.formula.version_str_full());

    let staged = if job.is_source_build() {
        build_from_source(job, ctx, staging, &keg_path)?
    } else {
        pour(job, ctx, staging, &keg_path)?
    };
    ctx.cancel.check(&format!("install of {}", job.target_id))?;

    // The installer keeps the old keg until the new one is registered.
    let replacing = match &job.action {
        JobAction::Reinstall {
            version,
            current_install_path,
        } => {
            ctx.emit(PipelineEvent::LogInfo {
                message: format!("{}: replacing installed {version}", job.target_id),
            });
            KegRegistry::new(ctx.config.clone()).read_receipt(current_install_path)?
        }
        JobAction::Install => None,
    };

    ctx.emit(PipelineEvent::InstallStarted {
        target_id: job.target_id.clone(),
    });
    let outcome = install_keg(&InstallRequest {
        config: &ctx.config,
        formula: &job.formula,
        build_config: &job.config,
        image_prefix: &staged.image_prefix,
        sha256: &staged.sha256,
        installed_on_request: job.installed_on_request,
        poured_from_bottle: staged.poured_from_bottle,
        runtime_dependencies: &job.runtime_dependencies,
        replacing: replacing.as_ref(),
        overwrite: ctx.overwrite,
    })?;

    if let JobAction::Reinstall {
        current_install_path,
        ..
    } = &job.action
    {
        // A previous keg without a receipt was never registered; drop it.
        if replacing.is_none() && *current_install_path != keg_path {
            remove_dir_all_if_exists(current_install_path)?;
        }
    }
    Ok(outcome)
}

fn fetch(
    ctx: &JobContext,
    target_id: &str,
    request: &kiln_net::FetchRequest,
) -> Result<PathBuf> {
    ctx.emit(PipelineEvent::FetchStarted {
        target_id: target_id.to_string(),
        url: request.url.clone(),
    });
    let path = ctx.fetcher.fetch(request)?;
    ctx.emit(PipelineEvent::FetchFinished {
        target_id: target_id.to_string(),
        path: path.clone(),
    });
    Ok(path)
}

fn pour(
    job: &PlannedJob,
    ctx: &JobContext,
    staging: &StagingArea,
    keg_path: &Path,
) -> Result<StagedImage> {
    let request = bottle_request(&job.formula, &ctx.config.bottle_tag)?;
    let archive = fetch(ctx, &job.target_id, &request)?;
    ctx.emit(PipelineEvent::PourStarted {
        target_id: job.target_id.clone(),
    });
    let image_prefix = pour_bottle(&ctx.config, &job.formula, &archive, staging, keg_path)?;
    Ok(StagedImage {
        image_prefix,
        sha256: request.sha256,
        poured_from_bottle: true,
    })
}

fn build_from_source(
    job: &PlannedJob,
    ctx: &JobContext,
    staging: &StagingArea,
    keg_path: &Path,
) -> Result<StagedImage> {
    let formula = &job.formula;
    let request = source_request(formula);
    let archive = fetch(ctx, &job.target_id, &request)?;
    let source_root = unpack_source(formula, &archive, staging)?;

    apply_patches(formula, ctx.fetcher.as_ref(), &source_root, |patch| {
        ctx.emit(PipelineEvent::PatchApplied {
            target_id: job.target_id.clone(),
            patch: patch.to_string(),
        });
    })?;

    let placeholders = PlaceholderContext::for_build(&ctx.config, formula, &job.config, ctx.jobs);
    let destdir = staging.image_dir();
    let env = BuildEnvironment::new(&EnvInputs {
        config: &ctx.config,
        formula,
        build_config: &job.config,
        dependencies: &job.build_dependencies,
        placeholders: &placeholders,
        destdir: &destdir,
        jobs: ctx.jobs,
    });
    let image_prefix = staging.image_prefix(keg_path);
    let step_ctx = StepContext {
        formula,
        build_config: &job.config,
        env: &env,
        placeholders: &placeholders,
        backend: ctx.backend.as_ref(),
        source_root: &source_root,
        image_prefix: &image_prefix,
        cancel: &ctx.cancel,
    };
    run_steps(&step_ctx, |step| {
        ctx.emit(PipelineEvent::BuildStepStarted {
            target_id: job.target_id.clone(),
            step: step.to_string(),
        });
    })?;
    debug!("[{}] Build finished", job.target_id);

    Ok(StagedImage {
        image_prefix,
        sha256: request.sha256,
        poured_from_bottle: false,
    })
}
