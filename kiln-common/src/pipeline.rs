// kiln-common/src/pipeline.rs
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dependency::NodeInstallStrategy;
use crate::error::KilnError;
use crate::model::formula::Formula;
use crate::options::BuildConfiguration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobAction {
    Install,
    Reinstall {
        version: String,
        current_install_path: PathBuf,
    },
}

/// One package the engine must build and install.
#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub target_id: String,
    pub formula: Arc<Formula>,
    pub config: BuildConfiguration,
    pub strategy: NodeInstallStrategy,
    pub action: JobAction,
    pub installed_on_request: bool,
    /// Direct dependencies that are themselves part of this plan; the job is
    /// dispatched only once all of them succeeded.
    pub dependencies: Vec<String>,
    /// Every package (transitively) required while building, in resolution
    /// order. Their opt paths feed the build environment.
    pub build_dependencies: Vec<String>,
    /// Direct runtime dependencies, recorded in the receipt.
    pub runtime_dependencies: Vec<String>,
}

impl PlannedJob {
    pub fn is_source_build(&self) -> bool {
        self.strategy == NodeInstallStrategy::Source
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        total_jobs: usize,
    },
    PipelineFinished {
        duration_secs: f64,
        success_count: usize,
        fail_count: usize,
        skipped_count: usize,
    },
    JobDispatched {
        target_id: String,
    },
    FetchStarted {
        target_id: String,
        url: String,
    },
    FetchFinished {
        target_id: String,
        path: PathBuf,
    },
    PatchApplied {
        target_id: String,
        patch: String,
    },
    BuildStepStarted {
        target_id: String,
        step: String,
    },
    PourStarted {
        target_id: String,
    },
    InstallStarted {
        target_id: String,
    },
    JobSuccess {
        target_id: String,
        action: JobAction,
    },
    JobFailed {
        target_id: String,
        action: JobAction,
        error: String,
    },
    /// Never started: a dependency failed, or the run was aborted first.
    JobSkipped {
        target_id: String,
        reason: String,
    },
    LogInfo {
        message: String,
    },
    LogWarn {
        message: String,
    },
}

impl PipelineEvent {
    pub fn job_failed(target_id: String, action: JobAction, error: &KilnError) -> Self {
        PipelineEvent::JobFailed {
            target_id,
            action,
            error: error.to_string(),
        }
    }
}

/// Shared cancellation signal. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the flag is set.
    pub fn check(&self, what: &str) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(KilnError::Cancelled(what.to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_shared_between_clones() {
        let flag = CancellationFlag::new();
        let worker_view = flag.clone();
        assert!(worker_view.check("build").is_ok());
        flag.cancel();
        assert!(worker_view.is_cancelled());
        assert!(matches!(
            worker_view.check("build"),
            Err(KilnError::Cancelled(ref what)) if what == "build"
        ));
    }
}
