// kiln-core/src/lib.rs
//! Build orchestration for kiln: staging, patching, backend invocation,
//! installation into kegs, and the worker pool that drives a plan.

pub mod build;
pub mod caveats;
pub mod install;
pub mod pipeline;
pub mod staging;
pub mod uninstall;

pub use build::{BuildBackend, ProcessBackend};
pub use install::{install_keg, InstallOutcome, InstallRequest};
pub use pipeline::{plan_jobs, resolve, run_pipeline, JobContext, PipelineSummary, PlanRequest};
pub use staging::StagingArea;
pub use uninstall::{uninstall_keg, uninstall_package};
