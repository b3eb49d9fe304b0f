// kiln-core/src/pipeline/mod.rs
pub mod engine;
pub mod planner;
pub mod worker;

pub use engine::{run_pipeline, PipelineSummary};
pub use planner::{plan_jobs, resolve, PlanRequest};
pub use worker::{execute_job, JobContext};
