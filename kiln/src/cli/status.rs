// kiln/src/cli/status.rs
use std::collections::HashMap;

use colored::*;
use kiln_common::pipeline::{JobAction, PipelineEvent};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStatus {
    Waiting,
    Fetching,
    Building,
    Pouring,
    Installing,
    Success,
    Failed,
    Skipped,
}

impl JobStatus {
    fn indicator(&self) -> ColoredString {
        match self {
            JobStatus::Waiting => "·".dimmed(),
            JobStatus::Fetching => "↓".yellow(),
            JobStatus::Building => "⚙".blue(),
            JobStatus::Pouring => "⚙".magenta(),
            JobStatus::Installing => "→".cyan(),
            JobStatus::Success => "✓".green().bold(),
            JobStatus::Failed => "✗".red().bold(),
            JobStatus::Skipped => "-".dimmed(),
        }
    }
}

struct StatusDisplay {
    jobs: HashMap<String, JobStatus>,
    total_jobs: usize,
    logs_buffer: Vec<String>,
}

impl StatusDisplay {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            total_jobs: 0,
            logs_buffer: Vec::new(),
        }
    }

    /// Prints one line per state change; repeated events for a state are folded.
    fn update(&mut self, target_id: &str, status: JobStatus, detail: &str) {
        let previous = self.jobs.insert(target_id.to_string(), status);
        if previous == Some(status) && detail.is_empty() {
            return;
        }
        if detail.is_empty() {
            println!("{} {}", status.indicator(), target_id.cyan());
        } else {
            println!("{} {} {}", status.indicator(), target_id.cyan(), detail.dimmed());
        }
    }
}

pub async fn handle_events(mut event_rx: broadcast::Receiver<PipelineEvent>) {
    let mut display = StatusDisplay::new();

    loop {
        match event_rx.recv().await {
            Ok(event) => match event {
                PipelineEvent::PipelineStarted { total_jobs } => {
                    display.total_jobs = total_jobs;
                    println!("{} {}", "==> Installing packages:".cyan().bold(), total_jobs);
                }
                PipelineEvent::JobDispatched { target_id } => {
                    display.update(&target_id, JobStatus::Waiting, "");
                }
                PipelineEvent::FetchStarted { target_id, url } => {
                    display.update(&target_id, JobStatus::Fetching, &url);
                }
                PipelineEvent::FetchFinished { target_id, path } => {
                    debug!("{} fetched to {}", target_id, path.display());
                }
                PipelineEvent::PatchApplied { target_id, patch } => {
                    display.update(&target_id, JobStatus::Building, &format!("patch {patch}"));
                }
                PipelineEvent::BuildStepStarted { target_id, step } => {
                    display.update(&target_id, JobStatus::Building, &step);
                }
                PipelineEvent::PourStarted { target_id } => {
                    display.update(&target_id, JobStatus::Pouring, "pouring bottle");
                }
                PipelineEvent::InstallStarted { target_id } => {
                    display.update(&target_id, JobStatus::Installing, "");
                }
                PipelineEvent::JobSuccess { target_id, action } => {
                    let action_str = match action {
                        JobAction::Install => "installed",
                        JobAction::Reinstall { .. } => "reinstalled",
                    };
                    display.update(&target_id, JobStatus::Success, action_str);
                }
                PipelineEvent::JobFailed {
                    target_id, error, ..
                } => {
                    display.update(&target_id, JobStatus::Failed, "");
                    display.logs_buffer.push(format!(
                        "{} {}: {}",
                        "✗".red().bold(),
                        target_id.cyan(),
                        error.red()
                    ));
                }
                PipelineEvent::JobSkipped { target_id, reason } => {
                    display.update(&target_id, JobStatus::Skipped, &reason);
                }
                PipelineEvent::LogInfo { message } => {
                    display.logs_buffer.push(message);
                }
                PipelineEvent::LogWarn { message } => {
                    display.logs_buffer.push(message.yellow().to_string());
                }
                PipelineEvent::PipelineFinished {
                    duration_secs,
                    success_count,
                    fail_count,
                    skipped_count,
                } => {
                    if !display.logs_buffer.is_empty() {
                        println!();
                        for log in &display.logs_buffer {
                            println!("{log}");
                        }
                    }
                    println!(
                        "\n{}: {}  {}: {}  {}: {}  {}: {}  {}: {:.2}s",
                        "Total jobs".bold(),
                        display.total_jobs,
                        "Completed".green().bold(),
                        success_count,
                        "Failed".red().bold(),
                        fail_count,
                        "Skipped".yellow().bold(),
                        skipped_count,
                        "Elapsed".bold(),
                        duration_secs
                    );
                    break;
                }
            },
            Err(broadcast::error::RecvError::Closed) => {
                break;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Status display lagged behind by {} events", skipped);
            }
        }
    }
}
