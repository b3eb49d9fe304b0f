// kiln/src/cli/deps.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::dependency::ResolutionStatus;
use kiln_common::error::Result;
use kiln_common::formulary::Formulary;
use kiln_core::pipeline::{resolve, PlanRequest};

use crate::pipeline::runner::option_requests;

#[derive(Args, Debug)]
pub struct Deps {
    /// Name of the formula
    pub name: String,

    /// Resolve as if these options were requested
    #[arg(long = "with", value_name = "OPTION")]
    pub with: Vec<String>,

    #[arg(long = "without", value_name = "OPTION")]
    pub without: Vec<String>,

    /// Include test-only dependencies
    #[arg(long)]
    pub include_test: bool,
}

impl Deps {
    pub fn run(&self, config: &Config) -> Result<()> {
        let targets = vec![self.name.clone()];
        let request = PlanRequest {
            options: option_requests(&targets, &self.with, &self.without),
            targets,
            include_test: self.include_test,
            ..Default::default()
        };
        let graph = resolve(config, &Formulary::new(config), &request)?;

        for name in &graph.order {
            let Some(node) = graph.resolution_details.get(name) else {
                continue;
            };
            let state = match node.status {
                ResolutionStatus::Installed => "installed".green(),
                ResolutionStatus::Missing | ResolutionStatus::Requested => {
                    format!("{:?}", node.strategy).to_lowercase().yellow()
                }
            };
            let deps = graph.edges.get(name).cloned().unwrap_or_default();
            if deps.is_empty() {
                println!("{} {}  [{}]", node.name().bold(), node.formula.version_str_full(), state);
            } else {
                println!(
                    "{} {}  [{}]  <- {}",
                    node.name().bold(),
                    node.formula.version_str_full(),
                    state,
                    deps.join(", ").dimmed()
                );
            }
        }
        Ok(())
    }
}
