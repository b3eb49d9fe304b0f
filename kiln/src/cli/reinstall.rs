// kiln/src/cli/reinstall.rs
use clap::Args;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::KegRegistry;
use kiln_common::options::OptionRequest;
use tracing::instrument;

use crate::pipeline::runner::{self, PipelineFlags};

#[derive(Debug, Args)]
pub struct ReinstallArgs {
    #[arg(required = true)]
    names: Vec<String>,

    /// Enable an option in addition to the ones the package was installed with
    #[arg(long = "with", value_name = "OPTION")]
    with: Vec<String>,

    /// Disable an option the package was installed with
    #[arg(long = "without", value_name = "OPTION")]
    without: Vec<String>,

    #[arg(long)]
    build_from_source: bool,

    #[arg(long)]
    overwrite: bool,

    #[arg(long, short = 'j', value_name = "N")]
    jobs: Option<usize>,
}

impl ReinstallArgs {
    #[instrument(skip(self, config), fields(targets = ?self.names))]
    pub async fn run(&self, config: &Config) -> Result<()> {
        let registry = KegRegistry::new(config.clone());
        let mut options = std::collections::BTreeMap::new();
        for name in &self.names {
            let record = registry.get_installed_record(name)?.ok_or_else(|| {
                KilnError::NotFound(format!("{name} is not installed; use `kiln install`"))
            })?;
            // Start from what is installed, then apply this invocation's changes.
            let mut request = OptionRequest::with_options(record.enabled_options);
            for option in &self.with {
                request = request.enable(option.clone());
            }
            for option in &self.without {
                request.with.remove(option);
                request = request.disable(option.clone());
            }
            options.insert(name.clone(), request);
        }

        let flags = PipelineFlags {
            build_from_source: self.build_from_source,
            include_test: false,
            force_reinstall: true,
            overwrite: self.overwrite,
            keep_staging: false,
            jobs: self.jobs,
        };
        runner::run_pipeline(&self.names, options, config, &flags).await
    }
}
