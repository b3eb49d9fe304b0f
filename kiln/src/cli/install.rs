// kiln/src/cli/install.rs
use clap::Args;
use kiln_common::config::Config;
use kiln_common::error::Result;
use tracing::instrument;

use crate::pipeline::runner::{self, option_requests, PipelineFlags};

#[derive(Debug, Args)]
pub struct InstallArgs {
    #[arg(required = true)]
    names: Vec<String>,

    /// Enable an option (e.g. `--with java`, `--with with-gpg-agent`)
    #[arg(long = "with", value_name = "OPTION")]
    with: Vec<String>,

    /// Disable an option
    #[arg(long = "without", value_name = "OPTION")]
    without: Vec<String>,

    #[arg(
        long,
        help = "Force building from source, even if a bottle is available"
    )]
    build_from_source: bool,

    /// Also resolve and install test-only dependencies
    #[arg(long)]
    include_test: bool,

    /// Replace links owned by other packages or unmanaged files
    #[arg(long)]
    overwrite: bool,

    /// Number of packages built concurrently (defaults to KILN_JOBS or the CPU count)
    #[arg(long, short = 'j', value_name = "N")]
    jobs: Option<usize>,

    /// Keep staging directories after a successful install
    #[arg(long)]
    keep_staging: bool,
}

impl InstallArgs {
    #[instrument(skip(self, config), fields(targets = ?self.names))]
    pub async fn run(&self, config: &Config) -> Result<()> {
        let flags = PipelineFlags {
            build_from_source: self.build_from_source,
            include_test: self.include_test,
            force_reinstall: false,
            overwrite: self.overwrite,
            keep_staging: self.keep_staging,
            jobs: self.jobs,
        };
        let options = option_requests(&self.names, &self.with, &self.without);
        runner::run_pipeline(&self.names, options, config, &flags).await
    }
}
