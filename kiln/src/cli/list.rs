// kiln/src/cli/list.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_common::keg::KegRegistry;

#[derive(Args, Debug)]
pub struct List {
    /// Only list packages that were explicitly requested
    #[arg(long)]
    pub requested: bool,
}

impl List {
    pub fn run(&self, config: &Config) -> Result<()> {
        let mut installed = KegRegistry::new(config.clone()).list_installed()?;
        if self.requested {
            installed.retain(|record| record.installed_on_request);
        }
        installed.sort_by(|a, b| a.name.cmp(&b.name));

        if installed.is_empty() {
            println!("{}", "0 packages installed".yellow());
            return Ok(());
        }

        let width = installed.iter().map(|r| r.name.len()).max().unwrap_or(0);
        for record in &installed {
            let name = format!("{:<width$}", record.name);
            let mut line = format!("{}  {}", name.bold(), record.version);
            if !record.enabled_options.is_empty() {
                line.push_str(&format!("  {}", record.enabled_options.join(",").cyan()));
            }
            if record.poured_from_bottle {
                line.push_str(&format!("  {}", "(bottle)".dimmed()));
            }
            println!("{line}");
        }
        println!("{}", format!("{} packages installed", installed.len()).bold());
        Ok(())
    }
}
