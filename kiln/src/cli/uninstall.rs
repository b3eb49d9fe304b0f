// kiln/src/cli/uninstall.rs
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::KegRegistry;
use tracing::{debug, error};

#[derive(Args, Debug)]
pub struct Uninstall {
    /// The names of the packages to uninstall
    #[arg(required = true)]
    pub names: Vec<String>,

    /// Remove packages even if other installed packages depend on them
    #[arg(long)]
    pub ignore_dependencies: bool,
}

impl Uninstall {
    pub fn run(&self, config: &Config) -> Result<()> {
        let registry = KegRegistry::new(config.clone());
        let mut errors: Vec<(String, KilnError)> = Vec::new();

        for name in &self.names {
            if name.contains('/') || name.contains("..") {
                let msg = format!("Invalid package name '{name}' contains disallowed characters");
                error!("✖ {msg}");
                errors.push((name.clone(), KilnError::ValidationError(msg)));
                continue;
            }

            if !self.ignore_dependencies {
                // Dependents being removed in the same invocation don't count.
                let dependents: Vec<String> = registry
                    .dependents_of(name)?
                    .into_iter()
                    .filter(|d| !self.names.contains(d))
                    .collect();
                if !dependents.is_empty() {
                    let msg = format!(
                        "Refusing to uninstall {name}: required by {}",
                        dependents.join(", ")
                    );
                    error!("✖ {msg}");
                    errors.push((name.clone(), KilnError::Generic(msg)));
                    continue;
                }
            }

            debug!("Uninstalling {}", name);
            match kiln_core::uninstall_package(config, name) {
                Ok(record) => println!(
                    "{} Uninstalled {} {}",
                    "✓".green(),
                    name.green(),
                    record.version.dimmed()
                ),
                Err(e) => {
                    error!("✖ Failed to uninstall '{}': {}", name.cyan(), e);
                    errors.push((name.clone(), e));
                }
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0).1),
            n => Err(KilnError::Generic(format!(
                "{n} packages failed to uninstall: {}",
                errors
                    .iter()
                    .map(|(name, _)| name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}
