// kiln/src/cli/info.rs
//! Prints a formula's metadata, option set and install state.
use clap::Args;
use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_common::formulary::Formulary;
use kiln_common::keg::{InstalledPackageRecord, KegRegistry};
use kiln_common::model::formula::Formula;

#[derive(Args, Debug)]
pub struct Info {
    /// Name of the formula
    pub name: String,

    /// Print the formula definition and receipt as JSON
    #[arg(long)]
    pub json: bool,
}

impl Info {
    pub fn run(&self, config: &Config) -> Result<()> {
        let formula = Formulary::new(config).load_formula(&self.name)?;
        let installed = KegRegistry::new(config.clone()).get_installed_record(&self.name)?;

        if self.json {
            let value = serde_json::json!({
                "formula": &*formula,
                "installed": installed,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
            return Ok(());
        }

        print_formula(config, &formula, installed.as_ref());
        Ok(())
    }
}

fn print_formula(config: &Config, formula: &Formula, installed: Option<&InstalledPackageRecord>) {
    println!(
        "{} {}",
        formula.name().green().bold(),
        formula.version_str_full()
    );
    if let Some(desc) = &formula.desc {
        println!("{desc}");
    }
    if let Some(homepage) = &formula.homepage {
        println!("{}", homepage.blue().underline());
    }

    match installed {
        Some(record) => {
            let options = if record.enabled_options.is_empty() {
                String::new()
            } else {
                format!(" with {}", record.enabled_options.join(", "))
            };
            println!(
                "{} {}{} ({})",
                "Installed:".bold(),
                record.install_path.display(),
                options,
                if record.poured_from_bottle { "poured from bottle" } else { "built from source" }
            );
        }
        None => println!("{} no", "Installed:".bold()),
    }

    let options = formula.declared_options();
    if !options.is_empty() {
        println!("\n{}", "==> Options".blue().bold());
        for option in &options {
            let default = if option.default { " (default)".dimmed().to_string() } else { String::new() };
            println!("--{}{}\n\t{}", option.name, default, option.description);
        }
    }
    if !formula.unsupported_options.is_empty() {
        println!("\n{}", "==> Unsupported options".blue().bold());
        for option in &formula.unsupported_options {
            println!("--{}\n\t{}", option.name, option.reason);
        }
    }

    if !formula.dependencies().is_empty() {
        println!("\n{}", "==> Dependencies".blue().bold());
        for dep in formula.dependencies() {
            let mut line = format!("{} [{}]", dep.name, dep.tags);
            if let Some(when) = &dep.when {
                line.push_str(&format!(" when --{when}"));
            }
            println!("{line}");
        }
    }

    if !formula.bottle.files.is_empty() {
        println!("\n{}", "==> Bottles".blue().bold());
        for tag in formula.bottle.files.keys() {
            let marker = if *tag == config.bottle_tag { " (this machine)".green().to_string() } else { String::new() };
            println!("{tag}{marker}");
        }
    }

    if !formula.caveats.is_empty() {
        println!("\n{}", "==> Caveats".blue().bold());
        for caveat in &formula.caveats {
            match &caveat.when {
                Some(option) => println!("[--{option}] {}", caveat.text.trim_end()),
                None => println!("{}", caveat.text.trim_end()),
            }
        }
    }
}
