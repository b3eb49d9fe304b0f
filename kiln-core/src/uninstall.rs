// kiln-core/src/uninstall.rs
use std::fs;
use std::path::Path;

use kiln_aio::fs::{remove_dir_all_if_exists, remove_file_if_exists};
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::{InstalledPackageRecord, KegRegistry};
use tracing::{debug, warn};

use crate::install::link::remove_links;

/// Removes an installed keg: the links it owns, its `opt/` link when that
/// still points at it, the keg (receipt included) and the package's cellar
/// directory once empty.
pub fn uninstall_keg(config: &Config, record: &InstalledPackageRecord) -> Result<()> {
    debug!(
        "Uninstalling {} {} from {}",
        record.name,
        record.version,
        record.install_path.display()
    );
    // Only links that still point into this keg are ours to remove.
    let owned: Vec<_> = record
        .linked_files
        .iter()
        .filter(|link| {
            fs::read_link(link)
                .map(|target| target.starts_with(&record.install_path))
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    if owned.len() != record.linked_files.len() {
        warn!(
            "[{}] {} recorded link(s) no longer point into the keg; leaving them",
            record.name,
            record.linked_files.len() - owned.len()
        );
    }
    remove_links(&owned);

    let opt_path = config.formula_opt_path(&record.name);
    if points_at(&opt_path, &record.install_path) {
        remove_file_if_exists(&opt_path)?;
    }

    if record.install_path.exists() {
        remove_dir_all_if_exists(&record.install_path)?;
    } else {
        warn!(
            "Keg directory {} not found during uninstall. It might have been already removed.",
            record.install_path.display()
        );
    }

    let cellar_dir = config.formula_cellar_dir(&record.name);
    if fs::remove_dir(&cellar_dir).is_ok() {
        debug!("Removed empty {}", cellar_dir.display());
    }
    Ok(())
}

fn points_at(link: &Path, target: &Path) -> bool {
    fs::read_link(link).map(|t| t == target).unwrap_or(false)
}

/// Uninstalls the installed version of `name`.
pub fn uninstall_package(config: &Config, name: &str) -> Result<InstalledPackageRecord> {
    let registry = KegRegistry::new(config.clone());
    let record = registry
        .get_installed_record(name)?
        .ok_or_else(|| KilnError::NotFound(format!("{name} is not installed")))?;
    uninstall_keg(config, &record)?;
    Ok(record)
}
