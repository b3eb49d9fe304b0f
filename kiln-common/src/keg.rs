// kiln-common/src/keg.rs
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::Config;
use super::error::{KilnError, Result};

/// Receipt written into every keg once its install has fully succeeded.
pub const RECEIPT_FILENAME: &str = "INSTALL_RECEIPT.json";

/// Persisted metadata for one installed package, stored as the keg's receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackageRecord {
    pub name: String,
    pub version: String,
    /// Checksum of the artifact the keg was produced from (source or bottle).
    pub sha256: String,
    pub install_path: PathBuf,
    pub enabled_options: Vec<String>,
    pub installed_on_request: bool,
    pub poured_from_bottle: bool,
    /// RFC 3339 timestamp.
    pub installed_at: String,
    /// Absolute paths of the symlinks this package created under the root.
    #[serde(default)]
    pub linked_files: Vec<PathBuf>,
    #[serde(default)]
    pub runtime_dependencies: Vec<String>,
}

impl InstalledPackageRecord {
    /// Same package, same version, same options: nothing to do.
    pub fn matches(&self, version: &str, enabled_options: &[String]) -> bool {
        self.version == version && self.enabled_options == enabled_options
    }
}

/// Queries the cellar for installed packages. Only kegs carrying a receipt
/// count as installed; a bare keg directory is leftover from an aborted run.
#[derive(Debug, Clone)]
pub struct KegRegistry {
    config: Config,
}

impl KegRegistry {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn cellar_path(&self) -> PathBuf {
        self.config.cellar_dir()
    }

    pub fn get_keg_path(&self, name: &str, version_str_full: &str) -> PathBuf {
        self.config.formula_keg_path(name, version_str_full)
    }

    pub fn get_opt_path(&self, name: &str) -> PathBuf {
        self.config.formula_opt_path(name)
    }

    /// Reads the receipt of the keg at `keg_path`, `None` if there is none.
    pub fn read_receipt(&self, keg_path: &Path) -> Result<Option<InstalledPackageRecord>> {
        let receipt_path = keg_path.join(RECEIPT_FILENAME);
        let raw = match fs::read_to_string(&receipt_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: InstalledPackageRecord = serde_json::from_str(&raw).map_err(|e| {
            KilnError::ValidationError(format!(
                "Corrupt install receipt {}: {e}",
                receipt_path.display()
            ))
        })?;
        Ok(Some(record))
    }

    pub fn get_installed_record(&self, name: &str) -> Result<Option<InstalledPackageRecord>> {
        let formula_dir = self.config.formula_cellar_dir(name);
        if !formula_dir.is_dir() {
            debug!(
                "[KEG_REGISTRY:{}] No cellar directory at {}",
                name,
                formula_dir.display()
            );
            return Ok(None);
        }

        let mut latest: Option<InstalledPackageRecord> = None;
        for entry in fs::read_dir(&formula_dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(
                        "[KEG_REGISTRY:{}] Error reading entry in {}: {}. Skipping.",
                        name,
                        formula_dir.display(),
                        e
                    );
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(record) = self.read_receipt(&path)? else {
                debug!(
                    "[KEG_REGISTRY:{}] Keg {} has no receipt; ignoring.",
                    name,
                    path.display()
                );
                continue;
            };
            // Lexicographic, same as the directory names.
            let newer = latest
                .as_ref()
                .map_or(true, |current| record.version > current.version);
            if newer {
                latest = Some(record);
            }
        }
        Ok(latest)
    }

    pub fn is_installed(&self, name: &str) -> Result<bool> {
        Ok(self.get_installed_record(name)?.is_some())
    }

    /// Every installed package, sorted by name.
    pub fn list_installed(&self) -> Result<Vec<InstalledPackageRecord>> {
        let cellar_dir = self.cellar_path();
        if !cellar_dir.is_dir() {
            debug!("[KEG_REGISTRY] Cellar directory not found. Returning empty list.");
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&cellar_dir)?.flatten() {
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();

        let mut records = Vec::new();
        for name in names {
            if let Some(record) = self.get_installed_record(&name)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Map of link path to owning package, across all installed packages.
    pub fn link_owners(&self) -> Result<HashMap<PathBuf, String>> {
        let mut owners = HashMap::new();
        for record in self.list_installed()? {
            for link in &record.linked_files {
                owners.insert(link.clone(), record.name.clone());
            }
        }
        Ok(owners)
    }

    /// Installed packages that declare `name` as a runtime dependency.
    pub fn dependents_of(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .list_installed()?
            .into_iter()
            .filter(|r| r.runtime_dependencies.iter().any(|d| d == name))
            .map(|r| r.name)
            .collect())
    }
}
