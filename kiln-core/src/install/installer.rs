// kiln-core/src/install/installer.rs
// Moves a staged image into its keg, links it and registers it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use kiln_aio::fs::{copy_dir_all, remove_dir_all_if_exists};
use kiln_aio::json_io::write_json_atomic;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::{InstalledPackageRecord, KegRegistry, RECEIPT_FILENAME};
use kiln_common::model::formula::Formula;
use kiln_common::options::BuildConfiguration;
use tracing::{debug, info, warn};

use super::link::{
    check_link_conflicts, create_links, link_opt, plan_links, remove_links, PlannedLink,
};
use crate::uninstall::uninstall_keg;

pub struct InstallRequest<'a> {
    pub config: &'a Config,
    pub formula: &'a Formula,
    pub build_config: &'a BuildConfiguration,
    /// The staged image of the keg path.
    pub image_prefix: &'a Path,
    /// Checksum of the source archive or bottle the image came from.
    pub sha256: &'a str,
    pub installed_on_request: bool,
    pub poured_from_bottle: bool,
    pub runtime_dependencies: &'a [String],
    /// Installed keg this install replaces (a reinstall).
    pub replacing: Option<&'a InstalledPackageRecord>,
    pub overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed(InstalledPackageRecord),
    /// Same name, version and options were already installed; nothing changed.
    AlreadyInstalled(InstalledPackageRecord),
}

impl InstallOutcome {
    pub fn record(&self) -> &InstalledPackageRecord {
        match self {
            InstallOutcome::Installed(record) | InstallOutcome::AlreadyInstalled(record) => record,
        }
    }
}

fn now_rfc3339() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}

/// An installed keg being replaced. It stays on disk until the new keg is
/// registered so a failed install can put it back.
struct Retired {
    record: InstalledPackageRecord,
    /// Set when the new keg needs the same path and the old one was moved.
    moved_to: Option<PathBuf>,
}

impl Retired {
    fn set_aside(record: InstalledPackageRecord, keg_path: &Path) -> Result<Self> {
        if record.install_path != keg_path {
            return Ok(Self {
                record,
                moved_to: None,
            });
        }
        let file_name = keg_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let aside = keg_path.with_file_name(format!(".{file_name}.replaced"));
        remove_dir_all_if_exists(&aside)?;
        fs::rename(keg_path, &aside)?;
        debug!("Moved {} aside to {}", keg_path.display(), aside.display());
        Ok(Self {
            record,
            moved_to: Some(aside),
        })
    }

    /// Puts the old keg, its links and its `opt/` link back.
    fn restore(self, config: &Config) {
        let keg = &self.record.install_path;
        if let Some(aside) = &self.moved_to {
            if let Err(e) = fs::rename(aside, keg) {
                warn!(
                    "[{}] Could not restore {} from {}: {}",
                    self.record.name,
                    keg.display(),
                    aside.display(),
                    e
                );
                return;
            }
        }
        let root = config.kiln_root();
        let planned: Vec<PlannedLink> = self
            .record
            .linked_files
            .iter()
            .filter_map(|link| {
                link.strip_prefix(root).ok().map(|rel| PlannedLink {
                    link: link.clone(),
                    target: keg.join(rel),
                })
            })
            .collect();
        if let Err(e) = create_links(&planned) {
            warn!("[{}] Could not restore links: {}", self.record.name, e);
        }
        if let Err(e) = link_opt(&config.formula_opt_path(&self.record.name), keg) {
            warn!("[{}] Could not restore opt link: {}", self.record.name, e);
        }
        debug!("[{}] Restored {}", self.record.name, keg.display());
    }

    /// Drops the old keg once the new one is registered.
    fn discard(self, config: &Config, new_links: &[PathBuf]) -> Result<()> {
        match self.moved_to {
            Some(aside) => {
                // Links the new keg did not re-create now dangle.
                let stale: Vec<PathBuf> = self
                    .record
                    .linked_files
                    .iter()
                    .filter(|link| !new_links.contains(link) && !link.exists())
                    .cloned()
                    .collect();
                remove_links(&stale);
                remove_dir_all_if_exists(&aside)
            }
            None => uninstall_keg(config, &self.record),
        }
    }
}

/// Installs `request.image_prefix` as the keg of `request.formula`.
///
/// Nothing installed is touched until the image and its links have been
/// checked. A replaced keg is restored if any later step fails. The receipt
/// is written last: a crash before that leaves a keg without a receipt,
/// which is never treated as installed and is removed by the next install
/// of the same version.
pub fn install_keg(request: &InstallRequest<'_>) -> Result<InstallOutcome> {
    let name = request.formula.name();
    let version = request.formula.version_str_full();
    let enabled = request.build_config.enabled_options();
    let registry = KegRegistry::new(request.config.clone());
    let keg_path = registry.get_keg_path(name, &version);

    let mut replaced: Vec<InstalledPackageRecord> = request.replacing.into_iter().cloned().collect();
    if let Some(existing) = registry.read_receipt(&keg_path)? {
        let already_replaced = replaced.iter().any(|r| r.install_path == existing.install_path);
        if !already_replaced {
            if existing.matches(&version, &enabled) {
                debug!(
                    "[{}] {} already installed with the same options; leaving it alone",
                    name, version
                );
                return Ok(InstallOutcome::AlreadyInstalled(existing));
            }
            if !request.overwrite {
                return Err(KilnError::InstallConflict {
                    package: name.to_string(),
                    path: keg_path,
                    owner: Some(existing.name),
                });
            }
            warn!(
                "[{}] Replacing installed {} (options {:?})",
                name, existing.version, existing.enabled_options
            );
            replaced.push(existing);
        }
    } else if keg_path.exists() {
        warn!(
            "[{}] Removing leftover keg without receipt at {}",
            name,
            keg_path.display()
        );
        remove_dir_all_if_exists(&keg_path)?;
    }

    if !request.image_prefix.is_dir() {
        return Err(KilnError::ValidationError(format!(
            "Build of {name} installed nothing under {} (is DESTDIR honored?)",
            keg_path.display()
        )));
    }

    let planned = plan_links(
        request.image_prefix,
        &keg_path,
        &request.formula.link_dirs,
        request.config.kiln_root(),
    )?;
    if !request.overwrite {
        let owners = registry.link_owners()?;
        check_link_conflicts(
            name,
            &planned,
            &owners,
            &request.config.formula_cellar_dir(name),
        )?;
    }

    let mut retired = Vec::with_capacity(replaced.len());
    for record in replaced {
        match Retired::set_aside(record, &keg_path) {
            Ok(r) => retired.push(r),
            Err(e) => {
                for r in retired {
                    r.restore(request.config);
                }
                return Err(e);
            }
        }
    }

    let record = match place_keg(request, &keg_path, &planned, version, enabled) {
        Ok(record) => record,
        Err(e) => {
            let _ = remove_dir_all_if_exists(&keg_path);
            for r in retired {
                r.restore(request.config);
            }
            return Err(e);
        }
    };
    for r in retired {
        if let Err(e) = r.discard(request.config, &record.linked_files) {
            warn!("[{}] Failed to clean up the replaced keg: {}", name, e);
        }
    }
    info!(
        "[{}] Installed {} ({} link(s))",
        name,
        keg_path.display(),
        record.linked_files.len()
    );
    Ok(InstallOutcome::Installed(record))
}

/// Copies the image, links it and writes the receipt. Links created here
/// are removed again on failure; the keg directory is left to the caller.
fn place_keg(
    request: &InstallRequest<'_>,
    keg_path: &Path,
    planned: &[PlannedLink],
    version: String,
    enabled_options: Vec<String>,
) -> Result<InstalledPackageRecord> {
    let name = request.formula.name();
    debug!(
        "[{}] Copying image {} -> {}",
        name,
        request.image_prefix.display(),
        keg_path.display()
    );
    copy_dir_all(request.image_prefix, keg_path)?;

    let linked_files = create_links(planned).map_err(|e| attribute_conflict(e, name))?;
    let record = InstalledPackageRecord {
        name: name.to_string(),
        version,
        sha256: request.sha256.to_string(),
        install_path: keg_path.to_path_buf(),
        enabled_options,
        installed_on_request: request.installed_on_request,
        poured_from_bottle: request.poured_from_bottle,
        installed_at: now_rfc3339(),
        linked_files,
        runtime_dependencies: request.runtime_dependencies.to_vec(),
    };
    let registered = link_opt(&request.config.formula_opt_path(name), keg_path)
        .and_then(|()| write_json_atomic(&keg_path.join(RECEIPT_FILENAME), &record));
    if let Err(e) = registered {
        remove_links(&record.linked_files);
        return Err(e);
    }
    Ok(record)
}

fn attribute_conflict(error: KilnError, package: &str) -> KilnError {
    match error {
        KilnError::InstallConflict { path, owner, .. } => KilnError::InstallConflict {
            package: package.to_string(),
            path,
            owner,
        },
        other => other,
    }
}
