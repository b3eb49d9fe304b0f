// kiln-core/src/install/link.rs
// Symlinks from the shared prefix (`<root>/bin`, `<root>/lib`, ...) into kegs.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use kiln_aio::fs::{create_symlink, path_exists_or_symlink, remove_file_if_exists};
use kiln_common::error::{KilnError, Result};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// One symlink to create: `link` in the shared prefix pointing at `target` in the keg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedLink {
    pub link: PathBuf,
    pub target: PathBuf,
}

/// Plans links for every non-directory entry below `layout_root/<dir>` for
/// each of `link_dirs`. `layout_root` is scanned; `keg_path` is what links
/// will point at (they share the same layout).
pub fn plan_links(
    layout_root: &Path,
    keg_path: &Path,
    link_dirs: &[String],
    kiln_root: &Path,
) -> Result<Vec<PlannedLink>> {
    let mut planned = Vec::new();
    for dir in link_dirs {
        let scan_root = layout_root.join(dir);
        if !scan_root.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&scan_root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                KilnError::Generic(format!("Failed to walk {}: {e}", scan_root.display()))
            })?;
            if entry.file_type().is_dir() {
                continue;
            }
            let rel = entry.path().strip_prefix(layout_root).map_err(|e| {
                KilnError::Generic(format!(
                    "{} is outside {}: {e}",
                    entry.path().display(),
                    layout_root.display()
                ))
            })?;
            planned.push(PlannedLink {
                link: kiln_root.join(rel),
                target: keg_path.join(rel),
            });
        }
    }
    Ok(planned)
}

fn points_into(link: &Path, dir: &Path) -> bool {
    fs::read_link(link)
        .map(|target| target.starts_with(dir))
        .unwrap_or(false)
}

/// Fails with `InstallConflict` for the first planned link whose path is
/// already taken by another package or by a file kiln does not manage.
/// Paths owned by `package` itself, or symlinks into its own cellar
/// directory, are not conflicts.
pub fn check_link_conflicts(
    package: &str,
    planned: &[PlannedLink],
    owners: &HashMap<PathBuf, String>,
    own_cellar_dir: &Path,
) -> Result<()> {
    for link in planned {
        if !path_exists_or_symlink(&link.link) {
            continue;
        }
        match owners.get(&link.link) {
            Some(owner) if owner == package => continue,
            Some(owner) => {
                return Err(KilnError::InstallConflict {
                    package: package.to_string(),
                    path: link.link.clone(),
                    owner: Some(owner.clone()),
                });
            }
            None if points_into(&link.link, own_cellar_dir) => continue,
            None => {
                return Err(KilnError::InstallConflict {
                    package: package.to_string(),
                    path: link.link.clone(),
                    owner: None,
                });
            }
        }
    }
    Ok(())
}

/// Creates the planned links, replacing whatever is in the way. On error
/// the links created so far are removed again.
pub fn create_links(planned: &[PlannedLink]) -> Result<Vec<PathBuf>> {
    let mut created = Vec::with_capacity(planned.len());
    for link in planned {
        let result = (|| -> Result<()> {
            if let Some(parent) = link.link.parent() {
                fs::create_dir_all(parent)?;
            }
            if path_exists_or_symlink(&link.link) {
                if link.link.is_dir() && !link.link.is_symlink() {
                    return Err(KilnError::InstallConflict {
                        package: String::new(),
                        path: link.link.clone(),
                        owner: None,
                    });
                }
                remove_file_if_exists(&link.link)?;
            }
            create_symlink(&link.target, &link.link)
        })();
        if let Err(e) = result {
            warn!("Linking {} failed: {}; rolling back", link.link.display(), e);
            remove_links(&created);
            return Err(e);
        }
        created.push(link.link.clone());
    }
    debug!("Created {} link(s)", created.len());
    Ok(created)
}

/// Removes the given paths if they are symlinks, then prunes parent
/// directories left empty. Real files are never touched.
pub fn remove_links(links: &[PathBuf]) {
    for link in links {
        if !link.is_symlink() {
            continue;
        }
        if let Err(e) = fs::remove_file(link) {
            warn!("Failed to remove link {}: {}", link.display(), e);
            continue;
        }
        let mut parent = link.parent();
        while let Some(dir) = parent {
            // Stops at the first non-empty directory.
            if fs::remove_dir(dir).is_err() {
                break;
            }
            parent = dir.parent();
        }
    }
}

/// Points `opt/<name>` at `keg_path`.
pub fn link_opt(opt_path: &Path, keg_path: &Path) -> Result<()> {
    if let Some(parent) = opt_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if path_exists_or_symlink(opt_path) {
        remove_file_if_exists(opt_path)?;
    }
    create_symlink(keg_path, opt_path)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn layout(root: &Path) -> PathBuf {
        let image = root.join("image");
        fs::create_dir_all(image.join("bin")).unwrap();
        fs::create_dir_all(image.join("share/man/man1")).unwrap();
        fs::create_dir_all(image.join("libexec")).unwrap();
        fs::write(image.join("bin/svn"), "svn").unwrap();
        fs::write(image.join("share/man/man1/svn.1"), "man").unwrap();
        fs::write(image.join("libexec/helper"), "helper").unwrap();
        image
    }

    fn link_dirs() -> Vec<String> {
        vec!["bin".into(), "share".into()]
    }

    #[test]
    fn plans_only_link_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let image = layout(tmp.path());
        let keg = tmp.path().join("Cellar/subversion/1.8.0");
        let planned = plan_links(&image, &keg, &link_dirs(), tmp.path()).unwrap();
        assert_eq!(
            planned,
            vec![
                PlannedLink {
                    link: tmp.path().join("bin/svn"),
                    target: keg.join("bin/svn"),
                },
                PlannedLink {
                    link: tmp.path().join("share/man/man1/svn.1"),
                    target: keg.join("share/man/man1/svn.1"),
                },
            ]
        );
    }

    #[test]
    fn foreign_and_unmanaged_paths_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let image = layout(tmp.path());
        let keg = tmp.path().join("Cellar/subversion/1.8.0");
        let planned = plan_links(&image, &keg, &link_dirs(), tmp.path()).unwrap();
        let own_cellar = tmp.path().join("Cellar/subversion");

        fs::create_dir_all(tmp.path().join("bin")).unwrap();
        fs::write(tmp.path().join("bin/svn"), "someone else's").unwrap();
        let err = check_link_conflicts("subversion", &planned, &HashMap::new(), &own_cellar)
            .unwrap_err();
        assert!(matches!(err, KilnError::InstallConflict { owner: None, .. }));

        let owners: HashMap<PathBuf, String> =
            [(tmp.path().join("bin/svn"), "svn-legacy".to_string())].into();
        let err = check_link_conflicts("subversion", &planned, &owners, &own_cellar).unwrap_err();
        assert!(matches!(
            err,
            KilnError::InstallConflict { owner: Some(ref o), .. } if o == "svn-legacy"
        ));

        let owners: HashMap<PathBuf, String> =
            [(tmp.path().join("bin/svn"), "subversion".to_string())].into();
        assert!(check_link_conflicts("subversion", &planned, &owners, &own_cellar).is_ok());
    }

    #[test]
    fn create_and_remove_links() {
        let tmp = tempfile::tempdir().unwrap();
        let image = layout(tmp.path());
        let keg = tmp.path().join("Cellar/subversion/1.8.0");
        let planned = plan_links(&image, &keg, &link_dirs(), tmp.path()).unwrap();
        let created = create_links(&planned).unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(
            fs::read_link(tmp.path().join("bin/svn")).unwrap(),
            keg.join("bin/svn")
        );
        remove_links(&created);
        assert!(!tmp.path().join("bin/svn").is_symlink());
        assert!(!tmp.path().join("share/man").exists());
    }
}
