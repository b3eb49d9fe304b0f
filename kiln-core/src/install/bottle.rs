// kiln-core/src/install/bottle.rs
// Pours a prebuilt bottle into the staging image so it installs like a build.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use kiln_aio::extract::extract_archive;
use kiln_aio::fs::move_dir;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::formula::Formula;
use kiln_net::FetchRequest;
use tracing::debug;
use walkdir::WalkDir;

use crate::staging::StagingArea;

pub const PREFIX_PLACEHOLDER: &str = "@@KILN_PREFIX@@";
pub const CELLAR_PLACEHOLDER: &str = "@@KILN_CELLAR@@";

/// Bytes inspected when deciding whether a file is text.
const TEXT_SNIFF_LEN: usize = 8192;

pub fn bottle_request(formula: &Formula, bottle_tag: &str) -> Result<FetchRequest> {
    let spec = formula.bottle_for(bottle_tag).ok_or_else(|| {
        KilnError::NotFound(format!(
            "No bottle of {} for platform '{}'",
            formula.name(),
            bottle_tag
        ))
    })?;
    Ok(FetchRequest::new(formula.name(), &spec.url, &spec.sha256))
}

/// Extracts `archive` (laid out as `<name>/<version>/…`) and moves the keg
/// contents to `staging.image_prefix(keg_path)`, relocating placeholder
/// paths in text files. Returns the staged prefix.
pub fn pour_bottle(
    config: &Config,
    formula: &Formula,
    archive: &Path,
    staging: &StagingArea,
    keg_path: &Path,
) -> Result<PathBuf> {
    let src_dir = staging.src_dir();
    extract_archive(archive, &src_dir)?;
    let bottle_root = locate_keg_dir(formula, &src_dir)?;
    let image_prefix = staging.image_prefix(keg_path);
    if let Some(parent) = image_prefix.parent() {
        fs::create_dir_all(parent)?;
    }
    move_dir(&bottle_root, &image_prefix)?;

    let relocated = relocate_placeholders(&image_prefix, config.kiln_root(), &config.cellar_dir())?;
    debug!(
        "[{}] Poured bottle into {} ({} file(s) relocated)",
        formula.name(),
        image_prefix.display(),
        relocated
    );
    Ok(image_prefix)
}

fn locate_keg_dir(formula: &Formula, src_dir: &Path) -> Result<PathBuf> {
    let name_dir = src_dir.join(formula.name());
    let exact = name_dir.join(formula.version_str_full());
    if exact.is_dir() {
        return Ok(exact);
    }
    // A bottle built from another revision still has a single version dir.
    let versions: Vec<PathBuf> = fs::read_dir(&name_dir)
        .map_err(|e| {
            KilnError::ExtractError(format!(
                "Bottle for {} has no '{}/' directory: {e}",
                formula.name(),
                formula.name()
            ))
        })?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    match versions.as_slice() {
        [only] => Ok(only.clone()),
        _ => Err(KilnError::ExtractError(format!(
            "Bottle for {} does not contain exactly one version directory",
            formula.name()
        ))),
    }
}

fn looks_like_text(path: &Path) -> Result<bool> {
    let mut buf = vec![0u8; TEXT_SNIFF_LEN];
    let mut file = fs::File::open(path)?;
    let read = file.read(&mut buf)?;
    Ok(!buf[..read].contains(&0))
}

/// Replaces the prefix and cellar placeholders in every regular text file
/// below `dir`. Binaries and symlinks are left alone. Returns the number of
/// rewritten files.
pub fn relocate_placeholders(dir: &Path, root: &Path, cellar: &Path) -> Result<usize> {
    let root = root.display().to_string();
    let cellar = cellar.display().to_string();
    let mut rewritten = 0;
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| {
            KilnError::Generic(format!("Failed to walk {}: {e}", dir.display()))
        })?;
        if !entry.file_type().is_file() || !looks_like_text(entry.path())? {
            continue;
        }
        let Ok(content) = fs::read_to_string(entry.path()) else {
            continue;
        };
        if !content.contains(PREFIX_PLACEHOLDER) && !content.contains(CELLAR_PLACEHOLDER) {
            continue;
        }
        let replaced = content
            .replace(CELLAR_PLACEHOLDER, &cellar)
            .replace(PREFIX_PLACEHOLDER, &root);
        // fs::write keeps the existing mode bits.
        fs::write(entry.path(), replaced)?;
        rewritten += 1;
    }
    Ok(rewritten)
}
