// kiln-core/src/build/source.rs
use std::fs;
use std::path::{Path, PathBuf};

use kiln_aio::extract::{extract_archive, infer_archive_root_dir};
use kiln_common::error::{KilnError, Result};
use kiln_common::model::formula::{Formula, PatchSource, PatchSpec};
use kiln_net::{FetchRequest, Fetcher};
use tracing::debug;

use super::patch::apply_patch;
use crate::staging::StagingArea;

pub fn source_request(formula: &Formula) -> FetchRequest {
    FetchRequest::new(formula.name(), &formula.url, &formula.sha256)
        .with_mirrors(formula.mirrors.clone())
}

/// Unpacks a verified source archive into the staging area and returns the
/// root of the source tree.
pub fn unpack_source(formula: &Formula, archive: &Path, staging: &StagingArea) -> Result<PathBuf> {
    let src_dir = staging.src_dir();
    extract_archive(archive, &src_dir)?;
    let root = infer_archive_root_dir(&src_dir)?;
    debug!("[{}] Source tree at {}", formula.name(), root.display());
    Ok(root)
}

fn patch_content(formula: &Formula, patch: &PatchSpec, fetcher: &dyn Fetcher) -> Result<String> {
    match &patch.source {
        PatchSource::Inline { content } => Ok(content.clone()),
        PatchSource::Remote { url, sha256 } => {
            let path = fetcher.fetch(&FetchRequest::new(formula.name(), url, sha256))?;
            fs::read_to_string(&path).map_err(|e| KilnError::PatchFailed {
                package: formula.name().to_string(),
                patch: patch.name.clone(),
                reason: format!("cannot read {}: {e}", path.display()),
            })
        }
    }
}

/// Applies the formula's patches in declaration order, stopping at the first
/// failure. `on_applied` is told about each patch that went in.
pub fn apply_patches<F>(
    formula: &Formula,
    fetcher: &dyn Fetcher,
    source_root: &Path,
    mut on_applied: F,
) -> Result<()>
where
    F: FnMut(&str),
{
    for patch in &formula.patches {
        let content = patch_content(formula, patch, fetcher)?;
        let files = apply_patch(formula.name(), &patch.name, &content, patch.strip, source_root)?;
        debug!(
            "[{}] Applied patch '{}' ({} file(s))",
            formula.name(),
            patch.name,
            files
        );
        on_applied(&patch.name);
    }
    Ok(())
}
