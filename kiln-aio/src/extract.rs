// kiln-aio/src/extract.rs
// Handles archive extraction for source tarballs and bottles.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use kiln_common::error::{KilnError, Result};
use tracing::debug;
use xz2::read::XzDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    TarBz2,
    TarXz,
}

impl ArchiveKind {
    /// Infers the archive type from the file name.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") || name.ends_with(".gz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar.bz2")
            || name.ends_with(".tbz")
            || name.ends_with(".tbz2")
            || name.ends_with(".bz2")
        {
            Some(ArchiveKind::TarBz2)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") || name.ends_with(".xz") {
            Some(ArchiveKind::TarXz)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }
}

/// Extracts `archive_path` into `target_dir`. Entries escaping the target
/// (absolute paths, `..`) are refused by `tar` itself.
pub fn extract_archive(archive_path: &Path, target_dir: &Path) -> Result<()> {
    let kind = ArchiveKind::from_path(archive_path).ok_or_else(|| {
        KilnError::ExtractError(format!(
            "Unsupported archive type: {}",
            archive_path.display()
        ))
    })?;
    debug!(
        "Extracting archive '{}' ({:?}) to '{}'",
        archive_path.display(),
        kind,
        target_dir.display()
    );
    fs::create_dir_all(target_dir)?;
    let reader = BufReader::new(File::open(archive_path)?);
    let decoder: Box<dyn Read> = match kind {
        ArchiveKind::Tar => Box::new(reader),
        ArchiveKind::TarGz => Box::new(GzDecoder::new(reader)),
        ArchiveKind::TarBz2 => Box::new(BzDecoder::new(reader)),
        ArchiveKind::TarXz => Box::new(XzDecoder::new(reader)),
    };
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.unpack(target_dir).map_err(|e| {
        KilnError::ExtractError(format!(
            "Failed to unpack {}: {e}",
            archive_path.display()
        ))
    })
}

/// Source tarballs conventionally wrap everything in one `<name>-<version>/`
/// directory; returns it if so, otherwise `dir` itself.
pub fn infer_archive_root_dir(dir: &Path) -> Result<PathBuf> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        // macOS tar leaves these around.
        if name.to_string_lossy().starts_with("._") {
            continue;
        }
        entries.push(entry.path());
    }
    match entries.as_slice() {
        [single] if single.is_dir() => {
            debug!("Archive root inferred as {}", single.display());
            Ok(single.clone())
        }
        _ => Ok(dir.to_path_buf()),
    }
}
