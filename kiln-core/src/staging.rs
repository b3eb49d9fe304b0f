// kiln-core/src/staging.rs
// Private per-package working directories under `<root>/tmp/staging`.

use std::fs;
use std::path::{Path, PathBuf};

use kiln_aio::fs::{remove_dir_all_if_exists, remove_file_if_exists};
use kiln_common::config::Config;
use kiln_common::error::Result;
use tracing::debug;

/// Present in a staging directory until its package is fully installed.
pub const INCOMPLETE_MARKER: &str = ".incomplete";

#[derive(Debug)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn create(config: &Config, name: &str, version: &str) -> Result<Self> {
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let root = config
            .staging_dir()
            .join(format!("{name}-{version}-{}", &unique[..8]));
        fs::create_dir_all(root.join("src"))?;
        fs::create_dir_all(root.join("image"))?;
        fs::write(root.join(INCOMPLETE_MARKER), format!("{name} {version}\n"))?;
        debug!("[{}] Staging directory: {}", name, root.display());
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Where sources and bottles are unpacked.
    pub fn src_dir(&self) -> PathBuf {
        self.root.join("src")
    }

    /// `DESTDIR` for the build.
    pub fn image_dir(&self) -> PathBuf {
        self.root.join("image")
    }

    /// Location of `prefix` inside the image, mirroring `make install DESTDIR=…`.
    pub fn image_prefix(&self, prefix: &Path) -> PathBuf {
        let relative = prefix.strip_prefix("/").unwrap_or(prefix);
        self.image_dir().join(relative)
    }

    pub fn is_incomplete(&self) -> bool {
        self.root.join(INCOMPLETE_MARKER).exists()
    }

    /// Marks the area complete; removes it unless `keep` is set.
    pub fn finish(self, keep: bool) -> Result<()> {
        remove_file_if_exists(&self.root.join(INCOMPLETE_MARKER))?;
        if keep {
            debug!("Keeping staging directory {}", self.root.display());
            Ok(())
        } else {
            remove_dir_all_if_exists(&self.root)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_lives_until_finish() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path());
        let staging = StagingArea::create(&config, "serf", "1.3.0").unwrap();
        assert!(staging.is_incomplete());
        assert!(staging.path().starts_with(config.staging_dir()));
        assert_eq!(
            staging.image_prefix(Path::new("/opt/kiln/Cellar/serf/1.3.0")),
            staging.image_dir().join("opt/kiln/Cellar/serf/1.3.0")
        );
        let path = staging.path().to_path_buf();
        staging.finish(false).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn two_areas_for_one_package_do_not_collide() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path());
        let a = StagingArea::create(&config, "serf", "1.3.0").unwrap();
        let b = StagingArea::create(&config, "serf", "1.3.0").unwrap();
        assert_ne!(a.path(), b.path());
        let kept = a.path().to_path_buf();
        a.finish(true).unwrap();
        assert!(kept.is_dir());
        assert!(!kept.join(INCOMPLETE_MARKER).exists());
        assert!(b.is_incomplete());
    }
}
