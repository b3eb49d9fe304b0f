// kiln-common/src/config.rs
use std::env;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use tracing::debug;

use super::error::{KilnError, Result};

// Used when KILN_ROOT is unset and no home directory can be determined.
const DEFAULT_FALLBACK_KILN_ROOT: &str = "/opt/kiln";
const DEFAULT_COMPILERS: &[&str] = &["clang", "gcc"];
const MAX_DEFAULT_WORKERS: usize = 6;

#[derive(Debug, Clone)]
pub struct Config {
    pub kiln_root: PathBuf,
    /// Additional formula directories searched after `<root>/Library/Formula`.
    pub extra_formula_dirs: Vec<PathBuf>,
    /// Explicit worker count; `None` derives one from the CPU count.
    pub jobs: Option<usize>,
    /// Compiler preference order handed to the option evaluator.
    pub compilers: Vec<String>,
    pub bottle_tag: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("Loading kiln configuration");

        let kiln_root = match env::var("KILN_ROOT").ok().filter(|s| !s.is_empty()) {
            Some(root) => PathBuf::from(root),
            None => {
                let fallback = BaseDirs::new()
                    .map(|dirs| dirs.home_dir().join(".kiln"))
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_FALLBACK_KILN_ROOT));
                debug!(
                    "KILN_ROOT not set or empty, falling back to: {}",
                    fallback.display()
                );
                fallback
            }
        };
        debug!("Effective KILN_ROOT set to: {}", kiln_root.display());

        let extra_formula_dirs = env::var("KILN_FORMULA_PATH")
            .map(|raw| env::split_paths(&raw).filter(|p| !p.as_os_str().is_empty()).collect())
            .unwrap_or_default();

        let jobs = match env::var("KILN_JOBS") {
            Ok(raw) => Some(parse_jobs(&raw)?),
            Err(_) => None,
        };

        let compilers = env::var("KILN_CC")
            .ok()
            .map(|raw| parse_compiler_list(&raw))
            .filter(|list| !list.is_empty())
            .unwrap_or_else(default_compilers);

        let bottle_tag = env::var("KILN_BOTTLE_TAG")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(default_bottle_tag);

        debug!("Configuration loaded successfully.");
        Ok(Self {
            kiln_root,
            extra_formula_dirs,
            jobs,
            compilers,
            bottle_tag,
        })
    }

    /// Configuration rooted at `root` with no environment lookups.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            kiln_root: root.into(),
            extra_formula_dirs: Vec::new(),
            jobs: None,
            compilers: default_compilers(),
            bottle_tag: default_bottle_tag(),
        }
    }

    pub fn kiln_root(&self) -> &Path {
        &self.kiln_root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.kiln_root.join("bin")
    }

    pub fn cellar_dir(&self) -> PathBuf {
        self.kiln_root.join("Cellar")
    }

    pub fn opt_dir(&self) -> PathBuf {
        self.kiln_root.join("opt")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.kiln_root.join("kiln_cache")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.kiln_root.join("kiln_logs")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.kiln_root.join("tmp")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.tmp_dir().join("staging")
    }

    pub fn formula_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.kiln_root.join("Library").join("Formula")];
        dirs.extend(self.extra_formula_dirs.iter().cloned());
        dirs
    }

    pub fn formula_cellar_dir(&self, formula_name: &str) -> PathBuf {
        self.cellar_dir().join(formula_name)
    }

    pub fn formula_keg_path(&self, formula_name: &str, version_str: &str) -> PathBuf {
        self.formula_cellar_dir(formula_name).join(version_str)
    }

    pub fn formula_opt_path(&self, formula_name: &str) -> PathBuf {
        self.opt_dir().join(formula_name)
    }

    /// Number of concurrent build workers.
    pub fn worker_count(&self) -> usize {
        match self.jobs {
            Some(n) => n.max(1),
            None => std::cmp::max(1, num_cpus::get_physical().saturating_sub(1))
                .min(MAX_DEFAULT_WORKERS),
        }
    }
}

fn parse_jobs(raw: &str) -> Result<usize> {
    match raw.trim().parse::<usize>() {
        Ok(0) | Err(_) => Err(KilnError::Config(format!(
            "KILN_JOBS must be a positive integer, got '{raw}'"
        ))),
        Ok(n) => Ok(n),
    }
}

fn parse_compiler_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_compilers() -> Vec<String> {
    DEFAULT_COMPILERS.iter().map(|s| s.to_string()).collect()
}

/// Platform identifier used as the key into a formula's bottle table.
pub fn default_bottle_tag() -> String {
    let arch = match env::consts::ARCH {
        "aarch64" => "arm64",
        other => other,
    };
    format!("{arch}_{}", env::consts::OS)
}

impl Default for Config {
    fn default() -> Self {
        Self::with_root(DEFAULT_FALLBACK_KILN_ROOT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_the_root() {
        let config = Config::with_root("/tmp/kiln-test");
        assert_eq!(
            config.formula_keg_path("serf", "1.3.0"),
            PathBuf::from("/tmp/kiln-test/Cellar/serf/1.3.0")
        );
        assert_eq!(
            config.formula_opt_path("serf"),
            PathBuf::from("/tmp/kiln-test/opt/serf")
        );
        assert_eq!(
            config.formula_dirs()[0],
            PathBuf::from("/tmp/kiln-test/Library/Formula")
        );
    }

    #[test]
    fn jobs_must_be_positive() {
        assert!(parse_jobs("0").is_err());
        assert!(parse_jobs("many").is_err());
        assert_eq!(parse_jobs(" 4 ").ok(), Some(4));
    }

    #[test]
    fn explicit_jobs_override_cpu_count() {
        let mut config = Config::with_root("/tmp/kiln-test");
        config.jobs = Some(3);
        assert_eq!(config.worker_count(), 3);
        config.jobs = None;
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn compiler_list_is_trimmed() {
        assert_eq!(parse_compiler_list(" gcc, ,clang "), vec!["gcc", "clang"]);
    }
}
