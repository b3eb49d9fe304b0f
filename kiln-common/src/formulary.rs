// kiln-common/src/formulary.rs
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use super::config::Config;
use super::error::{KilnError, Result};
use super::model::formula::Formula;

const FORMULA_EXTENSION: &str = "json";

/// The formula registry: `<name>.json` descriptors looked up across the
/// configured formula directories, parsed once and shared as `Arc<Formula>`.
#[derive(Debug)]
pub struct Formulary {
    search_dirs: Vec<PathBuf>,
    parsed_cache: Mutex<HashMap<String, Arc<Formula>>>,
}

impl Formulary {
    pub fn new(config: &Config) -> Self {
        Self {
            search_dirs: config.formula_dirs(),
            parsed_cache: Mutex::new(HashMap::new()),
        }
    }

    /// In-memory registry that never touches the filesystem.
    pub fn from_formulae<I>(formulae: I) -> Self
    where
        I: IntoIterator<Item = Formula>,
    {
        let parsed = formulae
            .into_iter()
            .map(|f| (f.name.clone(), Arc::new(f)))
            .collect();
        Self {
            search_dirs: Vec::new(),
            parsed_cache: Mutex::new(parsed),
        }
    }

    fn cache_guard(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<Formula>>>> {
        self.parsed_cache
            .lock()
            .map_err(|e| KilnError::Generic(format!("Formula cache lock poisoned: {e}")))
    }

    pub fn load_formula(&self, name: &str) -> Result<Arc<Formula>> {
        if let Some(formula) = self.cache_guard()?.get(name) {
            debug!("Loaded formula '{}' from parsed cache.", name);
            return Ok(Arc::clone(formula));
        }

        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(KilnError::NotFound(format!("Formula '{name}'")));
        }

        for dir in &self.search_dirs {
            let path = dir.join(format!("{name}.{FORMULA_EXTENSION}"));
            if !path.is_file() {
                continue;
            }
            debug!("Reading formula '{}' from {}", name, path.display());
            let raw = fs::read_to_string(&path)?;
            let formula = Formula::from_json(&raw).map_err(|e| {
                KilnError::ValidationError(format!(
                    "Failed to load formula {}: {e}",
                    path.display()
                ))
            })?;
            if formula.name != name {
                return Err(KilnError::ValidationError(format!(
                    "Formula file {} declares name '{}'",
                    path.display(),
                    formula.name
                )));
            }
            debug!(
                "Successfully loaded formula '{}' version {}",
                formula.name,
                formula.version_str_full()
            );
            let formula = Arc::new(formula);
            let mut guard = self.cache_guard()?;
            let cached = guard
                .entry(name.to_string())
                .or_insert_with(|| Arc::clone(&formula));
            return Ok(Arc::clone(cached));
        }

        debug!("Formula '{}' not found in any formula directory.", name);
        Err(KilnError::NotFound(format!("Formula '{name}'")))
    }

    /// Whether `name` can be loaded, without surfacing parse errors.
    pub fn contains(&self, name: &str) -> bool {
        matches!(self.load_formula(name), Ok(_))
    }

    /// Sorted names of every formula known to this registry.
    pub fn list_names(&self) -> Result<Vec<String>> {
        let mut names: BTreeSet<String> = self.cache_guard()?.keys().cloned().collect();
        for dir in &self.search_dirs {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!("Could not read formula directory {}: {}", dir.display(), e);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(FORMULA_EXTENSION) {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.insert(stem.to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_registry_returns_shared_formula() {
        let formulary = Formulary::from_formulae([Formula::new(
            "serf",
            "1.3.0",
            "https://x/serf.tar.bz2",
            "aa",
        )]);
        let a = formulary.load_formula("serf").unwrap();
        let b = formulary.load_formula("serf").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(
            formulary.load_formula("apr"),
            Err(KilnError::NotFound(_))
        ));
    }

    #[test]
    fn loads_formula_files_from_search_dirs() {
        let root = tempfile::tempdir().unwrap();
        let mut config = Config::with_root(root.path());
        let extra = root.path().join("tap");
        fs::create_dir_all(&extra).unwrap();
        config.extra_formula_dirs.push(extra.clone());
        fs::write(
            extra.join("sqlite.json"),
            r#"{ "name": "sqlite", "version": "3.7.17", "url": "https://x/sqlite.tar.gz", "sha256": "bb" }"#,
        )
        .unwrap();
        fs::write(extra.join("README.md"), "not a formula").unwrap();

        let formulary = Formulary::new(&config);
        let sqlite = formulary.load_formula("sqlite").unwrap();
        assert_eq!(sqlite.version, "3.7.17");
        assert_eq!(formulary.list_names().unwrap(), vec!["sqlite"]);
        assert!(!formulary.contains("../sqlite"));
    }

    #[test]
    fn mismatched_file_name_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path());
        let dir = &config.formula_dirs()[0];
        fs::create_dir_all(dir).unwrap();
        fs::write(
            dir.join("apr.json"),
            r#"{ "name": "apr-util", "version": "1.5.2", "url": "https://x/a.tar.gz", "sha256": "cc" }"#,
        )
        .unwrap();
        let formulary = Formulary::new(&config);
        assert!(matches!(
            formulary.load_formula("apr"),
            Err(KilnError::ValidationError(_))
        ));
    }
}
