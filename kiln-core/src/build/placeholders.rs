// kiln-core/src/build/placeholders.rs
// `{prefix}`-style substitution in build arguments and environment values.

use std::path::{Path, PathBuf};

use kiln_common::config::Config;
use kiln_common::model::formula::Formula;
use kiln_common::options::BuildConfiguration;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\$?)\{([a-z_]+)(?::([A-Za-z0-9@._+-]+))?\}").expect("placeholder regex is valid")
});

#[derive(Debug, Clone)]
pub struct PlaceholderContext {
    pub prefix: PathBuf,
    pub opt_prefix: PathBuf,
    pub root: PathBuf,
    pub opt_dir: PathBuf,
    pub name: String,
    pub version: String,
    pub jobs: usize,
}

impl PlaceholderContext {
    /// Context for building `formula` under `build_config`: `{jobs}` is 1
    /// when the configuration deparallelizes the build.
    pub fn for_build(
        config: &Config,
        formula: &Formula,
        build_config: &BuildConfiguration,
        jobs: usize,
    ) -> Self {
        let jobs = if build_config.deparallelize { 1 } else { jobs };
        Self::new(config, formula, jobs)
    }

    pub fn new(config: &Config, formula: &Formula, jobs: usize) -> Self {
        let version = formula.version_str_full();
        Self {
            prefix: config.formula_keg_path(formula.name(), &version),
            opt_prefix: config.formula_opt_path(formula.name()),
            root: config.kiln_root().to_path_buf(),
            opt_dir: config.opt_dir(),
            name: formula.name().to_string(),
            version,
            jobs,
        }
    }

    fn lookup(&self, key: &str, arg: Option<&str>) -> Option<String> {
        let path = |p: &Path| p.display().to_string();
        let value = match (key, arg) {
            ("prefix", None) => path(&self.prefix),
            ("opt_prefix", None) => path(&self.opt_prefix),
            ("root", None) => path(&self.root),
            ("bin", None) => path(&self.prefix.join("bin")),
            ("lib", None) => path(&self.prefix.join("lib")),
            ("libexec", None) => path(&self.prefix.join("libexec")),
            ("include", None) => path(&self.prefix.join("include")),
            ("share", None) => path(&self.prefix.join("share")),
            ("etc", None) => path(&self.prefix.join("etc")),
            ("name", None) => self.name.clone(),
            ("version", None) => self.version.clone(),
            ("jobs", None) => self.jobs.to_string(),
            ("opt", Some(dep)) => path(&self.opt_dir.join(dep)),
            _ => return None,
        };
        Some(value)
    }

    /// Expands known placeholders. Unrecognised keys and anything written
    /// shell-style as `${...}` are left verbatim.
    pub fn expand(&self, input: &str) -> String {
        PLACEHOLDER_RE
            .replace_all(input, |caps: &Captures<'_>| {
                if !caps[1].is_empty() {
                    return caps[0].to_string();
                }
                let key = &caps[2];
                let arg = caps.get(3).map(|m| m.as_str());
                self.lookup(key, arg)
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    pub fn expand_all<'a, I>(&self, inputs: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        inputs.into_iter().map(|s| self.expand(s)).collect()
    }
}
