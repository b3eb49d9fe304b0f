// kiln-core/src/build/env.rs
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use kiln_common::config::Config;
use kiln_common::model::formula::Formula;
use kiln_common::options::BuildConfiguration;
use tracing::debug;

use super::placeholders::PlaceholderContext;

// Passed through from the invoking user; everything else is dropped.
const ENV_VARS_TO_KEEP: &[&str] = &[
    "USER",
    "LOGNAME",
    "HOME",
    "TMPDIR",
    "TERM",
    "SHELL",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TZ",
];

const SYSTEM_PATH_DIRS: &[&str] = &["/usr/bin", "/bin", "/usr/sbin", "/sbin"];

/// Everything needed to derive one package's build environment.
pub struct EnvInputs<'a> {
    pub config: &'a Config,
    pub formula: &'a Formula,
    pub build_config: &'a BuildConfiguration,
    /// Packages whose opt paths feed PATH, pkg-config and compiler flags.
    pub dependencies: &'a [String],
    pub placeholders: &'a PlaceholderContext,
    /// Staging image root, exported as `DESTDIR`.
    pub destdir: &'a Path,
    pub jobs: usize,
}

/// The immutable environment handed to every backend invocation of one
/// package. Nothing here touches the orchestrator's own process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEnvironment {
    vars: BTreeMap<String, String>,
    path_dirs: Vec<PathBuf>,
}

impl BuildEnvironment {
    pub fn new(inputs: &EnvInputs<'_>) -> Self {
        Self::from_inherited(env::vars(), inputs)
    }

    pub fn from_inherited<I>(inherited: I, inputs: &EnvInputs<'_>) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut vars = BTreeMap::new();
        let mut user_path = None;
        for (key, value) in inherited {
            if key == "PATH" {
                user_path = Some(value);
            } else if ENV_VARS_TO_KEEP.contains(&key.as_str()) {
                vars.insert(key, value);
            }
        }

        let dep_opt_paths: Vec<PathBuf> = inputs
            .dependencies
            .iter()
            .map(|dep| inputs.config.formula_opt_path(dep))
            .collect();

        let mut path_dirs = Vec::new();
        for opt in &dep_opt_paths {
            path_dirs.push(opt.join("bin"));
            path_dirs.push(opt.join("sbin"));
        }
        path_dirs.push(inputs.config.bin_dir());
        path_dirs.push(inputs.config.kiln_root().join("sbin"));
        path_dirs.extend(SYSTEM_PATH_DIRS.iter().map(PathBuf::from));
        if inputs.build_config.userpaths {
            if let Some(user_path) = &user_path {
                for dir in env::split_paths(user_path) {
                    if !dir.as_os_str().is_empty() && !path_dirs.contains(&dir) {
                        path_dirs.push(dir);
                    }
                }
            }
        }
        vars.insert("PATH".to_string(), join_paths(&path_dirs));

        if !dep_opt_paths.is_empty() {
            let pkg_config: Vec<PathBuf> = dep_opt_paths
                .iter()
                .flat_map(|opt| [opt.join("lib/pkgconfig"), opt.join("share/pkgconfig")])
                .collect();
            vars.insert("PKG_CONFIG_PATH".to_string(), join_paths(&pkg_config));
            vars.insert(
                "CPPFLAGS".to_string(),
                flag_list("-I", dep_opt_paths.iter().map(|p| p.join("include"))),
            );
            vars.insert(
                "LDFLAGS".to_string(),
                flag_list("-L", dep_opt_paths.iter().map(|p| p.join("lib"))),
            );
        }

        if let Some(cc) = &inputs.build_config.compiler {
            let path_value = vars.get("PATH").cloned().unwrap_or_default();
            vars.insert("CC".to_string(), resolve_tool(cc, &path_value));
            vars.insert(
                "CXX".to_string(),
                resolve_tool(&cxx_for(cc), &path_value),
            );
        }

        let make_jobs = if inputs.build_config.deparallelize {
            1
        } else {
            inputs.jobs.max(1)
        };
        vars.insert("MAKEFLAGS".to_string(), format!("-j{make_jobs}"));
        vars.insert(
            "DESTDIR".to_string(),
            inputs.destdir.display().to_string(),
        );

        for (key, value) in &inputs.formula.env {
            vars.insert(key.clone(), inputs.placeholders.expand(value));
        }
        // Option effects win over the formula's own defaults.
        for (key, value) in &inputs.build_config.env {
            vars.insert(key.clone(), inputs.placeholders.expand(value));
        }

        debug!(
            "Build environment for {}: {:?}",
            inputs.formula.name(),
            vars.keys().collect::<Vec<_>>()
        );
        Self { vars, path_dirs }
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn path_dirs(&self) -> &[PathBuf] {
        &self.path_dirs
    }

    /// The environment for one step: this environment plus the step's own
    /// (placeholder-expanded) overrides.
    pub fn for_step(
        &self,
        overrides: &BTreeMap<String, String>,
        placeholders: &PlaceholderContext,
    ) -> BTreeMap<String, String> {
        let mut vars = self.vars.clone();
        for (key, value) in overrides {
            vars.insert(key.clone(), placeholders.expand(value));
        }
        vars
    }
}

fn join_paths(dirs: &[PathBuf]) -> String {
    dirs.iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

fn flag_list<I: Iterator<Item = PathBuf>>(flag: &str, dirs: I) -> String {
    dirs.map(|d| format!("{flag}{}", d.display()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn cxx_for(cc: &str) -> String {
    match cc {
        "clang" => "clang++".to_string(),
        "gcc" => "g++".to_string(),
        other => match other.strip_prefix("gcc-") {
            Some(version) => format!("g++-{version}"),
            None => other.to_string(),
        },
    }
}

fn resolve_tool(name: &str, path_value: &str) -> String {
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    match which::which_in(name, Some(path_value), cwd) {
        Ok(found) => found.display().to_string(),
        Err(_) => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use kiln_common::model::formula::{FormulaOption, OptionEffects};
    use kiln_common::options::{evaluate, OptionRequest, Toolchain};

    use super::*;

    fn subversion() -> Formula {
        let mut f = Formula::new("subversion", "1.8.0", "https://x/s.tar.bz2", "aa");
        f.options.push(FormulaOption {
            name: "java".into(),
            description: String::new(),
            default: false,
            effects: OptionEffects {
                deparallelize: true,
                env: [("JAVA_OPTS".to_string(), "-Dprefix={prefix}".to_string())].into(),
                ..Default::default()
            },
        });
        f.options.push(FormulaOption {
            name: "perl".into(),
            description: String::new(),
            default: false,
            effects: OptionEffects {
                userpaths: true,
                ..Default::default()
            },
        });
        f.env.insert("SVN_STATIC".into(), "no".into());
        f
    }

    fn inherited() -> Vec<(String, String)> {
        vec![
            ("HOME".into(), "/home/builder".into()),
            ("PATH".into(), "/home/builder/bin:/usr/bin".into()),
            ("PYTHONPATH".into(), "/somewhere".into()),
            ("CFLAGS".into(), "-O0".into()),
        ]
    }

    fn build(request: OptionRequest) -> BuildEnvironment {
        let config = Config::with_root("/opt/kiln");
        let formula = subversion();
        let build_config = evaluate(&formula, &request, &Toolchain::default()).unwrap();
        let placeholders = PlaceholderContext::new(&config, &formula, 8);
        let deps = vec!["serf".to_string(), "sqlite".to_string()];
        let destdir = PathBuf::from("/opt/kiln/tmp/staging/subversion/image");
        let inputs = EnvInputs {
            config: &config,
            formula: &formula,
            build_config: &build_config,
            dependencies: &deps,
            placeholders: &placeholders,
            destdir: &destdir,
            jobs: 8,
        };
        BuildEnvironment::from_inherited(inherited(), &inputs)
    }

    #[test]
    fn environment_is_sanitized_and_derived_from_dependencies() {
        let env = build(OptionRequest::new());
        assert_eq!(env.get("HOME"), Some("/home/builder"));
        assert_eq!(env.get("PYTHONPATH"), None);
        assert_eq!(env.get("CFLAGS"), None);
        assert_eq!(env.get("CC"), None);
        let path = env.get("PATH").unwrap();
        assert!(path.starts_with("/opt/kiln/opt/serf/bin:/opt/kiln/opt/serf/sbin:"));
        assert!(!path.contains("/home/builder/bin"));
        assert_eq!(
            env.get("CPPFLAGS"),
            Some("-I/opt/kiln/opt/serf/include -I/opt/kiln/opt/sqlite/include")
        );
        assert!(env
            .get("PKG_CONFIG_PATH")
            .unwrap()
            .contains("/opt/kiln/opt/sqlite/lib/pkgconfig"));
        assert_eq!(env.get("MAKEFLAGS"), Some("-j8"));
        assert_eq!(
            env.get("DESTDIR"),
            Some("/opt/kiln/tmp/staging/subversion/image")
        );
        assert_eq!(env.get("SVN_STATIC"), Some("no"));
    }

    #[test]
    fn option_effects_shape_the_environment() {
        let env = build(OptionRequest::with_options(["java", "perl"]));
        assert_eq!(env.get("MAKEFLAGS"), Some("-j1"));
        assert_eq!(
            env.get("JAVA_OPTS"),
            Some("-Dprefix=/opt/kiln/Cellar/subversion/1.8.0")
        );
        assert!(env.get("PATH").unwrap().ends_with(":/home/builder/bin"));
    }

    #[test]
    fn step_overrides_do_not_mutate_the_shared_environment() {
        let env = build(OptionRequest::new());
        let config = Config::with_root("/opt/kiln");
        let placeholders = PlaceholderContext::new(&config, &subversion(), 8);
        let overrides: BTreeMap<String, String> =
            [("MAKEFLAGS".to_string(), "-j1".to_string())].into();
        let step = env.for_step(&overrides, &placeholders);
        assert_eq!(step.get("MAKEFLAGS").map(String::as_str), Some("-j1"));
        assert_eq!(env.get("MAKEFLAGS"), Some("-j8"));
    }
}
