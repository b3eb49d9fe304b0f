// kiln-common/src/model/formula.rs
// Declarative package descriptors as loaded from `<name>.json` formula files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dependency::{Dependency, DependencyTag};
use crate::error::{KilnError, Result};

const DEFAULT_LINK_DIRS: [&str; 6] = ["bin", "sbin", "lib", "include", "share", "etc"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Formula {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,

    /// Source archive location.
    pub url: String,
    /// SHA256 of the source archive.
    pub sha256: String,
    #[serde(default)]
    pub mirrors: Vec<String>,

    #[serde(default)]
    pub options: Vec<FormulaOption>,
    #[serde(default)]
    pub unsupported_options: Vec<UnsupportedOption>,
    #[serde(default)]
    pub conflicts: Vec<OptionConflict>,

    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub patches: Vec<PatchSpec>,
    #[serde(default)]
    pub build: Vec<BuildStep>,
    /// Environment applied to every build step; values may use placeholders.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub compiler_failures: Vec<CompilerFailure>,

    #[serde(default)]
    pub bottle: BottleSpec,
    #[serde(default)]
    pub caveats: Vec<Caveat>,
    #[serde(default = "default_link_dirs")]
    pub link_dirs: Vec<String>,
}

fn default_link_dirs() -> Vec<String> {
    DEFAULT_LINK_DIRS.iter().map(|d| d.to_string()).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormulaOption {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub effects: OptionEffects,
}

/// What enabling an option changes about the build.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptionEffects {
    #[serde(default)]
    pub configure_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Force a serial build (`-j1`).
    #[serde(default)]
    pub deparallelize: bool,
    /// Append the user's own PATH entries to the sandboxed PATH.
    #[serde(default)]
    pub userpaths: bool,
}

/// A flag this version refuses to build with, plus the message shown to the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsupportedOption {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptionConflict {
    pub options: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchSpec {
    pub name: String,
    /// Leading path components removed from file names in the diff (`-pN`).
    #[serde(default = "default_strip")]
    pub strip: u32,
    #[serde(flatten)]
    pub source: PatchSource,
}

fn default_strip() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PatchSource {
    Inline { content: String },
    Remote { url: String, sha256: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildStep {
    Run {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        when: Option<String>,
        /// Append the configure arguments contributed by enabled options.
        #[serde(default)]
        option_args: bool,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    InstallFile {
        from: String,
        to: String,
        #[serde(default)]
        when: Option<String>,
    },
}

impl BuildStep {
    pub fn when(&self) -> Option<&str> {
        match self {
            BuildStep::Run { when, .. } | BuildStep::InstallFile { when, .. } => when.as_deref(),
        }
    }

    /// Short human-readable form used in logs and error reports.
    pub fn describe(&self) -> String {
        match self {
            BuildStep::Run { command, args, .. } if args.is_empty() => command.clone(),
            BuildStep::Run { command, args, .. } => format!("{} {}", command, args.join(" ")),
            BuildStep::InstallFile { from, to, .. } => format!("install {from} => {to}"),
        }
    }
}

/// `fails_with`: a compiler known to break this build, optionally only
/// when one of the listed options is enabled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompilerFailure {
    pub compiler: String,
    #[serde(default)]
    pub cause: String,
    #[serde(default)]
    pub when_any: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BottleSpec {
    #[serde(default)]
    pub rebuild: u32,
    #[serde(default)]
    pub files: BTreeMap<String, BottleFileSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BottleFileSpec {
    pub url: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Caveat {
    #[serde(default)]
    pub when: Option<String>,
    pub text: String,
}

impl Formula {
    /// Creates a bare formula. Primarily for tests and programmatic registries.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        url: impl Into<String>,
        sha256: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            revision: 0,
            desc: None,
            homepage: None,
            url: url.into(),
            sha256: sha256.into(),
            mirrors: Vec::new(),
            options: Vec::new(),
            unsupported_options: Vec::new(),
            conflicts: Vec::new(),
            dependencies: Vec::new(),
            patches: Vec::new(),
            build: Vec::new(),
            env: BTreeMap::new(),
            compiler_failures: Vec::new(),
            bottle: BottleSpec::default(),
            caveats: Vec::new(),
            link_dirs: default_link_dirs(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let formula: Formula = serde_json::from_str(raw)?;
        formula.validate()?;
        Ok(formula)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version including the revision suffix, used as the keg directory name.
    pub fn version_str_full(&self) -> String {
        if self.revision > 0 {
            format!("{}_{}", self.version, self.revision)
        } else {
            self.version.clone()
        }
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Every option a user may pass: the explicit ones followed by the
    /// `with-`/`without-` switches implied by optional and recommended
    /// dependencies.
    pub fn declared_options(&self) -> Vec<FormulaOption> {
        let mut declared = self.options.clone();
        for dep in &self.dependencies {
            let implied = if dep.tags.contains(DependencyTag::OPTIONAL) {
                Some((dep.with_option_name(), format!("Build with {} support", dep.name)))
            } else if dep.tags.contains(DependencyTag::RECOMMENDED) {
                Some((
                    dep.without_option_name(),
                    format!("Build without {} support", dep.name),
                ))
            } else {
                None
            };
            if let Some((name, description)) = implied {
                if !declared.iter().any(|o| o.name == name) {
                    declared.push(FormulaOption {
                        name,
                        description,
                        default: false,
                        effects: OptionEffects::default(),
                    });
                }
            }
        }
        declared
    }

    pub fn unsupported_option(&self, name: &str) -> Option<&UnsupportedOption> {
        self.unsupported_options.iter().find(|o| o.name == name)
    }

    pub fn bottle_for(&self, tag: &str) -> Option<&BottleFileSpec> {
        self.bottle.files.get(tag)
    }

    pub fn has_bottle_for(&self, tag: &str) -> bool {
        self.bottle_for(tag).is_some()
    }

    /// Structural checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') || self.name.starts_with('.') {
            return Err(KilnError::ValidationError(format!(
                "Invalid formula name '{}'",
                self.name
            )));
        }
        if self.version.is_empty() {
            return Err(KilnError::ValidationError(format!(
                "Formula '{}' has no version",
                self.name
            )));
        }
        let declared = self.declared_options();
        let is_declared = |name: &str| declared.iter().any(|o| o.name == name);
        for (idx, option) in self.options.iter().enumerate() {
            if self.options[..idx].iter().any(|o| o.name == option.name) {
                return Err(KilnError::ValidationError(format!(
                    "Formula '{}' declares option '{}' twice",
                    self.name, option.name
                )));
            }
        }
        let referenced = self
            .dependencies
            .iter()
            .filter_map(|d| d.when.as_deref())
            .chain(self.build.iter().filter_map(BuildStep::when))
            .chain(self.caveats.iter().filter_map(|c| c.when.as_deref()))
            .chain(self.conflicts.iter().flat_map(|c| c.options.iter().map(String::as_str)))
            .chain(
                self.compiler_failures
                    .iter()
                    .flat_map(|f| f.when_any.iter().map(String::as_str)),
            );
        for name in referenced {
            if !is_declared(name) {
                return Err(KilnError::ValidationError(format!(
                    "Formula '{}' refers to undeclared option '{}'",
                    self.name, name
                )));
            }
        }
        Ok(())
    }
}
