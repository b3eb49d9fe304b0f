// kiln-common/src/options.rs
// Resolves user-requested build flags against a formula's declared option set.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::dependency::{Dependency, DependencyTag};
use crate::error::{KilnError, Result};
use crate::model::formula::Formula;

/// Flags as given on the command line (`--with java --without perl`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionRequest {
    pub with: BTreeSet<String>,
    pub without: BTreeSet<String>,
}

impl OptionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            with: names.into_iter().map(Into::into).collect(),
            without: BTreeSet::new(),
        }
    }

    pub fn enable(mut self, name: impl Into<String>) -> Self {
        self.with.insert(name.into());
        self
    }

    pub fn disable(mut self, name: impl Into<String>) -> Self {
        self.without.insert(name.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.with.is_empty() && self.without.is_empty()
    }
}

/// Compilers available for selection, in preference order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Toolchain {
    pub compilers: Vec<String>,
}

impl Toolchain {
    pub fn new<I, S>(compilers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            compilers: compilers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.compilers.iter().cloned())
    }
}

/// The single resolved configuration a build consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfiguration {
    pub formula: String,
    /// Every declared option, explicit and implied, mapped to its state.
    pub enabled: BTreeMap<String, bool>,
    pub configure_args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub deparallelize: bool,
    pub userpaths: bool,
    pub compiler: Option<String>,
    defaults: BTreeMap<String, bool>,
}

impl BuildConfiguration {
    pub fn is_enabled(&self, option: &str) -> bool {
        self.enabled.get(option).copied().unwrap_or(false)
    }

    /// Names of enabled options, sorted.
    pub fn enabled_options(&self) -> Vec<String> {
        self.enabled
            .iter()
            .filter(|(_, on)| **on)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// True when no option differs from its declared default.
    pub fn is_default(&self) -> bool {
        self.enabled
            .iter()
            .all(|(name, on)| self.defaults.get(name).copied().unwrap_or(false) == *on)
    }

    /// Whether a declared dependency edge is active under this configuration.
    pub fn includes_dependency(&self, dep: &Dependency) -> bool {
        if let Some(option) = dep.when.as_deref() {
            if !self.is_enabled(option) {
                return false;
            }
        }
        if dep.tags.contains(DependencyTag::OPTIONAL) {
            return self.is_enabled(&dep.with_option_name());
        }
        if dep.tags.contains(DependencyTag::RECOMMENDED) {
            return !self.is_enabled(&dep.without_option_name());
        }
        true
    }
}

/// Evaluates `request` against `formula`. Pure: no IO, no global state.
pub fn evaluate(
    formula: &Formula,
    request: &OptionRequest,
    toolchain: &Toolchain,
) -> Result<BuildConfiguration> {
    let package = formula.name().to_string();
    let declared = formula.declared_options();
    let is_declared = |name: &str| declared.iter().any(|o| o.name == name);

    for name in &request.with {
        if let Some(unsupported) = formula.unsupported_option(name) {
            return Err(KilnError::IncompatibleOptions {
                package,
                options: vec![name.clone()],
                reason: unsupported.reason.clone(),
            });
        }
        if !is_declared(name) {
            return Err(KilnError::UnknownOption {
                package,
                option: name.clone(),
            });
        }
    }
    for name in &request.without {
        // Disabling a flag that can never be enabled is harmless.
        if formula.unsupported_option(name).is_some() {
            continue;
        }
        if !is_declared(name) {
            return Err(KilnError::UnknownOption {
                package,
                option: name.clone(),
            });
        }
    }

    let contradictory: Vec<String> = request.with.intersection(&request.without).cloned().collect();
    if !contradictory.is_empty() {
        return Err(KilnError::IncompatibleOptions {
            package,
            options: contradictory,
            reason: "requested both enabled and disabled".to_string(),
        });
    }

    let defaults: BTreeMap<String, bool> = declared
        .iter()
        .map(|o| (o.name.clone(), o.default))
        .collect();
    let mut enabled = defaults.clone();
    for name in &request.with {
        enabled.insert(name.clone(), true);
    }
    for name in &request.without {
        if enabled.contains_key(name) {
            enabled.insert(name.clone(), false);
        }
    }

    for conflict in &formula.conflicts {
        let all_on = !conflict.options.is_empty()
            && conflict
                .options
                .iter()
                .all(|o| enabled.get(o).copied().unwrap_or(false));
        if all_on {
            return Err(KilnError::IncompatibleOptions {
                package,
                options: conflict.options.clone(),
                reason: conflict.reason.clone(),
            });
        }
    }

    let mut configure_args = Vec::new();
    let mut env = BTreeMap::new();
    let mut deparallelize = false;
    let mut userpaths = false;
    for option in declared
        .iter()
        .filter(|o| enabled.get(&o.name).copied().unwrap_or(false))
    {
        configure_args.extend(option.effects.configure_args.iter().cloned());
        env.extend(
            option
                .effects
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        deparallelize |= option.effects.deparallelize;
        userpaths |= option.effects.userpaths;
    }

    let compiler = select_compiler(formula, &enabled, toolchain)?;

    debug!(
        "Evaluated options for {}: enabled={:?} compiler={:?}",
        package,
        enabled.iter().filter(|(_, on)| **on).map(|(n, _)| n).collect::<Vec<_>>(),
        compiler
    );

    Ok(BuildConfiguration {
        formula: package,
        enabled,
        configure_args,
        env,
        deparallelize,
        userpaths,
        compiler,
        defaults,
    })
}

fn select_compiler(
    formula: &Formula,
    enabled: &BTreeMap<String, bool>,
    toolchain: &Toolchain,
) -> Result<Option<String>> {
    if toolchain.compilers.is_empty() {
        return Ok(None);
    }
    let is_on = |name: &String| enabled.get(name).copied().unwrap_or(false);
    let active_rules: Vec<_> = formula
        .compiler_failures
        .iter()
        .filter(|rule| rule.when_any.is_empty() || rule.when_any.iter().any(is_on))
        .collect();

    if let Some(chosen) = toolchain
        .compilers
        .iter()
        .find(|cc| !active_rules.iter().any(|rule| &rule.compiler == *cc))
    {
        return Ok(Some(chosen.clone()));
    }

    let mut options: Vec<String> = active_rules
        .iter()
        .flat_map(|rule| rule.when_any.iter().filter(|o| is_on(o)).cloned())
        .collect();
    options.sort();
    options.dedup();
    let causes: Vec<String> = active_rules
        .iter()
        .map(|rule| {
            if rule.cause.is_empty() {
                rule.compiler.clone()
            } else {
                format!("{} ({})", rule.compiler, rule.cause)
            }
        })
        .collect();
    Err(KilnError::IncompatibleOptions {
        package: formula.name().to_string(),
        options,
        reason: format!("no usable compiler; known failures: {}", causes.join(", ")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::formula::{
        CompilerFailure, FormulaOption, OptionConflict, OptionEffects, UnsupportedOption,
    };

    fn option(name: &str, effects: OptionEffects) -> FormulaOption {
        FormulaOption {
            name: name.to_string(),
            description: String::new(),
            default: false,
            effects,
        }
    }

    fn subversion() -> Formula {
        let mut f = Formula::new("subversion", "1.8.0", "https://x/svn.tar.bz2", "aa");
        f.options = vec![
            option(
                "java",
                OptionEffects {
                    configure_args: vec!["--enable-javahl".into()],
                    deparallelize: true,
                    ..Default::default()
                },
            ),
            option(
                "perl",
                OptionEffects {
                    userpaths: true,
                    ..Default::default()
                },
            ),
            option(
                "ruby",
                OptionEffects {
                    configure_args: vec!["--with-ruby-sitedir={lib}/ruby".into()],
                    userpaths: true,
                    ..Default::default()
                },
            ),
        ];
        f.unsupported_options = vec![UnsupportedOption {
            name: "unicode-path".into(),
            reason: "The --unicode-path patch is not supported on Subversion 1.8. \
                     Upgrading from a 1.7 version built with this option is not supported."
                .into(),
        }];
        f.compiler_failures = vec![CompilerFailure {
            compiler: "clang".into(),
            cause: "bad value (native) for -march= switch".into(),
            when_any: vec!["perl".into(), "ruby".into()],
        }];
        f.dependencies = vec![
            Dependency::new_with_tags("python", DependencyTag::OPTIONAL),
            Dependency::new_with_tags("gettext", DependencyTag::RECOMMENDED),
            Dependency::new_runtime("libtool").when_option("ruby"),
        ];
        f
    }

    fn toolchain() -> Toolchain {
        Toolchain::new(["clang", "gcc"])
    }

    #[test]
    fn java_and_ruby_enable_together() {
        let request = OptionRequest::with_options(["java", "ruby"]);
        let config = evaluate(&subversion(), &request, &toolchain()).unwrap();
        assert!(config.is_enabled("java"));
        assert!(config.is_enabled("ruby"));
        assert!(!config.is_enabled("perl"));
        assert_eq!(
            config.configure_args,
            vec!["--enable-javahl", "--with-ruby-sitedir={lib}/ruby"]
        );
        assert!(config.deparallelize);
        assert!(config.userpaths);
        assert!(!config.is_default());
        assert_eq!(config.enabled_options(), vec!["java", "ruby"]);
    }

    #[test]
    fn unsupported_option_is_rejected_with_reason() {
        let request = OptionRequest::with_options(["unicode-path"]);
        let err = evaluate(&subversion(), &request, &toolchain()).unwrap_err();
        match err {
            KilnError::IncompatibleOptions {
                package,
                options,
                reason,
            } => {
                assert_eq!(package, "subversion");
                assert_eq!(options, vec!["unicode-path"]);
                assert!(reason.contains("not supported on Subversion 1.8"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_option_is_rejected() {
        let request = OptionRequest::with_options(["tcl"]);
        let err = evaluate(&subversion(), &request, &toolchain()).unwrap_err();
        assert!(matches!(err, KilnError::UnknownOption { ref option, .. } if option == "tcl"));

        let request = OptionRequest::new().disable("tcl");
        assert!(evaluate(&subversion(), &request, &toolchain()).is_err());
    }

    #[test]
    fn declared_conflict_reports_combination() {
        let mut formula = subversion();
        formula.conflicts = vec![OptionConflict {
            options: vec!["java".into(), "perl".into()],
            reason: "bindings cannot share a build".into(),
        }];
        let request = OptionRequest::with_options(["java", "perl"]);
        let err = evaluate(&formula, &request, &toolchain()).unwrap_err();
        assert!(matches!(
            err,
            KilnError::IncompatibleOptions { ref options, .. } if options == &vec!["java".to_string(), "perl".to_string()]
        ));

        let request = OptionRequest::with_options(["java"]);
        assert!(evaluate(&formula, &request, &toolchain()).is_ok());
    }

    #[test]
    fn same_option_enabled_and_disabled_is_incompatible() {
        let request = OptionRequest::new().enable("java").disable("java");
        let err = evaluate(&subversion(), &request, &toolchain()).unwrap_err();
        assert!(matches!(err, KilnError::IncompatibleOptions { .. }));
    }

    #[test]
    fn compiler_failure_rule_skips_clang_for_bindings() {
        let config = evaluate(&subversion(), &OptionRequest::new(), &toolchain()).unwrap();
        assert_eq!(config.compiler.as_deref(), Some("clang"));
        assert!(config.is_default());

        let request = OptionRequest::with_options(["perl"]);
        let config = evaluate(&subversion(), &request, &toolchain()).unwrap();
        assert_eq!(config.compiler.as_deref(), Some("gcc"));

        let only_clang = Toolchain::new(["clang"]);
        let err = evaluate(&subversion(), &request, &only_clang).unwrap_err();
        match err {
            KilnError::IncompatibleOptions { options, reason, .. } => {
                assert_eq!(options, vec!["perl"]);
                assert!(reason.contains("-march"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn implicit_dependency_options_gate_edges() {
        let formula = subversion();
        let defaults = evaluate(&formula, &OptionRequest::new(), &toolchain()).unwrap();
        let python = &formula.dependencies[0];
        let gettext = &formula.dependencies[1];
        let libtool = &formula.dependencies[2];
        assert!(!defaults.includes_dependency(python));
        assert!(defaults.includes_dependency(gettext));
        assert!(!defaults.includes_dependency(libtool));

        let request = OptionRequest::with_options(["with-python", "without-gettext", "ruby"]);
        let config = evaluate(&formula, &request, &Toolchain::new(["gcc"])).unwrap();
        assert!(config.includes_dependency(python));
        assert!(!config.includes_dependency(gettext));
        assert!(config.includes_dependency(libtool));
    }

    #[test]
    fn disabling_an_unsupported_option_is_a_no_op() {
        let request = OptionRequest::new().disable("unicode-path");
        let config = evaluate(&subversion(), &request, &toolchain()).unwrap();
        assert!(config.is_default());
    }
}
