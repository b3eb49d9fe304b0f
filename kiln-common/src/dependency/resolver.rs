// kiln-common/src/dependency/resolver.rs
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dependency::{Dependency, DependencyTag};
use crate::error::{KilnError, Result};
use crate::formulary::Formulary;
use crate::keg::{InstalledPackageRecord, KegRegistry};
use crate::model::formula::Formula;
use crate::options::{evaluate, BuildConfiguration, OptionRequest, Toolchain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeInstallStrategy {
    /// Pour a prebuilt bottle for the current platform.
    Bottle,
    /// Fetch, patch and build from source.
    Source,
}

pub struct ResolutionContext<'a> {
    pub formulary: &'a Formulary,
    pub keg_registry: &'a KegRegistry,
    pub toolchain: &'a Toolchain,
    pub bottle_tag: &'a str,
    /// Option requests for the named targets; dependencies always use defaults.
    pub target_requests: &'a BTreeMap<String, OptionRequest>,
    pub include_test: bool,
    pub build_from_source: bool,
    /// Re-plan targets even if installed with identical options.
    pub force_reinstall: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedDependency {
    pub formula: Arc<Formula>,
    pub config: BuildConfiguration,
    pub status: ResolutionStatus,
    pub accumulated_tags: DependencyTag,
    pub strategy: NodeInstallStrategy,
    pub opt_path: PathBuf,
    /// The receipt currently installed, if any.
    pub installed: Option<InstalledPackageRecord>,
}

impl ResolvedDependency {
    pub fn name(&self) -> &str {
        self.formula.name()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStatus {
    /// Present with a receipt; satisfies dependents, nothing to build.
    Installed,
    /// Needed by a target and not installed.
    Missing,
    /// Named by the user and (re)installation is required.
    Requested,
}

#[derive(Debug, Clone)]
pub struct ResolvedGraph {
    /// Nodes still needing installation; each after all of its dependencies.
    pub install_plan: Vec<ResolvedDependency>,
    pub resolution_details: HashMap<String, ResolvedDependency>,
    /// Active "requires before" edges per node, in declaration order.
    pub edges: HashMap<String, Vec<String>>,
    /// Every visited node in dependency order.
    pub order: Vec<String>,
}

impl ResolvedGraph {
    pub fn plan_names(&self) -> Vec<String> {
        self.install_plan
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    /// Direct dependencies of `name` that are themselves part of the plan.
    pub fn plan_dependencies(&self, name: &str) -> Vec<String> {
        let planned: HashSet<&str> = self.install_plan.iter().map(|d| d.name()).collect();
        self.edges
            .get(name)
            .map(|deps| {
                deps.iter()
                    .filter(|d| planned.contains(d.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Everything reachable from `name`, in dependency order.
    pub fn transitive_dependencies(&self, name: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut pending: Vec<&str> = vec![name];
        while let Some(current) = pending.pop() {
            if let Some(deps) = self.edges.get(current) {
                for dep in deps {
                    if seen.insert(dep.as_str()) {
                        pending.push(dep);
                    }
                }
            }
        }
        self.order
            .iter()
            .filter(|n| seen.contains(n.as_str()))
            .cloned()
            .collect()
    }
}

pub struct DependencyResolver<'a> {
    context: ResolutionContext<'a>,
    targets: HashSet<String>,
    stack: Vec<String>,
    resolution_details: HashMap<String, ResolvedDependency>,
    edges: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(context: ResolutionContext<'a>) -> Self {
        Self {
            context,
            targets: HashSet::new(),
            stack: Vec::new(),
            resolution_details: HashMap::new(),
            edges: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Resolves `targets` in the given order. Fails on the first planning
    /// error so nothing is built from a partially valid plan.
    pub fn resolve_targets(&mut self, targets: &[String]) -> Result<ResolvedGraph> {
        debug!("Starting dependency resolution for targets: {:?}", targets);
        self.targets = targets.iter().cloned().collect();
        self.stack.clear();
        self.resolution_details.clear();
        self.edges.clear();
        self.order.clear();

        for target in targets {
            self.resolve_recursive(target, DependencyTag::RUNTIME, None)?;
        }

        let install_plan: Vec<ResolvedDependency> = self
            .order
            .iter()
            .filter_map(|name| self.resolution_details.get(name))
            .filter(|dep| {
                matches!(
                    dep.status,
                    ResolutionStatus::Missing | ResolutionStatus::Requested
                )
            })
            .cloned()
            .collect();

        debug!(
            "Resolution finished: order={:?} plan={:?}",
            self.order,
            install_plan.iter().map(|d| d.name()).collect::<Vec<_>>()
        );

        Ok(ResolvedGraph {
            install_plan,
            resolution_details: std::mem::take(&mut self.resolution_details),
            edges: std::mem::take(&mut self.edges),
            order: std::mem::take(&mut self.order),
        })
    }

    fn determine_strategy(&self, formula: &Formula, config: &BuildConfiguration) -> NodeInstallStrategy {
        if self.context.build_from_source {
            return NodeInstallStrategy::Source;
        }
        // Bottles are built with default options only.
        if config.is_default() && formula.has_bottle_for(self.context.bottle_tag) {
            NodeInstallStrategy::Bottle
        } else {
            NodeInstallStrategy::Source
        }
    }

    fn should_follow_edge(
        &self,
        dep: &Dependency,
        config: &BuildConfiguration,
        strategy: NodeInstallStrategy,
    ) -> bool {
        if dep.tags.contains(DependencyTag::TEST) && !self.context.include_test {
            return false;
        }
        if !config.includes_dependency(dep) {
            return false;
        }
        !(strategy == NodeInstallStrategy::Bottle && dep.tags.is_build_only())
    }

    fn resolve_recursive(
        &mut self,
        name: &str,
        tags: DependencyTag,
        required_by: Option<&str>,
    ) -> Result<()> {
        if let Some(pos) = self.stack.iter().position(|n| n == name) {
            let mut cycle: Vec<String> = self.stack[pos..].to_vec();
            cycle.push(name.to_string());
            return Err(KilnError::CycleDetected { cycle });
        }
        if let Some(existing) = self.resolution_details.get_mut(name) {
            existing.accumulated_tags |= tags;
            return Ok(());
        }

        let formula = match self.context.formulary.load_formula(name) {
            Ok(formula) => formula,
            Err(KilnError::NotFound(_)) if required_by.is_some() => {
                return Err(KilnError::MissingDependency {
                    dependency: name.to_string(),
                    required_by: required_by.unwrap_or_default().to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        let is_target = self.targets.contains(name);
        let default_request = OptionRequest::default();
        let request = if is_target {
            self.context
                .target_requests
                .get(name)
                .unwrap_or(&default_request)
        } else {
            &default_request
        };
        let config = evaluate(&formula, request, self.context.toolchain)?;
        let strategy = self.determine_strategy(&formula, &config);
        let installed = self.context.keg_registry.get_installed_record(name)?;

        let status = match (&installed, is_target) {
            (Some(_), false) => ResolutionStatus::Installed,
            (Some(record), true) => {
                let unchanged =
                    record.matches(&formula.version_str_full(), &config.enabled_options());
                if unchanged && !self.context.force_reinstall {
                    ResolutionStatus::Installed
                } else {
                    ResolutionStatus::Requested
                }
            }
            (None, true) => ResolutionStatus::Requested,
            (None, false) => ResolutionStatus::Missing,
        };
        debug!(
            "Resolved '{}': status={:?} strategy={:?} tags={}",
            name, status, strategy, tags
        );

        let mut node_edges = Vec::new();
        if status != ResolutionStatus::Installed {
            self.stack.push(name.to_string());
            for dep in formula.dependencies() {
                if !self.should_follow_edge(dep, &config, strategy) {
                    debug!("Skipping edge {} -> {} ({})", name, dep.name, dep.tags);
                    continue;
                }
                let result = self.resolve_recursive(&dep.name, dep.tags, Some(name));
                if let Err(e) = result {
                    self.stack.pop();
                    return Err(e);
                }
                if !node_edges.contains(&dep.name) {
                    node_edges.push(dep.name.clone());
                }
            }
            self.stack.pop();
        }

        let opt_path = self.context.keg_registry.get_opt_path(name);
        self.edges.insert(name.to_string(), node_edges);
        self.order.push(name.to_string());
        self.resolution_details.insert(
            name.to_string(),
            ResolvedDependency {
                formula,
                config,
                status,
                accumulated_tags: tags,
                strategy,
                opt_path,
                installed,
            },
        );
        Ok(())
    }
}
