// kiln-core/src/pipeline/planner.rs
// Turns user targets into a resolved graph and the ordered job list.

use std::collections::BTreeMap;

use kiln_common::config::Config;
use kiln_common::dependency::{DependencyExt, DependencyResolver, ResolutionContext, ResolvedDependency, ResolvedGraph};
use kiln_common::error::Result;
use kiln_common::formulary::Formulary;
use kiln_common::keg::KegRegistry;
use kiln_common::options::{OptionRequest, Toolchain};
use kiln_common::pipeline::{JobAction, PlannedJob};
use tracing::{debug, instrument};

#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    pub targets: Vec<String>,
    /// Option requests per target; targets without an entry use defaults.
    pub options: BTreeMap<String, OptionRequest>,
    pub include_test: bool,
    pub build_from_source: bool,
    /// Rebuild targets even when installed with the same options.
    pub force_reinstall: bool,
}

/// Resolves `request.targets`. Every planning error (cycles, missing
/// dependencies, option errors) surfaces here, before any build work.
#[instrument(skip_all, fields(targets = ?request.targets))]
pub fn resolve(config: &Config, formulary: &Formulary, request: &PlanRequest) -> Result<ResolvedGraph> {
    let keg_registry = KegRegistry::new(config.clone());
    let toolchain = Toolchain::from_config(config);
    let context = ResolutionContext {
        formulary,
        keg_registry: &keg_registry,
        toolchain: &toolchain,
        bottle_tag: &config.bottle_tag,
        target_requests: &request.options,
        include_test: request.include_test,
        build_from_source: request.build_from_source,
        force_reinstall: request.force_reinstall,
    };
    DependencyResolver::new(context).resolve_targets(&request.targets)
}

/// One job per node of the install plan, in plan order.
pub fn plan_jobs(graph: &ResolvedGraph, targets: &[String]) -> Vec<PlannedJob> {
    graph
        .install_plan
        .iter()
        .map(|node| planned_job(graph, node, targets))
        .collect()
}

fn planned_job(graph: &ResolvedGraph, node: &ResolvedDependency, targets: &[String]) -> PlannedJob {
    let name = node.name().to_string();
    let action = match &node.installed {
        Some(record) => JobAction::Reinstall {
            version: record.version.clone(),
            current_install_path: record.install_path.clone(),
        },
        None => JobAction::Install,
    };
    let installed_on_request = targets.contains(&name)
        || node
            .installed
            .as_ref()
            .is_some_and(|record| record.installed_on_request);
    let active_edges = graph.edges.get(&name).cloned().unwrap_or_default();
    let runtime_dependencies = node
        .formula
        .dependencies()
        .runtime()
        .into_iter()
        .filter(|dep| active_edges.contains(&dep.name))
        .map(|dep| dep.name.clone())
        .fold(Vec::new(), |mut acc, dep| {
            if !acc.contains(&dep) {
                acc.push(dep);
            }
            acc
        });
    let job = PlannedJob {
        target_id: name.clone(),
        formula: node.formula.clone(),
        config: node.config.clone(),
        strategy: node.strategy,
        action,
        installed_on_request,
        dependencies: graph.plan_dependencies(&name),
        build_dependencies: graph.transitive_dependencies(&name),
        runtime_dependencies,
    };
    debug!(
        "Planned {} ({:?}, {:?}) after {:?}",
        job.target_id, job.strategy, job.action, job.dependencies
    );
    job
}
