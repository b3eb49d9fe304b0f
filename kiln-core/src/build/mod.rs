// kiln-core/src/build/mod.rs
// Source builds: environment, placeholders, patches and step execution.

pub mod backend;
pub mod env;
pub mod patch;
pub mod placeholders;
pub mod source;

use std::fs;
use std::path::{Component, Path, PathBuf};

use kiln_common::error::{KilnError, Result};
use kiln_common::model::formula::{BuildStep, Formula};
use kiln_common::options::BuildConfiguration;
use kiln_common::pipeline::CancellationFlag;
use tracing::debug;

pub use backend::{BackendInvocation, BackendOutput, BuildBackend, ProcessBackend};
pub use env::{BuildEnvironment, EnvInputs};
pub use placeholders::PlaceholderContext;

const OUTPUT_TAIL_LINES: usize = 40;

/// Everything one package's steps run against.
pub struct StepContext<'a> {
    pub formula: &'a Formula,
    pub build_config: &'a BuildConfiguration,
    pub env: &'a BuildEnvironment,
    pub placeholders: &'a PlaceholderContext,
    pub backend: &'a dyn BuildBackend,
    pub source_root: &'a Path,
    /// The staged image of `{prefix}`.
    pub image_prefix: &'a Path,
    pub cancel: &'a CancellationFlag,
}

impl StepContext<'_> {
    fn build_failed(&self, step: &str, status: Option<i32>, output: String) -> KilnError {
        KilnError::BuildFailed {
            package: self.formula.name().to_string(),
            step: step.to_string(),
            status,
            output,
        }
    }
}

pub fn is_step_active(step: &BuildStep, config: &BuildConfiguration) -> bool {
    step.when().map_or(true, |option| config.is_enabled(option))
}

/// Arguments for a `run` step: its own expanded args, plus the option
/// configure args when the step asks for them.
pub fn step_args(
    args: &[String],
    option_args: bool,
    config: &BuildConfiguration,
    placeholders: &PlaceholderContext,
) -> Vec<String> {
    let mut out = placeholders.expand_all(args);
    if option_args {
        out.extend(placeholders.expand_all(&config.configure_args));
    }
    out
}

/// Runs every active step in order. The first failing step aborts the build.
pub fn run_steps<F>(ctx: &StepContext<'_>, mut on_step: F) -> Result<()>
where
    F: FnMut(&str),
{
    for step in &ctx.formula.build {
        if !is_step_active(step, ctx.build_config) {
            debug!(
                "[{}] Skipping inactive step: {}",
                ctx.formula.name(),
                step.describe()
            );
            continue;
        }
        ctx.cancel.check(&format!("build of {}", ctx.formula.name()))?;
        match step {
            BuildStep::Run {
                command,
                args,
                option_args,
                env,
                ..
            } => {
                let invocation = BackendInvocation {
                    package: ctx.formula.name().to_string(),
                    program: ctx.placeholders.expand(command),
                    args: step_args(args, *option_args, ctx.build_config, ctx.placeholders),
                    cwd: ctx.source_root.to_path_buf(),
                    env: ctx.env.for_step(env, ctx.placeholders),
                };
                let described = invocation.describe();
                on_step(&described);
                let output = match ctx.backend.invoke(&invocation, ctx.cancel) {
                    Ok(output) => output,
                    Err(e @ KilnError::Cancelled(_)) => return Err(e),
                    Err(e) => return Err(ctx.build_failed(&described, None, e.to_string())),
                };
                if !output.success {
                    return Err(ctx.build_failed(
                        &described,
                        output.status,
                        output.tail(OUTPUT_TAIL_LINES),
                    ));
                }
            }
            BuildStep::InstallFile { from, to, .. } => {
                let described = step.describe();
                on_step(&described);
                install_file(ctx, from, to)
                    .map_err(|e| ctx.build_failed(&described, None, e.to_string()))?;
            }
        }
    }
    Ok(())
}

fn relative_inside(path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path);
    if candidate
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        Ok(candidate.to_path_buf())
    } else {
        Err(KilnError::ValidationError(format!(
            "path '{path}' must stay inside the build tree"
        )))
    }
}

fn install_file(ctx: &StepContext<'_>, from: &str, to: &str) -> Result<()> {
    let from = ctx.placeholders.expand(from);
    let to_expanded = ctx.placeholders.expand(to);
    let source = ctx.source_root.join(relative_inside(&from)?);
    let mut dest = ctx.image_prefix.join(relative_inside(&to_expanded)?);
    if to_expanded.ends_with('/') {
        if let Some(name) = source.file_name() {
            dest = dest.join(name);
        }
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(&source, &dest).map_err(|e| {
        KilnError::Generic(format!(
            "cannot copy {} to {}: {e}",
            source.display(),
            dest.display()
        ))
    })?;
    Ok(())
}
