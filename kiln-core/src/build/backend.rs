// kiln-core/src/build/backend.rs
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_aio::process::{run_command, CommandSpec};
use kiln_common::error::{KilnError, Result};
use kiln_common::pipeline::CancellationFlag;
use tracing::debug;

/// One request to the external build system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInvocation {
    pub package: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// The complete environment; nothing is inherited on top of it.
    pub env: BTreeMap<String, String>,
}

impl BackendInvocation {
    pub fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOutput {
    pub status: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl BackendOutput {
    /// Last `max_lines` lines of stdout followed by stderr.
    pub fn tail(&self, max_lines: usize) -> String {
        let lines: Vec<&str> = self.stdout.lines().chain(self.stderr.lines()).collect();
        lines[lines.len().saturating_sub(max_lines)..].join("\n")
    }
}

/// The narrow "run external build command" seam. Implementations must stop
/// promptly once `cancel` is set and must honour `DESTDIR`.
pub trait BuildBackend: Send + Sync {
    fn invoke(
        &self,
        invocation: &BackendInvocation,
        cancel: &CancellationFlag,
    ) -> Result<BackendOutput>;
}

/// Runs invocations as child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessBackend;

impl ProcessBackend {
    fn resolve_program(invocation: &BackendInvocation) -> Result<PathBuf> {
        let program = Path::new(&invocation.program);
        if program.is_absolute() {
            return Ok(program.to_path_buf());
        }
        if invocation.program.contains('/') {
            return Ok(invocation.cwd.join(program));
        }
        let path_value = invocation.env.get("PATH").cloned().unwrap_or_default();
        which::which_in(&invocation.program, Some(path_value), &invocation.cwd).map_err(|e| {
            KilnError::CommandExecError(format!(
                "'{}' not found in build PATH for {}: {e}",
                invocation.program, invocation.package
            ))
        })
    }
}

impl BuildBackend for ProcessBackend {
    fn invoke(
        &self,
        invocation: &BackendInvocation,
        cancel: &CancellationFlag,
    ) -> Result<BackendOutput> {
        let program = Self::resolve_program(invocation)?;
        debug!(
            "[{}] Invoking backend: {} (resolved {})",
            invocation.package,
            invocation.describe(),
            program.display()
        );
        let output = run_command(
            &CommandSpec {
                program,
                args: invocation.args.clone(),
                cwd: invocation.cwd.clone(),
                env: invocation.env.clone(),
            },
            cancel,
        )?;
        Ok(BackendOutput {
            status: output.status,
            success: output.success,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn invocation(program: &str, args: &[&str], cwd: &Path) -> BackendInvocation {
        BackendInvocation {
            package: "serf".into(),
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: cwd.to_path_buf(),
            env: [("PATH".to_string(), "/usr/bin:/bin".to_string())].into(),
        }
    }

    #[test]
    fn runs_relative_scripts_from_the_source_dir() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("configure");
        std::fs::write(&script, "#!/bin/sh\necho configured \"$1\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let out = ProcessBackend
            .invoke(
                &invocation("./configure", &["--prefix=/p"], dir.path()),
                &CancellationFlag::new(),
            )
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "configured --prefix=/p");
    }

    #[test]
    fn programs_are_looked_up_in_the_build_path() {
        let dir = tempfile::tempdir().unwrap();
        let out = ProcessBackend
            .invoke(
                &invocation("sh", &["-c", "exit 4"], dir.path()),
                &CancellationFlag::new(),
            )
            .unwrap();
        assert_eq!(out.status, Some(4));
        assert!(!out.success);

        let err = ProcessBackend
            .invoke(
                &invocation("kiln-no-such-tool", &[], dir.path()),
                &CancellationFlag::new(),
            )
            .unwrap_err();
        assert!(matches!(err, KilnError::CommandExecError(_)));
    }

    #[test]
    fn tail_keeps_the_last_lines() {
        let out = BackendOutput {
            status: Some(2),
            success: false,
            stdout: "a\nb\n".into(),
            stderr: "c\nd\n".into(),
        };
        assert_eq!(out.tail(2), "c\nd");
    }

    #[test]
    fn tail_keeps_streams_on_separate_lines() {
        let out = BackendOutput {
            status: Some(1),
            success: false,
            stdout: "checking for apr... no".into(),
            stderr: "configure: error: apr not found".into(),
        };
        assert_eq!(out.tail(2), "checking for apr... no\nconfigure: error: apr not found");
        assert_eq!(out.tail(10), out.tail(2));
    }
}
