// kiln-aio/src/process.rs
use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use kiln_common::error::{KilnError, Result};
use kiln_common::pipeline::CancellationFlag;
use tracing::{debug, error, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A fully specified external command. The child sees `env` and nothing else.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when terminated by a signal.
    pub status: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `spec` to completion, capturing output. Polls `cancel` while the
/// child runs and kills its whole process group once the flag is set.
pub fn run_command(spec: &CommandSpec, cancel: &CancellationFlag) -> Result<CommandOutput> {
    debug!(
        "Running command: {} {:?} (cwd: {}, env keys: {:?})",
        spec.program.display(),
        spec.args,
        spec.cwd.display(),
        spec.env.keys().collect::<Vec<_>>()
    );
    cancel.check(&format!("before running {}", spec.program.display()))?;

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .env_clear()
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group so make's children die with it.
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().map_err(|e| {
        error!("Failed to execute {}: {}", spec.program.display(), e);
        KilnError::CommandExecError(format!("{}: {e}", spec.program.display()))
    })?;

    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let status = loop {
        if cancel.is_cancelled() {
            warn!(
                "Cancellation requested; killing {} (pid {})",
                spec.program.display(),
                child.id()
            );
            terminate(&mut child);
            let _ = child.wait();
            let _ = join_reader(stdout_reader);
            let _ = join_reader(stderr_reader);
            return Err(KilnError::Cancelled(format!(
                "{} was terminated",
                spec.program.display()
            )));
        }
        match child.try_wait()? {
            Some(status) => break status,
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    let stdout = join_reader(stdout_reader);
    let stderr = join_reader(stderr_reader);
    if status.success() {
        debug!("Command finished successfully.");
    } else {
        debug!("Command failed with status: {}", status);
        if !stderr.trim().is_empty() {
            debug!("Stderr:\n{}", stderr.trim());
        }
    }
    Ok(CommandOutput {
        status: status.code(),
        success: status.success(),
        stdout,
        stderr,
    })
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> Option<thread::JoinHandle<String>> {
    source.map(|mut stream| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stream.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_reader(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    // The child leads its own group (process_group(0) above).
    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        debug!("killpg({}) failed: {}; killing the child only", pgid, e);
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;

    fn sh(script: &str) -> CommandSpec {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        env.insert("KILN_TEST_VALUE".to_string(), "serf".to_string());
        CommandSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
            env,
        }
    }

    #[test]
    fn captures_output_and_status() {
        let out = run_command(
            &sh("echo building $KILN_TEST_VALUE; echo oops >&2; exit 3"),
            &CancellationFlag::new(),
        )
        .unwrap();
        assert!(!out.success);
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout.trim(), "building serf");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[test]
    fn environment_is_not_inherited() {
        std::env::set_var("KILN_LEAK_CHECK", "leaked");
        let out = run_command(&sh("echo ${KILN_LEAK_CHECK:-clean}"), &CancellationFlag::new())
            .unwrap();
        assert_eq!(out.stdout.trim(), "clean");
    }

    #[test]
    fn cancellation_kills_running_child() {
        let cancel = CancellationFlag::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });
        let started = Instant::now();
        let result = run_command(&sh("sleep 30"), &cancel);
        canceller.join().unwrap();
        assert!(matches!(result, Err(KilnError::Cancelled(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn cancellation_reaches_background_children() {
        let cancel = CancellationFlag::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });
        let started = Instant::now();
        // The backgrounded sleeps hold stdout open; only a group kill frees it.
        let result = run_command(&sh("sleep 30 & sleep 30 & wait"), &cancel);
        canceller.join().unwrap();
        assert!(matches!(result, Err(KilnError::Cancelled(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_program_is_an_exec_error() {
        let mut spec = sh("true");
        spec.program = PathBuf::from("/nonexistent/kiln-configure");
        assert!(matches!(
            run_command(&spec, &CancellationFlag::new()),
            Err(KilnError::CommandExecError(_))
        ));
    }
}
