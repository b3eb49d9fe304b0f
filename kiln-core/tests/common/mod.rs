// Shared fixtures for kiln-core integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use kiln_aio::checksum::sha256_file;
use kiln_common::config::Config;
use kiln_common::dependency::Dependency;
use kiln_common::error::{KilnError, Result};
use kiln_common::formulary::Formulary;
use kiln_common::model::formula::{BuildStep, Formula};
use kiln_common::pipeline::{CancellationFlag, PipelineEvent, PlannedJob};
use kiln_core::build::{BackendInvocation, BackendOutput, BuildBackend};
use kiln_core::pipeline::{plan_jobs, resolve, JobContext, PlanRequest};
use kiln_net::CachingFetcher;
use tempfile::TempDir;
use tokio::sync::broadcast;
use url::Url;

/// Stands in for configure/make: records invocations and, on
/// `make install PREFIX=…`, writes a few files into `$DESTDIR$PREFIX`.
#[derive(Default)]
pub struct ScriptedBackend {
    failing: HashSet<String>,
    hanging: HashSet<String>,
    pub hang_started: AtomicBool,
    calls: Mutex<Vec<BackendInvocation>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// `make` fails for `package`.
    pub fn failing(mut self, package: &str) -> Self {
        self.failing.insert(package.to_string());
        self
    }

    /// The first step of `package` blocks until cancelled.
    pub fn hanging(mut self, package: &str) -> Self {
        self.hanging.insert(package.to_string());
        self
    }

    pub fn calls(&self) -> Vec<BackendInvocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn packages_built(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for call in self.calls() {
            if !seen.contains(&call.package) {
                seen.push(call.package);
            }
        }
        seen
    }

    fn ok() -> BackendOutput {
        BackendOutput {
            status: Some(0),
            success: true,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

impl BuildBackend for ScriptedBackend {
    fn invoke(
        &self,
        invocation: &BackendInvocation,
        cancel: &CancellationFlag,
    ) -> Result<BackendOutput> {
        self.calls.lock().unwrap().push(invocation.clone());
        let package = &invocation.package;

        if self.hanging.contains(package) {
            self.hang_started.store(true, Ordering::SeqCst);
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            return Err(KilnError::Cancelled(format!("build of {package}")));
        }

        if invocation.program != "make" {
            return Ok(Self::ok());
        }
        if self.failing.contains(package) {
            return Ok(BackendOutput {
                status: Some(2),
                success: false,
                stdout: format!("compiling {package}\n"),
                stderr: "error: undefined reference to `apr_pool_create'\n".to_string(),
            });
        }
        if invocation.args.first().map(String::as_str) == Some("install") {
            let destdir = invocation.env.get("DESTDIR").expect("DESTDIR is set");
            let prefix = invocation
                .args
                .iter()
                .find_map(|a| a.strip_prefix("PREFIX="))
                .expect("PREFIX= argument");
            let image = Path::new(destdir).join(prefix.trim_start_matches('/'));
            fs::create_dir_all(image.join("bin")).unwrap();
            fs::create_dir_all(image.join("lib")).unwrap();
            fs::create_dir_all(image.join("libexec")).unwrap();
            fs::write(image.join("bin").join(package), format!("#!/bin/sh\necho {package}\n"))
                .unwrap();
            fs::write(image.join("lib").join(format!("lib{package}.a")), b"\0archive").unwrap();
            fs::write(image.join("libexec/helper"), b"helper").unwrap();
        }
        Ok(Self::ok())
    }
}

pub struct Fixture {
    pub root: TempDir,
    pub config: Config,
    sources: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path().join("kiln"));
        let sources = root.path().join("sources");
        fs::create_dir_all(&sources).unwrap();
        Self {
            root,
            config,
            sources,
        }
    }

    /// Writes `<name>-<version>.tar.gz` containing `files` under the usual
    /// single top-level directory. Returns (file URL, sha256).
    pub fn source_archive(&self, name: &str, version: &str, files: &[(&str, &str)]) -> (String, String) {
        let prefixed: Vec<(String, &str)> = files
            .iter()
            .map(|(rel, content)| (format!("{name}-{version}/{rel}"), *content))
            .collect();
        let path = self.sources.join(format!("{name}-{version}.tar.gz"));
        write_tar_gz(&path, prefixed.iter().map(|(rel, c)| (rel.as_str(), *c)));
        let url = Url::from_file_path(&path).unwrap().to_string();
        (url, sha256_file(&path).unwrap())
    }

    /// Writes a bottle archive with `files` at the given paths.
    pub fn bottle_archive(&self, file_name: &str, files: &[(&str, &str)]) -> PathBuf {
        let path = self.sources.join(file_name);
        write_tar_gz(&path, files.iter().copied());
        path
    }

    /// A configure/make formula whose source archive exists on disk.
    pub fn formula(&self, name: &str, deps: &[&str]) -> Formula {
        let (url, sha256) = self.source_archive(
            name,
            "1.0",
            &[
                ("configure", "#!/bin/sh\nexit 0\n"),
                ("Makefile", "all:\n\techo building\n"),
            ],
        );
        let mut formula = Formula::new(name, "1.0", url, sha256);
        formula.dependencies = deps.iter().map(|d| Dependency::new_runtime(*d)).collect();
        formula.build = standard_steps();
        formula
    }

    pub fn plan(&self, formulae: Vec<Formula>, targets: &[&str]) -> Vec<PlannedJob> {
        let formulary = Formulary::from_formulae(formulae);
        let request = PlanRequest {
            targets: targets.iter().map(|t| t.to_string()).collect(),
            build_from_source: true,
            ..Default::default()
        };
        let graph = resolve(&self.config, &formulary, &request).unwrap();
        plan_jobs(&graph, &request.targets)
    }

    pub fn context(&self, backend: Arc<dyn BuildBackend>) -> (JobContext, broadcast::Receiver<PipelineEvent>) {
        let (event_tx, event_rx) = broadcast::channel(1024);
        let ctx = JobContext {
            config: self.config.clone(),
            fetcher: Arc::new(CachingFetcher::new(&self.config).unwrap()),
            backend,
            event_tx,
            cancel: CancellationFlag::new(),
            overwrite: false,
            keep_staging: false,
            jobs: 2,
        };
        (ctx, event_rx)
    }

    pub fn staging_entries(&self) -> Vec<PathBuf> {
        match fs::read_dir(self.config.staging_dir()) {
            Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn write_tar_gz<'a, I>(path: &Path, files: I)
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let file = File::create(path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (rel, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, rel, content.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

pub fn standard_steps() -> Vec<BuildStep> {
    let run = |command: &str, args: &[&str], option_args: bool| BuildStep::Run {
        command: command.to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        when: None,
        option_args,
        env: BTreeMap::new(),
    };
    vec![
        run("./configure", &["--prefix={prefix}"], true),
        run("make", &[], false),
        run("make", &["install", "PREFIX={prefix}"], false),
    ]
}

pub fn drain(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
