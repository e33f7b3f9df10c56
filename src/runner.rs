//! Suite runner: parameters, extension hooks and parallel script execution.
use crate::commands::Command;
use crate::condition::NetProbe;
use crate::env::{Env, HostEnv, DEFAULT_PASSTHROUGH};
use crate::report::{ScriptOutcome, SuiteReport};
use crate::script::TestScript;
use crate::transcript::{AnnotationSink, StdoutSink};
use crate::workdir::WorkdirRoot;
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Called once per script after the archive is unpacked.
pub type SetupFn = Arc<dyn Fn(&mut Env) -> anyhow::Result<()> + Send + Sync>;

/// Resolves guard predicates the built-ins do not know. `Ok(None)` means
/// "not mine either", which fails the script as an unknown condition.
pub type ConditionFn =
    Arc<dyn Fn(&TestScript, &str) -> anyhow::Result<Option<bool>> + Send + Sync>;

/// Everything that shapes a suite run.
pub struct Params {
    /// Directory holding the `*.txt` scripts.
    pub dir: PathBuf,
    pub setup: Option<SetupFn>,
    pub condition: Option<ConditionFn>,
    /// Extension commands, consulted after the built-ins.
    pub cmds: BTreeMap<String, Arc<dyn Command>>,
    /// Keep work directories and show their real paths.
    pub test_work: bool,
    pub workdir_root: Option<PathBuf>,
    /// Rewrite expected output sections from actual output.
    pub update_scripts: bool,
    pub verbose: bool,
    pub short: bool,
    /// Limit for each foreground command.
    pub timeout: Option<Duration>,
    /// Maximum number of scripts running at once.
    pub parallel: usize,
    pub host_env: HostEnv,
    pub net: NetProbe,
    pub annotations: Arc<dyn AnnotationSink>,
}

impl Params {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Params {
            dir: dir.into(),
            setup: None,
            condition: None,
            cmds: BTreeMap::new(),
            test_work: false,
            workdir_root: None,
            update_scripts: false,
            verbose: false,
            short: false,
            timeout: None,
            parallel: default_parallelism(),
            host_env: HostEnv {
                passthrough: DEFAULT_PASSTHROUGH
                    .iter()
                    .map(|name| name.to_string())
                    .collect(),
                extra: Vec::new(),
            },
            net: NetProbe::default(),
            annotations: Arc::new(StdoutSink),
        }
    }

    pub fn setup<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Env) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(hook));
        self
    }

    pub fn condition<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TestScript, &str) -> anyhow::Result<Option<bool>> + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(hook));
        self
    }

    /// Register an extension command. Built-ins with the same name win.
    pub fn command<F>(mut self, name: &str, command: F) -> Self
    where
        F: Fn(&mut TestScript, bool, &[String]) -> crate::error::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.cmds.insert(name.to_string(), Arc::new(command));
        self
    }

    pub fn test_work(mut self, enabled: bool) -> Self {
        self.test_work = enabled;
        self
    }

    pub fn workdir_root(mut self, root: Option<PathBuf>) -> Self {
        self.workdir_root = root;
        self
    }

    pub fn update_scripts(mut self, enabled: bool) -> Self {
        self.update_scripts = enabled;
        self
    }

    pub fn verbose(mut self, enabled: bool) -> Self {
        self.verbose = enabled;
        self
    }

    pub fn short(mut self, enabled: bool) -> Self {
        self.short = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    pub fn host_env(mut self, host_env: HostEnv) -> Self {
        self.host_env = host_env;
        self
    }

    pub fn net_probe_url(mut self, url: Option<String>) -> Self {
        self.net = NetProbe::new(url);
        self
    }

    pub fn annotations(mut self, sink: Arc<dyn AnnotationSink>) -> Self {
        self.annotations = sink;
        self
    }
}

fn default_parallelism() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Script files in `dir`, sorted by name.
pub fn discover_scripts(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("read script dir {}", dir.display()))?;
    let mut scripts = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read script dir {}", dir.display()))?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "txt") && path.is_file() {
            scripts.push(path);
        }
    }
    scripts.sort();
    Ok(scripts)
}

/// Run every script in `params.dir`.
pub fn run(params: Params) -> Result<SuiteReport> {
    let scripts = discover_scripts(&params.dir)?;
    if scripts.is_empty() {
        return Err(anyhow!(
            "no scripts found matching {}/*.txt",
            params.dir.display()
        ));
    }
    run_scripts(params, &scripts)
}

/// Run the given script files as one suite.
pub fn run_scripts(params: Params, scripts: &[PathBuf]) -> Result<SuiteReport> {
    let root = WorkdirRoot::create(
        params.workdir_root.as_deref(),
        scripts.len(),
        params.test_work,
    )
    .context("create workdir root")?;
    tracing::info!(
        scripts = scripts.len(),
        root = %root.path().display(),
        parallel = params.parallel,
        "suite start"
    );

    let params = Arc::new(params);
    let next = AtomicUsize::new(0);
    let outcomes: Mutex<Vec<(usize, ScriptOutcome)>> = Mutex::new(Vec::with_capacity(scripts.len()));
    let workers = params.parallel.clamp(1, scripts.len().max(1));
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let index = next.fetch_add(1, Ordering::SeqCst);
                let Some(file) = scripts.get(index) else {
                    break;
                };
                let outcome = run_one(&params, &root, file);
                outcomes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((index, outcome));
            });
        }
    });

    let mut outcomes = outcomes.into_inner().unwrap_or_else(PoisonError::into_inner);
    outcomes.sort_by_key(|(index, _)| *index);
    let report = SuiteReport::new(outcomes.into_iter().map(|(_, outcome)| outcome).collect());
    tracing::info!(
        passed = report.passed,
        failed = report.failed,
        skipped = report.skipped,
        "suite finished"
    );
    Ok(report)
}

fn run_one(params: &Arc<Params>, root: &WorkdirRoot, file: &Path) -> ScriptOutcome {
    let name = script_name(file);
    let work_dir = root.script_dir(&name);
    let ts = TestScript::new(Arc::clone(params), &name, file, work_dir.clone());
    let mut outcome = ts.run();
    if root.preserve() {
        outcome.work_dir = Some(work_dir);
    } else if let Err(err) = root.release(&work_dir) {
        tracing::warn!(script = %name, error = %err, "remove work dir");
        outcome
            .cleanup_errors
            .push(format!("remove {}: {err}", work_dir.display()));
    }
    outcome
}

fn script_name(file: &Path) -> String {
    file.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string())
}
