//! Per-script run context and the directive interpreter.
//!
//! A run goes through setup, the directive loop and an implicit final wait.
//! Fatal errors unwind the loop as `Err`. Teardown (script updates, deferred
//! cleanups, background drain) runs on every path, including skips.
use crate::archive::{self, Archive};
use crate::commands;
use crate::condition::{self, ExecCache, Guard};
use crate::env::{self, baseline_vars, DeferStack, Env, Values};
use crate::error::{ProcessError, Result, ScriptError};
use crate::grammar;
use crate::process::{self, BackgroundProcess, CancelScope, CommandSpec, Output};
use crate::report::{ScriptOutcome, ScriptStatus};
use crate::runner::Params;
use crate::transcript::Transcript;
use crate::workdir;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Process started with `exec ... &` and not yet waited for.
struct BackgroundCmd {
    name: Option<String>,
    label: String,
    process: BackgroundProcess,
    expect_failure: bool,
}

/// State of one script execution.
///
/// Directives, built-in or registered on [`Params`], receive `&mut TestScript`
/// and use its helpers to run processes, read files and log.
pub struct TestScript {
    params: Arc<Params>,
    name: String,
    file: PathBuf,
    work_dir: PathBuf,
    transcript: Transcript,
    cd: PathBuf,
    line_no: usize,
    env: Vec<String>,
    values: Values,
    stdin: String,
    stdout: String,
    stderr: String,
    stopped: bool,
    background: Vec<BackgroundCmd>,
    deferred: DeferStack,
    archive: Archive,
    /// Unpacked absolute path -> archive section name.
    script_files: HashMap<PathBuf, String>,
    /// Archive section name -> replacement content.
    script_updates: BTreeMap<String, String>,
    scope: CancelScope,
    exec_cache: ExecCache,
}

impl TestScript {
    pub(crate) fn new(params: Arc<Params>, name: &str, file: &Path, work_dir: PathBuf) -> Self {
        let verbose = params.verbose;
        TestScript {
            params,
            name: name.to_string(),
            file: file.to_path_buf(),
            cd: work_dir.clone(),
            work_dir,
            transcript: Transcript::new(verbose),
            line_no: 0,
            env: Vec::new(),
            values: Values::new(),
            stdin: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            stopped: false,
            background: Vec::new(),
            deferred: DeferStack::default(),
            archive: Archive::default(),
            script_files: HashMap::new(),
            script_updates: BTreeMap::new(),
            scope: CancelScope::new(),
            exec_cache: ExecCache::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Current directory for subprocesses and relative paths.
    pub fn cd(&self) -> &Path {
        &self.cd
    }

    /// Line number of the directive being executed.
    pub fn line(&self) -> usize {
        self.line_no
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn scope(&self) -> &CancelScope {
        &self.scope
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Replace the captured output, e.g. from an extension command that talks
    /// to a service directly.
    pub fn set_output(&mut self, stdout: impl Into<String>, stderr: impl Into<String>) {
        self.stdout = stdout.into();
        self.stderr = stderr.into();
    }

    pub fn env(&self) -> &[String] {
        &self.env
    }

    pub fn getenv(&self, key: &str) -> String {
        env::lookup_var(&self.env, key)
            .unwrap_or_default()
            .to_string()
    }

    /// Panics if `key` is empty or contains `=`.
    pub fn setenv(&mut self, key: &str, value: &str) {
        env::validate_key(key);
        self.env.push(format!("{key}={value}"));
    }

    pub fn logf(&mut self, message: impl AsRef<str>) {
        self.transcript.logf(message);
    }

    pub fn defer<F>(&mut self, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + 'static,
    {
        self.deferred.push(Box::new(action));
    }

    /// Value stored by the setup hook under `key`, if it has type `T`.
    pub fn value<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key)?.downcast_ref::<T>()
    }

    pub fn value_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.values.get_mut(key)?.downcast_mut::<T>()
    }

    /// Resolve `file` against the current directory, cleaning `.` and `..`.
    pub fn mk_abs(&self, file: &str) -> PathBuf {
        clean_path(&self.cd.join(file))
    }

    /// Contents of `name` as text, with invalid UTF-8 replaced; `stdout`
    /// and `stderr` name the captured output.
    pub fn read_file(&self, name: &str) -> Result<String> {
        match name {
            "stdout" => Ok(self.stdout.clone()),
            "stderr" => Ok(self.stderr.clone()),
            _ => Ok(String::from_utf8_lossy(&self.read_bytes(name)?).into_owned()),
        }
    }

    /// Raw contents of `name`, for comparisons that must not lose bytes.
    pub fn read_bytes(&self, name: &str) -> Result<Vec<u8>> {
        match name {
            "stdout" => Ok(self.stdout.clone().into_bytes()),
            "stderr" => Ok(self.stderr.clone().into_bytes()),
            _ => {
                let path = self.mk_abs(name);
                fs::read(&path).map_err(|err| ScriptError::io("read", &path, err))
            }
        }
    }

    pub(crate) fn set_stdin(&mut self, stdin: String) {
        self.stdin = stdin;
    }

    pub(crate) fn set_cd(&mut self, dir: PathBuf) {
        self.cd = dir;
    }

    pub(crate) fn stop(&mut self) {
        self.stopped = true;
    }

    /// Record that a `cmp` target unpacked from the archive should be
    /// rewritten with `content`. Returns `false` if `path` did not come from
    /// the archive.
    pub(crate) fn record_update(&mut self, path: &Path, content: &str) -> bool {
        match self.script_files.get(path) {
            Some(name) => {
                self.script_updates
                    .insert(name.clone(), content.to_string());
                true
            }
            None => false,
        }
    }

    /// Run a command in the foreground, capturing and logging its output.
    ///
    /// Pending stdin is consumed. Exit failures are reported in the returned
    /// status; `Err` means the process could not be started.
    pub fn exec(&mut self, program: &str, args: &[String]) -> Result<Output> {
        let stdin = std::mem::take(&mut self.stdin);
        let scope = self.scope.child(self.params.timeout);
        let spec = CommandSpec {
            program,
            args,
            cwd: &self.cd,
            env: &self.env,
            stdin: &stdin,
        };
        let output = process::run(&spec, &scope)?;
        self.stdout = output.stdout.clone();
        self.stderr = output.stderr.clone();
        if !output.stdout.is_empty() {
            self.transcript.logf(format!("[stdout]\n{}", output.stdout));
        }
        if !output.stderr.is_empty() {
            self.transcript.logf(format!("[stderr]\n{}", output.stderr));
        }
        Ok(output)
    }

    /// Start a command in the background.
    ///
    /// It is reconciled by the next `wait` or at the end of the script, where
    /// its exit status must match `expect_failure`. The command timeout
    /// applies from the moment it starts.
    pub fn exec_background(
        &mut self,
        name: Option<String>,
        program: &str,
        args: &[String],
        expect_failure: bool,
    ) -> Result<()> {
        if let Some(name) = &name {
            if self
                .background
                .iter()
                .any(|bg| bg.name.as_ref() == Some(name))
            {
                return Err(ScriptError::assertion(format!(
                    "duplicate background process name {name:?}"
                )));
            }
        }
        let stdin = std::mem::take(&mut self.stdin);
        let spec = CommandSpec {
            program,
            args,
            cwd: &self.cd,
            env: &self.env,
            stdin: &stdin,
        };
        let scope = self.scope.child(self.params.timeout);
        let process = process::start(&spec, &scope)?;
        let label = name.clone().unwrap_or_else(|| {
            let base = Path::new(program)
                .file_name()
                .and_then(|base| base.to_str())
                .unwrap_or(program);
            shell_words::join(std::iter::once(base).chain(args.iter().map(String::as_str)))
        });
        tracing::debug!(script = %self.name, label = %label, "background process started");
        self.background.push(BackgroundCmd {
            name,
            label,
            process,
            expect_failure,
        });
        self.stdout.clear();
        self.stderr.clear();
        Ok(())
    }

    /// Labels of the background processes not yet waited for.
    pub fn background_labels(&self) -> Vec<&str> {
        self.background
            .iter()
            .map(|bg| bg.label.as_str())
            .collect()
    }

    /// Wait for background processes and check their exit statuses.
    ///
    /// With `names`, only the processes started under those names are waited
    /// for. A name written `!name` must fail, and `expect_failure` requires
    /// every named process to fail. Captured output of the waited processes
    /// becomes the new stdout and stderr.
    pub fn wait_background(&mut self, names: &[String], expect_failure: bool) -> Result<()> {
        let selected = if names.is_empty() {
            std::mem::take(&mut self.background)
        } else {
            let mut wanted: Vec<(&str, bool)> = Vec::with_capacity(names.len());
            for arg in names {
                let (name, must_fail) = match arg.strip_prefix('!') {
                    Some(name) => (name, true),
                    None => (arg.as_str(), false),
                };
                if !self
                    .background
                    .iter()
                    .any(|bg| bg.name.as_deref() == Some(name))
                {
                    return Err(ScriptError::assertion(format!(
                        "no background process named {name:?}"
                    )));
                }
                if wanted.iter().any(|(seen, _)| *seen == name) {
                    return Err(ScriptError::usage(format!("wait: {name:?} listed twice")));
                }
                wanted.push((name, must_fail));
            }
            let mut selected = Vec::with_capacity(wanted.len());
            for mut bg in std::mem::take(&mut self.background) {
                let flag = wanted
                    .iter()
                    .find(|(name, _)| bg.name.as_deref() == Some(*name))
                    .map(|(_, must_fail)| *must_fail);
                match flag {
                    Some(must_fail) => {
                        bg.expect_failure |= must_fail;
                        selected.push(bg);
                    }
                    None => self.background.push(bg),
                }
            }
            selected
        };
        let failures = self.reconcile(selected, expect_failure, true);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ScriptError::assertion(failures.join("; ")))
        }
    }

    fn reconcile(
        &mut self,
        selected: Vec<BackgroundCmd>,
        expect_failure: bool,
        check: bool,
    ) -> Vec<String> {
        if selected.is_empty() {
            return Vec::new();
        }
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut failures = Vec::new();
        for bg in selected {
            let output = bg.process.wait();
            let state = output
                .failure()
                .unwrap_or_else(|| "exit status 0".to_string());
            self.transcript
                .logf(format!("[background] {}: {state}", bg.label));
            if !output.stdout.is_empty() {
                self.transcript
                    .logf(format!("[stdout]\n{}", output.stdout));
                stdout.push_str(&output.stdout);
            }
            if !output.stderr.is_empty() {
                self.transcript
                    .logf(format!("[stderr]\n{}", output.stderr));
                stderr.push_str(&output.stderr);
            }
            if !check {
                continue;
            }
            let want_failure = bg.expect_failure || expect_failure;
            match &output.status {
                Err(ProcessError::TimedOut) => {
                    failures.push(format!("{}: test timed out while running command", bg.label));
                }
                _ if output.success() && want_failure => {
                    failures.push(format!("{}: unexpected command success", bg.label));
                }
                _ if !output.success() && !want_failure => {
                    failures.push(format!("{}: unexpected command failure", bg.label));
                }
                _ => {}
            }
        }
        self.stdout = stdout;
        self.stderr = stderr;
        failures
    }

    /// Interrupt and reap whatever is still running, without checking status.
    fn drain_background(&mut self, log: bool) {
        for bg in &self.background {
            bg.process.interrupt();
        }
        let pending = std::mem::take(&mut self.background);
        if log {
            self.reconcile(pending, false, false);
        } else {
            for bg in pending {
                let _ = bg.process.wait();
            }
        }
    }

    /// Evaluate a guard predicate.
    pub fn condition(&self, cond: &str) -> Result<bool> {
        if let Some(name) = cond.strip_prefix("exec:") {
            return Ok(self.exec_cache.lookup(name, || {
                process::resolve_program(name, &self.env, &self.cd)
                    .is_ok_and(|path| self.cd.join(path).is_file())
            }));
        }
        for (prefix, text) in [("stdout:", &self.stdout), ("stderr:", &self.stderr)] {
            if let Some(pattern) = cond.strip_prefix(prefix) {
                return condition::output_matches(pattern, text).map_err(|err| {
                    ScriptError::BadCondition {
                        cond: cond.to_string(),
                        message: err.to_string(),
                    }
                });
            }
        }
        if let Some(value) = condition::builtin(cond, self.params.short, &self.params.net) {
            return Ok(value);
        }
        if let Some(hook) = &self.params.condition {
            let resolved = hook(self, cond).map_err(|err| ScriptError::BadCondition {
                cond: cond.to_string(),
                message: format!("{err:#}"),
            })?;
            if let Some(value) = resolved {
                return Ok(value);
            }
        }
        Err(ScriptError::UnknownCondition(cond.to_string()))
    }

    /// Log every variable once, with its effective value.
    pub(crate) fn dump_env(&mut self) {
        let mut printed = Vec::new();
        let mut lines = Vec::new();
        for entry in &self.env {
            let Some((key, _)) = entry.split_once('=') else {
                continue;
            };
            let normalized = env::env_var_name(key);
            if printed.contains(&normalized) {
                continue;
            }
            printed.push(normalized);
            lines.push(format!("{key}={}", self.getenv(key)));
        }
        for line in lines {
            self.transcript.logf(line);
        }
    }

    /// Execute the script and tear it down.
    pub(crate) fn run(mut self) -> ScriptOutcome {
        let started = Instant::now();
        tracing::info!(script = %self.name, "script start");

        let mut annotation = None;
        let status = match self.run_directives() {
            Ok(()) => ScriptStatus::Pass,
            Err(ScriptError::Skip(reason)) => {
                self.transcript.logf(format!("SKIP: {reason}"));
                ScriptStatus::Skip
            }
            Err(err) => {
                annotation = Some(self.fatal(&err));
                ScriptStatus::Fail
            }
        };

        let mut cleanup_errors = Vec::new();
        if let Err(err) = self.apply_script_updates() {
            cleanup_errors.push(err.to_string());
        }
        cleanup_errors.extend(self.deferred.run_all());
        self.drain_background(self.params.verbose || status == ScriptStatus::Fail);
        self.transcript.mark_time();
        for err in &cleanup_errors {
            tracing::warn!(script = %self.name, error = %err, "cleanup failed");
            self.transcript.logf(format!("cleanup: {err}"));
        }

        let expose_work = self.params.verbose || self.params.test_work;
        let elapsed = started.elapsed();
        tracing::info!(script = %self.name, ?status, ?elapsed, "script finished");
        ScriptOutcome {
            name: self.name,
            file: self.file,
            status,
            transcript: self.transcript.render(&self.work_dir, expose_work),
            annotation,
            cleanup_errors,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            work_dir: None,
        }
    }

    /// Log the failure, emit its annotation and cancel everything still running.
    fn fatal(&mut self, err: &ScriptError) -> String {
        self.transcript
            .fail(&self.file, self.line_no, &err.to_string());
        let annotation = self.transcript.annotation(&self.file, self.line_no);
        self.params.annotations.emit(&annotation);
        self.scope.cancel();
        annotation
    }

    fn run_directives(&mut self) -> Result<()> {
        let script = self.setup()?;
        if self.params.verbose || self.params.test_work {
            self.dump_env();
            self.transcript.write("\n");
            self.transcript.set_mark();
        }

        for (index, line) in script.lines().enumerate() {
            self.line_no = index + 1;
            if line.starts_with('#') {
                self.transcript.phase(line);
                continue;
            }
            let args = grammar::tokenize(line, |key| self.getenv(key))?;
            if args.is_empty() {
                continue;
            }
            tracing::debug!(script = %self.name, line = self.line_no, "> {line}");
            self.transcript.logf(format!("> {line}"));
            if !self.run_line(args)? {
                continue;
            }
            if self.stopped {
                break;
            }
        }

        for bg in &self.background {
            bg.process.interrupt();
        }
        self.wait_background(&[], false)?;

        self.transcript.rewind();
        self.transcript.mark_time();
        if !self.stopped {
            self.transcript.remove_annotations();
            self.transcript.logf("PASS");
        }
        Ok(())
    }

    /// Apply guards and dispatch one tokenized line. Returns `false` when a
    /// guard skipped it.
    fn run_line(&mut self, mut args: Vec<String>) -> Result<bool> {
        while let Some(guard) = args.first().and_then(|arg| Guard::parse(arg)) {
            args.remove(0);
            if args.is_empty() {
                return Err(ScriptError::Syntax(
                    "missing command after condition".to_string(),
                ));
            }
            if self.condition(&guard.cond)? != guard.want {
                return Ok(false);
            }
        }

        let mut neg = false;
        if args[0] == "!" {
            neg = true;
            args.remove(0);
            if args.is_empty() {
                return Err(ScriptError::Syntax("! on line by itself".to_string()));
            }
        }

        let name = args.remove(0);
        if let Some(builtin) = commands::builtin(&name) {
            builtin(self, neg, &args)?;
            return Ok(true);
        }
        let params = Arc::clone(&self.params);
        match params.cmds.get(&name) {
            Some(command) => command.run(self, neg, &args)?,
            None => return Err(ScriptError::UnknownCommand(name)),
        }
        Ok(true)
    }

    /// Create the work directory, unpack the archive and run the setup hook.
    ///
    /// Returns the directive text.
    fn setup(&mut self) -> Result<String> {
        workdir::remove_all(&self.work_dir)
            .map_err(|err| ScriptError::io("clear", &self.work_dir, err))?;
        let tmp = self.work_dir.join("tmp");
        fs::create_dir_all(&tmp).map_err(|err| ScriptError::io("create", &tmp, err))?;

        self.archive = Archive::parse_file(&self.file)?;
        self.env = baseline_vars(&self.work_dir, &self.params.host_env);
        self.cd = self.work_dir.clone();
        for file in &self.archive.files {
            let name = grammar::expand(&file.name, |key| {
                env::lookup_var(&self.env, key)
                    .unwrap_or_default()
                    .to_string()
            });
            let path = self.mk_abs(&name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|err| ScriptError::io("create", parent, err))?;
            }
            fs::write(&path, &file.data).map_err(|err| ScriptError::io("write", &path, err))?;
            self.script_files.insert(path, file.name.clone());
        }

        let mut setup_env = Env::new(&self.work_dir, std::mem::take(&mut self.env));
        let hooked = match &self.params.setup {
            Some(hook) => hook(&mut setup_env),
            None => Ok(()),
        };
        let (vars, cd, values, mut deferred) = setup_env.into_parts();
        self.env = vars;
        self.cd = cd;
        self.values = values;
        self.deferred.append(&mut deferred);
        hooked.map_err(|err| ScriptError::Setup(format!("{err:#}")))?;

        Ok(String::from_utf8_lossy(&self.archive.comment).into_owned())
    }

    /// Write back sections captured in update mode.
    fn apply_script_updates(&mut self) -> Result<()> {
        if self.script_updates.is_empty() {
            return Ok(());
        }
        for (name, content) in std::mem::take(&mut self.script_updates) {
            let mut data = content.into_bytes();
            if archive::needs_quote(&data) {
                data = archive::quote(&data).map_err(|err| {
                    ScriptError::Cleanup(format!("cannot update script file {name:?}: {err}"))
                })?;
            }
            if !self.archive.replace(&name, &data) {
                return Err(ScriptError::Cleanup(format!(
                    "script update file {name:?} not found in archive"
                )));
            }
        }
        fs::write(&self.file, self.archive.format()).map_err(|err| {
            ScriptError::Cleanup(format!("cannot update script {}: {err}", self.file.display()))
        })?;
        self.transcript
            .logf(format!("{} updated", self.file.display()));
        tracing::info!(script = %self.name, "script file updated");
        Ok(())
    }
}

/// Lexically normalize a path: drop `.` and fold `..` into its parent.
pub(crate) fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() && !cleaned.has_root() {
                    cleaned.push(component);
                }
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}
