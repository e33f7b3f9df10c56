//! Foreground and background subprocess execution.
//!
//! Every wait is supervised against a [`CancelScope`]: when the scope is
//! cancelled or its deadline passes, the child's process group gets SIGINT (a
//! hard kill where signals are unavailable), is reaped, and the call reports
//! the scope error. Descendants still holding the output pipes are killed and
//! never delay the return by more than [`KILL_GRACE`].
use crate::env::lookup_var;
use crate::error::ProcessError;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long an interrupted child may take to exit before it is killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Cooperative cancellation token shared by everything a script starts.
///
/// Clones share state. A child scope is cancelled when its parent is, and may
/// carry its own deadline.
#[derive(Clone, Debug, Default)]
pub struct CancelScope {
    inner: Arc<ScopeInner>,
}

#[derive(Debug, Default)]
struct ScopeInner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<CancelScope>,
}

impl CancelScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        CancelScope {
            inner: Arc::new(ScopeInner {
                cancelled: AtomicBool::new(false),
                deadline: timeout.map(|timeout| Instant::now() + timeout),
                parent: None,
            }),
        }
    }

    /// Derive a scope that also expires after `timeout`, if given.
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        CancelScope {
            inner: Arc::new(ScopeInner {
                cancelled: AtomicBool::new(false),
                deadline: timeout.map(|timeout| Instant::now() + timeout),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.error().is_some()
    }

    pub fn error(&self) -> Option<ProcessError> {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return Some(ProcessError::Cancelled);
        }
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                return Some(ProcessError::TimedOut);
            }
        }
        self.inner.parent.as_ref().and_then(CancelScope::error)
    }

    pub fn check(&self) -> Result<(), ProcessError> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Everything needed to launch one subprocess.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub cwd: &'a Path,
    /// `KEY=VALUE` entries; later entries win.
    pub env: &'a [String],
    pub stdin: &'a str,
}

/// Captured result of a finished (or abandoned) subprocess.
#[derive(Debug)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: Result<ExitStatus, ProcessError>,
}

impl Output {
    pub fn success(&self) -> bool {
        matches!(&self.status, Ok(status) if status.success())
    }

    /// Failure description, or `None` for a zero exit.
    pub fn failure(&self) -> Option<String> {
        match &self.status {
            Ok(status) if status.success() => None,
            Ok(status) => Some(describe_status(status)),
            Err(err) => Some(err.to_string()),
        }
    }
}

type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// Handle to a process started with [`start`].
#[derive(Debug)]
pub struct BackgroundProcess {
    program: String,
    interrupt: Arc<AtomicBool>,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    supervisor: JoinHandle<Result<ExitStatus, ProcessError>>,
}

impl BackgroundProcess {
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Ask the process to stop; the supervisor escalates to a kill if needed.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }

    /// Output captured so far.
    pub fn stdout_snapshot(&self) -> String {
        snapshot(&self.stdout)
    }

    pub fn stderr_snapshot(&self) -> String {
        snapshot(&self.stderr)
    }

    /// Block until the process exits and return everything it wrote.
    pub fn wait(self) -> Output {
        let status = match self.supervisor.join() {
            Ok(status) => status,
            Err(_) => Err(ProcessError::Wait {
                program: self.program.clone(),
                source: io::Error::other("supervisor thread panicked"),
            }),
        };
        Output {
            stdout: snapshot(&self.stdout),
            stderr: snapshot(&self.stderr),
            status,
        }
    }
}

/// Resolve `program` the way the script's own environment would.
///
/// Bare names are looked up on the `PATH` from `env`, not the host process;
/// anything containing a path separator is used as given.
pub fn resolve_program(program: &str, env: &[String], cwd: &Path) -> Result<PathBuf, ProcessError> {
    let as_path = Path::new(program);
    if as_path.file_name().and_then(|name| name.to_str()) != Some(program) {
        return Ok(as_path.to_path_buf());
    }
    let search_path = lookup_var(env, "PATH");
    which::which_in(program, search_path, cwd).map_err(|_| ProcessError::NotFound {
        name: program.to_string(),
    })
}

/// Run a command to completion.
///
/// Errors are returned only when the process could not be started; exit
/// failures and cancellation are reported in [`Output::status`].
pub fn run(spec: &CommandSpec<'_>, scope: &CancelScope) -> Result<Output, ProcessError> {
    scope.check()?;
    let mut launched = launch(spec)?;
    let status = supervise(&mut launched.child, spec.program, scope, None);
    launched.finish_io(status.is_err());
    Ok(Output {
        stdout: snapshot(&launched.stdout),
        stderr: snapshot(&launched.stderr),
        status,
    })
}

/// Start a command without waiting for it.
pub fn start(spec: &CommandSpec<'_>, scope: &CancelScope) -> Result<BackgroundProcess, ProcessError> {
    scope.check()?;
    let mut launched = launch(spec)?;
    let interrupt = Arc::new(AtomicBool::new(false));
    let stdout = launched.stdout.clone();
    let stderr = launched.stderr.clone();
    let program = spec.program.to_string();
    let supervisor = {
        let scope = scope.clone();
        let interrupt = interrupt.clone();
        let program = program.clone();
        thread::spawn(move || {
            let status = supervise(&mut launched.child, &program, &scope, Some(&*interrupt));
            launched.finish_io(status.is_err() || interrupt.load(Ordering::SeqCst));
            status
        })
    };
    Ok(BackgroundProcess {
        program,
        interrupt,
        stdout,
        stderr,
        supervisor,
    })
}

/// Human-readable exit status, e.g. `exit status 1` or `signal: 2`.
pub fn describe_status(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit status {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal: {signal}");
        }
    }
    "terminated".to_string()
}

struct Launched {
    child: Child,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    io_threads: Vec<JoinHandle<()>>,
}

impl Launched {
    /// Join the I/O threads once the child has exited.
    ///
    /// With `bounded`, threads still blocked after [`KILL_GRACE`] are left
    /// detached and whatever they captured so far is kept.
    fn finish_io(&mut self, bounded: bool) {
        let deadline = Instant::now() + KILL_GRACE;
        for handle in self.io_threads.drain(..) {
            if bounded {
                while !handle.is_finished() && Instant::now() < deadline {
                    thread::sleep(POLL_INTERVAL);
                }
                if !handle.is_finished() {
                    tracing::debug!("output pipe still open after kill, detaching reader");
                    continue;
                }
            }
            let _ = handle.join();
        }
    }
}

fn launch(spec: &CommandSpec<'_>) -> Result<Launched, ProcessError> {
    let resolved = resolve_program(spec.program, spec.env, spec.cwd)?;
    tracing::debug!(program = spec.program, resolved = %resolved.display(), "spawn");

    let mut cmd = Command::new(&resolved);
    cmd.args(spec.args);
    cmd.current_dir(spec.cwd);
    cmd.env_clear();
    for entry in spec.env {
        if let Some((key, value)) = entry.split_once('=') {
            if !key.is_empty() {
                cmd.env(key, value);
            }
        }
    }
    cmd.env("PWD", spec.cwd);
    cmd.stdin(if spec.stdin.is_empty() {
        Stdio::null()
    } else {
        Stdio::piped()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group, so signals reach everything the command starts.
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: spec.program.to_string(),
        source,
    })?;

    let stdout = SharedBuffer::default();
    let stderr = SharedBuffer::default();
    let mut io_threads = Vec::with_capacity(3);
    if let Some(pipe) = child.stdout.take() {
        io_threads.push(capture(pipe, stdout.clone()));
    }
    if let Some(pipe) = child.stderr.take() {
        io_threads.push(capture(pipe, stderr.clone()));
    }
    if let Some(mut pipe) = child.stdin.take() {
        let input = spec.stdin.as_bytes().to_vec();
        io_threads.push(thread::spawn(move || {
            // The child may exit without reading its input.
            let _ = pipe.write_all(&input);
        }));
    }
    Ok(Launched {
        child,
        stdout,
        stderr,
        io_threads,
    })
}

fn capture<R: Read + Send + 'static>(mut pipe: R, sink: SharedBuffer) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if let Ok(mut buf) = sink.lock() {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}

fn snapshot(buf: &SharedBuffer) -> String {
    match buf.lock() {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
    }
}

fn supervise(
    child: &mut Child,
    program: &str,
    scope: &CancelScope,
    interrupt_requested: Option<&AtomicBool>,
) -> Result<ExitStatus, ProcessError> {
    let mut interrupted_at: Option<Instant> = None;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if interrupted_at.is_some() {
                    kill_group(child);
                }
                return Ok(status);
            }
            Ok(None) => {}
            Err(source) => {
                return Err(ProcessError::Wait {
                    program: program.to_string(),
                    source,
                })
            }
        }
        if let Some(err) = scope.error() {
            tracing::debug!(program, error = %err, "interrupting on cancelled scope");
            interrupt_process(child);
            reap(child);
            kill_group(child);
            return Err(err);
        }
        let requested = interrupt_requested.is_some_and(|flag| flag.load(Ordering::SeqCst));
        match interrupted_at {
            None if requested => {
                interrupt_process(child);
                interrupted_at = Some(Instant::now());
            }
            Some(at) if at.elapsed() > KILL_GRACE => {
                kill_group(child);
                let _ = child.kill();
            }
            _ => {}
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Wait for an interrupted child, killing it if it lingers.
fn reap(child: &mut Child) {
    let deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        thread::sleep(POLL_INTERVAL);
    }
    kill_group(child);
    let _ = child.kill();
    let _ = child.wait();
}

/// Send SIGINT to the child's process group, falling back to a kill where
/// signals are unavailable.
fn interrupt_process(child: &mut Child) {
    #[cfg(unix)]
    {
        if signal_group(child, libc::SIGINT) {
            return;
        }
    }
    let _ = child.kill();
}

/// SIGKILL whatever is left of the child's process group.
///
/// Background descendants of a shell ignore SIGINT, so this runs even after
/// the child itself has been reaped.
fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    {
        signal_group(child, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) -> bool {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: kill(2) has no memory-safety preconditions. The group id is
    // the pid of our own child, and a group id is not reused while any
    // member is alive.
    let rc = unsafe { libc::kill(-pgid, signal) };
    rc == 0
}
