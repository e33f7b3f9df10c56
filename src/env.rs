//! Script environment: variable list, setup hook view and deferred cleanups.
use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Arbitrary per-run values handed from the setup hook to extension commands.
pub type Values = HashMap<String, Box<dyn Any + Send>>;

/// Cleanup action run at teardown.
pub type Deferred = Box<dyn FnOnce() -> anyhow::Result<()>>;

/// Environment variable names compare case-insensitively on Windows.
pub fn env_var_name(key: &str) -> String {
    if cfg!(windows) {
        key.to_lowercase()
    } else {
        key.to_string()
    }
}

/// Value of `key` in a `KEY=VALUE` list; the last entry wins.
pub fn lookup_var<'a>(vars: &'a [String], key: &str) -> Option<&'a str> {
    let key = env_var_name(key);
    vars.iter().rev().find_map(|entry| {
        let (name, value) = entry.split_once('=')?;
        (env_var_name(name) == key).then_some(value)
    })
}

/// Panics on keys that can never be valid; callers pass literal names.
pub fn validate_key(key: &str) {
    if key.is_empty() || key.contains('=') {
        panic!("invalid environment variable key {key:?}");
    }
}

/// LIFO stack of cleanup actions.
#[derive(Default)]
pub struct DeferStack {
    actions: Vec<Deferred>,
}

impl DeferStack {
    pub fn push(&mut self, action: Deferred) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn append(&mut self, other: &mut DeferStack) {
        self.actions.append(&mut other.actions);
    }

    /// Run every action, most recently deferred first, collecting failures.
    pub fn run_all(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        while let Some(action) = self.actions.pop() {
            if let Err(err) = action() {
                failures.push(format!("{err:#}"));
            }
        }
        failures
    }
}

/// Starting state of a script, as seen by the setup hook.
///
/// The hook may rewrite `vars` and `cd`, stash values for extension commands
/// and register cleanups before the first directive runs.
pub struct Env {
    pub work_dir: PathBuf,
    pub vars: Vec<String>,
    pub cd: PathBuf,
    pub values: Values,
    deferred: DeferStack,
}

impl Env {
    pub fn new(work_dir: &Path, vars: Vec<String>) -> Self {
        Env {
            work_dir: work_dir.to_path_buf(),
            vars,
            cd: work_dir.to_path_buf(),
            values: Values::new(),
            deferred: DeferStack::default(),
        }
    }

    /// Value of `key`, or an empty string when unset.
    pub fn getenv(&self, key: &str) -> String {
        lookup_var(&self.vars, key).unwrap_or_default().to_string()
    }

    /// Append `key=value`, shadowing any earlier entry.
    ///
    /// Panics if `key` is empty or contains `=`.
    pub fn setenv(&mut self, key: &str, value: &str) {
        validate_key(key);
        self.vars.push(format!("{key}={value}"));
    }

    pub fn defer<F>(&mut self, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + 'static,
    {
        self.deferred.push(Box::new(action));
    }

    pub fn set_value<T: Any + Send>(&mut self, key: &str, value: T) {
        self.values.insert(key.to_string(), Box::new(value));
    }

    pub(crate) fn into_parts(self) -> (Vec<String>, PathBuf, Values, DeferStack) {
        (self.vars, self.cd, self.values, self.deferred)
    }
}

/// Host variables passed through when no suite config says otherwise.
pub const DEFAULT_PASSTHROUGH: &[&str] = &["DOCKER_HOST"];

/// Host-dependent inputs to the baseline environment.
#[derive(Debug, Clone, Default)]
pub struct HostEnv {
    /// Host variables copied through unchanged, e.g. `DOCKER_HOST`.
    pub passthrough: Vec<String>,
    /// Extra `KEY=VALUE` pairs appended after the baseline.
    pub extra: Vec<(String, String)>,
}

/// Baseline variables every script starts with.
///
/// `WORK` must stay first: transcript abbreviation relies on it.
pub fn baseline_vars(work_dir: &Path, host: &HostEnv) -> Vec<String> {
    let work = work_dir.display().to_string();
    let tmp = work_dir.join("tmp").display().to_string();
    let mut vars = vec![
        format!("WORK={work}"),
        format!("PATH={}", std::env::var("PATH").unwrap_or_default()),
    ];
    for name in &host.passthrough {
        vars.push(format!(
            "{name}={}",
            std::env::var(name).unwrap_or_default()
        ));
    }
    vars.push(format!("{}={tmp}", temp_env_name()));
    vars.push(format!("devnull={}", dev_null()));
    vars.push(format!("/={}", std::path::MAIN_SEPARATOR));
    vars.push(format!(":={}", if cfg!(windows) { ';' } else { ':' }));

    if cfg!(target_os = "macos") {
        let home = dirs::home_dir()
            .map(|home| home.display().to_string())
            .unwrap_or_default();
        vars.push(format!("{}={home}", home_env_name()));
        vars.push(format!("USER={}", std::env::var("USER").unwrap_or_default()));
    } else {
        vars.push(format!("{}=/no-home", home_env_name()));
    }
    if cfg!(windows) {
        vars.push(format!(
            "SYSTEMROOT={}",
            std::env::var("SYSTEMROOT").unwrap_or_default()
        ));
        vars.push("exe=.exe".to_string());
    } else {
        vars.push("exe=".to_string());
    }
    for (key, value) in &host.extra {
        vars.push(format!("{key}={value}"));
    }
    vars
}

fn home_env_name() -> &'static str {
    if cfg!(windows) {
        "USERPROFILE"
    } else {
        "HOME"
    }
}

fn temp_env_name() -> &'static str {
    if cfg!(windows) {
        "TMP"
    } else {
        "TMPDIR"
    }
}

fn dev_null() -> &'static str {
    if cfg!(windows) {
        "NUL"
    } else {
        "/dev/null"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn last_entry_wins() {
        let vars = vec!["X=1".to_string(), "Y=a=b".to_string(), "X=2".to_string()];
        assert_eq!(lookup_var(&vars, "X"), Some("2"));
        assert_eq!(lookup_var(&vars, "Y"), Some("a=b"));
        assert_eq!(lookup_var(&vars, "Z"), None);
    }

    #[test]
    fn setenv_shadows_earlier_values() {
        let mut env = Env::new(Path::new("/w"), vec!["X=1".to_string()]);
        env.setenv("X", "2");
        assert_eq!(env.getenv("X"), "2");
        assert_eq!(env.vars, vec!["X=1", "X=2"]);
        assert_eq!(env.getenv("MISSING"), "");
    }

    #[test]
    #[should_panic(expected = "invalid environment variable key")]
    fn setenv_rejects_key_with_equals() {
        let mut env = Env::new(Path::new("/w"), Vec::new());
        env.setenv("A=B", "x");
    }

    #[test]
    #[should_panic(expected = "invalid environment variable key")]
    fn setenv_rejects_empty_key() {
        let mut env = Env::new(Path::new("/w"), Vec::new());
        env.setenv("", "x");
    }

    #[test]
    fn deferred_actions_run_lifo_and_collect_failures() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut stack = DeferStack::default();
        for label in ["first", "second", "third"] {
            let order = order.clone();
            stack.push(Box::new(move || {
                order.borrow_mut().push(label);
                if label == "second" {
                    anyhow::bail!("second failed");
                }
                Ok(())
            }));
        }
        let failures = stack.run_all();
        assert_eq!(*order.borrow(), vec!["third", "second", "first"]);
        assert_eq!(failures, vec!["second failed"]);
        assert!(stack.is_empty());
    }

    #[test]
    fn baseline_starts_with_work_and_includes_aliases() {
        let host = HostEnv {
            passthrough: vec!["ESCRIPT_TEST_UNSET_VAR".to_string()],
            extra: vec![("EXTRA".to_string(), "yes".to_string())],
        };
        let vars = baseline_vars(Path::new("/tmp/script-x"), &host);
        assert_eq!(vars[0], "WORK=/tmp/script-x");
        assert_eq!(lookup_var(&vars, "ESCRIPT_TEST_UNSET_VAR"), Some(""));
        assert_eq!(lookup_var(&vars, "EXTRA"), Some("yes"));
        assert!(lookup_var(&vars, "devnull").is_some());
        assert!(lookup_var(&vars, "exe").is_some());
        #[cfg(target_os = "linux")]
        {
            assert_eq!(lookup_var(&vars, "HOME"), Some("/no-home"));
            assert_eq!(lookup_var(&vars, "TMPDIR"), Some("/tmp/script-x/tmp"));
            assert_eq!(lookup_var(&vars, "/"), Some("/"));
            assert_eq!(lookup_var(&vars, ":"), Some(":"));
        }
    }
}
