//! Built-in predicates for `[cond]` guards.
//!
//! The interpreter owns dispatch (see `TestScript::condition`); this module
//! holds the pieces that do not need the run context.
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

const NET_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Operating systems a guard may name. Anything here other than the host
/// evaluates to false instead of being an unknown condition.
pub const KNOWN_OS: &[&str] = &[
    "aix", "android", "darwin", "dragonfly", "freebsd", "fuchsia", "haiku", "hurd", "illumos",
    "ios", "js", "linux", "macos", "netbsd", "openbsd", "plan9", "redox", "solaris", "wasip1",
    "windows", "zos",
];

/// Architectures a guard may name, in both Rust and Go spellings.
pub const KNOWN_ARCH: &[&str] = &[
    "386", "aarch64", "amd64", "arm", "arm64", "loong64", "loongarch64", "mips", "mips64",
    "mips64le", "mipsle", "powerpc", "powerpc64", "ppc64", "ppc64le", "riscv64", "s390x",
    "sparc64", "wasm", "wasm32", "x86", "x86_64",
];

/// A parsed `[cond]` or `[!cond]` guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub cond: String,
    pub want: bool,
}

impl Guard {
    /// Parse a guard token; `None` if `token` is not bracketed.
    pub fn parse(token: &str) -> Option<Guard> {
        let inner = token.strip_prefix('[')?.strip_suffix(']')?.trim();
        Some(match inner.strip_prefix('!') {
            Some(negated) => Guard {
                cond: negated.trim().to_string(),
                want: false,
            },
            None => Guard {
                cond: inner.to_string(),
                want: true,
            },
        })
    }
}

/// Names of the host OS and architecture, with common aliases.
pub fn host_names() -> Vec<&'static str> {
    let mut names = vec![std::env::consts::OS, std::env::consts::ARCH];
    if std::env::consts::OS == "macos" {
        names.push("darwin");
    }
    match std::env::consts::ARCH {
        "x86_64" => names.push("amd64"),
        "aarch64" => names.push("arm64"),
        "x86" => names.push("386"),
        "loongarch64" => names.push("loong64"),
        _ => {}
    }
    names
}

/// Resolve a platform or capability predicate.
///
/// Returns `None` when `cond` is not one of these built-ins.
pub fn builtin(cond: &str, short: bool, net: &NetProbe) -> Option<bool> {
    match cond {
        "short" => Some(short),
        "net" => Some(net.reachable(short)),
        "link" => Some(has_link()),
        "symlink" => Some(has_symlink()),
        _ if host_names().contains(&cond) => Some(true),
        _ if KNOWN_OS.contains(&cond) || KNOWN_ARCH.contains(&cond) => Some(false),
        _ => None,
    }
}

/// Multiline regex match used by `stdout:` and `stderr:` guards.
pub fn output_matches(pattern: &str, text: &str) -> Result<bool, regex::Error> {
    let re = Regex::new(&format!("(?m){pattern}"))?;
    Ok(re.is_match(text))
}

fn has_link() -> bool {
    !cfg!(any(target_os = "android", target_os = "ios"))
}

fn has_symlink() -> bool {
    if cfg!(windows) {
        windows_symlink_allowed()
    } else {
        !cfg!(target_os = "android")
    }
}

#[cfg(windows)]
fn windows_symlink_allowed() -> bool {
    static ALLOWED: OnceLock<bool> = OnceLock::new();
    *ALLOWED.get_or_init(|| {
        let Ok(dir) = tempfile::tempdir() else {
            return false;
        };
        let target = dir.path().join("target");
        if std::fs::write(&target, b"").is_err() {
            return false;
        }
        std::os::windows::fs::symlink_file(&target, dir.path().join("link")).is_ok()
    })
}

#[cfg(not(windows))]
fn windows_symlink_allowed() -> bool {
    false
}

/// External network reachability, probed at most once.
///
/// Without a probe URL the network is assumed reachable outside short mode.
#[derive(Debug, Default)]
pub struct NetProbe {
    url: Option<String>,
    reachable: OnceLock<bool>,
}

impl NetProbe {
    pub fn new(url: Option<String>) -> Self {
        NetProbe {
            url,
            reachable: OnceLock::new(),
        }
    }

    pub fn reachable(&self, short: bool) -> bool {
        if short {
            return false;
        }
        let Some(url) = self.url.as_deref() else {
            return true;
        };
        *self.reachable.get_or_init(|| {
            let config = ureq::Agent::config_builder()
                .timeout_global(Some(NET_PROBE_TIMEOUT))
                .build();
            let agent = ureq::Agent::new_with_config(config);
            let reachable = match agent.get(url).call() {
                Ok(_) => true,
                // Any HTTP answer means the network works.
                Err(ureq::Error::StatusCode(_)) => true,
                Err(_) => false,
            };
            tracing::info!(url, reachable, "network probe");
            reachable
        })
    }
}

/// Memoized `exec:<name>` lookups.
#[derive(Debug, Default)]
pub struct ExecCache {
    found: Mutex<HashMap<String, bool>>,
}

impl ExecCache {
    /// Cached answer for `name`, running `probe` only on the first request.
    pub fn lookup<F>(&self, name: &str, probe: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let mut found = self.found.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&hit) = found.get(name) {
            tracing::debug!(name, hit, "exec cache hit");
            return hit;
        }
        let result = probe();
        found.insert(name.to_string(), result);
        result
    }
}
