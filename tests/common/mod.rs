//! Shared test infrastructure for integration tests.
#![allow(dead_code)]

use escript::{MemorySink, Params, ScriptOutcome, SuiteReport};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// A directory of scripts plus an in-memory annotation sink.
pub struct ScriptSuite {
    pub dir: TempDir,
    pub sink: Arc<MemorySink>,
}

impl ScriptSuite {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create script dir"),
            sink: Arc::new(MemorySink::default()),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `<name>.txt` with `body` and return its path.
    pub fn write(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(format!("{name}.txt"));
        fs::write(&path, body).expect("write script");
        path
    }

    /// Parameters for this suite, with annotations captured in memory.
    pub fn params(&self) -> Params {
        Params::new(self.dir.path())
            .annotations(self.sink.clone())
            .parallel(2)
    }

    pub fn run(&self, params: Params) -> SuiteReport {
        escript::run(params).expect("run suite")
    }
}

pub fn outcome<'a>(report: &'a SuiteReport, name: &str) -> &'a ScriptOutcome {
    report
        .scripts
        .iter()
        .find(|outcome| outcome.name == name)
        .unwrap_or_else(|| panic!("no outcome for {name}"))
}

/// Check that every binary is on PATH; skip the test if not.
pub fn skip_if_missing(binaries: &[&str]) -> bool {
    for binary in binaries {
        if which::which(binary).is_err() {
            eprintln!("Skipping: {binary} not available");
            return true;
        }
    }
    false
}
