//! Script outcomes and the JSON suite report.
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptStatus {
    Pass,
    Fail,
    Skip,
}

/// Result of one script.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptOutcome {
    pub name: String,
    pub file: PathBuf,
    pub status: ScriptStatus,
    pub transcript: String,
    /// CI annotation emitted for a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    /// Failed cleanups; they never change `status`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cleanup_errors: Vec<String>,
    pub elapsed_ms: u64,
    /// Set when the work directory was preserved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub schema_version: u32,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub scripts: Vec<ScriptOutcome>,
}

impl SuiteReport {
    pub fn new(scripts: Vec<ScriptOutcome>) -> Self {
        let count = |status: ScriptStatus| scripts.iter().filter(|s| s.status == status).count();
        SuiteReport {
            schema_version: SCHEMA_VERSION,
            passed: count(ScriptStatus::Pass),
            failed: count(ScriptStatus::Fail),
            skipped: count(ScriptStatus::Skip),
            scripts,
        }
    }

    /// True when nothing failed, counting cleanup errors.
    pub fn is_success(&self) -> bool {
        self.failed == 0
            && self
                .scripts
                .iter()
                .all(|script| script.cleanup_errors.is_empty())
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut text = serde_json::to_string_pretty(self).context("serialize report")?;
        text.push('\n');
        fs::write(path, text).with_context(|| format!("write report {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(name: &str, status: ScriptStatus) -> ScriptOutcome {
        ScriptOutcome {
            name: name.to_string(),
            file: PathBuf::from(format!("tests/scripts/{name}.txt")),
            status,
            transcript: String::new(),
            annotation: None,
            cleanup_errors: Vec::new(),
            elapsed_ms: 1,
            work_dir: None,
        }
    }

    #[test]
    fn counts_statuses_and_serializes() {
        let mut cleanup = outcome("c", ScriptStatus::Pass);
        cleanup.cleanup_errors.push("remove failed".to_string());
        let report = SuiteReport::new(vec![
            outcome("a", ScriptStatus::Pass),
            outcome("b", ScriptStatus::Skip),
            cleanup,
        ]);
        assert_eq!((report.passed, report.failed, report.skipped), (2, 0, 1));
        assert!(!report.is_success());

        let value = serde_json::to_value(&report).expect("json");
        assert_eq!(value["scripts"][1]["status"], "skip");
        assert!(value["scripts"][0].get("annotation").is_none());
        assert_eq!(value["scripts"][2]["cleanup_errors"][0], "remove failed");
    }

    #[test]
    fn writes_report_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("report.json");
        SuiteReport::new(vec![outcome("a", ScriptStatus::Fail)])
            .write(&path)
            .expect("write");
        let text = fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"failed\": 1"), "{text}");
    }
}
