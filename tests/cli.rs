//! Binary-level tests for the `escript` command line.

mod common;

use common::{skip_if_missing, ScriptSuite};
use std::fs;
use std::process::{Command, Output};

fn escript(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_escript"))
        .args(args)
        .env_remove("ESCRIPT_TESTWORK")
        .env_remove("ESCRIPT_VERBOSE")
        .env_remove("ESCRIPT_UPDATE")
        .env_remove("ESCRIPT_TIMEOUT")
        .env_remove("ESCRIPT_LOG")
        .output()
        .expect("spawn escript")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn run_reports_passing_suite() {
    if skip_if_missing(&["sh"]) {
        return;
    }
    let suite = ScriptSuite::new();
    suite.write("hello", "exec sh -c 'echo hi'\nstdout '^hi$'\n");
    let dir = suite.path().to_string_lossy().into_owned();

    let output = escript(&["run", "--dir", &dir]);
    let text = stdout(&output);
    assert!(output.status.success(), "{text}");
    assert!(text.contains("--- PASS: hello"), "{text}");
    assert!(text.contains(&format!("ok\t{dir}\t1 passed, 0 failed, 0 skipped")), "{text}");
}

#[test]
fn run_fails_and_annotates_broken_script() {
    if skip_if_missing(&["sh"]) {
        return;
    }
    let suite = ScriptSuite::new();
    suite.write("fine", "exec true\n");
    suite.write("broken", "exec sh -c 'exit 2'\n");
    let dir = suite.path().to_string_lossy().into_owned();

    let output = escript(&["run", "--dir", &dir]);
    let text = stdout(&output);
    assert!(!output.status.success(), "{text}");
    assert!(text.contains("::error file="), "{text}");
    assert!(text.contains("--- FAIL: broken"), "{text}");
    assert!(text.contains("unexpected command failure"), "{text}");
    assert!(text.contains("1 passed, 1 failed, 0 skipped"), "{text}");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("1 of 2 scripts failed"), "{stderr}");
}

#[test]
fn run_filter_selects_scripts() {
    let suite = ScriptSuite::new();
    suite.write("keep", "env A=1\n");
    suite.write("drop", "bogus-command\n");
    let dir = suite.path().to_string_lossy().into_owned();

    let output = escript(&["run", "--dir", &dir, "--run", "^keep$"]);
    let text = stdout(&output);
    assert!(output.status.success(), "{text}");
    assert!(text.contains("--- PASS: keep"), "{text}");
    assert!(text.contains("1 passed, 0 failed, 0 skipped"), "{text}");
}

#[test]
fn run_writes_json_report() {
    let suite = ScriptSuite::new();
    suite.write("skipper", "skip 'not today'\n");
    let out_dir = tempfile::tempdir().expect("tempdir");
    let report_path = out_dir.path().join("report.json");
    let dir = suite.path().to_string_lossy().into_owned();

    let output = escript(&[
        "run",
        "--dir",
        &dir,
        "--report",
        report_path.to_str().expect("utf8 path"),
    ]);
    assert!(output.status.success(), "{}", stdout(&output));

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report_path).expect("read report"))
            .expect("parse report");
    assert_eq!(report["skipped"], 1);
    assert_eq!(report["scripts"][0]["name"], "skipper");
    assert_eq!(report["scripts"][0]["status"], "skip");
}

#[test]
fn empty_dir_is_an_error() {
    let suite = ScriptSuite::new();
    let output = escript(&["run", "--dir", &suite.path().to_string_lossy()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no scripts to run"), "{stderr}");
}

#[test]
fn fmt_check_accepts_canonical_script() {
    let suite = ScriptSuite::new();
    let path = suite.write("tidy", "exec true\ncmp a.txt b.txt\n-- a.txt --\nx\n-- b.txt --\nx\n");
    let output = escript(&["fmt-check", &path.to_string_lossy()]);
    let text = stdout(&output);
    assert!(output.status.success(), "{text}");
    assert!(text.starts_with("ok\t"), "{text}");
}

#[test]
fn fmt_check_flags_problems() {
    let suite = ScriptSuite::new();
    let path = suite.write("messy", "exec 'unterminated\nvm-start edge\n-- a.txt --\nno newline");
    let output = escript(&["fmt-check", &path.to_string_lossy()]);
    let text = stdout(&output);
    assert!(!output.status.success(), "{text}");
    assert!(text.contains(":1: unterminated quoted argument"), "{text}");
    assert!(text.contains("\"vm-start\" is not a built-in command"), "{text}");
    assert!(text.contains("missing a final newline"), "{text}");
}
