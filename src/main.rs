use anyhow::{anyhow, Context, Result};
use clap::Parser;
use escript::archive::Archive;
use escript::cli::{Command, FmtCheckArgs, RootArgs, RunArgs};
use escript::commands;
use escript::condition::Guard;
use escript::config::{load_suite_config, parse_timeout};
use escript::env::{HostEnv, DEFAULT_PASSTHROUGH};
use escript::grammar::tokenize;
use escript::report::{ScriptOutcome, ScriptStatus, SuiteReport};
use escript::runner::{discover_scripts, run_scripts, Params};
use regex::Regex;
use std::fs;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    init_tracing();
    let cli = RootArgs::parse();
    match cli.command {
        Command::Run(args) => cmd_run(args),
        Command::FmtCheck(args) => cmd_fmt_check(args),
    }
}

/// Diagnostics go to stderr; `ESCRIPT_LOG` takes precedence over `RUST_LOG`.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("ESCRIPT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn cmd_run(args: RunArgs) -> Result<()> {
    let config = load_suite_config(&args.dir)?;
    let timeout = match args.timeout_seconds {
        Some(seconds) => Some(parse_timeout(seconds).context("--timeout-seconds")?),
        None => config.timeout()?,
    };
    let host_env = HostEnv {
        passthrough: config.passthrough_env.clone().unwrap_or_else(|| {
            DEFAULT_PASSTHROUGH
                .iter()
                .map(|name| name.to_string())
                .collect()
        }),
        extra: config
            .env
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    };

    let mut params = Params::new(&args.dir)
        .test_work(args.testwork)
        .verbose(args.verbose)
        .update_scripts(args.update)
        .short(args.short)
        .timeout(timeout)
        .workdir_root(args.workdir_root.clone())
        .host_env(host_env)
        .net_probe_url(config.net_probe_url.clone());
    if let Some(parallel) = args.parallel {
        params = params.parallel(parallel);
    }

    let mut scripts = discover_scripts(&args.dir)?;
    if let Some(pattern) = &args.run {
        let re = Regex::new(pattern).with_context(|| format!("parse --run {pattern:?}"))?;
        scripts.retain(|path| {
            path.file_stem()
                .is_some_and(|stem| re.is_match(&stem.to_string_lossy()))
        });
    }
    if scripts.is_empty() {
        return Err(anyhow!(
            "no scripts to run in {}",
            args.dir.display()
        ));
    }

    let report = run_scripts(params, &scripts)?;
    for outcome in &report.scripts {
        print_outcome(outcome, args.verbose);
    }
    print_summary(&args.dir, &report);
    if let Some(path) = &args.report {
        report.write(path)?;
    }
    if !report.is_success() {
        return Err(anyhow!(
            "{} of {} scripts failed",
            report.failed,
            report.scripts.len()
        ));
    }
    Ok(())
}

fn print_outcome(outcome: &ScriptOutcome, verbose: bool) {
    let label = match outcome.status {
        ScriptStatus::Pass => "PASS",
        ScriptStatus::Fail => "FAIL",
        ScriptStatus::Skip => "SKIP",
    };
    let seconds = outcome.elapsed_ms as f64 / 1000.0;
    println!("--- {label}: {} ({seconds:.2}s)", outcome.name);
    if verbose || outcome.status != ScriptStatus::Pass {
        for line in outcome.transcript.lines() {
            println!("    {line}");
        }
    }
    for err in &outcome.cleanup_errors {
        println!("    cleanup error: {err}");
    }
    if let Some(dir) = &outcome.work_dir {
        println!("    work dir: {}", dir.display());
    }
}

fn print_summary(dir: &Path, report: &SuiteReport) {
    let verdict = if report.is_success() { "ok" } else { "FAIL" };
    println!(
        "{verdict}\t{}\t{} passed, {} failed, {} skipped",
        dir.display(),
        report.passed,
        report.failed,
        report.skipped
    );
}

/// Parse a script, tokenize its directives and check it is in canonical form.
fn cmd_fmt_check(args: FmtCheckArgs) -> Result<()> {
    let file = &args.file;
    let data = fs::read(file).with_context(|| format!("read {}", file.display()))?;
    let archive = Archive::parse(&data).with_context(|| format!("parse {}", file.display()))?;
    let comment = String::from_utf8_lossy(&archive.comment);

    let mut problems = Vec::new();
    for (index, line) in comment.lines().enumerate() {
        let line_no = index + 1;
        if line.starts_with('#') {
            continue;
        }
        let words = match tokenize(line, |_| String::new()) {
            Ok(words) => words,
            Err(err) => {
                problems.push(format!("{}:{line_no}: {err}", file.display()));
                continue;
            }
        };
        let command = words
            .iter()
            .find(|word| Guard::parse(word).is_none() && *word != "!");
        if let Some(name) = command {
            if commands::builtin(name).is_none() {
                println!(
                    "{}:{line_no}: note: {name:?} is not a built-in command",
                    file.display()
                );
            }
        }
    }
    if archive.format() != data {
        problems.push(format!(
            "{}: sections are missing a final newline",
            file.display()
        ));
    }

    if problems.is_empty() {
        println!("ok\t{}", file.display());
        return Ok(());
    }
    for problem in &problems {
        println!("{problem}");
    }
    Err(anyhow!("{} problem(s) in {}", problems.len(), file.display()))
}
