//! CLI argument parsing for the script runner.
use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "escript",
    version,
    about = "Run txtar test scripts against real processes",
    after_help = "Examples:\n  escript run --dir tests/scripts\n  escript run --dir tests/scripts -v --timeout-seconds 30\n  escript run --dir tests/scripts --update\n  escript fmt-check tests/scripts/vm-boot.txt",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    FmtCheck(FmtCheckArgs),
}

/// Run every `*.txt` script in a directory.
#[derive(Args, Debug)]
#[command(about = "Run every *.txt script in a directory")]
pub struct RunArgs {
    /// Directory containing the scripts (and an optional escript.json)
    #[arg(long, value_name = "DIR")]
    pub dir: PathBuf,

    /// Run only scripts whose name matches this regex
    #[arg(long, value_name = "REGEX")]
    pub run: Option<String>,

    /// Keep work directories and print their paths
    #[arg(long, env = "ESCRIPT_TESTWORK", value_parser = BoolishValueParser::new())]
    pub testwork: bool,

    /// Keep full transcripts of passing phases
    #[arg(short, long, env = "ESCRIPT_VERBOSE", value_parser = BoolishValueParser::new())]
    pub verbose: bool,

    /// Per-command timeout
    #[arg(long, value_name = "SECONDS", env = "ESCRIPT_TIMEOUT")]
    pub timeout_seconds: Option<f64>,

    /// Rewrite expected output sections from actual output
    #[arg(long, env = "ESCRIPT_UPDATE", value_parser = BoolishValueParser::new())]
    pub update: bool,

    /// Enable the [short] condition and disable [net]
    #[arg(long)]
    pub short: bool,

    /// Root for work directories (implies keeping them)
    #[arg(long, value_name = "DIR")]
    pub workdir_root: Option<PathBuf>,

    /// Maximum number of scripts running at once
    #[arg(long, value_name = "N")]
    pub parallel: Option<usize>,

    /// Write a JSON report of all outcomes
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,
}

/// Check that a script parses and round-trips through the archive codec.
#[derive(Args, Debug)]
#[command(about = "Check that a script parses and its directives tokenize")]
pub struct FmtCheckArgs {
    /// Script file to check
    #[arg(value_name = "FILE")]
    pub file: PathBuf,
}
