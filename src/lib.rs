//! Script-driven acceptance test engine.
//!
//! Scripts are text archives: a list of directives followed by the files that
//! seed the work directory. Each script runs in a private work directory and
//! environment, drives real processes, and produces a transcript with a
//! PASS/FAIL verdict.
pub mod archive;
pub mod cli;
pub mod commands;
pub mod condition;
pub mod config;
pub mod env;
pub mod error;
pub mod grammar;
pub mod process;
pub mod report;
pub mod runner;
pub mod script;
pub mod transcript;
pub mod workdir;

pub use archive::{Archive, ArchiveFile};
pub use commands::Command;
pub use env::Env;
pub use error::{ArchiveError, ProcessError, ScriptError};
pub use report::{ScriptOutcome, ScriptStatus, SuiteReport};
pub use runner::{run, run_scripts, Params};
pub use script::TestScript;
pub use transcript::{AnnotationSink, MemorySink, StdoutSink};
