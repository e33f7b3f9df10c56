//! Phase-scoped script log and CI failure annotations.
//!
//! The transcript is an append-only buffer with a mark at the start of the
//! current phase. When a phase completes, quiet mode truncates its details
//! back to the heading; the heading always gets the phase's elapsed time.
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

/// Placeholder substituted for the real work directory.
pub const WORK_PLACEHOLDER: &str = "$WORK";
/// Prefix of a captured-output block; annotations start at the last one.
pub const STDOUT_MARKER: &str = "\n[stdout]\n";
const ANNOTATION_TAG: &str = "::error file";

#[derive(Debug, Default)]
pub struct Transcript {
    log: String,
    mark: usize,
    phase_start: Option<Instant>,
    verbose: bool,
}

impl Transcript {
    pub fn new(verbose: bool) -> Self {
        Transcript {
            verbose,
            ..Transcript::default()
        }
    }

    /// Append one message, terminated by exactly one newline.
    pub fn logf(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        self.log
            .push_str(message.strip_suffix('\n').unwrap_or(message));
        self.log.push('\n');
    }

    /// Append text verbatim.
    pub fn write(&mut self, text: &str) {
        self.log.push_str(text);
    }

    /// Close the current phase and open one titled `heading`.
    pub fn phase(&mut self, heading: &str) {
        if self.log.len() > self.mark {
            self.rewind();
        }
        self.mark_time();
        self.log.push_str(heading);
        self.log.push('\n');
        self.mark = self.log.len();
        self.phase_start = Some(Instant::now());
    }

    /// Treat everything logged so far as permanent (e.g. an environment dump).
    pub fn set_mark(&mut self) {
        self.mark = self.log.len();
    }

    /// Drop the current phase's details unless verbose.
    pub fn rewind(&mut self) {
        if !self.verbose {
            self.log.truncate(self.mark);
        }
    }

    /// Append ` (1.234s)` to the current phase heading.
    pub fn mark_time(&mut self) {
        if let Some(started) = self.phase_start.take() {
            if self.mark == 0 {
                return;
            }
            let after_mark = self.log.split_off(self.mark);
            self.log.truncate(self.mark - 1);
            self.log
                .push_str(&format!(" ({:.3}s)\n", started.elapsed().as_secs_f64()));
            self.log.push_str(&after_mark);
            self.mark = self.log.len() - after_mark.len();
        }
    }

    /// Record a failure at `file:line`.
    pub fn fail(&mut self, file: &Path, line: usize, message: &str) {
        self.logf(format!("FAIL: {}:{line}: {message}", file.display()));
    }

    /// Single-line CI annotation for a failure at `file:line`.
    ///
    /// The message is everything logged since the last captured stdout block,
    /// with line breaks escaped so it survives as one line.
    pub fn annotation(&self, file: &Path, line: usize) -> String {
        let start = self
            .log
            .rfind(STDOUT_MARKER)
            .map(|index| index + 1)
            .unwrap_or(0);
        let message = self.log[start..]
            .replace('\n', "%0A")
            .replace('\r', "%0D");
        format!(
            "{ANNOTATION_TAG}={},line={line}::{message}",
            annotation_path(file)
        )
    }

    /// Strip annotation lines that leaked into the log from subprocess output.
    pub fn remove_annotations(&mut self) {
        if !self.log.contains(ANNOTATION_TAG) {
            return;
        }
        let mut kept = String::with_capacity(self.log.len());
        for line in self.log.lines() {
            if line.contains(ANNOTATION_TAG) {
                continue;
            }
            kept.push_str(line);
            kept.push('\n');
        }
        self.log = kept;
        self.mark = self.mark.min(self.log.len());
    }

    pub fn as_str(&self) -> &str {
        &self.log
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Final text with the work directory abbreviated to `$WORK`.
    ///
    /// With `expose_work`, the real path is restored on the first line so the
    /// directory can be found afterwards.
    pub fn render(&self, work_dir: &Path, expose_work: bool) -> String {
        let work = work_dir.display().to_string();
        let text = if work.is_empty() {
            self.log.clone()
        } else {
            self.log.replace(&work, WORK_PLACEHOLDER)
        };
        if !expose_work {
            return text;
        }
        let placeholder_line = format!("WORK={WORK_PLACEHOLDER}\n");
        let rest = text.strip_prefix(&placeholder_line).unwrap_or(&text);
        format!("WORK={work}\n{rest}")
    }
}

/// Path shown in annotations: relative to the repository's `tests/` dir when
/// the script lives under one.
fn annotation_path(file: &Path) -> String {
    let absolute = std::path::absolute(file).unwrap_or_else(|_| file.to_path_buf());
    let display = absolute.display().to_string();
    match display.split_once("/tests/") {
        Some((_, rest)) => format!("tests/{rest}"),
        None => file.display().to_string(),
    }
}

/// Side channel receiving failure annotations.
pub trait AnnotationSink: Send + Sync {
    fn emit(&self, annotation: &str);
}

/// Prints annotations on stdout, where CI runners pick them up.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl AnnotationSink for StdoutSink {
    fn emit(&self, annotation: &str) {
        println!("{annotation}");
    }
}

/// Keeps annotations in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AnnotationSink for MemorySink {
    fn emit(&self, annotation: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(annotation.to_string());
        }
    }
}
