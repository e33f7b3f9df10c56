//! Built-in directives.
//!
//! Every directive receives the run context, whether the line was negated
//! with `!`, and its arguments. Returning `Err` fails the script at the
//! current line.
use crate::archive;
use crate::error::{ProcessError, Result, ScriptError};
use crate::grammar;
use crate::process::describe_status;
use crate::script::TestScript;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A directive callable from scripts.
///
/// Implemented for any `Fn(&mut TestScript, bool, &[String]) -> Result<()>`,
/// so closures can be registered as extension commands directly.
pub trait Command: Send + Sync {
    fn run(&self, ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()>;
}

impl<F> Command for F
where
    F: Fn(&mut TestScript, bool, &[String]) -> Result<()> + Send + Sync,
{
    fn run(&self, ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
        self(ts, neg, args)
    }
}

pub type Builtin = fn(&mut TestScript, bool, &[String]) -> Result<()>;

/// Built-in directive table, sorted by name.
const BUILTINS: &[(&str, Builtin)] = &[
    ("cat", cmd_cat),
    ("cd", cmd_cd),
    ("chmod", cmd_chmod),
    ("cmp", cmd_cmp),
    ("cmpenv", cmd_cmpenv),
    ("cp", cmd_cp),
    ("env", cmd_env),
    ("exec", cmd_exec),
    ("exists", cmd_exists),
    ("grep", cmd_grep),
    ("mkdir", cmd_mkdir),
    ("rm", cmd_rm),
    ("skip", cmd_skip),
    ("stderr", cmd_stderr),
    ("stdin", cmd_stdin),
    ("stdout", cmd_stdout),
    ("stop", cmd_stop),
    ("symlink", cmd_symlink),
    ("unquote", cmd_unquote),
    ("wait", cmd_wait),
];

pub fn builtin(name: &str) -> Option<Builtin> {
    BUILTINS
        .binary_search_by(|(candidate, _)| candidate.cmp(&name))
        .ok()
        .map(|index| BUILTINS[index].1)
}

pub fn builtin_names() -> impl Iterator<Item = &'static str> {
    BUILTINS.iter().map(|(name, _)| *name)
}

fn unsupported(name: &str) -> ScriptError {
    ScriptError::Syntax(format!("unsupported: ! {name}"))
}

/// Log file contents as captured stdout.
fn cmd_cat(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    if neg {
        return Err(unsupported("cat"));
    }
    if args.is_empty() {
        return Err(ScriptError::usage("cat file..."));
    }
    let mut text = String::new();
    for name in args {
        text.push_str(&ts.read_file(name)?);
    }
    if !text.is_empty() {
        ts.logf(format!("[stdout]\n{text}"));
    }
    ts.set_output(text, "");
    Ok(())
}

fn cmd_cd(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    if neg {
        return Err(unsupported("cd"));
    }
    let [dir] = args else {
        return Err(ScriptError::usage("cd dir"));
    };
    let dir = ts.mk_abs(dir);
    match fs::metadata(&dir) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            return Err(ScriptError::assertion(format!(
                "{} is not a directory",
                dir.display()
            )))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ScriptError::assertion(format!(
                "directory {} does not exist",
                dir.display()
            )))
        }
        Err(err) => return Err(ScriptError::io("stat", &dir, err)),
    }
    ts.logf(dir.display().to_string());
    ts.set_cd(dir);
    Ok(())
}

fn cmd_chmod(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    if neg {
        return Err(unsupported("chmod"));
    }
    let Some((perm, paths)) = args.split_first().filter(|(_, paths)| !paths.is_empty()) else {
        return Err(ScriptError::usage("chmod perm paths..."));
    };
    let mode = u32::from_str_radix(perm, 8)
        .ok()
        .filter(|mode| mode & !0o777 == 0)
        .ok_or_else(|| {
            ScriptError::assertion(format!(
                "invalid mode {perm:?}: must be in octal and in range 0-777"
            ))
        })?;
    for path in paths {
        let path = ts.mk_abs(path);
        set_mode(&path, mode).map_err(|err| ScriptError::io("chmod", &path, err))?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o222 == 0);
    fs::set_permissions(path, perms)
}

fn cmd_cmp(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    let [left, right] = args else {
        return Err(ScriptError::usage("cmp file1 file2"));
    };
    compare(ts, neg, left, right, false)
}

fn cmd_cmpenv(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    let [left, right] = args else {
        return Err(ScriptError::usage("cmpenv file1 file2"));
    };
    compare(ts, neg, left, right, true)
}

/// Compare two files; with `expand_right`, `$VAR` references in the second
/// are expanded first.
///
/// In update mode a mismatch between `stdout`/`stderr` and a file unpacked
/// from the script is recorded as the file's new content instead of failing.
fn compare(ts: &mut TestScript, neg: bool, left: &str, right: &str, expand_right: bool) -> Result<()> {
    let left_data = ts.read_bytes(left)?;
    let right_path = ts.mk_abs(right);
    let mut right_data = ts.read_bytes(right)?;
    if expand_right {
        let text = String::from_utf8_lossy(&right_data).into_owned();
        right_data = grammar::expand(&text, |key| ts.getenv(key)).into_bytes();
    }
    let equal = left_data == right_data;
    if neg {
        if equal {
            return Err(ScriptError::assertion(format!(
                "{left} and {right} do not differ"
            )));
        }
        return Ok(());
    }
    if equal {
        return Ok(());
    }
    let left_text = String::from_utf8_lossy(&left_data);
    if ts.params().update_scripts
        && matches!(left, "stdout" | "stderr")
        && ts.record_update(&right_path, &left_text)
    {
        return Ok(());
    }
    let diff = line_diff(&left_text, &String::from_utf8_lossy(&right_data));
    ts.logf(format!("[diff -{left} +{right}]\n{diff}"));
    Err(ScriptError::assertion(format!("{left} and {right} differ")))
}

/// Cells in the LCS table beyond which the diff falls back to listing both
/// texts in full.
const DIFF_LIMIT: usize = 4_000_000;

/// Line-oriented diff: `-` lines only in `old`, `+` lines only in `new`.
fn line_diff(old: &str, new: &str) -> String {
    let old: Vec<&str> = old.lines().collect();
    let new: Vec<&str> = new.lines().collect();
    let mut out = String::new();
    if old.len().saturating_mul(new.len()) > DIFF_LIMIT {
        for line in &old {
            out.push_str(&format!("-{line}\n"));
        }
        for line in &new {
            out.push_str(&format!("+{line}\n"));
        }
        return out;
    }

    // lcs[i][j] = length of the longest common subsequence of old[i..], new[j..]
    let mut lcs = vec![vec![0usize; new.len() + 1]; old.len() + 1];
    for i in (0..old.len()).rev() {
        for j in (0..new.len()).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }
    let (mut i, mut j) = (0, 0);
    while i < old.len() || j < new.len() {
        if i < old.len() && j < new.len() && old[i] == new[j] {
            out.push_str(&format!(" {}\n", old[i]));
            i += 1;
            j += 1;
        } else if i < old.len() && (j == new.len() || lcs[i + 1][j] >= lcs[i][j + 1]) {
            out.push_str(&format!("-{}\n", old[i]));
            i += 1;
        } else {
            out.push_str(&format!("+{}\n", new[j]));
            j += 1;
        }
    }
    out
}

fn cmd_cp(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    if neg {
        return Err(unsupported("cp"));
    }
    let Some((dst, sources)) = args.split_last().filter(|(_, sources)| !sources.is_empty()) else {
        return Err(ScriptError::usage("cp src... dst"));
    };
    let dst = ts.mk_abs(dst);
    let dst_is_dir = dst.is_dir();
    if sources.len() > 1 && !dst_is_dir {
        return Err(ScriptError::assertion(format!(
            "cp: destination {} is not a directory",
            dst.display()
        )));
    }
    for source in sources {
        let (src, data, perms) = match source.as_str() {
            "stdout" | "stderr" => (
                PathBuf::from(source),
                ts.read_file(source)?.into_bytes(),
                None,
            ),
            _ => {
                let src = ts.mk_abs(source);
                let data = fs::read(&src).map_err(|err| ScriptError::io("read", &src, err))?;
                let perms = fs::metadata(&src)
                    .map_err(|err| ScriptError::io("stat", &src, err))?
                    .permissions();
                (src, data, Some(perms))
            }
        };
        let target = match (dst_is_dir, src.file_name()) {
            (true, Some(base)) => dst.join(base),
            _ => dst.clone(),
        };
        fs::write(&target, data).map_err(|err| ScriptError::io("write", &target, err))?;
        if let Some(perms) = perms {
            fs::set_permissions(&target, perms)
                .map_err(|err| ScriptError::io("chmod", &target, err))?;
        }
    }
    Ok(())
}

/// Print variables, or set `KEY=VALUE` pairs.
fn cmd_env(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    if neg {
        return Err(unsupported("env"));
    }
    if args.is_empty() {
        ts.dump_env();
        return Ok(());
    }
    for arg in args {
        match arg.split_once('=') {
            Some(("", _)) => {
                return Err(ScriptError::usage("env [key[=value]...]"));
            }
            Some((key, value)) => ts.setenv(key, value),
            None => {
                let value = ts.getenv(arg);
                ts.logf(format!("{arg}={value}"));
            }
        }
    }
    Ok(())
}

/// Split a trailing `&` or `&name&` off a command line.
fn background_marker(arg: &str) -> Option<Option<String>> {
    if arg == "&" {
        return Some(None);
    }
    let name = arg.strip_prefix('&')?.strip_suffix('&')?;
    (!name.is_empty()).then(|| Some(name.to_string()))
}

fn cmd_exec(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    let usage = || ScriptError::usage("exec program [args...] [&]");
    let Some((last, _)) = args.split_last() else {
        return Err(usage());
    };
    if let Some(name) = background_marker(last) {
        let [program, rest @ ..] = &args[..args.len() - 1] else {
            return Err(usage());
        };
        return ts.exec_background(name, program, rest, neg);
    }

    let output = ts.exec(&args[0], &args[1..])?;
    match output.status {
        Ok(status) if status.success() => {
            if neg {
                return Err(ScriptError::assertion("unexpected command success"));
            }
        }
        Ok(status) => {
            ts.logf(format!("[{}]", describe_status(&status)));
            if !neg {
                return Err(ScriptError::assertion("unexpected command failure"));
            }
        }
        Err(err @ (ProcessError::TimedOut | ProcessError::Cancelled)) => {
            ts.logf(format!("[{err}]"));
            return Err(ScriptError::assertion("test timed out while running command"));
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

fn cmd_exists(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    let (readonly, files) = match args.split_first() {
        Some((flag, rest)) if flag == "-readonly" => (true, rest),
        _ => (false, args),
    };
    if files.is_empty() {
        return Err(ScriptError::usage("exists [-readonly] file..."));
    }
    for file in files {
        let path = ts.mk_abs(file);
        match (fs::metadata(&path), neg) {
            (Ok(metadata), true) => {
                let what = if metadata.is_dir() { "directory" } else { "file" };
                return Err(ScriptError::assertion(format!(
                    "{what} {} unexpectedly exists",
                    path.display()
                )));
            }
            (Err(_), false) => {
                return Err(ScriptError::assertion(format!(
                    "{} does not exist",
                    path.display()
                )));
            }
            (Ok(metadata), false) if readonly && !metadata.permissions().readonly() => {
                return Err(ScriptError::assertion(format!(
                    "{} exists but is writable",
                    path.display()
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

fn cmd_grep(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    match_output(ts, neg, args, "grep")
}

fn cmd_stdout(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    match_output(ts, neg, args, "stdout")
}

fn cmd_stderr(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    match_output(ts, neg, args, "stderr")
}

/// Shared body of `stdout`, `stderr` and `grep`.
fn match_output(ts: &mut TestScript, neg: bool, args: &[String], name: &str) -> Result<()> {
    let mut args = args;
    let mut count = None;
    if let Some(value) = args.first().and_then(|arg| arg.strip_prefix("-count=")) {
        if neg {
            return Err(ScriptError::Syntax(
                "cannot use -count= with negated match".to_string(),
            ));
        }
        let n: usize = value
            .parse()
            .map_err(|err| ScriptError::Syntax(format!("bad -count=: {err}")))?;
        if n < 1 {
            return Err(ScriptError::Syntax(
                "bad -count=: must be at least 1".to_string(),
            ));
        }
        count = Some(n);
        args = &args[1..];
    }

    let is_grep = name == "grep";
    let want = if is_grep { 2 } else { 1 };
    if args.len() != want {
        let file = if is_grep { " file" } else { "" };
        return Err(ScriptError::usage(format!(
            "{name} [-count=N] 'pattern'{file}"
        )));
    }
    let pattern = &args[0];
    let re = Regex::new(&format!("(?m){pattern}"))?;
    let (source, text) = if is_grep {
        (args[1].as_str(), ts.read_file(&args[1])?)
    } else {
        (name, ts.read_file(name)?)
    };

    if neg {
        if let Some(found) = re.find(&text) {
            if is_grep {
                ts.logf(format!("[{source}]\n{text}"));
            }
            return Err(ScriptError::assertion(format!(
                "unexpected match for `{pattern}` found in {source}: {}",
                found.as_str()
            )));
        }
        return Ok(());
    }
    if !re.is_match(&text) {
        if is_grep {
            ts.logf(format!("[{source}]\n{text}"));
        }
        return Err(ScriptError::assertion(format!(
            "no match for `{pattern}` found in {source}"
        )));
    }
    if let Some(n) = count {
        let have = re.find_iter(&text).count();
        if have != n {
            return Err(ScriptError::assertion(format!(
                "have {have} matches for `{pattern}`, want {n}"
            )));
        }
    }
    Ok(())
}

fn cmd_mkdir(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    if neg {
        return Err(unsupported("mkdir"));
    }
    if args.is_empty() {
        return Err(ScriptError::usage("mkdir dir..."));
    }
    for dir in args {
        let path = ts.mk_abs(dir);
        fs::create_dir_all(&path).map_err(|err| ScriptError::io("mkdir", &path, err))?;
    }
    Ok(())
}

fn cmd_rm(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    if neg {
        return Err(unsupported("rm"));
    }
    if args.is_empty() {
        return Err(ScriptError::usage("rm file..."));
    }
    for file in args {
        let path = ts.mk_abs(file);
        let removed = match fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.is_dir() => crate::workdir::remove_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        };
        removed.map_err(|err| ScriptError::io("remove", &path, err))?;
    }
    Ok(())
}

fn cmd_skip(_ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    if neg {
        return Err(unsupported("skip"));
    }
    match args {
        [] => Err(ScriptError::Skip(String::new())),
        [reason] => Err(ScriptError::Skip(reason.clone())),
        _ => Err(ScriptError::usage("skip [msg]")),
    }
}

fn cmd_stdin(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    if neg {
        return Err(unsupported("stdin"));
    }
    let [file] = args else {
        return Err(ScriptError::usage("stdin filename"));
    };
    let text = ts.read_file(file)?;
    ts.set_stdin(text);
    Ok(())
}

fn cmd_stop(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    if neg {
        return Err(unsupported("stop"));
    }
    match args {
        [] => ts.logf("stop"),
        [reason] => ts.logf(format!("stop: {reason}")),
        _ => return Err(ScriptError::usage("stop [msg]")),
    }
    ts.stop();
    Ok(())
}

/// `symlink file -> target`; the target is taken literally, relative to the
/// link's directory.
fn cmd_symlink(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    if neg {
        return Err(unsupported("symlink"));
    }
    let [link, arrow, target] = args else {
        return Err(ScriptError::usage("symlink file -> target"));
    };
    if arrow != "->" {
        return Err(ScriptError::usage("symlink file -> target"));
    }
    let link = ts.mk_abs(link);
    make_symlink(Path::new(target), &link).map_err(|err| ScriptError::io("symlink", &link, err))
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    let resolved = link.parent().map(|dir| dir.join(target));
    if resolved.is_some_and(|path| path.is_dir()) {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}

#[cfg(not(any(unix, windows)))]
fn make_symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks are not supported"))
}

fn cmd_unquote(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    if neg {
        return Err(unsupported("unquote"));
    }
    for file in args {
        let path = ts.mk_abs(file);
        let data = fs::read(&path).map_err(|err| ScriptError::io("read", &path, err))?;
        let unquoted = archive::unquote(&data)?;
        fs::write(&path, unquoted).map_err(|err| ScriptError::io("write", &path, err))?;
    }
    Ok(())
}

/// `wait` reconciles every background process; `wait name...` only the named
/// ones. `wait ok !bad` expects `bad` to fail, and `! wait name...` expects
/// each named process to fail.
fn cmd_wait(ts: &mut TestScript, neg: bool, args: &[String]) -> Result<()> {
    if neg && args.is_empty() {
        return Err(ScriptError::usage("! wait name..."));
    }
    ts.wait_background(args, neg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted_for_lookup() {
        let names: Vec<&str> = builtin_names().collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
        assert!(builtin("exec").is_some());
        assert!(builtin("wait").is_some());
        assert!(builtin("go").is_none());
    }

    #[test]
    fn parses_background_markers() {
        assert_eq!(background_marker("&"), Some(None));
        assert_eq!(
            background_marker("&server&"),
            Some(Some("server".to_string()))
        );
        assert_eq!(background_marker("&&"), None);
        assert_eq!(background_marker("arg"), None);
    }

    #[test]
    fn diff_marks_changed_lines() {
        let diff = line_diff("a\nb\nc\n", "a\nB\nc\nd\n");
        assert_eq!(diff, " a\n-b\n+B\n c\n+d\n");
    }

    #[test]
    fn diff_of_equal_texts_has_only_context() {
        assert_eq!(line_diff("x\ny\n", "x\ny\n"), " x\n y\n");
    }
}
