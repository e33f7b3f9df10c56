//! Line tokenizer and environment expansion for script directives.
use crate::error::{Result, ScriptError};

/// Suffix on a variable name asking for its regex-escaped value.
const REGEX_QUOTE_SUFFIX: &str = "@R";

/// Split a directive line into words.
///
/// Words are separated by spaces, tabs and carriage returns; an unquoted `#`
/// ends the line. Single quotes disable splitting and expansion, and a doubled
/// quote inside a quoted chunk is a literal quote (`'don''t'` is `don't`).
/// Expansion results are never re-split.
pub fn tokenize<F>(line: &str, lookup: F) -> Result<Vec<String>>
where
    F: Fn(&str) -> String,
{
    let bytes = line.as_bytes();
    let mut args = Vec::new();
    let mut arg = String::new();
    // Start of the pending chunk, if any.
    let mut start: Option<usize> = None;
    let mut quoted = false;
    let mut i = 0;
    loop {
        let at_end = i >= bytes.len();
        if !quoted && (at_end || matches!(bytes[i], b' ' | b'\t' | b'\r' | b'#')) {
            if let Some(chunk_start) = start.take() {
                arg.push_str(&expand(&line[chunk_start..i], &lookup));
                args.push(std::mem::take(&mut arg));
            }
            if at_end || bytes[i] == b'#' {
                break;
            }
            i += 1;
            continue;
        }
        if at_end {
            return Err(ScriptError::UnterminatedQuote);
        }
        if bytes[i] == b'\'' {
            if !quoted {
                if let Some(chunk_start) = start {
                    arg.push_str(&expand(&line[chunk_start..i], &lookup));
                }
                start = Some(i + 1);
                quoted = true;
                i += 1;
                continue;
            }
            let chunk_start = start.unwrap_or(i);
            arg.push_str(&line[chunk_start..i]);
            if bytes.get(i + 1) == Some(&b'\'') {
                start = Some(i + 1);
                i += 2;
                continue;
            }
            start = Some(i + 1);
            quoted = false;
            i += 1;
            continue;
        }
        if start.is_none() {
            start = Some(i);
        }
        i += 1;
    }
    Ok(args)
}

/// Replace `$name` and `${name}` references using `lookup`.
///
/// `${name@R}` substitutes the value of `name` with regex metacharacters
/// escaped. A `$` not followed by a name is kept; `${}` is dropped.
pub fn expand<F>(s: &str, lookup: F) -> String
where
    F: Fn(&str) -> String,
{
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut copied = 0;
    let mut j = 0;
    while j < bytes.len() {
        if bytes[j] == b'$' && j + 1 < bytes.len() {
            out.push_str(&s[copied..j]);
            let (name, width) = shell_name(&s[j + 1..]);
            if name.is_empty() && width > 0 {
                // Invalid syntax such as `${}`; eat it.
            } else if name.is_empty() {
                out.push('$');
            } else {
                out.push_str(&resolve(name, &lookup));
            }
            j += width;
            copied = j + 1;
        }
        j += 1;
    }
    out.push_str(&s[copied..]);
    out
}

fn resolve<F>(name: &str, lookup: &F) -> String
where
    F: Fn(&str) -> String,
{
    match name.strip_suffix(REGEX_QUOTE_SUFFIX) {
        Some(base) => regex::escape(&lookup(base)),
        None => lookup(name),
    }
}

/// Name following a `$` and the number of bytes it occupies.
fn shell_name(s: &str) -> (&str, usize) {
    let bytes = s.as_bytes();
    if bytes[0] == b'{' {
        if bytes.len() > 2 && is_special_var(bytes[1]) && bytes[2] == b'}' {
            return (&s[1..2], 3);
        }
        return match s[1..].find('}') {
            Some(0) => ("", 2),
            Some(end) => (&s[1..end + 1], end + 2),
            // No closing brace: eat only the "${".
            None => ("", 1),
        };
    }
    if is_special_var(bytes[0]) {
        return (&s[0..1], 1);
    }
    let end = bytes
        .iter()
        .position(|&byte| !(byte == b'_' || byte.is_ascii_alphanumeric()))
        .unwrap_or(bytes.len());
    (&s[..end], end)
}

fn is_special_var(byte: u8) -> bool {
    matches!(byte, b'*' | b'#' | b'$' | b'@' | b'!' | b'?' | b'-') || byte.is_ascii_digit()
}
