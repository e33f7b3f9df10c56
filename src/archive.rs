//! Text archive codec for script files.
//!
//! A script is a comment section followed by file sections, each introduced by
//! a `-- NAME --` marker line and running until the next marker or the end of
//! input. The comment section holds the directives; the file sections are the
//! initial contents of the work directory.
use crate::error::ArchiveError;
use std::fs;
use std::path::Path;

const MARKER: &[u8] = b"-- ";
const NEWLINE_MARKER: &[u8] = b"\n-- ";
const MARKER_END: &[u8] = b" --";

/// Single named file section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    pub name: String,
    pub data: Vec<u8>,
}

/// Parsed script file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Archive {
    pub comment: Vec<u8>,
    pub files: Vec<ArchiveFile>,
}

/// Position of a marker line found while scanning.
struct Marker<'a> {
    name: &'a [u8],
    offset: usize,
    after: &'a [u8],
}

impl Archive {
    pub fn parse(data: &[u8]) -> Result<Archive, ArchiveError> {
        let mut archive = Archive::default();
        let (comment, mut next) = find_file_marker(data, 0);
        archive.comment = fix_newline(comment);
        while let Some(marker) = next {
            let name = marker_name(&marker)?;
            let consumed = data.len() - marker.after.len();
            let (body, following) = find_file_marker(marker.after, consumed);
            archive.files.push(ArchiveFile {
                name,
                data: fix_newline(body),
            });
            next = following;
        }
        Ok(archive)
    }

    pub fn parse_file(path: &Path) -> Result<Archive, ArchiveError> {
        let data = fs::read(path).map_err(|source| ArchiveError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Archive::parse(&data)
    }

    /// Serialize the archive, adding a final newline to any section missing one.
    pub fn format(&self) -> Vec<u8> {
        let mut out = fix_newline(&self.comment);
        for file in &self.files {
            out.extend_from_slice(MARKER);
            out.extend_from_slice(file.name.as_bytes());
            out.extend_from_slice(MARKER_END);
            out.push(b'\n');
            out.extend_from_slice(&fix_newline(&file.data));
        }
        out
    }

    pub fn file(&self, name: &str) -> Option<&ArchiveFile> {
        self.files.iter().find(|file| file.name == name)
    }

    /// Replace the data of every section named `name`.
    ///
    /// Returns `false` when no section carries that name.
    pub fn replace(&mut self, name: &str, data: &[u8]) -> bool {
        let mut found = false;
        for file in self.files.iter_mut().filter(|file| file.name == name) {
            file.data = data.to_vec();
            found = true;
        }
        found
    }
}

/// Reports whether `data` contains a line that would be read back as a marker.
pub fn needs_quote(data: &[u8]) -> bool {
    find_file_marker(data, 0).1.is_some()
}

/// Prefix every line with `>` so the data can be stored as a section safely.
pub fn quote(data: &[u8]) -> Result<Vec<u8>, ArchiveError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data.last() != Some(&b'\n') {
        return Err(ArchiveError::NoFinalNewline);
    }
    if std::str::from_utf8(data).is_err() {
        return Err(ArchiveError::InvalidUtf8);
    }
    let mut out = Vec::with_capacity(data.len() + data.len() / 16 + 1);
    let mut prev = b'\n';
    for &byte in data {
        if prev == b'\n' {
            out.push(b'>');
        }
        out.push(byte);
        prev = byte;
    }
    Ok(out)
}

pub fn unquote(data: &[u8]) -> Result<Vec<u8>, ArchiveError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data[0] != b'>' || data.last() != Some(&b'\n') {
        return Err(ArchiveError::NotQuoted);
    }
    let mut out = Vec::with_capacity(data.len());
    let mut at_line_start = true;
    for &byte in data {
        if at_line_start && byte == b'>' {
            at_line_start = false;
            continue;
        }
        at_line_start = byte == b'\n';
        out.push(byte);
    }
    Ok(out)
}

/// Split `data` at the first marker line.
///
/// `base` is the offset of `data` within the whole input, used for errors.
fn find_file_marker(data: &[u8], base: usize) -> (&[u8], Option<Marker<'_>>) {
    let mut i = 0;
    loop {
        if let Some((name, after)) = is_marker(&data[i..]) {
            return (
                &data[..i],
                Some(Marker {
                    name,
                    offset: base + i,
                    after,
                }),
            );
        }
        match find(&data[i..], NEWLINE_MARKER) {
            Some(j) => i += j + 1,
            None => return (data, None),
        }
    }
}

fn is_marker(data: &[u8]) -> Option<(&[u8], &[u8])> {
    if !data.starts_with(MARKER) {
        return None;
    }
    let (line, after) = match data.iter().position(|&byte| byte == b'\n') {
        Some(i) => (&data[..i], &data[i + 1..]),
        None => (data, &data[data.len()..]),
    };
    if line.len() < MARKER.len() + MARKER_END.len() || !line.ends_with(MARKER_END) {
        return None;
    }
    let name = line[MARKER.len()..line.len() - MARKER_END.len()].trim_ascii();
    if name.is_empty() {
        return None;
    }
    Some((name, after))
}

fn marker_name(marker: &Marker<'_>) -> Result<String, ArchiveError> {
    std::str::from_utf8(marker.name)
        .map(str::to_string)
        .map_err(|_| ArchiveError::InvalidName {
            offset: marker.offset,
        })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn fix_newline(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    if !out.is_empty() && out.last() != Some(&b'\n') {
        out.push(b'\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "comment line\nexec echo hi\n-- a.txt --\nhello\n-- dir/b.txt --\nworld\n";

    #[test]
    fn parses_comment_and_sections_in_order() {
        let archive = Archive::parse(SCRIPT.as_bytes()).expect("parse");
        assert_eq!(archive.comment, b"comment line\nexec echo hi\n");
        let names: Vec<&str> = archive.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "dir/b.txt"]);
        assert_eq!(archive.files[1].data, b"world\n");
    }

    #[test]
    fn format_is_left_inverse_of_parse() {
        let archive = Archive::parse(SCRIPT.as_bytes()).expect("parse");
        assert_eq!(archive.format(), SCRIPT.as_bytes());

        let empty_sections = "-- a --\n-- b --\n";
        let archive = Archive::parse(empty_sections.as_bytes()).expect("parse");
        assert_eq!(archive.comment, b"");
        assert_eq!(archive.files.len(), 2);
        assert_eq!(archive.format(), empty_sections.as_bytes());
    }

    #[test]
    fn marker_names_are_trimmed_and_empty_names_ignored() {
        let archive = Archive::parse(b"--   spaced.txt   --\nx\n--  --\ny\n").expect("parse");
        assert_eq!(archive.files.len(), 1);
        assert_eq!(archive.files[0].name, "spaced.txt");
        assert_eq!(archive.files[0].data, b"x\n--  --\ny\n");
    }

    #[test]
    fn missing_final_newline_is_added() {
        let archive = Archive::parse(b"-- f --\nno newline").expect("parse");
        assert_eq!(archive.files[0].data, b"no newline\n");
    }

    #[test]
    fn non_utf8_marker_name_is_a_parse_error() {
        let err = Archive::parse(b"ok\n-- \xff --\n").expect_err("invalid name");
        assert!(matches!(err, ArchiveError::InvalidName { offset: 3 }));
    }

    #[test]
    fn replace_rewrites_all_matching_sections() {
        let mut archive = Archive::parse(b"-- out --\n1\n-- out --\n2\n-- other --\n3\n").unwrap();
        assert!(archive.replace("out", b"new\n"));
        assert_eq!(archive.files[0].data, b"new\n");
        assert_eq!(archive.files[1].data, b"new\n");
        assert_eq!(archive.files[2].data, b"3\n");
        assert!(!archive.replace("missing", b""));
    }

    #[test]
    fn needs_quote_detects_marker_lines() {
        assert!(!needs_quote(b"plain\ntext\n"));
        assert!(needs_quote(b"-- inner --\n"));
        assert!(needs_quote(b"before\n-- inner --\nafter\n"));
        assert!(!needs_quote(b"x -- inner --\n"));
    }

    #[test]
    fn quote_then_unquote_restores_marker_content() {
        let data = b"before\n-- inner --\n\nafter\n";
        assert!(needs_quote(data));
        let quoted = quote(data).expect("quote");
        assert_eq!(quoted, b">before\n>-- inner --\n>\n>after\n");
        assert!(!needs_quote(&quoted));
        assert_eq!(unquote(&quoted).expect("unquote"), data);
    }

    #[test]
    fn quote_rejects_unrepresentable_data() {
        assert!(matches!(quote(b"-- x --"), Err(ArchiveError::NoFinalNewline)));
        assert!(matches!(quote(b"\xff\n"), Err(ArchiveError::InvalidUtf8)));
        assert!(matches!(unquote(b"plain\n"), Err(ArchiveError::NotQuoted)));
    }
}
