use std::fmt;
use std::path::{Path, PathBuf};

use veritas_core::{ChangeType, DiffHunk, VeritasError};

/// A complete diff for a single file, containing one or more hunks.
///
/// # Examples
///
/// ```
/// use veritas_difflens::parser::{parse_unified_diff, FileDiff};
///
/// let diff = "diff --git a/hello.py b/hello.py\n\
///             --- a/hello.py\n\
///             +++ b/hello.py\n\
///             @@ -1,2 +1,3 @@\n\
///              def main():\n\
///             +    print(\"hello\")\n\
///                  pass\n";
/// let files = parse_unified_diff(diff).unwrap();
/// assert_eq!(files.len(), 1);
/// assert_eq!(files[0].path().to_str(), Some("hello.py"));
/// assert_eq!(files[0].added_lines(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    /// Path in the base version.
    pub old_path: PathBuf,
    /// Path in the head version.
    pub new_path: PathBuf,
    /// Parsed hunks for this file.
    pub hunks: Vec<DiffHunk>,
    /// Whether this is a newly created file.
    pub is_new_file: bool,
    /// Whether this file was deleted.
    pub is_deleted_file: bool,
    /// Whether this file was renamed.
    pub is_rename: bool,
}

impl FileDiff {
    fn empty() -> Self {
        Self {
            old_path: PathBuf::new(),
            new_path: PathBuf::new(),
            hunks: Vec::new(),
            is_new_file: false,
            is_deleted_file: false,
            is_rename: false,
        }
    }

    /// The path claims should refer to: the head path, or the base path for deletions.
    pub fn path(&self) -> &Path {
        if self.is_deleted_file {
            &self.old_path
        } else {
            &self.new_path
        }
    }

    /// Number of `+` lines across all hunks.
    pub fn added_lines(&self) -> usize {
        self.count_lines('+')
    }

    /// Number of `-` lines across all hunks.
    pub fn removed_lines(&self) -> usize {
        self.count_lines('-')
    }

    fn count_lines(&self, marker: char) -> usize {
        self.hunks
            .iter()
            .flat_map(|h| h.content.lines())
            .filter(|l| l.starts_with(marker))
            .count()
    }

    /// Status word used in prompt headers.
    pub fn status(&self) -> &'static str {
        if self.is_new_file {
            "added"
        } else if self.is_deleted_file {
            "deleted"
        } else if self.is_rename {
            "renamed"
        } else {
            "modified"
        }
    }
}

impl fmt::Display for FileDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, +{} -{})",
            self.path().display(),
            self.status(),
            self.added_lines(),
            self.removed_lines()
        )
    }
}

/// Parse a unified diff string (as returned by the GitHub diff media type or
/// `git diff`) into structured [`FileDiff`] entries.
///
/// Handles new, deleted and renamed files. Binary sections are dropped.
/// Patches without a `diff --git` line start a file at the `---` header.
///
/// # Errors
///
/// Returns [`VeritasError::Parse`] if a hunk header is malformed.
///
/// # Examples
///
/// ```
/// use veritas_difflens::parser::parse_unified_diff;
///
/// let files = parse_unified_diff("").unwrap();
/// assert!(files.is_empty());
/// ```
pub fn parse_unified_diff(input: &str) -> Result<Vec<FileDiff>, VeritasError> {
    let mut state = ParseState::default();
    for line in input.lines() {
        state.feed(line)?;
    }
    Ok(state.finish())
}

#[derive(Default)]
struct ParseState {
    files: Vec<FileDiff>,
    file: Option<FileDiff>,
    hunk: Option<DiffHunk>,
    remaining: (u32, u32),
    binary: bool,
}

impl ParseState {
    fn feed(&mut self, line: &str) -> Result<(), VeritasError> {
        if line.starts_with("diff --git ") {
            self.close_file();
            self.file = Some(FileDiff::empty());
            return Ok(());
        }
        if self.body_line(line) {
            return Ok(());
        }
        if line.starts_with("--- ") {
            // Patches without `diff --git` lines: a new `---` after hunks starts the next file.
            let has_hunks = self.file.as_ref().is_some_and(|f| !f.hunks.is_empty())
                || self.hunk.is_some();
            if self.file.is_none() || has_hunks {
                self.close_file();
                self.file = Some(FileDiff::empty());
            }
        }
        if self.file.is_none() {
            return Ok(());
        }
        if line.starts_with("@@ ") {
            self.close_hunk();
            let hunk = self.open_hunk(line)?;
            self.remaining = (hunk.old_lines, hunk.new_lines);
            self.hunk = Some(hunk);
            return Ok(());
        }
        self.header(line);
        Ok(())
    }

    /// Consume `line` as hunk content if a hunk is open and expects it.
    fn body_line(&mut self, line: &str) -> bool {
        let Some(hunk) = self.hunk.as_mut() else {
            return false;
        };
        if line.starts_with('\\') {
            return true;
        }
        let (old, new) = &mut self.remaining;
        let expecting = *old > 0 || *new > 0;
        let marker = line.chars().next();
        let accept = match marker {
            Some('-') if *old > 0 => {
                *old -= 1;
                true
            }
            Some('+') if *new > 0 => {
                *new -= 1;
                true
            }
            Some(' ') | None if expecting => {
                *old = old.saturating_sub(1);
                *new = new.saturating_sub(1);
                true
            }
            // Lenient: stray +/-/context lines after the counted range still
            // belong to the hunk unless they look like a file header.
            Some('+' | '-' | ' ') => {
                !line.starts_with("--- ") && !line.starts_with("+++ ")
            }
            _ => false,
        };
        if accept {
            hunk.content.push_str(if line.is_empty() { " " } else { line });
            hunk.content.push('\n');
        }
        accept
    }

    fn header(&mut self, line: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if line.starts_with("Binary files ") && line.ends_with(" differ") {
            self.binary = true;
        } else if line.starts_with("GIT binary patch") {
            self.binary = true;
        } else if line.starts_with("new file mode") {
            file.is_new_file = true;
        } else if line.starts_with("deleted file mode") {
            file.is_deleted_file = true;
        } else if let Some(from) = line.strip_prefix("rename from ") {
            file.is_rename = true;
            file.old_path = PathBuf::from(from.trim_matches('"'));
        } else if let Some(to) = line.strip_prefix("rename to ") {
            file.is_rename = true;
            file.new_path = PathBuf::from(to.trim_matches('"'));
        } else if let Some(path) = line.strip_prefix("--- ") {
            file.old_path = parse_path(path);
            if path == "/dev/null" {
                file.is_new_file = true;
            }
        } else if let Some(path) = line.strip_prefix("+++ ") {
            file.new_path = parse_path(path);
            if path == "/dev/null" {
                file.is_deleted_file = true;
            }
        }
    }

    fn open_hunk(&self, line: &str) -> Result<DiffHunk, VeritasError> {
        let (old_start, old_lines, new_start, new_lines) = parse_hunk_header(line)?;
        let (file_path, change_type) = match self.file.as_ref() {
            Some(file) => {
                let change_type = if file.is_new_file || old_lines == 0 {
                    ChangeType::Add
                } else if file.is_deleted_file || new_lines == 0 {
                    ChangeType::Delete
                } else {
                    ChangeType::Modify
                };
                (file.path().to_path_buf(), change_type)
            }
            None => (PathBuf::new(), ChangeType::Modify),
        };
        Ok(DiffHunk {
            file_path,
            old_start,
            old_lines,
            new_start,
            new_lines,
            content: String::new(),
            change_type,
        })
    }

    fn close_hunk(&mut self) {
        if let (Some(hunk), Some(file)) = (self.hunk.take(), self.file.as_mut()) {
            file.hunks.push(hunk);
        }
    }

    fn close_file(&mut self) {
        self.close_hunk();
        if let Some(file) = self.file.take() {
            if !self.binary {
                self.files.push(file);
            }
        }
        self.binary = false;
    }

    fn finish(mut self) -> Vec<FileDiff> {
        self.close_file();
        self.files
    }
}

fn parse_path(raw: &str) -> PathBuf {
    // Strip trailing tab-separated timestamps emitted by plain `diff -u`.
    let raw = raw.split('\t').next().unwrap_or(raw);
    let normalized = raw.trim_matches('"');
    if normalized == "/dev/null" {
        return PathBuf::from("/dev/null");
    }
    let stripped = normalized
        .strip_prefix("a/")
        .or_else(|| normalized.strip_prefix("b/"))
        .unwrap_or(normalized);
    PathBuf::from(stripped)
}

fn parse_hunk_header(line: &str) -> Result<(u32, u32, u32, u32), VeritasError> {
    let invalid = || VeritasError::Parse(format!("invalid hunk header: {line}"));
    let inner = line
        .strip_prefix("@@ ")
        .and_then(|s| s.find(" @@").map(|end| &s[..end]))
        .ok_or_else(invalid)?;

    let (old, new) = inner.split_once(' ').ok_or_else(invalid)?;
    let old = old.strip_prefix('-').ok_or_else(invalid)?;
    let new = new.strip_prefix('+').ok_or_else(invalid)?;

    let (old_start, old_lines) = parse_range(old, line)?;
    let (new_start, new_lines) = parse_range(new, line)?;
    Ok((old_start, old_lines, new_start, new_lines))
}

fn parse_range(range: &str, context: &str) -> Result<(u32, u32), VeritasError> {
    let number = |s: &str| {
        s.parse::<u32>()
            .map_err(|_| VeritasError::Parse(format!("invalid range in: {context}")))
    };
    match range.split_once(',') {
        Some((start, count)) => Ok((number(start)?, number(count)?)),
        None => Ok((number(range)?, 1)),
    }
}
