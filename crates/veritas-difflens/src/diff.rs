use std::fmt::Write as _;
use std::path::Path;

use veritas_core::{DiffHunk, RefPair, VeritasError};

use crate::parser::{parse_unified_diff, FileDiff};

/// The per-file diff of a pull request plus the refs it was taken between.
///
/// Immutable once built for a run.
///
/// # Examples
///
/// ```
/// use veritas_core::RefPair;
/// use veritas_difflens::Diff;
///
/// let raw = "diff --git a/a.py b/a.py\n--- a/a.py\n+++ b/a.py\n@@ -1 +1,2 @@\n x = 1\n+y = 2\n";
/// let diff = Diff::parse(raw, RefPair { base: "main".into(), head: "abc123".into() }).unwrap();
/// assert_eq!(diff.files().len(), 1);
/// assert!(diff.to_prompt_text(10_000).contains("+y = 2"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Diff {
    files: Vec<FileDiff>,
    refs: RefPair,
}

impl Diff {
    /// Wrap already-parsed files.
    pub fn new(files: Vec<FileDiff>, refs: RefPair) -> Self {
        Self { files, refs }
    }

    /// Parse unified diff text taken between `refs`.
    ///
    /// # Errors
    ///
    /// Returns [`VeritasError::Parse`] on a malformed hunk header.
    pub fn parse(raw: &str, refs: RefPair) -> Result<Self, VeritasError> {
        Ok(Self::new(parse_unified_diff(raw)?, refs))
    }

    /// Files in diff order.
    pub fn files(&self) -> &[FileDiff] {
        &self.files
    }

    /// Base and head refs.
    pub fn refs(&self) -> &RefPair {
        &self.refs
    }

    /// Every hunk, in diff order.
    pub fn hunks(&self) -> impl Iterator<Item = &DiffHunk> {
        self.files.iter().flat_map(|f| f.hunks.iter())
    }

    /// Returns `true` if the diff touches `path`.
    pub fn touches(&self, path: &Path) -> bool {
        self.files.iter().any(|f| f.path() == path)
    }

    /// Returns `true` when no reviewable file is left.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Replace the file list, keeping the refs. Used after filtering.
    pub fn with_files(self, files: Vec<FileDiff>) -> Self {
        Self {
            files,
            refs: self.refs,
        }
    }

    /// Consume the diff, returning its files.
    pub fn into_files(self) -> Vec<FileDiff> {
        self.files
    }

    /// Render the diff for a model prompt, at most `max_chars` characters.
    ///
    /// Whole files are dropped from the end first; only when the first file
    /// alone is too long is it cut mid-way. A trailing note says what was left
    /// out.
    pub fn to_prompt_text(&self, max_chars: usize) -> String {
        let blocks: Vec<String> = self.files.iter().map(render_file).collect();
        let total: usize = blocks.iter().map(|b| b.chars().count()).sum();
        if total <= max_chars {
            return blocks.concat();
        }

        let mut out = String::new();
        let mut used = 0;
        let mut included = 0;
        for block in &blocks {
            let len = block.chars().count();
            if used + len > max_chars {
                break;
            }
            out.push_str(block);
            used += len;
            included += 1;
        }
        if included == 0 {
            if let Some(first) = blocks.first() {
                out.extend(first.chars().take(max_chars));
                out.push('\n');
                included = 1;
            }
        }
        let omitted = blocks.len() - included;
        if omitted > 0 {
            let _ = writeln!(out, "... (diff truncated, {omitted} more file(s) omitted)");
        } else {
            out.push_str("... (diff truncated)\n");
        }
        out
    }
}

fn render_file(file: &FileDiff) -> String {
    let mut out = String::new();
    let old = if file.is_new_file {
        "/dev/null".to_string()
    } else {
        format!("a/{}", file.old_path.display())
    };
    let new = if file.is_deleted_file {
        "/dev/null".to_string()
    } else {
        format!("b/{}", file.new_path.display())
    };
    let _ = writeln!(out, "--- {old}");
    let _ = writeln!(out, "+++ {new}");
    for hunk in &file.hunks {
        let _ = writeln!(
            out,
            "@@ -{},{} +{},{} @@",
            hunk.old_start, hunk.old_lines, hunk.new_start, hunk.new_lines
        );
        out.push_str(&hunk.content);
    }
    out
}
