//! Drop files the model should never see before drafting.
//!
//! Lock files, generated code, vendored dependencies, minified bundles and
//! files matching configured patterns only cost prompt space and invite
//! claims nobody can act on.

use std::fmt;
use std::path::{Path, PathBuf};

use veritas_core::ReviewConfig;

use crate::diff::Diff;
use crate::parser::FileDiff;

const LOCK_FILES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "Cargo.lock",
    "pnpm-lock.yaml",
    "poetry.lock",
    "Pipfile.lock",
    "Gemfile.lock",
    "composer.lock",
    "go.sum",
    "uv.lock",
];

const VENDOR_DIRS: &[&str] = &["vendor", "third_party", "node_modules", ".venv", "site-packages"];

const GENERATED_MARKERS: &[&str] = &[
    "// Code generated",
    "# AUTO-GENERATED",
    "@generated",
    "DO NOT EDIT",
];

/// Changed-line count above which a single file is skipped.
const MAX_CHANGED_LINES: usize = 1000;

/// Longest line (in bytes) a hand-written file is expected to have.
const MINIFIED_LINE_BYTES: usize = 500;

/// Files and patterns to skip before sending a diff to the model.
///
/// # Examples
///
/// ```
/// use veritas_difflens::filter::DiffFilter;
///
/// let filter = DiffFilter::default_filter();
/// assert!(filter.should_skip("package-lock.json"));
/// assert!(filter.should_skip("vendor/lib.js"));
/// assert!(!filter.should_skip("src/main.rs"));
/// ```
#[derive(Debug, Clone)]
pub struct DiffFilter {
    skip_patterns: Vec<glob::Pattern>,
    skip_extensions: Vec<String>,
    max_files: usize,
}

impl DiffFilter {
    /// Built-in rules only, no file limit.
    pub fn default_filter() -> Self {
        Self {
            skip_patterns: Vec::new(),
            skip_extensions: Vec::new(),
            max_files: usize::MAX,
        }
    }

    /// Built-in rules plus the patterns, extensions and file limit of `config`.
    ///
    /// Invalid glob patterns are logged and ignored.
    ///
    /// # Examples
    ///
    /// ```
    /// use veritas_core::ReviewConfig;
    /// use veritas_difflens::filter::DiffFilter;
    ///
    /// let config = ReviewConfig {
    ///     skip_patterns: vec!["migrations/**".into()],
    ///     ..ReviewConfig::default()
    /// };
    /// let filter = DiffFilter::from_config(&config);
    /// assert!(filter.should_skip("migrations/0001_init.py"));
    /// assert!(filter.should_skip("Cargo.lock"));
    /// ```
    pub fn from_config(config: &ReviewConfig) -> Self {
        let skip_patterns = config
            .skip_patterns
            .iter()
            .filter_map(|pat| match glob::Pattern::new(pat) {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::warn!(pattern = %pat, error = %e, "ignoring invalid skip pattern");
                    None
                }
            })
            .collect();
        Self {
            skip_patterns,
            skip_extensions: config
                .skip_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_string())
                .collect(),
            max_files: config.max_files.max(1),
        }
    }

    /// Check a single path against the path-based rules.
    pub fn should_skip(&self, path: &str) -> bool {
        self.skip_reason(Path::new(path), "", 0).is_some()
    }

    /// Split `files` into reviewable and skipped ones.
    ///
    /// # Examples
    ///
    /// ```
    /// use veritas_difflens::filter::DiffFilter;
    /// use veritas_difflens::parser::parse_unified_diff;
    ///
    /// let diff = "diff --git a/src/main.rs b/src/main.rs\n\
    ///             --- a/src/main.rs\n\
    ///             +++ b/src/main.rs\n\
    ///             @@ -1,2 +1,3 @@\n\
    ///              line\n\
    ///             +new\n";
    /// let files = parse_unified_diff(diff).unwrap();
    /// let result = DiffFilter::default_filter().filter(files);
    /// assert_eq!(result.kept.len(), 1);
    /// assert!(result.skipped.is_empty());
    /// ```
    pub fn filter(&self, files: Vec<FileDiff>) -> FilterResult {
        let mut result = FilterResult::default();
        for file in files {
            let content: String = file.hunks.iter().map(|h| h.content.as_str()).collect();
            let changed = file.added_lines() + file.removed_lines();
            let reason = self
                .skip_reason(file.path(), &content, changed)
                .or_else(|| (result.kept.len() >= self.max_files).then_some(SkipReason::FileLimit));
            match reason {
                Some(reason) => result.skipped.push(SkippedFile {
                    path: file.path().to_path_buf(),
                    reason,
                }),
                None => result.kept.push(file),
            }
        }
        result
    }

    /// Filter a whole [`Diff`], keeping its refs. Skipped files are logged.
    pub fn apply(&self, diff: Diff) -> Diff {
        let refs = diff.refs().clone();
        let result = self.filter(diff.into_files());
        for skipped in &result.skipped {
            tracing::debug!(path = %skipped.path.display(), reason = %skipped.reason, "skipping file");
        }
        Diff::new(result.kept, refs)
    }

    fn skip_reason(&self, path: &Path, content: &str, changed_lines: usize) -> Option<SkipReason> {
        let path_str = path.to_string_lossy();
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        if LOCK_FILES.contains(&file_name.as_str()) {
            return Some(SkipReason::LockFile);
        }
        if path_str.split('/').any(|part| VENDOR_DIRS.contains(&part)) {
            return Some(SkipReason::VendoredCode);
        }
        if is_minified(&file_name, content) {
            return Some(SkipReason::MinifiedFile);
        }
        if is_generated_by_name(&file_name) || is_generated_by_content(content) {
            return Some(SkipReason::GeneratedFile);
        }
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if self.skip_extensions.iter().any(|s| s == ext) {
                return Some(SkipReason::PatternMatch(format!("*.{ext}")));
            }
        }
        if let Some(pat) = self.skip_patterns.iter().find(|p| p.matches(&path_str)) {
            return Some(SkipReason::PatternMatch(pat.to_string()));
        }
        if changed_lines > MAX_CHANGED_LINES {
            return Some(SkipReason::TooLarge);
        }
        None
    }
}

/// Result of filtering diffs.
#[derive(Debug, Default)]
pub struct FilterResult {
    /// Files that passed the filter.
    pub kept: Vec<FileDiff>,
    /// Files that were skipped, with reasons.
    pub skipped: Vec<SkippedFile>,
}

/// A file that was skipped during filtering.
#[derive(Debug, Clone)]
pub struct SkippedFile {
    /// Path of the skipped file.
    pub path: PathBuf,
    /// Why the file was skipped.
    pub reason: SkipReason,
}

/// Reason a file was skipped.
///
/// # Examples
///
/// ```
/// use veritas_difflens::filter::SkipReason;
///
/// assert_eq!(SkipReason::LockFile.to_string(), "lock file");
/// assert_eq!(SkipReason::PatternMatch("*.snap".into()).to_string(), "pattern: *.snap");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Package manager lock file.
    LockFile,
    /// Auto-generated code.
    GeneratedFile,
    /// Third-party vendored code.
    VendoredCode,
    /// Minified or bundled file.
    MinifiedFile,
    /// More changed lines than a review can cover.
    TooLarge,
    /// Matched a configured pattern or extension.
    PatternMatch(String),
    /// Beyond `review.max_files`.
    FileLimit,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::LockFile => write!(f, "lock file"),
            SkipReason::GeneratedFile => write!(f, "generated file"),
            SkipReason::VendoredCode => write!(f, "vendored code"),
            SkipReason::MinifiedFile => write!(f, "minified file"),
            SkipReason::TooLarge => write!(f, "too large"),
            SkipReason::PatternMatch(pat) => write!(f, "pattern: {pat}"),
            SkipReason::FileLimit => write!(f, "file limit reached"),
        }
    }
}

fn is_minified(file_name: &str, content: &str) -> bool {
    file_name.ends_with(".min.js")
        || file_name.ends_with(".min.css")
        || content.lines().any(|l| l.len() > MINIFIED_LINE_BYTES)
}

fn is_generated_by_name(file_name: &str) -> bool {
    file_name.contains(".generated.")
        || file_name.ends_with(".g.dart")
        || file_name.ends_with(".pb.go")
        || file_name.ends_with(".pb.rs")
        || file_name.ends_with("_pb2.py")
}

/// Looks for a generator banner in the first lines of the hunk content.
fn is_generated_by_content(content: &str) -> bool {
    content
        .lines()
        .take(5)
        .map(|l| l.get(1..).unwrap_or(""))
        .any(|l| GENERATED_MARKERS.iter().any(|m| l.contains(m)))
}
