//! Fetch repository files as evidence, at most once per path and ref per run.

use std::collections::HashMap;
use std::sync::Arc;

use veritas_core::{Evidence, RepoRef, VeritasError};

use crate::ports::RepositoryContent;
use crate::retry::RetryPolicy;

/// Bytes inspected for NUL when deciding whether a file is binary.
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// Result of looking a file up at a ref.
///
/// Missing and unreadable files are outcomes rather than errors: the claim
/// that referenced them becomes unverifiable, never refuted.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The file exists and decoded as text.
    Found(Arc<Evidence>),
    /// No such file at the ref.
    NotFound,
    /// The file exists but cannot be used as evidence (binary, too large).
    Unfetchable(String),
}

impl FetchOutcome {
    /// The evidence, when the file was found.
    pub fn evidence(&self) -> Option<&Arc<Evidence>> {
        match self {
            FetchOutcome::Found(evidence) => Some(evidence),
            _ => None,
        }
    }
}

/// Per-run evidence fetcher with a `(path, ref)` cache.
///
/// Successful lookups, including `NotFound` and `Unfetchable`, are cached.
/// Failed lookups are not, so a later claim may try again.
pub struct EvidenceFetcher {
    content: Arc<dyn RepositoryContent>,
    repo: RepoRef,
    retry: RetryPolicy,
    max_file_bytes: usize,
    cache: HashMap<(String, String), FetchOutcome>,
}

impl EvidenceFetcher {
    /// Create a fetcher for `repo` with an empty cache.
    pub fn new(
        content: Arc<dyn RepositoryContent>,
        repo: RepoRef,
        retry: RetryPolicy,
        max_file_bytes: usize,
    ) -> Self {
        Self {
            content,
            repo,
            retry,
            max_file_bytes,
            cache: HashMap::new(),
        }
    }

    /// Returns `true` if `path` at `git_ref` has already been looked up.
    pub fn is_cached(&self, path: &str, git_ref: &str) -> bool {
        self.cache
            .contains_key(&(normalize_path(path), git_ref.to_string()))
    }

    /// Number of distinct files looked up so far.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// Look up `path` at `git_ref`.
    ///
    /// # Errors
    ///
    /// - [`VeritasError::InvalidInput`] for an empty path or ref
    /// - the port's error once retries are exhausted (typically
    ///   [`VeritasError::Transport`] or [`VeritasError::RateLimited`])
    pub async fn fetch(&mut self, path: &str, git_ref: &str) -> Result<FetchOutcome, VeritasError> {
        let path = normalize_path(path);
        if path.is_empty() {
            return Err(VeritasError::InvalidInput("empty file path".into()));
        }
        let git_ref = git_ref.trim();
        if git_ref.is_empty() {
            return Err(VeritasError::InvalidInput(format!("empty git ref for {path}")));
        }

        let key = (path.clone(), git_ref.to_string());
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(path = %path, git_ref, "evidence cache hit");
            return Ok(hit.clone());
        }

        let content = &self.content;
        let repo = &self.repo;
        let file = path.as_str();
        let fetched = self
            .retry
            .run("fetch evidence", move || content.file_content(repo, file, git_ref))
            .await;

        let outcome = match fetched {
            Ok(Some(bytes)) => decode(&path, git_ref, bytes, self.max_file_bytes),
            Ok(None) | Err(VeritasError::NotFound(_)) => FetchOutcome::NotFound,
            Err(e) => return Err(e),
        };
        tracing::debug!(path = %path, git_ref, outcome = outcome_label(&outcome), "evidence fetched");
        self.cache.insert(key, outcome.clone());
        Ok(outcome)
    }
}

/// Repository-relative form of a path as written in a review.
///
/// # Examples
///
/// ```
/// use veritas_review::evidence::normalize_path;
///
/// assert_eq!(normalize_path("./src/lib.rs"), "src/lib.rs");
/// assert_eq!(normalize_path("/src/lib.rs"), "src/lib.rs");
/// assert_eq!(normalize_path("  "), "");
/// ```
pub fn normalize_path(path: &str) -> String {
    let mut p = path.trim();
    loop {
        let stripped = p.trim_start_matches('/');
        let stripped = stripped.strip_prefix("./").unwrap_or(stripped);
        if stripped == p {
            break;
        }
        p = stripped;
    }
    p.to_string()
}

fn decode(path: &str, git_ref: &str, bytes: Vec<u8>, max_file_bytes: usize) -> FetchOutcome {
    if bytes.len() > max_file_bytes {
        return FetchOutcome::Unfetchable(format!(
            "{} bytes exceeds the {max_file_bytes} byte limit",
            bytes.len()
        ));
    }
    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if sniff.contains(&0) {
        return FetchOutcome::Unfetchable("binary file".into());
    }
    match String::from_utf8(bytes) {
        Ok(text) => FetchOutcome::Found(Arc::new(Evidence::new(path, git_ref, text))),
        Err(_) => FetchOutcome::Unfetchable("not valid UTF-8".into()),
    }
}

fn outcome_label(outcome: &FetchOutcome) -> &'static str {
    match outcome {
        FetchOutcome::Found(_) => "found",
        FetchOutcome::NotFound => "not_found",
        FetchOutcome::Unfetchable(_) => "unfetchable",
    }
}
