//! Seams between the verification loop and the outside world.
//!
//! The controller only talks to these traits. [`GitHubClient`](crate::github::GitHubClient),
//! [`LlmClient`](crate::llm::LlmClient) and [`SqliteHistory`](crate::history::SqliteHistory)
//! are the production implementations; tests substitute in-memory fakes.

use async_trait::async_trait;
use veritas_core::{CommentRef, PullRequestId, RepoRef, VeritasError};
use veritas_difflens::Diff;

use crate::history::HistoryEntry;
use crate::llm::ChatMessage;

/// Everything needed to review one pull request at one head commit.
#[derive(Debug, Clone)]
pub struct PullRequestSnapshot {
    /// Parsed diff with base/head refs.
    pub diff: Diff,
    /// Head commit the evidence is fetched at.
    pub head_ref: String,
    /// Base commit.
    pub base_ref: String,
    /// Base branch name, used for monitoring rules.
    pub base_branch: String,
    /// Pull request title.
    pub title: String,
    /// Pull request description.
    pub body: Option<String>,
}

/// Source of pull-request diffs.
#[async_trait]
pub trait DiffSource: Send + Sync {
    /// Fetch the current diff and refs of `pr`.
    async fn pull_request(&self, pr: &PullRequestId) -> Result<PullRequestSnapshot, VeritasError>;
}

/// Read access to repository files.
#[async_trait]
pub trait RepositoryContent: Send + Sync {
    /// Raw bytes of `path` at `git_ref`, `None` when the file does not exist there.
    async fn file_content(
        &self,
        repo: &RepoRef,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<Vec<u8>>, VeritasError>;
}

/// Pull-request comment operations.
#[async_trait]
pub trait CommentApi: Send + Sync {
    /// Post a new comment.
    async fn create_comment(&self, pr: &PullRequestId, body: &str)
        -> Result<CommentRef, VeritasError>;

    /// Replace the body of an existing comment.
    async fn update_comment(
        &self,
        pr: &PullRequestId,
        comment: CommentRef,
        body: &str,
    ) -> Result<(), VeritasError>;

    /// First comment on `pr` whose body contains `marker`.
    async fn find_comment(
        &self,
        pr: &PullRequestId,
        marker: &str,
    ) -> Result<Option<CommentRef>, VeritasError>;
}

/// A chat-completion model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Send `messages` and return the assistant's text.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, VeritasError>;

    /// Model identifier, recorded in history.
    fn model(&self) -> &str;
}

/// Sink for finished runs.
#[async_trait]
pub trait ReviewHistory: Send + Sync {
    /// Persist one finished run.
    async fn record(&self, entry: &HistoryEntry) -> Result<(), VeritasError>;
}
