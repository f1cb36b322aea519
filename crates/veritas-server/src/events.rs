//! The parts of GitHub `pull_request` deliveries the service reads.

use serde::Deserialize;
use veritas_core::PullRequestId;

use crate::dispatch::ReviewJob;

/// Actions that put new code in front of reviewers.
pub const REVIEWABLE_ACTIONS: [&str; 3] = ["opened", "synchronize", "reopened"];

/// A `pull_request` webhook payload.
///
/// # Examples
///
/// ```
/// use veritas_server::events::PullRequestEvent;
///
/// let event: PullRequestEvent = serde_json::from_str(r#"{
///     "action": "synchronize",
///     "number": 7,
///     "pull_request": {
///         "title": "Add cwd helper",
///         "head": { "sha": "abc123", "ref": "feature" },
///         "base": { "sha": "def456", "ref": "main" }
///     },
///     "repository": { "full_name": "octo/app", "name": "app", "owner": { "login": "octo" } }
/// }"#).unwrap();
/// assert!(event.is_reviewable_action());
/// assert_eq!(event.pr_id().to_string(), "octo/app#7");
/// assert_eq!(event.target_branch(), "main");
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    /// `opened`, `synchronize`, `closed`, ...
    pub action: String,
    /// Pull request number.
    pub number: u64,
    /// The pull request as of this delivery.
    pub pull_request: PullRequestPayload,
    /// Repository the pull request lives in.
    pub repository: RepositoryPayload,
}

/// `pull_request` object of the payload.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestPayload {
    /// Title, only used for logging here.
    #[serde(default)]
    pub title: String,
    /// Head branch and commit.
    pub head: BranchPayload,
    /// Base branch and commit.
    pub base: BranchPayload,
}

/// `head` / `base` object.
#[derive(Debug, Clone, Deserialize)]
pub struct BranchPayload {
    /// Commit SHA.
    pub sha: String,
    /// Branch name.
    #[serde(rename = "ref")]
    pub branch: String,
}

/// `repository` object.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryPayload {
    /// `owner/name`.
    pub full_name: String,
    /// Repository name.
    pub name: String,
    /// Owning account.
    pub owner: OwnerPayload,
}

/// `repository.owner` object.
#[derive(Debug, Clone, Deserialize)]
pub struct OwnerPayload {
    /// Account login.
    pub login: String,
}

impl PullRequestEvent {
    /// Whether the action brings new code to review.
    pub fn is_reviewable_action(&self) -> bool {
        REVIEWABLE_ACTIONS.contains(&self.action.as_str())
    }

    /// Identity of the pull request.
    pub fn pr_id(&self) -> PullRequestId {
        PullRequestId::new(
            self.repository.owner.login.clone(),
            self.repository.name.clone(),
            self.number,
        )
    }

    /// Branch the pull request merges into.
    pub fn target_branch(&self) -> &str {
        &self.pull_request.base.branch
    }

    /// The review this delivery asks for.
    pub fn job(&self) -> ReviewJob {
        ReviewJob {
            pr: self.pr_id(),
            head_sha: self.pull_request.head.sha.clone(),
        }
    }
}
