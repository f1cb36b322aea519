//! Render a finished run and write it into the pull request's review comment.

use std::collections::HashSet;
use std::sync::Arc;

use veritas_core::{
    Claim, CommentRef, PullRequestId, RunStatus, Verdict, VerificationRun, VeritasError,
};

use crate::ports::CommentApi;

/// Hidden marker identifying the bot's review comment on a pull request.
pub const REVIEW_MARKER: &str = "<!-- veritas:review -->";

/// Writes review comments.
pub struct Publisher {
    comments: Arc<dyn CommentApi>,
    bot_name: String,
}

impl Publisher {
    /// Create a publisher signing comments as `bot_name`.
    pub fn new(comments: Arc<dyn CommentApi>, bot_name: impl Into<String>) -> Self {
        Self {
            comments,
            bot_name: bot_name.into(),
        }
    }

    /// Reuse the marked comment on `pr`, or create one, and show the
    /// "review in progress" placeholder in it.
    ///
    /// # Errors
    ///
    /// Returns the comment API error.
    pub async fn open_placeholder(
        &self,
        pr: &PullRequestId,
        head_ref: &str,
    ) -> Result<CommentRef, VeritasError> {
        let body = placeholder_body(&self.bot_name, head_ref);
        match self.comments.find_comment(pr, REVIEW_MARKER).await? {
            Some(existing) => {
                self.comments.update_comment(pr, existing, &body).await?;
                tracing::debug!(pr = %pr, comment = %existing, "reusing review comment");
                Ok(existing)
            }
            None => {
                let created = self.comments.create_comment(pr, &body).await?;
                tracing::debug!(pr = %pr, comment = %created, "created review comment");
                Ok(created)
            }
        }
    }

    /// Write the outcome of `run` into its placeholder comment.
    ///
    /// Never creates a comment.
    ///
    /// # Errors
    ///
    /// Returns the comment API error.
    pub async fn publish(&self, run: &VerificationRun) -> Result<CommentRef, VeritasError> {
        let body = render_review(run, &self.bot_name);
        self.comments
            .update_comment(&run.pr, run.comment, &body)
            .await?;
        tracing::info!(pr = %run.pr, comment = %run.comment, status = %run.status, "review published");
        Ok(run.comment)
    }

    /// Replace the placeholder with a failure notice when no run could start.
    ///
    /// # Errors
    ///
    /// Returns the comment API error.
    pub async fn publish_failure(
        &self,
        pr: &PullRequestId,
        comment: CommentRef,
        reason: &str,
    ) -> Result<CommentRef, VeritasError> {
        let body = failure_body(&self.bot_name, reason);
        self.comments.update_comment(pr, comment, &body).await?;
        Ok(comment)
    }
}

/// Body shown while a run is in progress.
///
/// # Examples
///
/// ```
/// use veritas_review::publish::{placeholder_body, REVIEW_MARKER};
///
/// let body = placeholder_body("Veritas", "0123456789abcdef");
/// assert!(body.starts_with(REVIEW_MARKER));
/// assert!(body.contains("`0123456`"));
/// ```
pub fn placeholder_body(bot_name: &str, head_ref: &str) -> String {
    format!(
        "{REVIEW_MARKER}\n## Code Review by {bot_name}\n\n\
         Reviewing `{}` and checking every finding against the repository...\n",
        short_ref(head_ref)
    )
}

fn failure_body(bot_name: &str, reason: &str) -> String {
    format!(
        "{REVIEW_MARKER}\n## Code Review by {bot_name}\n\n\
         The automated review could not be completed: {reason}\n\n\
         Push a new commit or reopen the pull request to try again.\n"
    )
}

/// Markdown comment body for a finished run.
pub fn render_review(run: &VerificationRun, bot_name: &str) -> String {
    if run.status == RunStatus::Failed {
        let reason = run.failure.as_deref().unwrap_or("unknown error");
        return format!("{}{}", failure_body(bot_name, reason), footer(run));
    }

    let mut body = format!("{REVIEW_MARKER}\n## Code Review by {bot_name}\n\n");
    let text = run.final_text.as_deref().unwrap_or("").trim();
    if text.is_empty() {
        body.push_str("No issues found after verification.\n");
    } else {
        body.push_str(text);
        body.push('\n');
    }

    if run.status == RunStatus::BudgetExceeded {
        let unchecked = run
            .current_pass()
            .iter()
            .filter(|c| c.evidence.as_deref() == Some("not verified: budget exhausted"))
            .count();
        body.push_str(&format!(
            "\n> **Partial verification:** the budget of {} verification call(s) ran out; \
             {unchecked} finding(s) above were not checked against the repository.\n",
            run.budget.spent()
        ));
    }

    body.push_str(&footer(run));
    body
}

fn footer(run: &VerificationRun) -> String {
    let mut seen = HashSet::new();
    let removed: Vec<&Claim> = run
        .claims
        .iter()
        .filter(|c| c.verdict == Verdict::Refuted && seen.insert(c.key()))
        .collect();
    let mut out = String::new();
    if !removed.is_empty() {
        out.push_str(&format!(
            "\n<details><summary>Verification results: {} finding(s) removed as incorrect</summary>\n\n",
            removed.len()
        ));
        for claim in &removed {
            out.push_str(&rejection_line(claim));
        }
        out.push_str("\n</details>\n");
    }
    out.push_str(&format!(
        "\n---\n<sub>{} confirmed · {} unverifiable · {} removed as incorrect · \
         {} verification call(s) · {} refinement pass(es) · `{}`</sub>\n",
        run.count(Verdict::Confirmed),
        run.count(Verdict::Unverifiable),
        removed.len(),
        run.budget.spent(),
        run.iteration,
        short_ref(&run.head_ref)
    ));
    out
}

/// `- ~~assertion~~ (location): evidence`, on one line.
fn rejection_line(claim: &Claim) -> String {
    let location = match (claim.file_path.as_deref(), claim.lines) {
        (Some(path), Some(lines)) => format!(" (`{path}:{lines}`)"),
        (Some(path), None) => format!(" (`{path}`)"),
        _ => String::new(),
    };
    let evidence = claim
        .evidence
        .as_deref()
        .map(|e| e.split_whitespace().collect::<Vec<_>>().join(" "))
        .unwrap_or_else(|| "no evidence recorded".into());
    format!("- ~~{}~~{location}: {evidence}\n", claim.assertion.trim())
}

fn short_ref(git_ref: &str) -> &str {
    match git_ref.char_indices().nth(7) {
        Some((idx, _)) if git_ref.chars().all(|c| c.is_ascii_hexdigit()) => &git_ref[..idx],
        _ => git_ref,
    }
}
