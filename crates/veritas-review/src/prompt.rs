//! Prompts for drafting, refining and checking review findings.
//!
//! The item format in [`ITEM_FORMAT`] is the contract between the model and
//! [`extract_claims`](crate::extract::extract_claims): one bullet per finding,
//! an optional `[kind]` tag and a backticked `path:lines` location.

use veritas_core::Claim;

/// How the model must write each finding.
pub const ITEM_FORMAT: &str = "\
Write every finding as exactly one bullet in this form:

- [kind] `path/to/file.ext:START-END` one-sentence finding

where kind is one of: missing_code, incomplete_file, syntax, bug, security, style, other.
Use the repository-relative path exactly as it appears in the diff. Give a \
single line as `path:LINE`. Omit the line numbers only if the finding is \
about the whole file. When you say something is missing, name it in \
backticks (for example: missing import `os`).";

const REVIEW_SYSTEM_PROMPT: &str = "\
You are a senior engineer reviewing a pull request. Report genuine bugs, \
security problems, missing code and incomplete files in the changed code.

Rules:
- Only report what you can point to in the diff
- Reference specific files and line numbers of the new version
- Do not claim that something is missing unless the diff shows it is used and \
you are certain it is not defined or imported
- Do not invent files that are not in the diff
- Skip praise and general advice

Start with a one-paragraph summary, then a `### Findings` heading followed \
by the findings. If there is nothing to report, write the summary and \
`No issues found.` instead of findings.";

const CHECK_SYSTEM_PROMPT: &str = "\
You verify code review findings against source code. You are given one \
finding and an excerpt of the file it refers to, with line numbers.

Answer with exactly one of these words first:
CONFIRMED - the excerpt shows the finding is correct
REFUTED - the excerpt shows the finding is wrong
UNVERIFIABLE - the excerpt is not enough to decide

After the word you may add one short sentence of reasoning. Judge only from \
the excerpt.";

/// Full system prompt for drafting and refining reviews.
///
/// # Examples
///
/// ```
/// use veritas_review::prompt::review_system_prompt;
///
/// let prompt = review_system_prompt();
/// assert!(prompt.contains("line numbers"));
/// assert!(prompt.contains("[kind]"));
/// ```
pub fn review_system_prompt() -> String {
    format!("{REVIEW_SYSTEM_PROMPT}\n\n{ITEM_FORMAT}")
}

/// System prompt for the constrained claim check.
pub fn check_system_prompt() -> &'static str {
    CHECK_SYSTEM_PROMPT
}

/// User prompt for the first draft.
///
/// # Examples
///
/// ```
/// use veritas_review::prompt::build_draft_prompt;
///
/// let prompt = build_draft_prompt("Add retry", Some("Retries flaky calls."), "+retry()");
/// assert!(prompt.contains("Add retry"));
/// assert!(prompt.contains("```diff\n+retry()"));
/// ```
pub fn build_draft_prompt(title: &str, description: Option<&str>, diff: &str) -> String {
    let mut prompt = String::new();
    if !title.is_empty() {
        prompt.push_str(&format!("Pull request: {title}\n"));
    }
    if let Some(desc) = description {
        prompt.push_str(&format!("\nDescription:\n{desc}\n"));
    }
    prompt.push_str(&format!(
        "\nReview the following code changes:\n\n```diff\n{diff}\n```\n"
    ));
    prompt
}

/// User prompt asking the model to correct a draft whose findings were refuted.
///
/// Each refuted claim is listed with the evidence that contradicts it.
///
/// # Examples
///
/// ```
/// use veritas_core::{Claim, ClaimKind, Verdict};
/// use veritas_review::prompt::build_refine_prompt;
///
/// let mut claim = Claim::new(1, "missing import `os`", ClaimKind::MissingCode).with_file("a.py");
/// claim.decide(Verdict::Refuted, Some("L1: import os".into()));
/// let prompt = build_refine_prompt("- [missing_code] `a.py` missing import `os`", &[&claim], "+x");
/// assert!(prompt.contains("L1: import os"));
/// ```
pub fn build_refine_prompt(draft: &str, refuted: &[&Claim], diff: &str) -> String {
    let mut prompt = String::from(
        "Your previous review contained findings that were checked against the \
         repository and found to be FALSE.\n\nPrevious review:\n\n",
    );
    prompt.push_str(draft.trim());
    prompt.push_str("\n\nRefuted findings:\n");
    for claim in refuted {
        let location = claim.location().unwrap_or_else(|| "(no file)".into());
        let why = claim.evidence.as_deref().unwrap_or("contradicted by the file contents");
        prompt.push_str(&format!(
            "- `{location}` {}\n  Evidence: {}\n",
            claim.assertion,
            why.replace('\n', " | ")
        ));
    }
    prompt.push_str(
        "\nRewrite the review. Remove or correct every refuted finding, keep the \
         findings that were not refuted unchanged, and do not add findings you \
         cannot support from the diff.",
    );
    prompt.push_str(&format!("\n\nThe diff, for reference:\n\n```diff\n{diff}\n```\n"));
    prompt
}

/// User prompt for checking one claim against an excerpt.
pub fn build_check_prompt(claim: &Claim, excerpt: &str) -> String {
    let location = claim.location().unwrap_or_default();
    format!(
        "Finding ({kind}) about `{location}`:\n{assertion}\n\nExcerpt:\n```\n{excerpt}\n```\n",
        kind = claim.kind,
        assertion = claim.assertion,
    )
}

/// Strip one surrounding Markdown code fence, with or without a language tag.
///
/// # Examples
///
/// ```
/// use veritas_review::prompt::strip_code_fences;
///
/// assert_eq!(strip_code_fences("```markdown\n- item\n```"), "- item");
/// assert_eq!(strip_code_fences("plain"), "plain");
/// ```
pub fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the info string (```markdown, ```md, ...) on the opening line.
    match inner.split_once('\n') {
        Some((info, body)) if !info.trim().contains(' ') => body.trim(),
        _ => inner.trim(),
    }
}
