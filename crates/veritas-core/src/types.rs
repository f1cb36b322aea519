use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::VeritasError;

/// A single hunk from a unified diff.
///
/// # Examples
///
/// ```
/// use veritas_core::{DiffHunk, ChangeType};
/// use std::path::PathBuf;
///
/// let hunk = DiffHunk {
///     file_path: PathBuf::from("src/lib.rs"),
///     old_start: 10,
///     old_lines: 5,
///     new_start: 10,
///     new_lines: 8,
///     content: "+ new line\n- old line".into(),
///     change_type: ChangeType::Modify,
/// };
/// assert_eq!(hunk.added_range().unwrap().end, 17);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffHunk {
    /// Path to the affected file.
    pub file_path: PathBuf,
    /// Starting line in the old version.
    pub old_start: u32,
    /// Number of lines in the old version.
    pub old_lines: u32,
    /// Starting line in the new version.
    pub new_start: u32,
    /// Number of lines in the new version.
    pub new_lines: u32,
    /// Raw diff content for this hunk.
    pub content: String,
    /// Classification of the change.
    pub change_type: ChangeType,
}

impl DiffHunk {
    /// Line range touched in the head version, `None` for pure deletions.
    pub fn added_range(&self) -> Option<LineRange> {
        (self.new_lines > 0)
            .then(|| LineRange::new(self.new_start, self.new_start + self.new_lines - 1))
    }

    /// Line range touched in the base version, `None` for pure additions.
    pub fn removed_range(&self) -> Option<LineRange> {
        (self.old_lines > 0)
            .then(|| LineRange::new(self.old_start, self.old_start + self.old_lines - 1))
    }
}

/// Classification of a diff hunk.
///
/// # Examples
///
/// ```
/// use veritas_core::ChangeType;
///
/// let ct = ChangeType::Add;
/// assert_eq!(format!("{ct}"), "add");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// New file or code added.
    Add,
    /// Existing file or code removed.
    Delete,
    /// Existing code modified in place.
    Modify,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Add => write!(f, "add"),
            ChangeType::Delete => write!(f, "delete"),
            ChangeType::Modify => write!(f, "modify"),
        }
    }
}

/// Inclusive, 1-based line range.
///
/// # Examples
///
/// ```
/// use veritas_core::LineRange;
///
/// let range = LineRange::new(18, 12);
/// assert_eq!(range.start, 12);
/// assert!(range.contains(15));
/// assert_eq!(range.to_string(), "12-18");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineRange {
    /// First line (inclusive).
    pub start: u32,
    /// Last line (inclusive).
    pub end: u32,
}

impl LineRange {
    /// Build a range, swapping the bounds if they arrive reversed.
    pub fn new(start: u32, end: u32) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// A range covering one line.
    pub fn single(line: u32) -> Self {
        Self::new(line, line)
    }

    /// Returns `true` if `line` falls inside the range.
    pub fn contains(&self, line: u32) -> bool {
        self.start <= line && line <= self.end
    }
}

impl fmt::Display for LineRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Base and head references of a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefPair {
    /// Commit (or branch) the pull request merges into.
    pub base: String,
    /// Commit (or branch) carrying the proposed change.
    pub head: String,
}

/// A GitHub repository, `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    /// Account or organisation login.
    pub owner: String,
    /// Repository name.
    pub name: String,
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Identity of a pull request.
///
/// Parses from and displays as `owner/repo#number`.
///
/// # Examples
///
/// ```
/// use veritas_core::PullRequestId;
///
/// let pr: PullRequestId = "rust-lang/rust#12345".parse().unwrap();
/// assert_eq!(pr.repo.owner, "rust-lang");
/// assert_eq!(pr.repo.name, "rust");
/// assert_eq!(pr.number, 12345);
/// assert_eq!(pr.to_string(), "rust-lang/rust#12345");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PullRequestId {
    /// Repository the pull request belongs to.
    pub repo: RepoRef,
    /// Pull request number.
    pub number: u64,
}

impl PullRequestId {
    /// Build an identity from its parts.
    pub fn new(owner: impl Into<String>, name: impl Into<String>, number: u64) -> Self {
        Self {
            repo: RepoRef {
                owner: owner.into(),
                name: name.into(),
            },
            number,
        }
    }
}

impl fmt::Display for PullRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

impl FromStr for PullRequestId {
    type Err = VeritasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            VeritasError::Config(format!(
                "invalid PR reference '{s}', expected owner/repo#number"
            ))
        };
        let (owner_repo, number_str) = s.split_once('#').ok_or_else(invalid)?;
        let (owner, repo) = owner_repo.split_once('/').ok_or_else(invalid)?;
        if owner.is_empty() || repo.is_empty() {
            return Err(invalid());
        }
        let number: u64 = number_str
            .parse()
            .map_err(|_| VeritasError::Config(format!("invalid PR number: {number_str}")))?;
        Ok(Self::new(owner, repo, number))
    }
}

/// Reference to a pull-request comment owned by the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommentRef(pub u64);

impl fmt::Display for CommentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "comment {}", self.0)
    }
}

/// Category of a review claim.
///
/// # Examples
///
/// ```
/// use veritas_core::ClaimKind;
///
/// let kind: ClaimKind = "missing-code".parse().unwrap();
/// assert_eq!(kind, ClaimKind::MissingCode);
/// assert_eq!(kind.to_string(), "missing_code");
/// assert!(kind.has_deterministic_check());
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    /// Something (an import, a symbol, a line) is said to be absent.
    MissingCode,
    /// A file is said to be truncated or unfinished.
    IncompleteFile,
    /// A cited line is said not to parse.
    Syntax,
    /// A functional defect.
    Bug,
    /// A security weakness.
    Security,
    /// Style, naming or formatting.
    Style,
    /// Anything the keyword rules cannot place.
    Other,
}

impl ClaimKind {
    /// Kinds that can be settled by searching the evidence, without a model call.
    pub fn has_deterministic_check(self) -> bool {
        matches!(
            self,
            ClaimKind::MissingCode | ClaimKind::IncompleteFile | ClaimKind::Syntax
        )
    }

    /// Kinds whose claims may name a symbol said to be absent.
    pub fn names_symbol(self) -> bool {
        matches!(self, ClaimKind::MissingCode | ClaimKind::IncompleteFile)
    }
}

impl fmt::Display for ClaimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimKind::MissingCode => write!(f, "missing_code"),
            ClaimKind::IncompleteFile => write!(f, "incomplete_file"),
            ClaimKind::Syntax => write!(f, "syntax"),
            ClaimKind::Bug => write!(f, "bug"),
            ClaimKind::Security => write!(f, "security"),
            ClaimKind::Style => write!(f, "style"),
            ClaimKind::Other => write!(f, "other"),
        }
    }
}

impl FromStr for ClaimKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "missing_code" | "missing" => Ok(ClaimKind::MissingCode),
            "incomplete_file" | "incomplete" => Ok(ClaimKind::IncompleteFile),
            "syntax" | "syntax_error" => Ok(ClaimKind::Syntax),
            "bug" => Ok(ClaimKind::Bug),
            "security" => Ok(ClaimKind::Security),
            "style" => Ok(ClaimKind::Style),
            "other" => Ok(ClaimKind::Other),
            other => Err(format!("unknown claim kind: {other}")),
        }
    }
}

/// Outcome of checking a claim against the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Not checked yet.
    Pending,
    /// The evidence supports the claim.
    Confirmed,
    /// The evidence contradicts the claim.
    Refuted,
    /// The claim could not be checked.
    Unverifiable,
}

impl Verdict {
    /// Returns `true` once a verdict has been reached.
    pub fn is_decided(self) -> bool {
        self != Verdict::Pending
    }

    /// Parse the first word of a model answer.
    ///
    /// # Examples
    ///
    /// ```
    /// use veritas_core::Verdict;
    ///
    /// assert_eq!(Verdict::from_answer("REFUTED: the import is on line 1"), Some(Verdict::Refuted));
    /// assert_eq!(Verdict::from_answer("**confirmed**"), Some(Verdict::Confirmed));
    /// assert_eq!(Verdict::from_answer("maybe"), None);
    /// ```
    pub fn from_answer(answer: &str) -> Option<Self> {
        let word: String = answer
            .trim_start()
            .trim_start_matches(|c: char| !c.is_alphabetic())
            .chars()
            .take_while(|c| c.is_alphabetic())
            .collect();
        match word.to_uppercase().as_str() {
            "CONFIRMED" => Some(Verdict::Confirmed),
            "REFUTED" => Some(Verdict::Refuted),
            "UNVERIFIABLE" => Some(Verdict::Unverifiable),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pending => write!(f, "PENDING"),
            Verdict::Confirmed => write!(f, "CONFIRMED"),
            Verdict::Refuted => write!(f, "REFUTED"),
            Verdict::Unverifiable => write!(f, "UNVERIFIABLE"),
        }
    }
}

/// The symbol a claim says is missing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    /// Identifier or module name to look for.
    pub symbol: String,
    /// `true` when the claim is about an import statement.
    pub import: bool,
}

/// One atomic, independently checkable assertion taken from review text.
///
/// # Examples
///
/// ```
/// use veritas_core::{Claim, ClaimKind, Verdict};
///
/// let claim = Claim::new(1, "utils.py is missing import os", ClaimKind::MissingCode)
///     .with_file("utils.py");
/// assert_eq!(claim.verdict, Verdict::Pending);
/// assert_eq!(claim.key().file_path.as_deref(), Some("utils.py"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    /// Unique within a run.
    pub id: u32,
    /// The finding as written by the model.
    pub assertion: String,
    /// Inferred category.
    pub kind: ClaimKind,
    /// Repository-relative file the claim is about.
    pub file_path: Option<String>,
    /// Lines the claim points at.
    pub lines: Option<LineRange>,
    /// Symbol the claim says is missing, if one could be identified.
    pub subject: Option<Subject>,
    /// Current verdict.
    pub verdict: Verdict,
    /// Snippet or explanation backing the verdict.
    pub evidence: Option<String>,
    /// Refinement pass that produced the claim (0 = initial draft).
    pub iteration: u32,
}

impl Claim {
    /// A pending claim with no location.
    pub fn new(id: u32, assertion: impl Into<String>, kind: ClaimKind) -> Self {
        Self {
            id,
            assertion: assertion.into(),
            kind,
            file_path: None,
            lines: None,
            subject: None,
            verdict: Verdict::Pending,
            evidence: None,
            iteration: 0,
        }
    }

    /// Attach a file reference.
    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Attach a line range.
    pub fn with_lines(mut self, lines: LineRange) -> Self {
        self.lines = Some(lines);
        self
    }

    /// Attach the missing symbol.
    pub fn with_subject(mut self, symbol: impl Into<String>, import: bool) -> Self {
        self.subject = Some(Subject {
            symbol: symbol.into(),
            import,
        });
        self
    }

    /// Record a verdict and the evidence behind it.
    pub fn decide(&mut self, verdict: Verdict, evidence: Option<String>) {
        self.verdict = verdict;
        self.evidence = evidence;
    }

    /// Identity used for convergence checks and verdict carry-over.
    pub fn key(&self) -> ClaimKey {
        ClaimKey {
            assertion: self.assertion.clone(),
            file_path: self.file_path.clone(),
            kind: self.kind,
        }
    }

    /// `path:lines` when the claim has a location.
    pub fn location(&self) -> Option<String> {
        let path = self.file_path.as_ref()?;
        Some(match self.lines {
            Some(lines) => format!("{path}:{lines}"),
            None => path.clone(),
        })
    }
}

/// Assertion + file + kind: two claims with equal keys are the same finding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimKey {
    /// Finding text.
    pub assertion: String,
    /// Referenced file.
    pub file_path: Option<String>,
    /// Claim category.
    pub kind: ClaimKind,
}

/// File content fetched from the repository at a given ref.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    /// Repository-relative path.
    pub path: String,
    /// Commit or branch the content was read at.
    pub git_ref: String,
    /// Decoded text.
    pub content: String,
    /// When the content was fetched.
    pub fetched_at: DateTime<Utc>,
}

impl Evidence {
    /// Wrap freshly fetched content.
    pub fn new(path: impl Into<String>, git_ref: impl Into<String>, content: String) -> Self {
        Self {
            path: path.into(),
            git_ref: git_ref.into(),
            content,
            fetched_at: Utc::now(),
        }
    }

    /// Number of lines in the file.
    pub fn line_count(&self) -> usize {
        self.content.lines().count()
    }

    /// Lines of `range` widened by `context` on each side, numbered `L<n>: `.
    ///
    /// # Examples
    ///
    /// ```
    /// use veritas_core::{Evidence, LineRange};
    ///
    /// let ev = Evidence::new("a.py", "main", "one\ntwo\nthree\nfour\n".into());
    /// assert_eq!(ev.excerpt(LineRange::single(3), 1), "L2: two\nL3: three\nL4: four");
    /// ```
    pub fn excerpt(&self, range: LineRange, context: u32) -> String {
        let first = range.start.saturating_sub(context).max(1);
        let last = range.end.saturating_add(context);
        self.numbered_lines()
            .filter(|(n, _)| *n >= first && *n <= last)
            .map(|(n, line)| format!("L{n}: {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The first `max_lines` lines, numbered.
    pub fn head(&self, max_lines: usize) -> String {
        self.numbered_lines()
            .take(max_lines)
            .map(|(n, line)| format!("L{n}: {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Iterate `(line_number, text)` pairs, 1-based.
    pub fn numbered_lines(&self) -> impl Iterator<Item = (u32, &str)> {
        self.content
            .lines()
            .enumerate()
            .map(|(i, line)| (i as u32 + 1, line))
    }
}

/// Verification call budget of a single run.
///
/// Built from the configured integer where `-1` means unlimited.
///
/// # Examples
///
/// ```
/// use veritas_core::Budget;
///
/// let mut budget = Budget::from_setting(2).unwrap();
/// assert!(budget.try_spend());
/// assert!(budget.try_spend());
/// assert!(!budget.try_spend());
/// assert_eq!(budget.spent(), 2);
/// assert!(budget.is_exhausted());
///
/// let unlimited = Budget::from_setting(-1).unwrap();
/// assert_eq!(unlimited.remaining(), None);
/// assert!(Budget::from_setting(-2).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    limit: Option<u32>,
    spent: u32,
}

impl Budget {
    /// Configuration value meaning "no limit".
    pub const UNLIMITED_SENTINEL: i64 = -1;

    /// Build a budget from its configured value.
    ///
    /// # Errors
    ///
    /// Returns [`VeritasError::Config`] for values below `-1` or above `u32::MAX`.
    pub fn from_setting(value: i64) -> Result<Self, VeritasError> {
        if value == Self::UNLIMITED_SENTINEL {
            return Ok(Self::unlimited());
        }
        let limit = u32::try_from(value).map_err(|_| {
            VeritasError::Config(format!(
                "verification budget must be a non-negative integer or -1, got {value}"
            ))
        })?;
        Ok(Self::limited(limit))
    }

    /// A budget of `limit` chargeable calls.
    pub fn limited(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            spent: 0,
        }
    }

    /// A budget that never runs out.
    pub fn unlimited() -> Self {
        Self {
            limit: None,
            spent: 0,
        }
    }

    /// Spend one unit. Returns `false`, spending nothing, when none remain.
    pub fn try_spend(&mut self) -> bool {
        match self.limit {
            Some(limit) if self.spent >= limit => false,
            _ => {
                self.spent += 1;
                true
            }
        }
    }

    /// Units left, `None` when unlimited.
    pub fn remaining(&self) -> Option<u32> {
        self.limit.map(|limit| limit.saturating_sub(self.spent))
    }

    /// Units spent so far.
    pub fn spent(&self) -> u32 {
        self.spent
    }

    /// Returns `true` when a limited budget has nothing left.
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == Some(0)
    }

    /// Returns `true` for the unlimited sentinel.
    pub fn is_unlimited(&self) -> bool {
        self.limit.is_none()
    }
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.limit {
            Some(limit) => write!(f, "{}/{limit}", self.spent),
            None => write!(f, "{}/unlimited", self.spent),
        }
    }
}

/// Terminal status of a verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Still running.
    InProgress,
    /// No refuted claims remain, or the claim set stopped changing.
    Converged,
    /// The call budget ran out before every claim was checked.
    BudgetExceeded,
    /// The run could not produce a review.
    Failed,
}

impl RunStatus {
    /// Returns `true` for every status except [`RunStatus::InProgress`].
    pub fn is_terminal(self) -> bool {
        self != RunStatus::InProgress
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::InProgress => write!(f, "IN_PROGRESS"),
            RunStatus::Converged => write!(f, "CONVERGED"),
            RunStatus::BudgetExceeded => write!(f, "BUDGET_EXCEEDED"),
            RunStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Non-terminal controller states, recorded in the run's transition log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Asking the model for the initial review.
    Drafting,
    /// Turning review text into claims.
    Extracting,
    /// Checking pending claims.
    Validating,
    /// Asking the model to correct refuted findings.
    Refining,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Drafting => write!(f, "DRAFTING"),
            Phase::Extracting => write!(f, "EXTRACTING"),
            Phase::Validating => write!(f, "VALIDATING"),
            Phase::Refining => write!(f, "REFINING"),
        }
    }
}

/// Aggregate state of one verification run (one pull-request event).
///
/// # Examples
///
/// ```
/// use veritas_core::{Budget, Claim, ClaimKind, CommentRef, PullRequestId, RunStatus, VerificationRun};
///
/// let pr = PullRequestId::new("octo", "app", 7);
/// let mut run = VerificationRun::new(pr, "abc123", CommentRef(1), Budget::limited(3));
/// run.begin_pass(vec![Claim::new(1, "x is missing", ClaimKind::MissingCode)]);
/// assert_eq!(run.current_pass().len(), 1);
/// assert_eq!(run.status, RunStatus::InProgress);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRun {
    /// Pull request under review.
    pub pr: PullRequestId,
    /// Ref the evidence is fetched at.
    pub head_ref: String,
    /// Placeholder comment the result is published into.
    pub comment: CommentRef,
    /// Completed refinement passes.
    pub iteration: u32,
    /// Remaining chargeable calls.
    pub budget: Budget,
    /// Every claim extracted during the run, oldest first.
    pub claims: Vec<Claim>,
    /// Current review text.
    pub draft: String,
    /// Text handed to the publisher (draft minus refuted findings).
    pub final_text: Option<String>,
    /// Terminal status.
    pub status: RunStatus,
    /// Why the run failed, for FAILED runs.
    pub failure: Option<String>,
    /// States the controller went through.
    pub transitions: Vec<Phase>,
    pass_start: usize,
}

impl VerificationRun {
    /// Start a run for `pr` at `head_ref`.
    pub fn new(
        pr: PullRequestId,
        head_ref: impl Into<String>,
        comment: CommentRef,
        budget: Budget,
    ) -> Self {
        Self {
            pr,
            head_ref: head_ref.into(),
            comment,
            iteration: 0,
            budget,
            claims: Vec::new(),
            draft: String::new(),
            final_text: None,
            status: RunStatus::InProgress,
            failure: None,
            transitions: Vec::new(),
            pass_start: 0,
        }
    }

    /// Append the claims of a new pass, renumbering them run-wide.
    ///
    /// A claim whose key already received a verdict earlier in the run
    /// inherits that verdict and evidence.
    pub fn begin_pass(&mut self, claims: Vec<Claim>) {
        let earlier = self.claims.len();
        self.pass_start = earlier;
        let mut next_id = earlier as u32 + 1;
        for mut claim in claims {
            claim.id = next_id;
            claim.iteration = self.iteration;
            next_id += 1;
            if !claim.verdict.is_decided() {
                let key = claim.key();
                if let Some(prior) = self.claims[..earlier]
                    .iter()
                    .rev()
                    .find(|c| c.verdict.is_decided() && c.key() == key)
                {
                    claim.decide(prior.verdict, prior.evidence.clone());
                }
            }
            self.claims.push(claim);
        }
    }

    /// Claims of the most recent pass.
    pub fn current_pass(&self) -> &[Claim] {
        &self.claims[self.pass_start..]
    }

    /// Indices (into `claims`) of current-pass claims still pending.
    pub fn pending_indices(&self) -> Vec<usize> {
        (self.pass_start..self.claims.len())
            .filter(|&i| self.claims[i].verdict == Verdict::Pending)
            .collect()
    }

    /// Current-pass claims that were refuted.
    pub fn refuted(&self) -> Vec<&Claim> {
        self.current_pass()
            .iter()
            .filter(|c| c.verdict == Verdict::Refuted)
            .collect()
    }

    /// Number of current-pass claims with `verdict`.
    pub fn count(&self, verdict: Verdict) -> usize {
        self.current_pass()
            .iter()
            .filter(|c| c.verdict == verdict)
            .count()
    }

    /// Record a state transition.
    pub fn enter(&mut self, phase: Phase) {
        self.transitions.push(phase);
    }

    /// Close the run: pending claims become UNVERIFIABLE and `final_text` is set.
    pub fn finish(&mut self, status: RunStatus, final_text: String) {
        for claim in &mut self.claims[self.pass_start..] {
            if claim.verdict == Verdict::Pending {
                claim.decide(
                    Verdict::Unverifiable,
                    Some("not verified: budget exhausted".into()),
                );
            }
        }
        self.status = status;
        self.final_text = Some(final_text);
    }

    /// Mark the run failed with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.failure = Some(reason.into());
    }
}

/// Output format for CLI subcommands.
///
/// # Examples
///
/// ```
/// use veritas_core::OutputFormat;
///
/// let fmt: OutputFormat = "md".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Markdown);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable summaries.
    #[default]
    Text,
    /// Machine-readable JSON with camelCase keys.
    Json,
    /// Markdown, as it would be posted.
    Markdown,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Markdown => write!(f, "markdown"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}
