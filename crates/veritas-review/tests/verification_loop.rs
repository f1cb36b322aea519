use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use veritas_core::{
    Budget, ClaimKind, CommentRef, Phase, PullRequestId, RefPair, RepoRef, RunStatus, Verdict,
    VerificationRun, VeritasConfig, VeritasError,
};
use veritas_difflens::Diff;
use veritas_review::controller::{RefinementController, NO_REVIEWABLE_CHANGES};
use veritas_review::extract::extract_claims;
use veritas_review::llm::ChatMessage;
use veritas_review::ports::{CommentApi, LanguageModel, PullRequestSnapshot, RepositoryContent};
use veritas_review::prompt::check_system_prompt;
use veritas_review::publish::{render_review, Publisher};

const UTILS_DIFF: &str = "diff --git a/utils.py b/utils.py\n\
--- a/utils.py\n\
+++ b/utils.py\n\
@@ -1,4 +1,6 @@\n \
import os\n\
+import sys\n \
\n \
def cwd():\n\
-    return os.getcwd()\n\
+    path = os.getcwd()\n\
+    return path\n";

const UTILS_PY: &str = "import os\nimport sys\n\ndef cwd():\n    path = os.getcwd()\n    return path\n";

/// Model fake: review prompts pop scripted texts, check prompts pop scripted
/// answers and default to CONFIRMED.
struct ScriptedModel {
    reviews: Mutex<VecDeque<String>>,
    checks: Mutex<VecDeque<String>>,
    review_calls: AtomicU32,
    check_calls: AtomicU32,
}

impl ScriptedModel {
    fn new(reviews: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            reviews: Mutex::new(reviews.iter().map(|r| r.to_string()).collect()),
            checks: Mutex::new(VecDeque::new()),
            review_calls: AtomicU32::new(0),
            check_calls: AtomicU32::new(0),
        })
    }

    fn with_checks(self: Arc<Self>, answers: &[&str]) -> Arc<Self> {
        self.checks
            .lock()
            .unwrap()
            .extend(answers.iter().map(|a| a.to_string()));
        self
    }

    fn reviews(&self) -> u32 {
        self.review_calls.load(Ordering::SeqCst)
    }

    fn checks(&self) -> u32 {
        self.check_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, VeritasError> {
        if messages[0].content == check_system_prompt() {
            self.check_calls.fetch_add(1, Ordering::SeqCst);
            let answer = self.checks.lock().unwrap().pop_front();
            return Ok(answer.unwrap_or_else(|| "CONFIRMED".into()));
        }
        self.review_calls.fetch_add(1, Ordering::SeqCst);
        self.reviews
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| VeritasError::Llm("no scripted review left".into()))
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

#[derive(Default)]
struct RepoFiles {
    files: HashMap<String, String>,
    broken: bool,
    calls: AtomicU32,
}

impl RepoFiles {
    fn with(files: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
            ..Self::default()
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepositoryContent for RepoFiles {
    async fn file_content(
        &self,
        _repo: &RepoRef,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<Vec<u8>>, VeritasError> {
        assert_eq!(git_ref, "head123");
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            return Err(VeritasError::Transport("connection reset".into()));
        }
        Ok(self.files.get(path).map(|c| c.as_bytes().to_vec()))
    }
}

#[derive(Default)]
struct Comments {
    bodies: Mutex<HashMap<u64, String>>,
}

#[async_trait]
impl CommentApi for Comments {
    async fn create_comment(
        &self,
        _pr: &PullRequestId,
        body: &str,
    ) -> Result<CommentRef, VeritasError> {
        let mut bodies = self.bodies.lock().unwrap();
        let id = bodies.len() as u64 + 1;
        bodies.insert(id, body.to_string());
        Ok(CommentRef(id))
    }

    async fn update_comment(
        &self,
        _pr: &PullRequestId,
        comment: CommentRef,
        body: &str,
    ) -> Result<(), VeritasError> {
        self.bodies
            .lock()
            .unwrap()
            .insert(comment.0, body.to_string());
        Ok(())
    }

    async fn find_comment(
        &self,
        _pr: &PullRequestId,
        marker: &str,
    ) -> Result<Option<CommentRef>, VeritasError> {
        Ok(self
            .bodies
            .lock()
            .unwrap()
            .iter()
            .find(|(_, body)| body.contains(marker))
            .map(|(id, _)| CommentRef(*id)))
    }
}

fn config(budget: i64, max_iterations: u32) -> VeritasConfig {
    let mut config = VeritasConfig::default();
    config.verification.budget = budget;
    config.verification.max_iterations = max_iterations;
    config.llm.max_retries = 0;
    config.llm.retry_base_ms = 1;
    config
}

fn snapshot(raw_diff: &str) -> PullRequestSnapshot {
    let refs = RefPair {
        base: "base456".into(),
        head: "head123".into(),
    };
    PullRequestSnapshot {
        diff: Diff::parse(raw_diff, refs).unwrap(),
        head_ref: "head123".into(),
        base_ref: "base456".into(),
        base_branch: "main".into(),
        title: "Return the path".into(),
        body: None,
    }
}

async fn verify(
    model: Arc<ScriptedModel>,
    files: Arc<RepoFiles>,
    config: &VeritasConfig,
) -> VerificationRun {
    let budget = Budget::from_setting(config.verification.budget).unwrap();
    let run = VerificationRun::new(
        PullRequestId::new("octo", "app", 12),
        "head123",
        CommentRef(1),
        budget,
    );
    RefinementController::new(model, files, config)
        .run(run, &snapshot(UTILS_DIFF))
        .await
}

/// No item of the published text may carry a refuted claim's key.
fn assert_no_refuted_published(run: &VerificationRun) {
    let refuted: HashSet<_> = run
        .claims
        .iter()
        .filter(|c| c.verdict == Verdict::Refuted)
        .map(|c| c.key())
        .collect();
    let text = run.final_text.as_deref().unwrap_or("");
    for claim in extract_claims(text) {
        assert!(
            !refuted.contains(&claim.key()),
            "refuted claim published: {}",
            claim.assertion
        );
    }
}

#[tokio::test]
async fn refuted_missing_import_is_dropped_and_run_converges() {
    let model = ScriptedModel::new(&[
        "Adds sys.\n\n### Findings\n- file utils.py is missing import os\n",
        "Adds sys.\n\nNo issues found.\n",
    ]);
    let files = RepoFiles::with(&[("utils.py", UTILS_PY)]);
    let run = verify(model.clone(), files.clone(), &config(20, 5)).await;

    assert_eq!(run.status, RunStatus::Converged);
    assert_eq!(run.iteration, 1);
    assert_eq!(run.claims.len(), 1);
    assert_eq!(run.claims[0].verdict, Verdict::Refuted);
    assert_eq!(run.claims[0].evidence.as_deref(), Some("L1: import os"));
    let text = run.final_text.as_deref().unwrap();
    assert!(extract_claims(text).is_empty());
    assert!(!text.contains("missing import"));

    assert_eq!(model.reviews(), 2);
    assert_eq!(model.checks(), 0);
    assert_eq!(run.budget.spent(), 1);
    assert_eq!(
        run.transitions,
        vec![
            Phase::Drafting,
            Phase::Extracting,
            Phase::Validating,
            Phase::Refining,
            Phase::Extracting,
            Phase::Validating,
        ]
    );
}

#[tokio::test]
async fn defined_symbol_with_missing_handling_is_kept() {
    let draft = "Summary.\n\n- [missing_code] `utils.py:4-6` `cwd()` is missing error handling around os.getcwd\n";
    let model = ScriptedModel::new(&[draft]).with_checks(&["CONFIRMED: getcwd is not guarded"]);
    let files = RepoFiles::with(&[("utils.py", UTILS_PY)]);
    let run = verify(model.clone(), files.clone(), &config(20, 5)).await;

    assert_eq!(run.status, RunStatus::Converged);
    assert_eq!(run.claims.len(), 1);
    assert!(run.claims[0].subject.is_none());
    assert_eq!(run.claims[0].verdict, Verdict::Confirmed);
    assert_eq!(model.checks(), 1);
    assert_eq!(model.reviews(), 1);
    assert!(run
        .final_text
        .as_deref()
        .unwrap()
        .contains("`cwd()` is missing error handling"));
    assert_no_refuted_published(&run);
}

#[tokio::test]
async fn syntax_claim_is_settled_from_the_cited_line() {
    let model = ScriptedModel::new(&[
        "Summary.\n\n- `utils.py` has a syntax error on line 5\n",
        "Summary.\n\nNo issues found.\n",
    ]);
    let files = RepoFiles::with(&[("utils.py", UTILS_PY)]);
    let run = verify(model.clone(), files.clone(), &config(20, 5)).await;

    assert_eq!(run.status, RunStatus::Converged);
    assert_eq!(run.claims[0].kind, ClaimKind::Syntax);
    assert_eq!(run.claims[0].verdict, Verdict::Refuted);
    assert!(run.claims[0]
        .evidence
        .as_deref()
        .unwrap()
        .starts_with("L5: path = os.getcwd()"));
    assert_eq!(model.checks(), 0);
    assert_eq!(run.budget.spent(), 1);
    assert_no_refuted_published(&run);
}

#[tokio::test]
async fn claim_without_file_is_kept_unverifiable() {
    let model = ScriptedModel::new(&["Summary.\n\n- function foo has no error handling\n"]);
    let files = RepoFiles::with(&[]);
    let run = verify(model.clone(), files.clone(), &config(20, 5)).await;

    assert_eq!(run.status, RunStatus::Converged);
    assert_eq!(run.iteration, 0);
    assert_eq!(run.claims.len(), 1);
    assert_eq!(run.claims[0].verdict, Verdict::Unverifiable);
    assert!(run
        .final_text
        .as_deref()
        .unwrap()
        .contains("- function foo has no error handling"));
    assert_eq!(model.reviews(), 1);
    assert_eq!(files.calls(), 0);
    assert_eq!(run.budget.spent(), 0);
}

#[tokio::test]
async fn zero_budget_publishes_unverified_draft() {
    let draft = "Summary.\n\n- [bug] `utils.py:5-6` the path is returned without normalisation\n";
    let model = ScriptedModel::new(&[draft]);
    let files = RepoFiles::with(&[("utils.py", UTILS_PY)]);
    let run = verify(model.clone(), files.clone(), &config(0, 5)).await;

    assert_eq!(run.status, RunStatus::BudgetExceeded);
    assert_eq!(run.transitions, vec![Phase::Drafting, Phase::Extracting]);
    assert_eq!(model.reviews(), 1);
    assert_eq!(model.checks(), 0);
    assert_eq!(files.calls(), 0);
    assert_eq!(run.budget.spent(), 0);
    assert_eq!(run.claims[0].verdict, Verdict::Unverifiable);
    assert_eq!(run.final_text.as_deref(), Some(draft.trim()));

    let comments = Arc::new(Comments::default());
    let publisher = Publisher::new(comments.clone(), "Veritas");
    let pr = PullRequestId::new("octo", "app", 12);
    let placeholder = publisher.open_placeholder(&pr, "head123").await.unwrap();
    let mut run = run;
    run.comment = placeholder;
    publisher.publish(&run).await.unwrap();

    let bodies = comments.bodies.lock().unwrap();
    assert_eq!(bodies.len(), 1);
    let body = &bodies[&placeholder.0];
    assert!(body.contains("the path is returned without normalisation"));
    assert!(body.contains("Partial verification"));
}

#[tokio::test]
async fn zero_budget_stops_after_extracting_whatever_the_draft_claims() {
    let drafts = [
        "Summary.\n\n- function foo has no error handling\n",
        "Summary.\n\nNo issues found.\n",
    ];
    for draft in drafts {
        let model = ScriptedModel::new(&[draft]);
        let files = RepoFiles::with(&[("utils.py", UTILS_PY)]);
        let run = verify(model.clone(), files.clone(), &config(0, 5)).await;

        assert_eq!(run.status, RunStatus::BudgetExceeded, "{draft:?}");
        assert_eq!(run.transitions, vec![Phase::Drafting, Phase::Extracting], "{draft:?}");
        assert_eq!(run.final_text.as_deref(), Some(draft.trim()));
        assert!(run.claims.iter().all(|c| c.verdict == Verdict::Unverifiable));
        assert_eq!(model.checks(), 0);
        assert_eq!(files.calls(), 0);

        let body = render_review(&run, "Veritas");
        assert!(body.contains("Partial verification"), "{draft:?}");
    }
}

#[tokio::test]
async fn missing_file_is_unverifiable_not_refuted() {
    let model = ScriptedModel::new(&["Summary.\n\n- [bug] `src/gone.rs:4` unwrap on a None value\n"]);
    let files = RepoFiles::with(&[("utils.py", UTILS_PY)]);
    let run = verify(model.clone(), files.clone(), &config(20, 5)).await;

    assert_eq!(run.status, RunStatus::Converged);
    assert_eq!(run.claims[0].verdict, Verdict::Unverifiable);
    assert!(run.claims[0].evidence.as_deref().unwrap().contains("does not exist"));
    assert!(run.final_text.as_deref().unwrap().contains("unwrap on a None value"));
    assert_eq!(model.checks(), 0);
    assert_eq!(files.calls(), 1);
}

#[tokio::test]
async fn model_checks_decide_other_claims_and_verdicts_carry_over() {
    let model = ScriptedModel::new(&[
        "Summary.\n\n\
         - [bug] `utils.py:5` `os.getcwd()` can raise if the directory was removed\n\
         - [bug] `utils.py:6` returns None on every path\n",
        "Summary.\n\n\
         - [bug] `utils.py:5` `os.getcwd()` can raise if the directory was removed\n",
    ])
    .with_checks(&[
        "CONFIRMED: getcwd raises FileNotFoundError",
        "REFUTED: line 6 returns path",
    ]);
    let files = RepoFiles::with(&[("utils.py", UTILS_PY)]);
    let run = verify(model.clone(), files.clone(), &config(20, 5)).await;

    assert_eq!(run.status, RunStatus::Converged);
    assert_eq!(run.iteration, 1);
    // One fetch and two model checks; the second pass inherits its verdict.
    assert_eq!(run.budget.spent(), 3);
    assert_eq!(model.checks(), 2);
    assert_eq!(files.calls(), 1);
    assert_eq!(run.current_pass().len(), 1);
    assert_eq!(run.current_pass()[0].verdict, Verdict::Confirmed);
    assert_no_refuted_published(&run);
}

#[tokio::test]
async fn repeated_claim_set_converges_without_another_call() {
    let stubborn = "Summary.\n\n- [missing_code] `utils.py:1` missing import `os`\n- [style] `utils.py:5` `path` could be inlined\n";
    let model = ScriptedModel::new(&[stubborn, stubborn]);
    let files = RepoFiles::with(&[("utils.py", UTILS_PY)]);
    let run = verify(model.clone(), files.clone(), &config(20, 5)).await;

    assert_eq!(run.status, RunStatus::Converged);
    assert_eq!(run.iteration, 1);
    assert_eq!(model.reviews(), 2);
    // Only the style claim needed the model, once.
    assert_eq!(model.checks(), 1);
    let text = run.final_text.as_deref().unwrap();
    assert!(!text.contains("missing import"));
    assert!(text.contains("could be inlined"));
    assert_no_refuted_published(&run);
}

#[tokio::test]
async fn unlimited_budget_still_stops_at_the_iteration_ceiling() {
    let model = ScriptedModel::new(&[
        "- [missing_code] `utils.py` missing import `os`\n",
        "- [missing_code] `utils.py` missing import `sys`\n",
        "- [missing_code] `utils.py` `cwd` is never defined\n",
        "- [missing_code] `utils.py` missing import `os` at the top\n",
        "never requested\n",
    ]);
    let files = RepoFiles::with(&[("utils.py", UTILS_PY)]);
    let run = verify(model.clone(), files.clone(), &config(-1, 3)).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.iteration, 3);
    assert!(run.failure.as_deref().unwrap().contains("iteration ceiling"));
    assert_eq!(model.reviews(), 4);
    assert!(run.budget.is_unlimited());
    assert_eq!(run.budget.spent(), 1);
    assert!(extract_claims(run.final_text.as_deref().unwrap()).is_empty());
}

#[tokio::test]
async fn spending_never_exceeds_the_budget() {
    let draft = "Summary.\n\n\
                 - [bug] `a.py:1` division by zero when count is 0\n\
                 - [bug] `b.py:1` the handle is never closed\n\
                 - [security] `c.py:1` the token is logged\n";
    let files = [
        ("a.py", "ratio = total / count\n"),
        ("b.py", "handle = open('x')\n"),
        ("c.py", "log.info(token)\n"),
    ];

    for budget in 0..=7 {
        let model = ScriptedModel::new(&[draft]);
        let repo = RepoFiles::with(&files);
        let run = verify(model.clone(), repo, &config(budget, 5)).await;

        assert!(i64::from(run.budget.spent()) <= budget, "budget {budget}");
        assert!(run
            .claims
            .iter()
            .all(|c| c.verdict != Verdict::Pending));
        // Each claim costs a fetch and a model check.
        match budget {
            0..=4 => assert_eq!(run.status, RunStatus::BudgetExceeded, "budget {budget}"),
            5 => {
                assert_eq!(run.status, RunStatus::Converged);
                assert_eq!(run.count(Verdict::Confirmed), 2);
                assert_eq!(run.count(Verdict::Unverifiable), 1);
            }
            _ => {
                assert_eq!(run.status, RunStatus::Converged);
                assert_eq!(run.count(Verdict::Confirmed), 3);
            }
        }
    }
}

#[tokio::test]
async fn fetched_file_without_budget_for_the_check_is_unverifiable() {
    let model = ScriptedModel::new(&["- [bug] `utils.py:5` getcwd can raise\n"]);
    let files = RepoFiles::with(&[("utils.py", UTILS_PY)]);
    let run = verify(model.clone(), files.clone(), &config(1, 5)).await;

    assert_eq!(run.status, RunStatus::Converged);
    assert_eq!(run.claims[0].verdict, Verdict::Unverifiable);
    assert_eq!(
        run.claims[0].evidence.as_deref(),
        Some("budget exhausted before model check")
    );
    assert_eq!(model.checks(), 0);
    assert_eq!(run.budget.spent(), 1);
}

#[tokio::test]
async fn repeated_transport_failures_fail_the_run() {
    let model = ScriptedModel::new(&[
        "- [bug] `a.py:1` x\n- [bug] `b.py:1` y\n- [bug] `c.py:1` z\n",
    ]);
    let files = Arc::new(RepoFiles {
        broken: true,
        ..RepoFiles::default()
    });
    let mut config = config(20, 5);
    config.verification.max_transport_failures = 2;
    let run = verify(model, files.clone(), &config).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.failure.as_deref().unwrap().contains("transport"));
    assert_eq!(files.calls(), 2);
    assert!(run.claims.iter().all(|c| c.verdict == Verdict::Unverifiable));
}

#[tokio::test]
async fn draft_failure_fails_the_run() {
    let model = ScriptedModel::new(&[]);
    let run = verify(model, RepoFiles::with(&[]), &config(20, 5)).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run
        .failure
        .as_deref()
        .unwrap()
        .starts_with("draft generation failed"));
    assert!(run.claims.is_empty());
}

#[tokio::test]
async fn fully_filtered_diff_needs_no_model() {
    let lock_only = "\
diff --git a/Cargo.lock b/Cargo.lock
--- a/Cargo.lock
+++ b/Cargo.lock
@@ -1,1 +1,1 @@
-version = 3
+version = 4
";
    let model = ScriptedModel::new(&[]);
    let config = config(20, 5);
    let run = VerificationRun::new(
        PullRequestId::new("octo", "app", 12),
        "head123",
        CommentRef(1),
        Budget::limited(20),
    );
    let run = RefinementController::new(model.clone(), RepoFiles::with(&[]), &config)
        .run(run, &snapshot(lock_only))
        .await;

    assert_eq!(run.status, RunStatus::Converged);
    assert_eq!(run.final_text.as_deref(), Some(NO_REVIEWABLE_CHANGES));
    assert_eq!(model.reviews(), 0);
}
