use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use tokio::sync::Semaphore;
use veritas_core::{
    CommentRef, PullRequestId, RefPair, RepoRef, RunStatus, VeritasConfig, VeritasError,
};
use veritas_difflens::Diff;
use veritas_review::history::HistoryEntry;
use veritas_review::llm::ChatMessage;
use veritas_review::ports::{
    CommentApi, DiffSource, LanguageModel, PullRequestSnapshot, RepositoryContent, ReviewHistory,
};
use veritas_server::dispatch::{Dispatcher, ReviewJob, Services, Submission};
use veritas_server::http::{webhook, AppState, EVENT_HEADER, SIGNATURE_HEADER};
use veritas_server::signature::sign;

const APP_DIFF: &str = "diff --git a/src/app.py b/src/app.py\n\
--- a/src/app.py\n\
+++ b/src/app.py\n\
@@ -1,2 +1,3 @@\n \
def main():\n\
+    print(\"hello\")\n \
    return 0\n";

/// Diff source whose fetches block until the test opens the gate.
struct GatedDiffs {
    gate: Semaphore,
    fetches: AtomicU32,
    failing: AtomicBool,
    /// Fetches left that panic instead of answering.
    panics: AtomicU32,
}

impl GatedDiffs {
    fn closed() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            fetches: AtomicU32::new(0),
            failing: AtomicBool::new(false),
            panics: AtomicU32::new(0),
        })
    }

    fn open() -> Arc<Self> {
        let diffs = Self::closed();
        diffs.release(100);
        diffs
    }

    fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }

    fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiffSource for GatedDiffs {
    async fn pull_request(&self, _pr: &PullRequestId) -> Result<PullRequestSnapshot, VeritasError> {
        self.gate
            .acquire()
            .await
            .map_err(|e| VeritasError::Github(e.to_string()))?
            .forget();
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(VeritasError::Github("404 Not Found".into()));
        }
        let panicking = self
            .panics
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if panicking {
            panic!("diff source fell over");
        }
        let refs = RefPair {
            base: "snap-base".into(),
            head: "snap-head".into(),
        };
        Ok(PullRequestSnapshot {
            diff: Diff::parse(APP_DIFF, refs)?,
            head_ref: "snap-head".into(),
            base_ref: "snap-base".into(),
            base_branch: "main".into(),
            title: "Say hello".into(),
            body: None,
        })
    }
}

struct NoFiles;

#[async_trait]
impl RepositoryContent for NoFiles {
    async fn file_content(
        &self,
        _repo: &RepoRef,
        _path: &str,
        _git_ref: &str,
    ) -> Result<Option<Vec<u8>>, VeritasError> {
        Ok(None)
    }
}

/// A model that finds nothing to complain about.
struct QuietModel;

#[async_trait]
impl LanguageModel for QuietModel {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, VeritasError> {
        Ok("The change is small and reads fine.".into())
    }

    fn model(&self) -> &str {
        "quiet"
    }
}

#[derive(Default)]
struct Comments {
    /// id -> (pr number, body)
    bodies: Mutex<HashMap<u64, (u64, String)>>,
    /// Every body ever written, in order.
    log: Mutex<Vec<String>>,
    created: AtomicU32,
}

impl Comments {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn body_for(&self, number: u64) -> Option<String> {
        self.bodies
            .lock()
            .unwrap()
            .values()
            .find(|(n, _)| *n == number)
            .map(|(_, body)| body.clone())
    }
}

#[async_trait]
impl CommentApi for Comments {
    async fn create_comment(
        &self,
        pr: &PullRequestId,
        body: &str,
    ) -> Result<CommentRef, VeritasError> {
        let id = self.created.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        self.bodies
            .lock()
            .unwrap()
            .insert(id, (pr.number, body.to_string()));
        self.log.lock().unwrap().push(body.to_string());
        Ok(CommentRef(id))
    }

    async fn update_comment(
        &self,
        pr: &PullRequestId,
        comment: CommentRef,
        body: &str,
    ) -> Result<(), VeritasError> {
        self.bodies
            .lock()
            .unwrap()
            .insert(comment.0, (pr.number, body.to_string()));
        self.log.lock().unwrap().push(body.to_string());
        Ok(())
    }

    async fn find_comment(
        &self,
        pr: &PullRequestId,
        marker: &str,
    ) -> Result<Option<CommentRef>, VeritasError> {
        Ok(self
            .bodies
            .lock()
            .unwrap()
            .iter()
            .find(|(_, (n, body))| *n == pr.number && body.contains(marker))
            .map(|(id, _)| CommentRef(*id)))
    }
}

#[derive(Default)]
struct RecordedHistory {
    entries: Mutex<Vec<HistoryEntry>>,
}

#[async_trait]
impl ReviewHistory for RecordedHistory {
    async fn record(&self, entry: &HistoryEntry) -> Result<(), VeritasError> {
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

fn config() -> VeritasConfig {
    let mut config = VeritasConfig::default();
    config.llm.max_retries = 0;
    config.server.bot_name = "Veritas".into();
    config
}

fn dispatcher(
    diffs: Arc<GatedDiffs>,
    comments: Arc<Comments>,
    history: Option<Arc<RecordedHistory>>,
    config: &VeritasConfig,
) -> Dispatcher {
    let services = Services {
        diffs,
        content: Arc::new(NoFiles),
        comments,
        model: Arc::new(QuietModel),
        history: history.map(|h| h as Arc<dyn ReviewHistory>),
    };
    Dispatcher::new(services, config).unwrap()
}

fn job(number: u64, head: &str) -> ReviewJob {
    ReviewJob {
        pr: PullRequestId::new("octo", "app", number),
        head_sha: head.into(),
    }
}

async fn settle(dispatcher: &Dispatcher) {
    tokio::time::timeout(Duration::from_secs(5), dispatcher.wait_idle())
        .await
        .expect("reviews did not finish");
}

#[tokio::test]
async fn deliveries_for_a_busy_pr_coalesce_to_the_newest() {
    let diffs = GatedDiffs::closed();
    let comments = Arc::new(Comments::default());
    let dispatcher = dispatcher(diffs.clone(), comments.clone(), None, &config());

    assert_eq!(dispatcher.submit(job(7, "head-one")), Submission::Started);
    assert_eq!(dispatcher.submit(job(7, "head-two")), Submission::Queued);
    assert_eq!(dispatcher.submit(job(7, "head-three")), Submission::Queued);
    assert_eq!(dispatcher.submit(job(8, "other-head")), Submission::Started);
    assert_eq!(dispatcher.in_flight(), 2);

    diffs.release(100);
    settle(&dispatcher).await;

    assert_eq!(dispatcher.in_flight(), 0);
    assert_eq!(diffs.fetches(), 3);
    let log = comments.log();
    assert!(log.iter().any(|b| b.contains("Reviewing `head-one`")));
    assert!(log.iter().any(|b| b.contains("Reviewing `head-three`")));
    assert!(!log.iter().any(|b| b.contains("head-two")));
    // One comment per pull request, reused by the queued run.
    assert_eq!(comments.created.load(Ordering::SeqCst), 2);
    let final_body = comments.body_for(7).unwrap();
    assert!(final_body.contains("The change is small and reads fine."));
    assert!(final_body.contains("`snap-head`"));
}

#[tokio::test]
async fn pr_is_free_again_after_its_run() {
    let diffs = GatedDiffs::open();
    let comments = Arc::new(Comments::default());
    let dispatcher = dispatcher(diffs.clone(), comments, None, &config());

    assert_eq!(dispatcher.submit(job(3, "first")), Submission::Started);
    settle(&dispatcher).await;
    assert_eq!(dispatcher.submit(job(3, "second")), Submission::Started);
    settle(&dispatcher).await;
    assert_eq!(diffs.fetches(), 2);
}

#[tokio::test]
async fn finished_runs_are_recorded() {
    let history = Arc::new(RecordedHistory::default());
    let dispatcher = dispatcher(
        GatedDiffs::open(),
        Arc::new(Comments::default()),
        Some(history.clone()),
        &config(),
    );
    dispatcher.submit(job(5, "abc"));
    settle(&dispatcher).await;

    let entries = history.entries.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].pr_number, 5);
    assert_eq!(entries[0].status, RunStatus::Converged);
    assert_eq!(entries[0].head_ref, "snap-head");
    assert_eq!(entries[0].model, "quiet");
}

#[tokio::test]
async fn diff_fetch_failure_is_published() {
    let diffs = GatedDiffs::open();
    diffs.failing.store(true, Ordering::SeqCst);
    let comments = Arc::new(Comments::default());
    let history = Arc::new(RecordedHistory::default());
    let dispatcher = dispatcher(diffs, comments.clone(), Some(history.clone()), &config());

    dispatcher.submit(job(9, "abc"));
    settle(&dispatcher).await;

    let body = comments.body_for(9).unwrap();
    assert!(body.contains("could not fetch the pull request diff"));
    assert!(body.contains("404 Not Found"));
    assert!(history.entries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn panicking_review_releases_the_slot() {
    let diffs = GatedDiffs::closed();
    diffs.panics.store(1, Ordering::SeqCst);
    let comments = Arc::new(Comments::default());
    let dispatcher = dispatcher(diffs.clone(), comments.clone(), None, &config());

    assert_eq!(dispatcher.submit(job(4, "first")), Submission::Started);
    assert_eq!(dispatcher.submit(job(4, "second")), Submission::Queued);
    diffs.release(100);
    settle(&dispatcher).await;

    assert_eq!(dispatcher.in_flight(), 0);
    assert_eq!(diffs.fetches(), 2);
    assert!(comments
        .body_for(4)
        .unwrap()
        .contains("The change is small and reads fine."));

    assert_eq!(dispatcher.submit(job(4, "third")), Submission::Started);
    settle(&dispatcher).await;
    assert_eq!(diffs.fetches(), 3);
}

#[test]
fn invalid_budget_is_rejected() {
    let mut config = config();
    config.verification.budget = -3;
    let services = Services {
        diffs: GatedDiffs::open(),
        content: Arc::new(NoFiles),
        comments: Arc::new(Comments::default()),
        model: Arc::new(QuietModel),
        history: None,
    };
    assert!(Dispatcher::new(services, &config).is_err());
}

// --- webhook handler ---

const SECRET: &str = "topsecret";

fn state(secret: Option<&str>, branches: &[&str]) -> (AppState, Dispatcher) {
    let mut config = config();
    config.server.webhook_secret = secret.map(str::to_string);
    config.server.branches = branches.iter().map(|b| b.to_string()).collect();
    let dispatcher = dispatcher(GatedDiffs::closed(), Arc::new(Comments::default()), None, &config);
    (AppState::new(dispatcher.clone(), config.server), dispatcher)
}

fn pr_payload(action: &str, base: &str) -> Bytes {
    Bytes::from(
        serde_json::json!({
            "action": action,
            "number": 42,
            "pull_request": {
                "title": "Say hello",
                "head": { "sha": "feedbeef", "ref": "topic" },
                "base": { "sha": "cafe", "ref": base }
            },
            "repository": { "full_name": "octo/app", "name": "app", "owner": { "login": "octo" } }
        })
        .to_string(),
    )
}

fn headers(event: &str, signature: Option<String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(EVENT_HEADER, HeaderValue::from_str(event).unwrap());
    if let Some(signature) = signature {
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&signature).unwrap());
    }
    headers
}

async fn deliver(state: AppState, headers: HeaderMap, body: Bytes) -> StatusCode {
    webhook(State(state), headers, body).await.into_response().status()
}

#[tokio::test]
async fn signed_pull_request_is_accepted_and_dispatched() {
    let (state, dispatcher) = state(Some(SECRET), &[]);
    let body = pr_payload("opened", "main");
    let signature = sign(SECRET.as_bytes(), &body).unwrap();

    let status = deliver(state, headers("pull_request", Some(signature)), body).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(dispatcher.in_flight(), 1);
}

#[tokio::test]
async fn bad_or_missing_signature_is_unauthorized() {
    let (state, dispatcher) = state(Some(SECRET), &[]);
    let body = pr_payload("opened", "main");
    let forged = sign(b"wrong secret", &body).unwrap();

    let status = deliver(state.clone(), headers("pull_request", Some(forged)), body.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let status = deliver(state, headers("pull_request", None), body).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(dispatcher.in_flight(), 0);
}

#[tokio::test]
async fn unsigned_delivery_is_accepted_without_a_secret() {
    let (state, _) = state(None, &[]);
    let status = deliver(state, headers("ping", None), Bytes::from_static(b"{}")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn other_actions_and_events_are_ignored() {
    let (state, dispatcher) = state(None, &[]);
    let status = deliver(state.clone(), headers("pull_request", None), pr_payload("closed", "main")).await;
    assert_eq!(status, StatusCode::OK);
    let status = deliver(state, headers("issues", None), Bytes::from_static(b"{}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dispatcher.in_flight(), 0);
}

#[tokio::test]
async fn unmonitored_branch_is_ignored() {
    let (state, dispatcher) = state(None, &["release"]);
    let status = deliver(state, headers("pull_request", None), pr_payload("synchronize", "main")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dispatcher.in_flight(), 0);
}

#[tokio::test]
async fn malformed_requests_are_bad_requests() {
    let (state, _) = state(None, &[]);
    let status = deliver(state.clone(), headers("pull_request", None), Bytes::from_static(b"{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let status = deliver(state, HeaderMap::new(), Bytes::from_static(b"{}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
