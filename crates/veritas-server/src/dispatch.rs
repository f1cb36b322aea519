//! Per-pull-request run scheduling.
//!
//! At most one run per pull request is in flight. Deliveries that arrive
//! meanwhile share a single pending slot in which the newest one wins; when
//! the in-flight run ends, the pending delivery starts a fresh run. Runs
//! never share budget or caches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use veritas_core::{Budget, PullRequestId, VerificationRun, VeritasConfig, VeritasError};
use veritas_review::controller::RefinementController;
use veritas_review::history::HistoryEntry;
use veritas_review::ports::{
    CommentApi, DiffSource, LanguageModel, RepositoryContent, ReviewHistory,
};
use veritas_review::publish::Publisher;

/// The collaborators every run talks to.
#[derive(Clone)]
pub struct Services {
    /// Pull-request diffs and metadata.
    pub diffs: Arc<dyn DiffSource>,
    /// Repository files at the head commit.
    pub content: Arc<dyn RepositoryContent>,
    /// The bot's review comment.
    pub comments: Arc<dyn CommentApi>,
    /// Drafting and checking model.
    pub model: Arc<dyn LanguageModel>,
    /// Where finished runs are recorded, if anywhere.
    pub history: Option<Arc<dyn ReviewHistory>>,
}

/// One requested review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewJob {
    /// Pull request to review.
    pub pr: PullRequestId,
    /// Head commit named by the delivery.
    pub head_sha: String,
}

/// What [`Dispatcher::submit`] did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// A run started for it.
    Started,
    /// A run for the same pull request is in flight; the job waits in the
    /// pending slot, replacing whatever waited there.
    Queued,
}

/// Starts runs and coalesces deliveries for busy pull requests.
///
/// Cheap to clone; clones share the slot table.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    diffs: Arc<dyn DiffSource>,
    history: Option<Arc<dyn ReviewHistory>>,
    model_name: String,
    controller: RefinementController,
    publisher: Publisher,
    budget: Budget,
    /// Key present: a run is in flight. Value: the delivery waiting behind it.
    slots: Mutex<HashMap<PullRequestId, Option<ReviewJob>>>,
    idle: Notify,
}

impl Dispatcher {
    /// Build a dispatcher from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`VeritasError::Config`] for an invalid `verification.budget`.
    pub fn new(services: Services, config: &VeritasConfig) -> Result<Self, VeritasError> {
        let budget = Budget::from_setting(config.verification.budget)?;
        let controller =
            RefinementController::new(services.model.clone(), services.content.clone(), config);
        Ok(Self {
            inner: Arc::new(Inner {
                diffs: services.diffs,
                history: services.history,
                model_name: services.model.model().to_string(),
                controller,
                publisher: Publisher::new(services.comments, config.server.bot_name.clone()),
                budget,
                slots: Mutex::new(HashMap::new()),
                idle: Notify::new(),
            }),
        })
    }

    /// Start a run for `job`, or park it behind the run in flight.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, job: ReviewJob) -> Submission {
        let mut slots = self.inner.slots();
        if let Some(pending) = slots.get_mut(&job.pr) {
            if let Some(replaced) = pending.replace(job.clone()) {
                tracing::info!(pr = %job.pr, superseded = %replaced.head_sha, head = %job.head_sha, "pending review superseded");
            } else {
                tracing::info!(pr = %job.pr, head = %job.head_sha, "review queued behind in-flight run");
            }
            return Submission::Queued;
        }
        slots.insert(job.pr.clone(), None);
        drop(slots);

        tracing::info!(pr = %job.pr, head = %job.head_sha, "review started");
        tokio::spawn(self.inner.clone().work(job));
        Submission::Started
    }

    /// Pull requests with a run in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.slots().len()
    }

    /// Wait until no run is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.slots().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<PullRequestId, Option<ReviewJob>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Review `job`, then whatever queued behind it, until the slot is empty.
    ///
    /// Each review runs in its own task so that a panic inside it still
    /// releases the slot and lets the queued delivery start.
    async fn work(self: Arc<Self>, mut job: ReviewJob) {
        loop {
            let reviewing = tokio::spawn({
                let inner = self.clone();
                let job = job.clone();
                async move { inner.review(&job).await }
            });
            if let Err(e) = reviewing.await {
                tracing::error!(pr = %job.pr, head = %job.head_sha, error = %e, "review task aborted");
            }
            let next = {
                let mut slots = self.slots();
                match slots.get_mut(&job.pr).and_then(Option::take) {
                    Some(next) => next,
                    None => {
                        slots.remove(&job.pr);
                        break;
                    }
                }
            };
            tracing::info!(pr = %next.pr, head = %next.head_sha, "starting queued review");
            job = next;
        }
        self.idle.notify_waiters();
    }

    async fn review(&self, job: &ReviewJob) {
        let comment = match self.publisher.open_placeholder(&job.pr, &job.head_sha).await {
            Ok(comment) => comment,
            Err(e) => {
                tracing::error!(pr = %job.pr, error = %e, "could not open review comment");
                return;
            }
        };

        let snapshot = match self.diffs.pull_request(&job.pr).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(pr = %job.pr, error = %e, "could not fetch pull request");
                let reason = format!("could not fetch the pull request diff: {e}");
                if let Err(e) = self.publisher.publish_failure(&job.pr, comment, &reason).await {
                    tracing::error!(pr = %job.pr, error = %e, "could not publish failure notice");
                }
                return;
            }
        };
        if snapshot.head_ref != job.head_sha {
            tracing::debug!(pr = %job.pr, event = %job.head_sha, current = %snapshot.head_ref, "head moved since delivery");
        }

        let run = VerificationRun::new(job.pr.clone(), snapshot.head_ref.clone(), comment, self.budget);
        let run = self.controller.run(run, &snapshot).await;

        if let Err(e) = self.publisher.publish(&run).await {
            tracing::error!(pr = %job.pr, error = %e, "could not publish review");
        }
        if let Some(history) = &self.history {
            let recorded = match HistoryEntry::from_run(&run, &self.model_name) {
                Ok(entry) => history.record(&entry).await,
                Err(e) => Err(e),
            };
            if let Err(e) = recorded {
                tracing::warn!(pr = %job.pr, error = %e, "could not record review history");
            }
        }
    }
}
