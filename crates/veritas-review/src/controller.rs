//! The draft, extract, validate, refine loop of one verification run.
//!
//! ```text
//! Drafting → Extracting → Validating ─┬─ no refuted claims ──────→ Converged
//!                ↑                    ├─ budget ran out ──────────→ BudgetExceeded
//!                └──── Refining ←─────┴─ refuted, under ceiling
//!                                        refuted at ceiling ───────→ Failed
//! ```
//!
//! A pass whose claim set equals the previous pass's converges without
//! another model call. A run whose budget is spent before its first
//! validation pass ends BudgetExceeded straight from Extracting, whatever
//! the draft claims; a later pass does the same when nothing it holds can
//! be checked for free. Whatever the status, refuted items never reach the
//! final text.

use std::collections::HashSet;
use std::sync::Arc;

use veritas_core::{
    Claim, ClaimKey, Phase, RunStatus, Verdict, VerificationRun, VeritasConfig,
};
use veritas_difflens::filter::DiffFilter;

use crate::evidence::EvidenceFetcher;
use crate::extract::{extract_claims, strip_items};
use crate::generator::ReviewGenerator;
use crate::ports::{LanguageModel, PullRequestSnapshot, RepositoryContent};
use crate::retry::RetryPolicy;
use crate::validate::{ClaimValidator, ValidationOutcome};

/// Final text of a run whose diff had nothing left after filtering.
pub const NO_REVIEWABLE_CHANGES: &str =
    "No reviewable changes: every file in this pull request matched a skip rule.";

enum PassOutcome {
    Completed,
    BudgetExceeded,
    TransportFailures(u32),
}

/// Drives a [`VerificationRun`] to a terminal status.
pub struct RefinementController {
    generator: ReviewGenerator,
    validator: ClaimValidator,
    content: Arc<dyn RepositoryContent>,
    filter: DiffFilter,
    retry: RetryPolicy,
    max_iterations: u32,
    max_transport_failures: u32,
    max_file_bytes: usize,
}

impl RefinementController {
    /// Wire a controller from configuration.
    pub fn new(
        model: Arc<dyn LanguageModel>,
        content: Arc<dyn RepositoryContent>,
        config: &VeritasConfig,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.llm);
        let verification = &config.verification;
        Self {
            generator: ReviewGenerator::new(model.clone(), retry, config.review.max_diff_chars),
            validator: ClaimValidator::new(model, retry, verification.snippet_lines),
            content,
            filter: DiffFilter::from_config(&config.review),
            retry,
            max_iterations: verification.iteration_ceiling(),
            max_transport_failures: verification.max_transport_failures,
            max_file_bytes: verification.max_file_bytes,
        }
    }

    /// Refinement passes allowed before a run with refuted claims fails.
    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Run the loop for `snapshot` and return the finished run.
    ///
    /// Never fails: problems end the run as [`RunStatus::Failed`] with
    /// [`VerificationRun::failure`] set.
    #[tracing::instrument(name = "verification", skip_all, fields(pr = %run.pr, head = %run.head_ref))]
    pub async fn run(
        &self,
        mut run: VerificationRun,
        snapshot: &PullRequestSnapshot,
    ) -> VerificationRun {
        let diff = self.filter.apply(snapshot.diff.clone());
        if diff.is_empty() {
            tracing::info!("no reviewable files after filtering");
            run.finish(RunStatus::Converged, NO_REVIEWABLE_CHANGES.to_string());
            return run;
        }

        let mut fetcher = EvidenceFetcher::new(
            self.content.clone(),
            run.pr.repo.clone(),
            self.retry,
            self.max_file_bytes,
        );

        transition(&mut run, Phase::Drafting);
        match self
            .generator
            .draft(&diff, &snapshot.title, snapshot.body.as_deref())
            .await
        {
            Ok(text) => run.draft = text,
            Err(e) => {
                run.fail(format!("draft generation failed: {e}"));
                return finalize(run, RunStatus::Failed);
            }
        }

        let mut previous: Option<HashSet<ClaimKey>> = None;
        let status = loop {
            transition(&mut run, Phase::Extracting);
            let claims = extract_claims(&run.draft);
            let keys: HashSet<ClaimKey> = claims.iter().map(Claim::key).collect();
            if previous.as_ref() == Some(&keys) {
                tracing::info!("claim set unchanged by refinement");
                break RunStatus::Converged;
            }
            previous = Some(keys);
            run.begin_pass(claims);
            tracing::info!(
                claims = run.current_pass().len(),
                pending = run.pending_indices().len(),
                "claims extracted"
            );

            if run.budget.is_exhausted() && (run.iteration == 0 || !has_free_check(&run, &fetcher)) {
                tracing::info!(budget = %run.budget, "no budget left to validate claims");
                break RunStatus::BudgetExceeded;
            }

            transition(&mut run, Phase::Validating);
            match self.validate_pass(&mut run, &mut fetcher).await {
                PassOutcome::Completed => {}
                PassOutcome::BudgetExceeded => break RunStatus::BudgetExceeded,
                PassOutcome::TransportFailures(n) => {
                    run.fail(format!("{n} consecutive claims failed with transport errors"));
                    break RunStatus::Failed;
                }
            }

            let refuted = run.count(Verdict::Refuted);
            if refuted == 0 {
                break RunStatus::Converged;
            }
            if run.iteration >= self.max_iterations {
                run.fail(format!(
                    "iteration ceiling reached: {refuted} claim(s) still refuted after {} refinement pass(es)",
                    run.iteration
                ));
                break RunStatus::Failed;
            }

            transition(&mut run, Phase::Refining);
            let refined = {
                let refuted = run.refuted();
                self.generator.refine(&run.draft, &refuted, &diff).await
            };
            match refined {
                Ok(text) => {
                    run.draft = text;
                    run.iteration += 1;
                }
                Err(e) => {
                    run.fail(format!("refinement failed: {e}"));
                    break RunStatus::Failed;
                }
            }
        };

        finalize(run, status)
    }

    async fn validate_pass(
        &self,
        run: &mut VerificationRun,
        fetcher: &mut EvidenceFetcher,
    ) -> PassOutcome {
        let mut consecutive_failures = 0;
        for idx in run.pending_indices() {
            let claim = run.claims[idx].clone();
            let outcome = self
                .validator
                .validate(&claim, fetcher, &run.head_ref, &mut run.budget)
                .await;
            let validation = match outcome {
                ValidationOutcome::Decided(validation) => validation,
                ValidationOutcome::BudgetExhausted => {
                    tracing::info!(claim = claim.id, budget = %run.budget, "verification budget exhausted");
                    return PassOutcome::BudgetExceeded;
                }
            };

            tracing::debug!(
                claim = claim.id,
                verdict = %validation.verdict,
                evidence = validation.evidence.as_deref().unwrap_or(""),
                "claim decided"
            );
            if validation.transport_failure {
                consecutive_failures += 1;
            } else {
                consecutive_failures = 0;
            }
            run.claims[idx].decide(validation.verdict, validation.evidence);

            if self.max_transport_failures > 0 && consecutive_failures >= self.max_transport_failures {
                tracing::warn!(failures = consecutive_failures, "giving up after repeated transport failures");
                return PassOutcome::TransportFailures(consecutive_failures);
            }
        }
        PassOutcome::Completed
    }
}

/// Can any pending claim still be checked without spending a unit?
fn has_free_check(run: &VerificationRun, fetcher: &EvidenceFetcher) -> bool {
    let pending = run.pending_indices();
    pending.is_empty()
        || pending.iter().any(|&i| {
            run.claims[i]
                .file_path
                .as_deref()
                .map_or(true, |path| fetcher.is_cached(path, &run.head_ref))
        })
}

fn transition(run: &mut VerificationRun, phase: Phase) {
    tracing::info!(phase = %phase, iteration = run.iteration, budget = %run.budget, "entering phase");
    run.enter(phase);
}

/// Strip refuted items from the current draft and close the run.
fn finalize(mut run: VerificationRun, status: RunStatus) -> VerificationRun {
    let refuted: HashSet<ClaimKey> = run.refuted().into_iter().map(Claim::key).collect();
    let text = if refuted.is_empty() {
        run.draft.clone()
    } else {
        strip_items(&run.draft, |claim| refuted.contains(&claim.key()))
    };
    run.finish(status, text);
    tracing::info!(
        status = %run.status,
        iterations = run.iteration,
        spent = run.budget.spent(),
        confirmed = run.count(Verdict::Confirmed),
        unverifiable = run.count(Verdict::Unverifiable),
        removed = refuted.len(),
        "verification finished"
    );
    run
}
