use std::sync::Arc;

use veritas_core::{Claim, VeritasError};
use veritas_difflens::Diff;

use crate::llm::ChatMessage;
use crate::ports::LanguageModel;
use crate::prompt::{build_draft_prompt, build_refine_prompt, review_system_prompt, strip_code_fences};
use crate::retry::RetryPolicy;

/// Writes and rewrites review text.
///
/// Neither call is charged against the verification budget. An empty
/// answer counts as malformed output and is retried like a transport error.
pub struct ReviewGenerator {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    max_diff_chars: usize,
}

impl ReviewGenerator {
    /// Build a generator; `max_diff_chars` caps the diff text sent per prompt.
    pub fn new(model: Arc<dyn LanguageModel>, retry: RetryPolicy, max_diff_chars: usize) -> Self {
        Self {
            model,
            retry,
            max_diff_chars,
        }
    }

    /// Draft a review of `diff`.
    ///
    /// # Errors
    ///
    /// Returns the model error once retries are exhausted.
    pub async fn draft(
        &self,
        diff: &Diff,
        title: &str,
        description: Option<&str>,
    ) -> Result<String, VeritasError> {
        let description = description.map(str::trim).filter(|d| !d.is_empty());
        let messages = [
            ChatMessage::system(review_system_prompt()),
            ChatMessage::user(build_draft_prompt(
                title,
                description,
                &diff.to_prompt_text(self.max_diff_chars),
            )),
        ];
        self.ask("draft review", &messages).await
    }

    /// Rewrite `prior` without the findings in `refuted`.
    ///
    /// # Errors
    ///
    /// Returns the model error once retries are exhausted.
    pub async fn refine(
        &self,
        prior: &str,
        refuted: &[&Claim],
        diff: &Diff,
    ) -> Result<String, VeritasError> {
        let messages = [
            ChatMessage::system(review_system_prompt()),
            ChatMessage::user(build_refine_prompt(
                prior,
                refuted,
                &diff.to_prompt_text(self.max_diff_chars),
            )),
        ];
        self.ask("refine review", &messages).await
    }

    async fn ask(&self, what: &str, messages: &[ChatMessage]) -> Result<String, VeritasError> {
        let model = &self.model;
        self.retry
            .run(what, move || ask_once(model.as_ref(), messages))
            .await
    }
}

async fn ask_once(model: &dyn LanguageModel, messages: &[ChatMessage]) -> Result<String, VeritasError> {
    let text = model.complete(messages).await?;
    let text = strip_code_fences(&text);
    if text.is_empty() {
        return Err(VeritasError::MalformedModelOutput("empty review".into()));
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use veritas_core::{ClaimKind, RefPair, Verdict};

    use super::*;

    struct Scripted {
        answers: Mutex<Vec<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(answers: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.iter().rev().map(|a| a.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for Scripted {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String, VeritasError> {
            self.prompts.lock().unwrap().push(messages[1].content.clone());
            self.answers
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| VeritasError::Llm("script exhausted".into()))
        }

        fn model(&self) -> &str {
            "scripted"
        }
    }

    fn diff() -> Diff {
        let raw = "\
diff --git a/app/utils.py b/app/utils.py
--- a/app/utils.py
+++ b/app/utils.py
@@ -1,2 +1,3 @@
 import os
+import sys
 x = 1
";
        Diff::parse(raw, RefPair {
            base: "base".into(),
            head: "head".into(),
        })
        .unwrap()
    }

    fn generator(model: Arc<Scripted>) -> ReviewGenerator {
        ReviewGenerator::new(model, RetryPolicy::new(2, Duration::from_millis(1)), 16_000)
    }

    #[tokio::test]
    async fn draft_strips_fences_and_sends_the_diff() {
        let model = Scripted::new(&["```markdown\nLooks fine.\n\nNo issues found.\n```"]);
        let text = generator(model.clone())
            .draft(&diff(), "Add sys", Some("  "))
            .await
            .unwrap();
        assert_eq!(text, "Looks fine.\n\nNo issues found.");
        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].contains("+import sys"));
        assert!(!prompts[0].contains("Description"));
    }

    #[tokio::test]
    async fn empty_answers_are_retried() {
        let model = Scripted::new(&["", "```\n```", "Summary.\n\nNo issues found."]);
        let text = generator(model.clone()).draft(&diff(), "", None).await.unwrap();
        assert_eq!(text, "Summary.\n\nNo issues found.");
        assert_eq!(model.prompts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn refine_lists_the_refuted_claim() {
        let model = Scripted::new(&["Summary.\n\nNo issues found."]);
        let mut claim = Claim::new(1, "missing import `os`", ClaimKind::MissingCode)
            .with_file("app/utils.py");
        claim.decide(Verdict::Refuted, Some("L1: import os".into()));
        generator(model.clone())
            .refine("- [missing_code] `app/utils.py` missing import `os`", &[&claim], &diff())
            .await
            .unwrap();
        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].contains("L1: import os"));
        assert!(prompts[0].contains("found to be FALSE"));
    }

    #[tokio::test]
    async fn permanent_errors_surface() {
        let model = Scripted::new(&[]);
        let err = generator(model).draft(&diff(), "", None).await.unwrap_err();
        assert!(matches!(err, VeritasError::Llm(_)));
    }
}
