//! Decide one claim against the repository.
//!
//! Deterministic checks come first and cost nothing: a missing-code claim
//! that names a symbol is settled by searching the file, an
//! incomplete-file claim by parsing or bracket-balancing it, and a syntax
//! claim by inspecting its cited lines. Everything else is put to the model as a constrained CONFIRMED / REFUTED /
//! UNVERIFIABLE question.
//!
//! Budget accounting: an uncached file fetch costs one unit, a model check
//! costs one unit. Cache hits and deterministic checks are free.

use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use veritas_core::{Budget, Claim, ClaimKind, Evidence, LineRange, Verdict};

use crate::evidence::{EvidenceFetcher, FetchOutcome};
use crate::llm::ChatMessage;
use crate::ports::LanguageModel;
use crate::prompt::{build_check_prompt, check_system_prompt};
use crate::retry::RetryPolicy;

/// Lines of context around a claimed range in the model excerpt.
const EXCERPT_CONTEXT: u32 = 5;

/// Files shorter than this (trimmed) count as incomplete.
const MIN_COMPLETE_CHARS: usize = 50;

/// Longest model explanation kept as evidence.
const MAX_REASON_CHARS: usize = 300;

/// Line endings that leave an expression unfinished.
const DANGLING_OPERATORS: &[char] = &['+', '-', '*', '/', '=', '&', '|', '.'];

/// Python block openers that must end in a colon.
const PY_BLOCK_KEYWORDS: &[&str] = &[
    "def", "class", "if", "elif", "else", "for", "while", "try", "except", "finally", "with",
];

/// Keywords that introduce a definition of the following name.
const DEFINITION_KEYWORDS: &str =
    "def|fn|function|class|struct|enum|trait|type|interface|const|let|var|static|module|mod|func";

/// A decided claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    /// Never [`Verdict::Pending`].
    pub verdict: Verdict,
    /// Snippet or explanation supporting the verdict.
    pub evidence: Option<String>,
    /// Set when the claim could not be checked because of a transport
    /// failure, as opposed to a missing file or an unhelpful answer.
    pub transport_failure: bool,
}

impl Validation {
    fn new(verdict: Verdict, evidence: impl Into<String>) -> Self {
        Self {
            verdict,
            evidence: Some(evidence.into()),
            transport_failure: false,
        }
    }

    fn transport(evidence: impl Into<String>) -> Self {
        Self {
            transport_failure: true,
            ..Self::new(Verdict::Unverifiable, evidence)
        }
    }
}

/// What the validator did with a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// The claim has a verdict.
    Decided(Validation),
    /// The next chargeable call was not affordable; the claim stays pending.
    BudgetExhausted,
}

/// Checks claims one at a time.
pub struct ClaimValidator {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    snippet_lines: usize,
}

impl ClaimValidator {
    /// Build a validator. `snippet_lines` bounds the excerpt of claims with no line range.
    pub fn new(model: Arc<dyn LanguageModel>, retry: RetryPolicy, snippet_lines: usize) -> Self {
        Self {
            model,
            retry,
            snippet_lines: snippet_lines.max(1),
        }
    }

    /// Decide `claim` using evidence at `head_ref`, charging `budget`.
    ///
    /// Never returns a [`Verdict::Pending`] validation. A claim without a
    /// file, or whose file is missing or unreadable, is UNVERIFIABLE.
    pub async fn validate(
        &self,
        claim: &Claim,
        fetcher: &mut EvidenceFetcher,
        head_ref: &str,
        budget: &mut Budget,
    ) -> ValidationOutcome {
        let Some(path) = claim.file_path.as_deref() else {
            return ValidationOutcome::Decided(Validation::new(
                Verdict::Unverifiable,
                "no file reference",
            ));
        };

        let charged_fetch = !fetcher.is_cached(path, head_ref);
        if charged_fetch && !budget.try_spend() {
            return ValidationOutcome::BudgetExhausted;
        }

        let evidence = match fetcher.fetch(path, head_ref).await {
            Ok(FetchOutcome::Found(evidence)) => evidence,
            Ok(FetchOutcome::NotFound) => {
                return ValidationOutcome::Decided(Validation::new(
                    Verdict::Unverifiable,
                    format!("{path} does not exist at {head_ref}"),
                ));
            }
            Ok(FetchOutcome::Unfetchable(why)) => {
                return ValidationOutcome::Decided(Validation::new(
                    Verdict::Unverifiable,
                    format!("{path} cannot be used as evidence: {why}"),
                ));
            }
            Err(e) => {
                tracing::warn!(claim = claim.id, path, error = %e, "evidence fetch failed");
                let decided = if e.is_transient() {
                    Validation::transport(format!("could not fetch {path}: {e}"))
                } else {
                    Validation::new(Verdict::Unverifiable, format!("could not fetch {path}: {e}"))
                };
                return ValidationOutcome::Decided(decided);
            }
        };

        if let Some(decided) = deterministic_check(claim, &evidence) {
            return ValidationOutcome::Decided(decided);
        }

        if !budget.try_spend() {
            if charged_fetch {
                return ValidationOutcome::Decided(Validation::new(
                    Verdict::Unverifiable,
                    "budget exhausted before model check",
                ));
            }
            return ValidationOutcome::BudgetExhausted;
        }

        ValidationOutcome::Decided(self.model_check(claim, &evidence).await)
    }

    async fn model_check(&self, claim: &Claim, evidence: &Evidence) -> Validation {
        let excerpt = match claim.lines {
            Some(range) => evidence.excerpt(range, EXCERPT_CONTEXT),
            None => evidence.head(self.snippet_lines),
        };
        if excerpt.is_empty() {
            return Validation::new(
                Verdict::Unverifiable,
                format!(
                    "claimed lines are outside {} ({} lines)",
                    evidence.path,
                    evidence.line_count()
                ),
            );
        }

        let messages = [
            ChatMessage::system(check_system_prompt()),
            ChatMessage::user(build_check_prompt(claim, &excerpt)),
        ];
        let model = &self.model;
        let messages = &messages;
        let answer = self
            .retry
            .run("check claim", move || model.complete(messages))
            .await;

        match answer {
            Ok(answer) => match Verdict::from_answer(&answer) {
                Some(verdict) => Validation::new(verdict, truncate(answer.trim(), MAX_REASON_CHARS)),
                None => {
                    tracing::debug!(claim = claim.id, answer = %answer, "unparseable check answer");
                    Validation::new(Verdict::Unverifiable, "model answer had no verdict")
                }
            },
            Err(e) if e.is_transient() => Validation::transport(format!("model check failed: {e}")),
            Err(e) => Validation::new(Verdict::Unverifiable, format!("model check failed: {e}")),
        }
    }
}

/// Settle a claim from the file alone, when its kind allows it.
fn deterministic_check(claim: &Claim, evidence: &Evidence) -> Option<Validation> {
    match (claim.kind, &claim.subject) {
        (ClaimKind::MissingCode | ClaimKind::IncompleteFile, Some(subject)) => {
            let found = if subject.import {
                find_import(evidence, &subject.symbol)
            } else {
                find_import(evidence, &subject.symbol)
                    .or_else(|| find_definition(evidence, &subject.symbol))
            };
            Some(match found {
                Some((line, text)) => Validation::new(Verdict::Refuted, format!("L{line}: {}", text.trim())),
                None => Validation::new(
                    Verdict::Confirmed,
                    format!("`{}` not found in {}", subject.symbol, evidence.path),
                ),
            })
        }
        (ClaimKind::IncompleteFile, None) => Some(structural_check(evidence)),
        (ClaimKind::Syntax, _) => claim.lines.and_then(|range| syntax_check(evidence, range)),
        _ => None,
    }
}

/// First import-like line naming `symbol`.
fn find_import<'e>(evidence: &'e Evidence, symbol: &str) -> Option<(u32, &'e str)> {
    let sym = regex::escape(symbol);
    let patterns = [
        format!(r"\bimport\s+(?:[\w.]+\s*,\s*)*{sym}\b"),
        format!(r"\bfrom\s+{sym}\b"),
        format!(r"\bfrom\s+\S+\s+import\b.*[^\w.]{sym}\b"),
        format!(r"^\s*(?:pub\s+)?use\s+(?:.*[^\w.])?{sym}\b"),
        format!(r"\bimport\b(?:.*[^\w.])?{sym}\b"),
        format!(r#"\brequire\s*\(?\s*['"][^'"]*{sym}['"]"#),
        format!(r#"^\s*#\s*include\s*[<"][^>"]*{sym}"#),
    ];
    first_match(evidence, &patterns)
}

/// First line defining or assigning `symbol`.
fn find_definition<'e>(evidence: &'e Evidence, symbol: &str) -> Option<(u32, &'e str)> {
    // `module.func` is defined as `func`.
    let name = symbol.rsplit(['.', ':']).next().unwrap_or(symbol);
    if name.is_empty() {
        return None;
    }
    let sym = regex::escape(name);
    let patterns = [
        format!(r"\b(?:{DEFINITION_KEYWORDS})\s+(?:mut\s+)?{sym}\b"),
        format!(r"^\s*(?:self\.)?{sym}\s*(?::[^=]*)?=(?:[^=]|$)"),
    ];
    first_match(evidence, &patterns)
}

fn first_match<'e>(evidence: &'e Evidence, patterns: &[String]) -> Option<(u32, &'e str)> {
    let compiled: Vec<Regex> = patterns.iter().filter_map(|p| Regex::new(p).ok()).collect();
    evidence
        .numbered_lines()
        .find(|(_, line)| compiled.iter().any(|re| re.is_match(line)))
}

/// Is the file plausibly complete?
fn structural_check(evidence: &Evidence) -> Validation {
    let content = evidence.content.trim();
    if content.chars().count() < MIN_COMPLETE_CHARS {
        return Validation::new(
            Verdict::Confirmed,
            format!("{} has only {} characters", evidence.path, content.chars().count()),
        );
    }

    let extension = Path::new(&evidence.path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("json") => {
            return match serde_json::from_str::<serde_json::Value>(content) {
                Ok(_) => Validation::new(Verdict::Refuted, format!("{} parses as JSON", evidence.path)),
                Err(e) => Validation::new(Verdict::Confirmed, format!("JSON parse error: {e}")),
            };
        }
        Some("toml") => {
            return match toml::from_str::<toml::Table>(content) {
                Ok(_) => Validation::new(Verdict::Refuted, format!("{} parses as TOML", evidence.path)),
                Err(e) => Validation::new(
                    Verdict::Confirmed,
                    format!("TOML parse error: {}", e.message()),
                ),
            };
        }
        _ => {}
    }

    match unbalanced_bracket(content) {
        Some(detail) => Validation::new(Verdict::Confirmed, detail),
        None => Validation::new(
            Verdict::Refuted,
            format!(
                "brackets balance across all {} lines of {}",
                evidence.line_count(),
                evidence.path
            ),
        ),
    }
}

/// Describe the first bracket imbalance, if any.
fn unbalanced_bracket(content: &str) -> Option<String> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        for c in line.chars() {
            match c {
                '(' | '[' | '{' => stack.push((c, idx + 1)),
                ')' | ']' | '}' => {
                    let open = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some((o, _)) if o == open => {}
                        _ => return Some(format!("unmatched `{c}` on line {}", idx + 1)),
                    }
                }
                _ => {}
            }
        }
    }
    stack
        .last()
        .map(|(c, line)| format!("`{c}` opened on line {line} is never closed"))
}

/// Look for an obvious syntax problem on the cited lines.
///
/// Brackets must balance across the range; no line may end on a binary
/// operator, and in Python a block opener must end in a colon. `None` when
/// the range lies outside the file, leaving the claim to the model.
fn syntax_check(evidence: &Evidence, range: LineRange) -> Option<Validation> {
    let python = evidence.path.ends_with(".py") || evidence.path.ends_with(".pyi");
    let cited: Vec<(u32, &str)> = evidence
        .numbered_lines()
        .filter(|(n, _)| range.contains(*n))
        .collect();
    let (&(first, first_line), _) = cited.split_first()?;

    for &(n, line) in &cited {
        if let Some(problem) = line_problem(line, python) {
            return Some(Validation::new(
                Verdict::Confirmed,
                format!("L{n}: {} ({problem})", line.trim()),
            ));
        }
    }
    let code: String = cited
        .iter()
        .map(|(_, line)| *line)
        .filter(|line| !is_comment(line))
        .collect::<Vec<_>>()
        .join("\n");
    for (open, close) in [('(', ')'), ('[', ']'), ('{', '}')] {
        let opened = code.matches(open).count();
        let closed = code.matches(close).count();
        if opened != closed {
            return Some(Validation::new(
                Verdict::Confirmed,
                format!("L{first}: {} ({opened} `{open}` against {closed} `{close}`)", first_line.trim()),
            ));
        }
    }

    let shown = cited
        .iter()
        .map(|(n, line)| format!("L{n}: {}", line.trim()))
        .collect::<Vec<_>>()
        .join("; ");
    Some(Validation::new(
        Verdict::Refuted,
        format!("{shown} (no unbalanced bracket or dangling operator)"),
    ))
}

fn is_comment(line: &str) -> bool {
    let code = line.trim_start();
    code.starts_with('#')
        || code.starts_with("//")
        || code.starts_with("/*")
        || code.starts_with("* ")
        || code == "*"
        || code.starts_with("*/")
}

fn line_problem(line: &str, python: bool) -> Option<String> {
    let code = line.trim();
    if code.is_empty() || is_comment(code) || code.ends_with("*/") {
        return None;
    }
    // Trailing `# ...` comment in Python.
    let code = match code.split_once(" #") {
        Some((before, _)) if python => before.trim_end(),
        _ => code,
    };
    if let Some(last) = code.chars().last().filter(|c| DANGLING_OPERATORS.contains(c)) {
        return Some(format!("ends with `{last}`"));
    }
    if python {
        let keyword = code
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .next()
            .unwrap_or("");
        if PY_BLOCK_KEYWORDS.contains(&keyword) && !code.ends_with(':') {
            return Some(format!("`{keyword}` block without a trailing colon"));
        }
    }
    None
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
