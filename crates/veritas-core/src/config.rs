use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::VeritasError;
use crate::types::Budget;

/// Upper bound on refinement passes, whatever the configuration says.
pub const HARD_ITERATION_CEILING: u32 = 10;

/// Top-level configuration loaded from `.veritas.toml`.
///
/// Supports layered resolution: CLI flags > env vars > local config > defaults.
///
/// # Examples
///
/// ```
/// use veritas_core::VeritasConfig;
///
/// let config = VeritasConfig::default();
/// assert_eq!(config.verification.budget, 20);
/// assert_eq!(config.verification.max_iterations, 5);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VeritasConfig {
    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmConfig,
    /// GitHub API settings.
    #[serde(default)]
    pub github: GithubConfig,
    /// Verification loop limits.
    #[serde(default)]
    pub verification: VerificationConfig,
    /// Diff preparation settings.
    #[serde(default)]
    pub review: ReviewConfig,
    /// Webhook service settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Review history storage.
    #[serde(default)]
    pub history: HistoryConfig,
    /// Logging.
    #[serde(default)]
    pub log: LogConfig,
}

impl VeritasConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`VeritasError::Io`] if the file cannot be read, or
    /// [`VeritasError::Toml`] if the content is not valid TOML.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use veritas_core::VeritasConfig;
    /// use std::path::Path;
    ///
    /// let config = VeritasConfig::from_file(Path::new(".veritas.toml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, VeritasError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`VeritasError::Toml`] if parsing fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use veritas_core::VeritasConfig;
    ///
    /// let toml = r#"
    /// [verification]
    /// budget = -1
    /// "#;
    /// let config = VeritasConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.verification.budget, -1);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, VeritasError> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) -> Result<(), VeritasError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup`, which maps a variable name to its value.
    ///
    /// Recognised variables: `OPENAI_API_KEY`, `GITHUB_TOKEN` (then
    /// `GH_TOKEN`), `VERITAS_WEBHOOK_SECRET`, `VERITAS_BUDGET`, `VERITAS_LOG`.
    ///
    /// # Errors
    ///
    /// Returns [`VeritasError::Config`] if `VERITAS_BUDGET` is not an integer.
    ///
    /// # Examples
    ///
    /// ```
    /// use veritas_core::VeritasConfig;
    ///
    /// let mut config = VeritasConfig::default();
    /// config
    ///     .apply_env_from(|key| (key == "VERITAS_BUDGET").then(|| "7".to_string()))
    ///     .unwrap();
    /// assert_eq!(config.verification.budget, 7);
    /// ```
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), VeritasError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(token) = non_empty("GITHUB_TOKEN").or_else(|| non_empty("GH_TOKEN")) {
            self.github.token = Some(token);
        }
        if let Some(secret) = non_empty("VERITAS_WEBHOOK_SECRET") {
            self.server.webhook_secret = Some(secret);
        }
        if let Some(budget) = non_empty("VERITAS_BUDGET") {
            self.verification.budget = budget.trim().parse().map_err(|_| {
                VeritasError::Config(format!("VERITAS_BUDGET must be an integer, got '{budget}'"))
            })?;
        }
        if let Some(level) = non_empty("VERITAS_LOG") {
            self.log.level = level;
        }
        Ok(())
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`VeritasError::Config`] for a budget below `-1` or a zero
    /// `max_file_bytes`.
    ///
    /// # Examples
    ///
    /// ```
    /// use veritas_core::VeritasConfig;
    ///
    /// let mut config = VeritasConfig::default();
    /// assert!(config.validate().is_ok());
    /// config.verification.budget = -5;
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), VeritasError> {
        Budget::from_setting(self.verification.budget)?;
        if self.verification.max_file_bytes == 0 {
            return Err(VeritasError::Config(
                "verification.max_file_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// LLM provider configuration.
///
/// # Examples
///
/// ```
/// use veritas_core::LlmConfig;
///
/// let config = LlmConfig::default();
/// assert_eq!(config.model, "gpt-4o");
/// assert_eq!(config.max_retries, 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name (e.g. `"openai"`, `"ollama"`).
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// API key for the provider.
    pub api_key: Option<String>,
    /// Custom base URL for API requests.
    pub base_url: Option<String>,
    /// Retries after the first attempt for transient failures (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay in milliseconds, doubled per retry (default: 500).
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Per-request timeout in seconds (default: 120).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "openai".into()
}

fn default_model() -> String {
    "gpt-4o".into()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            base_url: None,
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// GitHub API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    /// Personal access or installation token.
    pub token: Option<String>,
    /// REST API root (default: `https://api.github.com`).
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://api.github.com".into()
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_base: default_api_base(),
        }
    }
}

/// Verification loop limits.
///
/// # Examples
///
/// ```
/// use veritas_core::VerificationConfig;
///
/// let config = VerificationConfig { max_iterations: 50, ..Default::default() };
/// assert_eq!(config.iteration_ceiling(), 10);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Chargeable calls per run; `-1` means unlimited (default: 20).
    #[serde(default = "default_budget")]
    pub budget: i64,
    /// Refinement passes before giving up (default: 5).
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Files larger than this are treated as unfetchable (default: 1 MiB).
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
    /// Lines of file head sent to the model when a claim has no range (default: 80).
    #[serde(default = "default_snippet_lines")]
    pub snippet_lines: usize,
    /// Consecutive transport failures that fail the run (default: 3).
    #[serde(default = "default_max_transport_failures")]
    pub max_transport_failures: u32,
}

fn default_budget() -> i64 {
    20
}

fn default_max_iterations() -> u32 {
    5
}

fn default_max_file_bytes() -> usize {
    1024 * 1024
}

fn default_snippet_lines() -> usize {
    80
}

fn default_max_transport_failures() -> u32 {
    3
}

impl VerificationConfig {
    /// `max_iterations` clamped to `1..=HARD_ITERATION_CEILING`.
    pub fn iteration_ceiling(&self) -> u32 {
        self.max_iterations.clamp(1, HARD_ITERATION_CEILING)
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            budget: default_budget(),
            max_iterations: default_max_iterations(),
            max_file_bytes: default_max_file_bytes(),
            snippet_lines: default_snippet_lines(),
            max_transport_failures: default_max_transport_failures(),
        }
    }
}

/// Diff preparation settings.
///
/// # Examples
///
/// ```
/// use veritas_core::ReviewConfig;
///
/// let config = ReviewConfig::default();
/// assert_eq!(config.max_diff_chars, 16_000);
/// assert!(config.skip_patterns.is_empty());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Diff text sent to the model is truncated to this many characters.
    #[serde(default = "default_max_diff_chars")]
    pub max_diff_chars: usize,
    /// Additional glob patterns to skip before sending to the model.
    #[serde(default)]
    pub skip_patterns: Vec<String>,
    /// Additional file extensions to skip before sending to the model.
    #[serde(default)]
    pub skip_extensions: Vec<String>,
    /// Review at most this many files; the rest are dropped (default: 50).
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_max_diff_chars() -> usize {
    16_000
}

fn default_max_files() -> usize {
    50
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_diff_chars: default_max_diff_chars(),
            skip_patterns: Vec::new(),
            skip_extensions: Vec::new(),
            max_files: default_max_files(),
        }
    }
}

/// Webhook service settings.
///
/// Empty `repositories` / `branches` lists mean "all".
///
/// # Examples
///
/// ```
/// use veritas_core::ServerConfig;
///
/// let config = ServerConfig {
///     repositories: vec!["octo/app".into()],
///     branches: vec!["main".into()],
///     ..Default::default()
/// };
/// assert!(config.is_monitored("octo/app", "main"));
/// assert!(!config.is_monitored("octo/app", "dev"));
/// assert!(!config.is_monitored("octo/other", "main"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (default: `0.0.0.0:8080`).
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Shared secret for `X-Hub-Signature-256`; unset disables the check.
    pub webhook_secret: Option<String>,
    /// Name shown in the comment header (default: `Veritas`).
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
    /// `owner/repo` slugs to review.
    #[serde(default)]
    pub repositories: Vec<String>,
    /// Base branches to review.
    #[serde(default)]
    pub branches: Vec<String>,
}

fn default_bind() -> String {
    "0.0.0.0:8080".into()
}

fn default_bot_name() -> String {
    "Veritas".into()
}

impl ServerConfig {
    /// Returns `true` if pull requests into `branch` of `repo` should be reviewed.
    pub fn is_monitored(&self, repo: &str, branch: &str) -> bool {
        let repo_ok = self.repositories.is_empty()
            || self.repositories.iter().any(|r| r.eq_ignore_ascii_case(repo));
        let branch_ok = self.branches.is_empty() || self.branches.iter().any(|b| b == branch);
        repo_ok && branch_ok
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            webhook_secret: None,
            bot_name: default_bot_name(),
            repositories: Vec::new(),
            branches: Vec::new(),
        }
    }
}

/// Review history storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// SQLite database path (default: `.veritas/history.db`).
    #[serde(default = "default_history_path")]
    pub path: PathBuf,
}

fn default_history_path() -> PathBuf {
    PathBuf::from(".veritas").join("history.db")
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: default_history_path(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive (default: `info`).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = VeritasConfig::default();
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.llm.model, "gpt-4o");
        assert_eq!(config.llm.retry_base_ms, 500);
        assert_eq!(config.github.api_base, "https://api.github.com");
        assert_eq!(config.verification.budget, 20);
        assert_eq!(config.verification.max_transport_failures, 3);
        assert_eq!(config.review.max_diff_chars, 16_000);
        assert_eq!(config.server.bot_name, "Veritas");
        assert_eq!(config.log.level, "info");
        assert!(!config.log.json);
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = VeritasConfig::from_toml("").unwrap();
        assert_eq!(config.verification.max_iterations, 5);
        assert_eq!(config.llm.model, "gpt-4o");
    }

    #[test]
    fn invalid_toml_returns_error() {
        let result = VeritasConfig::from_toml("{{invalid}}");
        assert!(result.is_err());
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
[llm]
model = "gpt-4o-mini"
base_url = "http://localhost:11434"
max_retries = 1

[verification]
budget = 8
max_iterations = 2
snippet_lines = 40

[review]
skip_patterns = ["fixtures/**"]
skip_extensions = ["snap"]

[server]
bind = "127.0.0.1:9000"
bot_name = "Reviewer"
repositories = ["octo/app"]
branches = ["main", "release"]

[history]
path = "/tmp/veritas.db"

[log]
level = "debug"
json = true
"#;
        let config = VeritasConfig::from_toml(toml).unwrap();
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.llm.max_retries, 1);
        assert_eq!(config.verification.budget, 8);
        assert_eq!(config.verification.iteration_ceiling(), 2);
        assert_eq!(config.verification.snippet_lines, 40);
        assert_eq!(config.review.skip_patterns, vec!["fixtures/**"]);
        assert_eq!(config.server.bind, "127.0.0.1:9000");
        assert_eq!(config.server.branches.len(), 2);
        assert_eq!(config.history.path, PathBuf::from("/tmp/veritas.db"));
        assert!(config.log.json);
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("OPENAI_API_KEY", "sk-test"),
            ("GH_TOKEN", "gh-fallback"),
            ("VERITAS_WEBHOOK_SECRET", "s3cret"),
            ("VERITAS_BUDGET", "-1"),
            ("VERITAS_LOG", "veritas=trace"),
        ]
        .into_iter()
        .collect();
        let mut config = VeritasConfig::from_toml("[verification]\nbudget = 3\n").unwrap();
        config
            .apply_env_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.github.token.as_deref(), Some("gh-fallback"));
        assert_eq!(config.server.webhook_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.verification.budget, -1);
        assert_eq!(config.log.level, "veritas=trace");
    }

    #[test]
    fn github_token_takes_precedence_over_gh_token() {
        let mut config = VeritasConfig::default();
        config
            .apply_env_from(|key| match key {
                "GITHUB_TOKEN" => Some("primary".into()),
                "GH_TOKEN" => Some("secondary".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.github.token.as_deref(), Some("primary"));
    }

    #[test]
    fn non_numeric_budget_env_is_rejected() {
        let mut config = VeritasConfig::default();
        let result =
            config.apply_env_from(|key| (key == "VERITAS_BUDGET").then(|| "lots".into()));
        assert!(matches!(result, Err(VeritasError::Config(_))));
    }

    #[test]
    fn validate_rejects_budget_below_sentinel() {
        let mut config = VeritasConfig::default();
        config.verification.budget = -1;
        assert!(config.validate().is_ok());
        config.verification.budget = 0;
        assert!(config.validate().is_ok());
        config.verification.budget = -2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn iteration_ceiling_is_clamped() {
        let mut config = VerificationConfig::default();
        config.max_iterations = 0;
        assert_eq!(config.iteration_ceiling(), 1);
        config.max_iterations = 99;
        assert_eq!(config.iteration_ceiling(), HARD_ITERATION_CEILING);
    }

    #[test]
    fn monitoring_defaults_to_everything() {
        let config = ServerConfig::default();
        assert!(config.is_monitored("any/repo", "any-branch"));
    }
}
