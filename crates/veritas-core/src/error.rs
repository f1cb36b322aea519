use std::time::Duration;

/// Errors that can occur across the Veritas platform.
///
/// Each variant wraps a specific error domain. Library crates use this type
/// directly; the binary converts to a `miette` report at the boundary.
///
/// # Examples
///
/// ```
/// use veritas_core::VeritasError;
///
/// let err = VeritasError::Config("missing API key".into());
/// assert!(err.to_string().contains("missing API key"));
/// assert!(!err.is_transient());
/// ```
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum VeritasError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    #[diagnostic(help("check .veritas.toml and the VERITAS_* environment variables"))]
    Config(String),

    /// A caller broke an input contract (empty path, empty ref, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// GitHub API failure that is not worth retrying.
    #[error("GitHub error: {0}")]
    Github(String),

    /// Diff or review text parsing failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Non-retryable LLM API error (bad request, auth, unknown model).
    #[error("LLM error: {0}")]
    Llm(String),

    /// Transient network failure: connect errors, timeouts, 5xx responses.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote asked us to slow down.
    #[error("rate limited{}", retry_suffix(.retry_after))]
    RateLimited {
        /// Delay suggested by the server, if any.
        retry_after: Option<Duration>,
    },

    /// A file does not exist at the requested ref.
    #[error("not found: {0}")]
    NotFound(String),

    /// The model answered with something the caller cannot use.
    #[error("malformed model output: {0}")]
    MalformedModelOutput(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Review history storage failure.
    #[error("database error: {0}")]
    Database(String),

    /// Webhook payload or signature problem.
    #[error("webhook error: {0}")]
    Webhook(String),
}

impl VeritasError {
    /// Returns `true` for failures that a bounded retry may fix.
    ///
    /// Malformed model output counts as transient: asking again usually
    /// yields a usable answer.
    ///
    /// # Examples
    ///
    /// ```
    /// use veritas_core::VeritasError;
    ///
    /// assert!(VeritasError::Transport("timeout".into()).is_transient());
    /// assert!(VeritasError::RateLimited { retry_after: None }.is_transient());
    /// assert!(!VeritasError::NotFound("a.rs".into()).is_transient());
    /// ```
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VeritasError::Transport(_)
                | VeritasError::RateLimited { .. }
                | VeritasError::MalformedModelOutput(_)
        )
    }

    /// Server-provided backoff hint, if this is a rate-limit error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            VeritasError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

fn retry_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}
