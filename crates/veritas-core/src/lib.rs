//! Core types, configuration, and error handling for Veritas.
//!
//! This crate provides the shared foundation used by all other Veritas crates:
//! - [`VeritasError`]: unified error type using `thiserror`
//! - [`VeritasConfig`]: configuration loaded from `.veritas.toml`
//! - Shared types: [`Claim`], [`Verdict`], [`Budget`], [`VerificationRun`],
//!   [`DiffHunk`], [`PullRequestId`], [`OutputFormat`]
//! - [`telemetry::init_tracing`] for the binary's log setup

mod config;
mod error;
pub mod telemetry;
mod types;

pub use config::{
    GithubConfig, HistoryConfig, LlmConfig, LogConfig, ReviewConfig, ServerConfig,
    VerificationConfig, VeritasConfig, HARD_ITERATION_CEILING,
};
pub use error::VeritasError;
pub use types::{
    Budget, ChangeType, Claim, ClaimKey, ClaimKind, CommentRef, DiffHunk, Evidence, LineRange,
    OutputFormat, Phase, PullRequestId, RefPair, RepoRef, RunStatus, Subject, Verdict,
    VerificationRun,
};

/// A convenience `Result` type for Veritas operations.
pub type Result<T> = std::result::Result<T, VeritasError>;
