//! Pull-request diff ingestion.
//!
//! Parses unified diffs into per-file hunks ([`parser`]), wraps them with the
//! base/head refs of the pull request ([`Diff`]) and drops files the model
//! should not review ([`filter`]).

mod diff;
pub mod filter;
pub mod parser;

pub use diff::Diff;
