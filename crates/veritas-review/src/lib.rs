//! Verified pull-request review.
//!
//! A model drafts the review, every finding in it is turned into a claim and
//! checked against the repository at the head commit, and findings the
//! repository contradicts are sent back for rewriting until the review
//! converges, the call budget runs out, or the iteration ceiling is hit.
//!
//! The loop lives in [`controller`]; it reaches the outside world only
//! through the traits in [`ports`].

pub mod controller;
pub mod evidence;
pub mod extract;
pub mod generator;
pub mod github;
pub mod history;
pub mod llm;
pub mod ports;
pub mod prompt;
pub mod publish;
pub mod retry;
pub mod validate;
