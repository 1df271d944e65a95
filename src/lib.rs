//! # Atesto (Wallet Authentication & Session Authority)
//!
//! `atesto` is the authentication authority for a wallet-backed document
//! registry. A client proves control of an address by signing a structured
//! challenge message; the server exchanges that proof for a short-lived
//! access token plus a rotating refresh token.
//!
//! ## Challenges
//!
//! - **Single active challenge:** issuing a challenge supersedes every prior
//!   unused challenge for the same address in one transaction.
//! - **Single use:** a challenge is consumed by a conditional update, so
//!   concurrent verifications succeed at most once.
//! - Challenges are short-lived (minutes) and never reusable after expiry.
//!
//! ## Sessions
//!
//! Access tokens are stateless `HS256` credentials verified by signature and
//! expiry alone. Refresh tokens are stateful, stored as hashes, and rotate
//! exactly once: a replayed value revokes the whole token family for the
//! subject.
//!
//! ## Concurrency Model
//!
//! No in-process locks. Every cross-request invariant is enforced through
//! conditional, transactional `PostgreSQL` writes, so multiple service
//! instances can safely share one database.

pub mod api;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
