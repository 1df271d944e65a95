//! Wallet authentication: challenges, sessions, and supporting modules.
//!
//! A client proves control of an address by signing a structured challenge
//! message; the server exchanges that proof for a short-lived access token
//! plus a rotating refresh token.
//!
//! ## Invariants
//!
//! - **One active challenge per address.** Issuing a challenge supersedes
//!   every prior unused challenge for the address in the same transaction.
//! - **Single use.** Challenges are consumed by a conditional update; refresh
//!   tokens rotate through a conditional update + insert in one transaction.
//!   Either way, at most one concurrent caller observes success.
//! - **No in-process locks.** All mutual exclusion comes from the database,
//!   so any number of service instances can run against the same store.
//!
//! ## Rate Limiting
//!
//! Challenge and verification attempts are counted per address and per
//! client IP over a rolling window, with three escalating block tiers.

pub mod access_token;
pub(crate) mod challenge;
pub mod challenge_storage;
mod error;
mod message;
pub mod rate_limit;
mod resolver;
pub(crate) mod session;
mod state;
pub(crate) mod sweep;
pub mod token_storage;
pub(crate) mod types;
mod utils;

pub use resolver::{
    DefaultRoleResolver, RejectAllVerifier, RemoteRoleResolver, RemoteSignatureVerifier,
    ResolvedRole, RoleResolver, SignatureVerifier,
};
pub use state::{AuthConfig, AuthState, RateLimitConfig};

#[cfg(test)]
mod tests;
