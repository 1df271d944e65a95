//! API handlers for atesto.
//!
//! The auth module carries the challenge/session subsystem; the rest of the
//! surface is the health probe and the root banner.

pub mod auth;
pub mod health;
pub mod root;
