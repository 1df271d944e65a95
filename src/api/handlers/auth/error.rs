//! Typed failures for the challenge/session flows.

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use tracing::error;

/// Failure taxonomy for challenge generation, verification, and refresh.
///
/// Handlers collapse everything except `RateLimited` into a uniform
/// "Authentication failed" response; the specific variant only reaches logs.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("rate limited until {blocked_until}")]
    RateLimited { blocked_until: DateTime<Utc> },
    #[error("no matching active challenge, expired, or already used")]
    InvalidChallenge,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("refresh token already rotated, revoked, or expired")]
    TokenReuseOrExpired,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl AuthError {
    /// Map to an HTTP response without leaking which check failed.
    pub(super) fn response(&self) -> (StatusCode, String) {
        match self {
            Self::RateLimited { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "Rate limited".to_string())
            }
            Self::InvalidChallenge | Self::InvalidSignature | Self::TokenReuseOrExpired => (
                StatusCode::UNAUTHORIZED,
                "Authentication failed".to_string(),
            ),
            Self::Store(err) => {
                error!("Auth store failure: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Authentication failed".to_string(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AuthError;
    use axum::http::StatusCode;
    use chrono::Utc;

    #[test]
    fn rate_limited_maps_to_429() {
        let err = AuthError::RateLimited {
            blocked_until: Utc::now(),
        };
        assert_eq!(err.response().0, StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn terminal_failures_share_a_generic_401() {
        for err in [
            AuthError::InvalidChallenge,
            AuthError::InvalidSignature,
            AuthError::TokenReuseOrExpired,
        ] {
            let (status, body) = err.response();
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body, "Authentication failed");
        }
    }

    #[test]
    fn store_failures_map_to_500_with_generic_body() {
        let err = AuthError::Store(anyhow::anyhow!("connection reset"));
        let (status, body) = err.response();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "Authentication failed");
    }
}
