//! Database-backed rate limiting for challenge and verification attempts.
//!
//! Flow overview:
//! 1) Every attempt appends a row to `auth_attempts` (per identifier + kind).
//! 2) Attempts inside the rolling window are counted against three ascending
//!    tier thresholds; crossing one stamps `blocked_until` on the new row.
//! 3) While any unexpired `blocked_until` exists, attempts are rejected
//!    without growing the count.
//!
//! Scaling: uses `PostgreSQL` to synchronize limits across service instances.

use anyhow::{Context, Result};
use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{error, Instrument};

use super::state::{AuthState, RateLimitConfig};
use super::types::RateLimitStatusResponse;

/// What the identifier names: a wallet address or a client IP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitKind {
    Address,
    Ip,
}

impl RateLimitKind {
    pub(super) const fn as_str(self) -> &'static str {
        match self {
            Self::Address => "address",
            Self::Ip => "ip",
        }
    }

    pub(super) fn parse(value: &str) -> Option<Self> {
        match value {
            "address" => Some(Self::Address),
            "ip" => Some(Self::Ip),
            _ => None,
        }
    }
}

/// Point-in-time limiter view for one identifier/kind.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitStatus {
    pub attempt_count: i64,
    pub is_blocked: bool,
    pub blocked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    pool: PgPool,
    config: RateLimitConfig,
}

impl RateLimiter {
    #[must_use]
    pub fn new(pool: PgPool, config: RateLimitConfig) -> Self {
        Self { pool, config }
    }

    /// Read-only status: current block (if any) and windowed attempt count.
    ///
    /// # Errors
    /// Propagates store failures; callers decide whether to fail open.
    pub async fn check(&self, identifier: &str, kind: RateLimitKind) -> Result<RateLimitStatus> {
        let blocked_until = self.active_block(identifier, kind).await?;
        let attempt_count = self.count_window(identifier, kind).await?;
        Ok(RateLimitStatus {
            attempt_count,
            is_blocked: blocked_until.is_some(),
            blocked_until,
        })
    }

    /// Register an attempt and evaluate the tier thresholds.
    ///
    /// An active block rejects the attempt without persisting a new row; in
    /// every other case the attempt is recorded, even when it triggers a block.
    ///
    /// # Errors
    /// Propagates store failures; the generate path treats them as decisive.
    pub async fn record(&self, identifier: &str, kind: RateLimitKind) -> Result<RateLimitStatus> {
        if let Some(blocked_until) = self.active_block(identifier, kind).await? {
            let attempt_count = self.count_window(identifier, kind).await?;
            return Ok(RateLimitStatus {
                attempt_count,
                is_blocked: true,
                blocked_until: Some(blocked_until),
            });
        }

        let attempt_count = self.count_window(identifier, kind).await? + 1;
        let block_seconds = self.config.block_seconds_for(attempt_count);

        let query = r"
            INSERT INTO auth_attempts (identifier, kind, blocked_until)
            VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
            RETURNING blocked_until
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(identifier)
            .bind(kind.as_str())
            .bind(block_seconds)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to record auth attempt")?;

        let blocked_until: Option<DateTime<Utc>> = row.get("blocked_until");
        Ok(RateLimitStatus {
            attempt_count,
            is_blocked: blocked_until.is_some(),
            blocked_until,
        })
    }

    async fn active_block(
        &self,
        identifier: &str,
        kind: RateLimitKind,
    ) -> Result<Option<DateTime<Utc>>> {
        let query = r"
            SELECT blocked_until
            FROM auth_attempts
            WHERE identifier = $1
              AND kind = $2
              AND blocked_until > NOW()
            ORDER BY blocked_until DESC
            LIMIT 1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(identifier)
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to check for active block")?;
        Ok(row.map(|row| row.get("blocked_until")))
    }

    async fn count_window(&self, identifier: &str, kind: RateLimitKind) -> Result<i64> {
        let query = r"
            SELECT COUNT(*) AS attempts
            FROM auth_attempts
            WHERE identifier = $1
              AND kind = $2
              AND created_at > NOW() - ($3 * INTERVAL '1 second')
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(identifier)
            .bind(kind.as_str())
            .bind(self.config.window_seconds())
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("failed to count auth attempts")?;
        Ok(row.get("attempts"))
    }
}

/// Purge attempt rows older than the retention cutoff whose blocks lapsed.
pub async fn delete_stale_attempts(pool: &PgPool, retention_seconds: i64) -> Result<u64> {
    let query = r"
        DELETE FROM auth_attempts
        WHERE created_at < NOW() - ($1 * INTERVAL '1 second')
          AND (blocked_until IS NULL OR blocked_until < NOW())
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(retention_seconds)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete stale auth attempts")?;
    Ok(result.rows_affected())
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct RateLimitQuery {
    /// Wallet address or client IP to inspect.
    identifier: String,
    /// Identifier kind: `address` or `ip`.
    kind: String,
}

/// Diagnostics endpoint exposing the limiter view for one identifier.
#[utoipa::path(
    get,
    path = "/v1/auth/rate-limit",
    params(RateLimitQuery),
    responses(
        (status = 200, description = "Current rate-limit status", body = RateLimitStatusResponse),
        (status = 400, description = "Unknown identifier kind", body = String)
    ),
    tag = "auth"
)]
pub async fn rate_limit_status(
    Query(query): Query<RateLimitQuery>,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    let Some(kind) = RateLimitKind::parse(&query.kind) else {
        return (
            StatusCode::BAD_REQUEST,
            "Unknown identifier kind".to_string(),
        )
            .into_response();
    };

    let limiter = RateLimiter::new(pool.0.clone(), *auth_state.config().rate_limit());
    match limiter.check(&query.identifier, kind).await {
        Ok(status) => (StatusCode::OK, Json(RateLimitStatusResponse::from(status))).into_response(),
        Err(err) => {
            error!("Failed to read rate-limit status: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RateLimitKind, RateLimitStatus};
    use chrono::Utc;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [RateLimitKind::Address, RateLimitKind::Ip] {
            assert_eq!(RateLimitKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RateLimitKind::parse("email"), None);
    }

    #[test]
    fn status_reports_block() {
        let status = RateLimitStatus {
            attempt_count: 21,
            is_blocked: true,
            blocked_until: Some(Utc::now()),
        };
        assert!(status.is_blocked);
        assert!(status.blocked_until.is_some());
    }
}
