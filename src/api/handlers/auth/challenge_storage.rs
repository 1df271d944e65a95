//! Database helpers for sign-in challenges.
//!
//! The single-active-challenge invariant is enforced here: creating a
//! challenge supersedes every unused challenge for the same address inside
//! one transaction, and consumption is a conditional update so concurrent
//! verifications race safely.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

/// Stored challenge row.
///
/// Status is a value computed from (`used`, `expires_at`), not a stored enum:
/// a row is active while `used = false` and `expires_at` is in the future.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub id: Uuid,
    pub address: String,
    pub nonce: String,
    pub message: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl Challenge {
    pub(super) fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.used && self.expires_at > now
    }
}

/// Input for a new challenge row.
pub struct NewChallenge<'a> {
    pub address: &'a str,
    pub nonce: &'a str,
    pub message: &'a str,
    pub expires_in_seconds: i64,
    pub client_ip: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

fn challenge_from_row(row: &PgRow) -> Challenge {
    Challenge {
        id: row.get("id"),
        address: row.get("address"),
        nonce: row.get("nonce"),
        message: row.get("message"),
        issued_at: row.get("issued_at"),
        expires_at: row.get("expires_at"),
        used: row.get("used"),
        used_at: row.get("used_at"),
        client_ip: row.get("client_ip"),
        user_agent: row.get("user_agent"),
    }
}

const CHALLENGE_COLUMNS: &str =
    "id, address, nonce, message, issued_at, expires_at, used, used_at, client_ip, user_agent";

/// Insert a challenge, superseding any prior unused challenge for the address.
///
/// Both steps run in one transaction so concurrent generation for the same
/// address still leaves exactly one active row.
pub async fn create_challenge(pool: &PgPool, input: &NewChallenge<'_>) -> Result<Challenge> {
    let mut tx = pool.begin().await.context("begin challenge transaction")?;

    let query = r"
        UPDATE wallet_challenges
        SET used = TRUE, used_at = NOW()
        WHERE address = $1 AND used = FALSE
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(input.address)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to supersede prior challenges")?;

    let query = format!(
        r"
        INSERT INTO wallet_challenges
            (address, nonce, message, expires_at, client_ip, user_agent)
        VALUES ($1, $2, $3, NOW() + ($4 * INTERVAL '1 second'), $5, $6)
        RETURNING {CHALLENGE_COLUMNS}
    "
    );
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(input.address)
        .bind(input.nonce)
        .bind(input.message)
        .bind(input.expires_in_seconds)
        .bind(input.client_ip)
        .bind(input.user_agent)
        .fetch_one(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert challenge")?;

    tx.commit().await.context("commit challenge transaction")?;

    Ok(challenge_from_row(&row))
}

/// Most recent unused, unexpired challenge for an address, if any.
pub async fn active_challenge_for_address(
    pool: &PgPool,
    address: &str,
) -> Result<Option<Challenge>> {
    let query = format!(
        r"
        SELECT {CHALLENGE_COLUMNS}
        FROM wallet_challenges
        WHERE address = $1
          AND used = FALSE
          AND expires_at > NOW()
        ORDER BY issued_at DESC
        LIMIT 1
    "
    );
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(address)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup active challenge")?;
    Ok(row.map(|row| challenge_from_row(&row)))
}

pub async fn challenge_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Challenge>> {
    let query = format!("SELECT {CHALLENGE_COLUMNS} FROM wallet_challenges WHERE id = $1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup challenge by id")?;
    Ok(row.map(|row| challenge_from_row(&row)))
}

/// Nonce lookup used when a submitted message references a superseded
/// challenge that is still unused.
pub async fn challenge_by_nonce(pool: &PgPool, nonce: &str) -> Result<Option<Challenge>> {
    let query = format!("SELECT {CHALLENGE_COLUMNS} FROM wallet_challenges WHERE nonce = $1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(nonce)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup challenge by nonce")?;
    Ok(row.map(|row| challenge_from_row(&row)))
}

/// Consume a challenge exactly once.
///
/// Conditional on `used = FALSE`: of two concurrent verifications only one
/// sees `true` here, which is the sole replay guard.
pub async fn mark_challenge_used(pool: &PgPool, id: Uuid) -> Result<bool> {
    let query = r"
        UPDATE wallet_challenges
        SET used = TRUE, used_at = NOW()
        WHERE id = $1 AND used = FALSE
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to mark challenge used")?;
    Ok(result.rows_affected() == 1)
}

/// Purge challenge rows that expired before the retention cutoff.
pub async fn delete_expired_challenges(
    pool: &PgPool,
    retention_seconds: i64,
) -> Result<u64> {
    let query = r"
        DELETE FROM wallet_challenges
        WHERE expires_at < NOW() - ($1 * INTERVAL '1 second')
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
        .context("failed to delete expired challenges")?;
    Ok(result.rows_affected())
}
