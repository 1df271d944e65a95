//! Database helpers for refresh tokens.
//!
//! Rotation is the replay detector: the old row is consumed by a conditional
//! update and the successor is inserted in the same transaction, so a second
//! concurrent rotation of the same token always observes zero affected rows.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

/// Stored refresh-token row. The token value itself is never stored; rows
/// carry a hash and the rotation chain via `replaced_by`.
#[derive(Debug, Clone)]
pub struct RefreshToken {
    pub id: Uuid,
    pub address: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub replaced_by: Option<Uuid>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Input for a new refresh-token row; the caller supplies the value hash.
pub struct NewRefreshToken<'a> {
    pub address: &'a str,
    pub token_hash: &'a [u8],
    pub expires_in_seconds: i64,
    pub client_ip: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

const TOKEN_COLUMNS: &str = "id, address, issued_at, expires_at, used, used_at, revoked, \
                             revoked_at, replaced_by, client_ip, user_agent";

fn token_from_row(row: &PgRow) -> RefreshToken {
    RefreshToken {
        id: row.get("id"),
        address: row.get("address"),
        issued_at: row.get("issued_at"),
        expires_at: row.get("expires_at"),
        used: row.get("used"),
        used_at: row.get("used_at"),
        revoked: row.get("revoked"),
        revoked_at: row.get("revoked_at"),
        replaced_by: row.get("replaced_by"),
        client_ip: row.get("client_ip"),
        user_agent: row.get("user_agent"),
    }
}

pub async fn create_refresh_token(
    pool: &PgPool,
    input: &NewRefreshToken<'_>,
) -> Result<RefreshToken> {
    let query = format!(
        r"
        INSERT INTO refresh_tokens
            (id, address, token_hash, expires_at, client_ip, user_agent)
        VALUES ($1, $2, $3, NOW() + ($4 * INTERVAL '1 second'), $5, $6)
        RETURNING {TOKEN_COLUMNS}
    "
    );
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(Uuid::new_v4())
        .bind(input.address)
        .bind(input.token_hash)
        .bind(input.expires_in_seconds)
        .bind(input.client_ip)
        .bind(input.user_agent)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to insert refresh token")?;
    Ok(token_from_row(&row))
}

/// Look up a presented token by value hash, accepting only rows that are
/// unused, unrevoked, and unexpired.
pub async fn get_refresh_token_by_value(
    pool: &PgPool,
    token_hash: &[u8],
) -> Result<Option<RefreshToken>> {
    let query = format!(
        r"
        SELECT {TOKEN_COLUMNS}
        FROM refresh_tokens
        WHERE token_hash = $1
          AND used = FALSE
          AND revoked = FALSE
          AND expires_at > NOW()
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
        .bind(token_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup refresh token")?;
    Ok(row.map(|row| token_from_row(&row)))
}

/// Any-state lookup used to attribute a replayed value to its subject.
pub async fn find_refresh_token(
    pool: &PgPool,
    token_hash: &[u8],
) -> Result<Option<RefreshToken>> {
    let query = format!("SELECT {TOKEN_COLUMNS} FROM refresh_tokens WHERE token_hash = $1");
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(token_hash)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to find refresh token")?;
    Ok(row.map(|row| token_from_row(&row)))
}

/// Rotate a token: consume the old row and insert its successor atomically.
///
/// Returns `None` when the old row was already used, revoked, or expired —
/// the caller must treat that as reuse. Any failure after the conditional
/// update rolls the whole operation back, so the old token is never left
/// consumed without a successor.
pub async fn rotate_refresh_token(
    pool: &PgPool,
    old_token_id: Uuid,
    new_token: &NewRefreshToken<'_>,
) -> Result<Option<RefreshToken>> {
    let mut tx = pool.begin().await.context("begin rotation transaction")?;

    let query = r"
        UPDATE refresh_tokens
        SET used = TRUE, used_at = NOW()
        WHERE id = $1
          AND used = FALSE
          AND revoked = FALSE
          AND expires_at > NOW()
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(old_token_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to consume refresh token")?;

    if result.rows_affected() == 0 {
        tx.rollback().await.context("rollback rotation")?;
        return Ok(None);
    }

    let new_id = Uuid::new_v4();
    let query = format!(
        r"
        INSERT INTO refresh_tokens
            (id, address, token_hash, expires_at, client_ip, user_agent)
        VALUES ($1, $2, $3, NOW() + ($4 * INTERVAL '1 second'), $5, $6)
        RETURNING {TOKEN_COLUMNS}
    "
    );
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query.as_str()
    );
    let row = sqlx::query(&query)
        .bind(new_id)
        .bind(new_token.address)
        .bind(new_token.token_hash)
        .bind(new_token.expires_in_seconds)
        .bind(new_token.client_ip)
        .bind(new_token.user_agent)
        .fetch_one(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert rotated refresh token")?;

    // Back-reference keeps the rotation chain auditable.
    let query = "UPDATE refresh_tokens SET replaced_by = $1 WHERE id = $2";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(new_id)
        .bind(old_token_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to link rotation chain")?;

    tx.commit().await.context("commit rotation transaction")?;

    Ok(Some(token_from_row(&row)))
}

/// Revoke one token by value hash; idempotent per row.
pub async fn revoke_refresh_token(pool: &PgPool, token_hash: &[u8]) -> Result<bool> {
    let query = r"
        UPDATE refresh_tokens
        SET revoked = TRUE, revoked_at = NOW()
        WHERE token_hash = $1 AND revoked = FALSE
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(token_hash)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to revoke refresh token")?;
    Ok(result.rows_affected() == 1)
}

/// Revoke every live token for a subject (reuse response and logout).
pub async fn revoke_all_for_address(pool: &PgPool, address: &str) -> Result<u64> {
    let query = r"
        UPDATE refresh_tokens
        SET revoked = TRUE, revoked_at = NOW()
        WHERE address = $1 AND revoked = FALSE
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(address)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to revoke subject tokens")?;
    Ok(result.rows_affected())
}

/// Purge refresh tokens past their expiry.
pub async fn delete_expired_refresh_tokens(pool: &PgPool) -> Result<u64> {
    let query = "DELETE FROM refresh_tokens WHERE expires_at < NOW()";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete expired refresh tokens")?;
    Ok(result.rows_affected())
}
