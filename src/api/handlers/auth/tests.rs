//! Auth module tests.
//!
//! Unit tests live next to their modules; the tests here exercise the
//! database-backed invariants end to end. They need a throwaway Postgres
//! reachable through `ATESTO_TEST_DSN` and skip with a note when it is unset.

use super::challenge::{generate_challenge, verify_challenge};
use super::challenge_storage::challenge_by_id;
use super::error::AuthError;
use super::rate_limit::{RateLimitKind, RateLimiter};
use super::resolver::{DefaultRoleResolver, SignatureVerifier};
use super::session::{authenticate, logout, refresh};
use super::state::{AuthConfig, AuthState, RateLimitConfig};
use super::token_storage::{find_refresh_token, get_refresh_token_by_value, revoke_refresh_token};
use super::utils::hash_refresh_token;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::{rngs::OsRng, RngCore};
use secrecy::SecretString;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;

const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

static POOL: OnceCell<Option<PgPool>> = OnceCell::const_new();

async fn test_pool() -> Option<PgPool> {
    POOL.get_or_init(|| async {
        let Ok(dsn) = std::env::var("ATESTO_TEST_DSN") else {
            eprintln!("Skipping integration test: ATESTO_TEST_DSN is not set");
            return None;
        };

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&dsn)
            .await
            .expect("failed to connect to ATESTO_TEST_DSN");

        for statement in split_sql_statements(SCHEMA_SQL) {
            sqlx::query(&statement)
                .execute(&pool)
                .await
                .expect("failed to apply test schema");
        }

        Some(pool)
    })
    .await
    .clone()
}

fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("--") {
            continue;
        }
        current.push_str(line);
        current.push('\n');

        if trimmed.ends_with(';') {
            let statement = current.trim();
            if !statement.is_empty() {
                statements.push(statement.to_string());
            }
            current.clear();
        }
    }

    let leftover = current.trim();
    if !leftover.is_empty() {
        statements.push(leftover.to_string());
    }

    statements
}

struct AcceptAllVerifier;

#[async_trait]
impl SignatureVerifier for AcceptAllVerifier {
    async fn verify(
        &self,
        _message: &str,
        _signature: &str,
        _expected_address: &str,
    ) -> Result<bool> {
        Ok(true)
    }
}

fn auth_state_with(config: AuthConfig) -> Arc<AuthState> {
    Arc::new(AuthState::new(
        config,
        SecretString::from("integration-test-secret".to_string()),
        Arc::new(AcceptAllVerifier),
        Arc::new(DefaultRoleResolver::new("member".to_string())),
    ))
}

fn auth_state() -> Arc<AuthState> {
    auth_state_with(AuthConfig::new("https://registry.example.org".to_string()))
}

/// Every test uses its own random address so parallel tests stay independent.
fn random_address() -> String {
    let mut bytes = [0u8; 20];
    OsRng.fill_bytes(&mut bytes);
    let hex = bytes.iter().fold(String::new(), |mut out, byte| {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
        out
    });
    format!("0x{hex}")
}

async fn unused_challenge_count(pool: &PgPool, address: &str) -> Result<i64> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS remaining FROM wallet_challenges WHERE address = $1 AND used = FALSE",
    )
    .bind(address)
    .fetch_one(pool)
    .await
    .context("failed to count unused challenges")?;
    Ok(row.get("remaining"))
}

#[tokio::test]
async fn challenge_round_trip_consumes_exactly_once() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let state = auth_state();
    let address = random_address();

    let challenge = generate_challenge(&pool, &state, &address, None, None).await?;
    verify_challenge(&pool, &state, &address, &challenge.message, "0xsig").await?;

    let stored = challenge_by_id(&pool, challenge.id)
        .await?
        .context("challenge row missing")?;
    assert!(stored.used);
    assert!(stored.used_at.is_some());

    // Replaying the identical message must fail now that the row is consumed.
    let replay = verify_challenge(&pool, &state, &address, &challenge.message, "0xsig").await;
    assert!(matches!(replay, Err(AuthError::InvalidChallenge)));
    Ok(())
}

#[tokio::test]
async fn new_challenge_supersedes_previous_one() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let state = auth_state();
    let address = random_address();

    let first = generate_challenge(&pool, &state, &address, None, None).await?;
    let second = generate_challenge(&pool, &state, &address, None, None).await?;
    assert_ne!(first.nonce, second.nonce);
    assert_eq!(unused_challenge_count(&pool, &address).await?, 1);

    // The superseded challenge is marked used, so answering it fails...
    let stale = verify_challenge(&pool, &state, &address, &first.message, "0xsig").await;
    assert!(matches!(stale, Err(AuthError::InvalidChallenge)));

    // ...while the replacement verifies.
    verify_challenge(&pool, &state, &address, &second.message, "0xsig").await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_generation_leaves_one_active_challenge() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let state = auth_state();
    let address = random_address();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        let state = state.clone();
        let address = address.clone();
        handles.push(tokio::spawn(async move {
            generate_challenge(&pool, &state, &address, None, None).await
        }));
    }
    for handle in handles {
        handle.await.context("generate task panicked")??;
    }

    assert_eq!(unused_challenge_count(&pool, &address).await?, 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_verification_succeeds_at_most_once() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let state = auth_state();
    let address = random_address();

    let challenge = generate_challenge(&pool, &state, &address, None, None).await?;

    let first = {
        let (pool, state, address) = (pool.clone(), state.clone(), address.clone());
        let message = challenge.message.clone();
        tokio::spawn(
            async move { verify_challenge(&pool, &state, &address, &message, "0xsig").await },
        )
    };
    let second = {
        let (pool, state, address) = (pool.clone(), state.clone(), address.clone());
        let message = challenge.message.clone();
        tokio::spawn(
            async move { verify_challenge(&pool, &state, &address, &message, "0xsig").await },
        )
    };

    let outcomes = [
        first.await.context("verify task panicked")?,
        second.await.context("verify task panicked")?,
    ];
    let successes = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    assert_eq!(successes, 1);
    assert!(outcomes
        .iter()
        .any(|outcome| matches!(outcome, Err(AuthError::InvalidChallenge))));
    Ok(())
}

#[tokio::test]
async fn expired_challenge_is_rejected() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    // Negative TTL issues a challenge that is already past its expiry.
    let state = auth_state_with(
        AuthConfig::new("https://registry.example.org".to_string())
            .with_challenge_ttl_seconds(-60),
    );
    let address = random_address();

    let challenge = generate_challenge(&pool, &state, &address, None, None).await?;
    assert!(challenge.expires_at < Utc::now());

    let result = verify_challenge(&pool, &state, &address, &challenge.message, "0xsig").await;
    assert!(matches!(result, Err(AuthError::InvalidChallenge)));
    Ok(())
}

#[tokio::test]
async fn authenticate_then_refresh_rotates_token() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let state = auth_state();
    let address = random_address();

    let challenge = generate_challenge(&pool, &state, &address, None, None).await?;
    let session = authenticate(
        &pool,
        &state,
        &address,
        &challenge.message,
        "0xsig",
        None,
        None,
    )
    .await?;
    assert_eq!(session.address, address);
    assert_eq!(session.role, "member");

    let renewed = refresh(&pool, &state, &session.refresh_token, None, None).await?;
    assert_ne!(renewed.refresh_token, session.refresh_token);

    // The consumed value is now replayed: hard failure, family revoked.
    let replay = refresh(&pool, &state, &session.refresh_token, None, None).await;
    assert!(matches!(replay, Err(AuthError::TokenReuseOrExpired)));

    // Revocation reached the freshly rotated token too.
    let follow_up = refresh(&pool, &state, &renewed.refresh_token, None, None).await;
    assert!(matches!(follow_up, Err(AuthError::TokenReuseOrExpired)));
    Ok(())
}

#[tokio::test]
async fn rotation_links_the_token_chain() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let state = auth_state();
    let address = random_address();

    let challenge = generate_challenge(&pool, &state, &address, Some("1.2.3.4"), None).await?;
    assert_eq!(challenge.client_ip.as_deref(), Some("1.2.3.4"));
    assert!(challenge.issued_at < challenge.expires_at);

    let session = authenticate(
        &pool,
        &state,
        &address,
        &challenge.message,
        "0xsig",
        Some("1.2.3.4"),
        Some("test-agent"),
    )
    .await?;

    let old_hash = hash_refresh_token(&session.refresh_token);
    let renewed = refresh(&pool, &state, &session.refresh_token, None, None).await?;

    let old_row = find_refresh_token(&pool, &old_hash)
        .await?
        .context("consumed token row missing")?;
    assert!(old_row.used);
    assert!(old_row.used_at.is_some());
    assert!(!old_row.revoked);
    assert!(old_row.revoked_at.is_none());
    assert!(old_row.issued_at < old_row.expires_at);
    assert_eq!(old_row.client_ip.as_deref(), Some("1.2.3.4"));
    assert_eq!(old_row.user_agent.as_deref(), Some("test-agent"));

    let new_hash = hash_refresh_token(&renewed.refresh_token);
    let new_row = get_refresh_token_by_value(&pool, &new_hash)
        .await?
        .context("rotated token row missing")?;
    assert_eq!(old_row.replaced_by, Some(new_row.id));
    assert_eq!(new_row.address, address);
    assert_eq!(new_row.replaced_by, None);
    Ok(())
}

#[tokio::test]
async fn revoked_token_is_never_returned() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let state = auth_state();
    let address = random_address();

    let challenge = generate_challenge(&pool, &state, &address, None, None).await?;
    let session = authenticate(
        &pool,
        &state,
        &address,
        &challenge.message,
        "0xsig",
        None,
        None,
    )
    .await?;

    let token_hash = hash_refresh_token(&session.refresh_token);
    assert!(revoke_refresh_token(&pool, &token_hash).await?);
    // Second revocation is a no-op on the already-revoked row.
    assert!(!revoke_refresh_token(&pool, &token_hash).await?);

    assert!(get_refresh_token_by_value(&pool, &token_hash)
        .await?
        .is_none());

    let result = refresh(&pool, &state, &session.refresh_token, None, None).await;
    assert!(matches!(result, Err(AuthError::TokenReuseOrExpired)));
    Ok(())
}

#[tokio::test]
async fn concurrent_refresh_rotates_exactly_once() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let state = auth_state();
    let address = random_address();

    let challenge = generate_challenge(&pool, &state, &address, None, None).await?;
    let session = authenticate(
        &pool,
        &state,
        &address,
        &challenge.message,
        "0xsig",
        None,
        None,
    )
    .await?;

    let spawn_refresh = |value: String| {
        let (pool, state) = (pool.clone(), state.clone());
        tokio::spawn(async move { refresh(&pool, &state, &value, None, None).await })
    };
    let first = spawn_refresh(session.refresh_token.clone());
    let second = spawn_refresh(session.refresh_token.clone());

    let outcomes = [
        first.await.context("refresh task panicked")?,
        second.await.context("refresh task panicked")?,
    ];
    let successes = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    assert_eq!(successes, 1);
    assert!(outcomes
        .iter()
        .any(|outcome| matches!(outcome, Err(AuthError::TokenReuseOrExpired))));
    Ok(())
}

#[tokio::test]
async fn logout_revokes_token_family() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let state = auth_state();
    let address = random_address();

    let challenge = generate_challenge(&pool, &state, &address, None, None).await?;
    let session = authenticate(
        &pool,
        &state,
        &address,
        &challenge.message,
        "0xsig",
        None,
        None,
    )
    .await?;

    assert!(logout(&pool, &address).await);

    let result = refresh(&pool, &state, &session.refresh_token, None, None).await;
    assert!(matches!(result, Err(AuthError::TokenReuseOrExpired)));
    Ok(())
}

#[tokio::test]
async fn rate_limit_escalates_to_highest_tier() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let limits = RateLimitConfig::new(3600, [(5, 60), (10, 600), (20, 6000)]);
    let limiter = RateLimiter::new(pool.clone(), limits);
    let identifier = random_address();

    // Twenty prior attempts in the window, none of which stamped a block.
    for _ in 0..20 {
        sqlx::query("INSERT INTO auth_attempts (identifier, kind) VALUES ($1, $2)")
            .bind(&identifier)
            .bind(RateLimitKind::Address.as_str())
            .execute(&pool)
            .await
            .context("failed to seed attempt")?;
    }

    // The 21st attempt crosses every threshold at once; tier 3 wins.
    let status = limiter.record(&identifier, RateLimitKind::Address).await?;
    assert_eq!(status.attempt_count, 21);
    assert!(status.is_blocked);
    let blocked_until = status.blocked_until.context("missing blocked_until")?;
    assert!(blocked_until > Utc::now() + chrono::Duration::seconds(5900));

    // Attempt 22 is rejected without growing the count.
    let rejected = limiter.record(&identifier, RateLimitKind::Address).await?;
    assert!(rejected.is_blocked);
    let observed = limiter.check(&identifier, RateLimitKind::Address).await?;
    assert_eq!(observed.attempt_count, 21);
    assert!(observed.is_blocked);
    Ok(())
}

#[tokio::test]
async fn blocked_address_cannot_request_challenges() -> Result<()> {
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let limits = RateLimitConfig::new(3600, [(1, 3600), (2, 7200), (3, 10800)]);
    let state = auth_state_with(
        AuthConfig::new("https://registry.example.org".to_string()).with_rate_limit(limits),
    );
    let address = random_address();

    // First issuance passes; the second crosses the single-attempt tier.
    generate_challenge(&pool, &state, &address, None, None).await?;
    let second = generate_challenge(&pool, &state, &address, None, None).await;
    assert!(matches!(second, Err(AuthError::RateLimited { .. })));

    let third = generate_challenge(&pool, &state, &address, None, None).await;
    assert!(matches!(third, Err(AuthError::RateLimited { .. })));
    Ok(())
}
