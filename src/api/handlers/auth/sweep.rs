//! Periodic expiry sweep over challenges, refresh tokens, and attempt logs.

use anyhow::Result;
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error};

use super::challenge_storage::delete_expired_challenges;
use super::rate_limit::delete_stale_attempts;
use super::state::AuthConfig;
use super::token_storage::delete_expired_refresh_tokens;

/// Spawn the background sweeper.
///
/// Rows past retention are deleted on a fixed cadence; a failed pass is
/// logged and retried on the next tick, never escalated.
pub fn spawn_expiry_sweeper(pool: PgPool, config: AuthConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(config.sweep_interval_seconds().max(1));

        loop {
            if let Err(err) = sweep_once(&pool, &config).await {
                error!("expiry sweep failed: {err}");
            }

            sleep(interval).await;
        }
    })
}

async fn sweep_once(pool: &PgPool, config: &AuthConfig) -> Result<()> {
    let challenges =
        delete_expired_challenges(pool, config.challenge_retention_seconds()).await?;
    let tokens = delete_expired_refresh_tokens(pool).await?;
    let attempts = delete_stale_attempts(pool, config.rate_limit().retention_seconds()).await?;

    if challenges + tokens + attempts > 0 {
        debug!(challenges, tokens, attempts, "expiry sweep removed rows");
    }

    Ok(())
}
