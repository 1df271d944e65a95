//! Challenge issuance and single-use verification.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{Duration, SecondsFormat, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};

use super::challenge_storage::{
    active_challenge_for_address, challenge_by_nonce, create_challenge, mark_challenge_used,
    Challenge, NewChallenge,
};
use super::error::AuthError;
use super::message::SignInMessage;
use super::rate_limit::{RateLimitKind, RateLimiter, RateLimitStatus};
use super::state::AuthState;
use super::types::{ChallengeRequest, ChallengeResponse};
use super::utils::{
    extract_client_ip, extract_user_agent, generate_nonce, normalize_address, valid_address,
};

/// Issue a fresh challenge for an address, superseding any active one.
///
/// Rate limits gate the path for both the address and, when known, the
/// client IP; both attempts are recorded before any row is written.
pub(super) async fn generate_challenge(
    pool: &PgPool,
    auth_state: &AuthState,
    address: &str,
    client_ip: Option<&str>,
    user_agent: Option<&str>,
) -> Result<Challenge, AuthError> {
    let limiter = RateLimiter::new(pool.clone(), *auth_state.config().rate_limit());

    reject_if_blocked(limiter.check(address, RateLimitKind::Address).await?)?;
    if let Some(ip) = client_ip {
        reject_if_blocked(limiter.check(ip, RateLimitKind::Ip).await?)?;
    }

    // The recording attempt itself may cross a tier threshold.
    reject_if_blocked(limiter.record(address, RateLimitKind::Address).await?)?;
    if let Some(ip) = client_ip {
        reject_if_blocked(limiter.record(ip, RateLimitKind::Ip).await?)?;
    }

    let nonce = generate_nonce().map_err(AuthError::Store)?;
    let issued_at = Utc::now();
    let ttl_seconds = auth_state.config().challenge_ttl_seconds();
    let message = SignInMessage {
        domain: auth_state.config().domain().to_string(),
        address: address.to_string(),
        statement: auth_state.config().statement().to_string(),
        nonce: nonce.clone(),
        issued_at,
        expires_at: issued_at + Duration::seconds(ttl_seconds),
    }
    .render();

    let challenge = create_challenge(
        pool,
        &NewChallenge {
            address,
            nonce: &nonce,
            message: &message,
            expires_in_seconds: ttl_seconds,
            client_ip,
            user_agent,
        },
    )
    .await?;

    info!(address, challenge_id = %challenge.id, "Issued sign-in challenge");
    Ok(challenge)
}

fn reject_if_blocked(status: RateLimitStatus) -> Result<(), AuthError> {
    match status.blocked_until {
        Some(blocked_until) if status.is_blocked => Err(AuthError::RateLimited { blocked_until }),
        _ => Ok(()),
    }
}

/// Verify a signed challenge and consume it exactly once.
///
/// The nonce embedded in the submitted message selects the challenge: the
/// active challenge first, then a direct nonce lookup for the benign race
/// where a newer challenge superseded the one the client is still answering.
/// Every failure collapses to a typed error; nothing here panics or leaks
/// which check failed to the client.
pub(super) async fn verify_challenge(
    pool: &PgPool,
    auth_state: &AuthState,
    address: &str,
    raw_message: &str,
    signature: &str,
) -> Result<(), AuthError> {
    let parsed = SignInMessage::parse(raw_message).ok_or(AuthError::InvalidChallenge)?;
    if normalize_address(&parsed.address) != address {
        return Err(AuthError::InvalidChallenge);
    }

    let now = Utc::now();
    let active = active_challenge_for_address(pool, address).await?;
    let challenge = match active {
        Some(challenge) if challenge.nonce == parsed.nonce => challenge,
        _ => {
            // Superseded-but-unused challenges are still answerable; single
            // use is enforced by the conditional consume below either way.
            let challenge = challenge_by_nonce(pool, &parsed.nonce)
                .await?
                .ok_or(AuthError::InvalidChallenge)?;
            if challenge.address != address || !challenge.is_active(now) {
                return Err(AuthError::InvalidChallenge);
            }
            challenge
        }
    };

    let verified = auth_state
        .verifier()
        .verify(raw_message, signature, address)
        .await
        .map_err(AuthError::Store)?;
    if !verified {
        warn!(address, "Challenge signature rejected");
        return Err(AuthError::InvalidSignature);
    }

    // Sole replay guard: only one concurrent verification flips the row.
    if !mark_challenge_used(pool, challenge.id).await? {
        return Err(AuthError::InvalidChallenge);
    }

    info!(address, challenge_id = %challenge.id, "Challenge consumed");
    Ok(())
}

#[utoipa::path(
    post,
    path = "/v1/auth/challenge",
    request_body = ChallengeRequest,
    responses(
        (status = 200, description = "Challenge issued", body = ChallengeResponse),
        (status = 400, description = "Validation error", body = String),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "auth"
)]
pub async fn challenge(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ChallengeRequest>>,
) -> impl IntoResponse {
    let request: ChallengeRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    let address = normalize_address(&request.address);
    if !valid_address(&address) {
        return (StatusCode::BAD_REQUEST, "Invalid address".to_string()).into_response();
    }

    let client_ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);

    match generate_challenge(
        &pool,
        &auth_state,
        &address,
        client_ip.as_deref(),
        user_agent.as_deref(),
    )
    .await
    {
        Ok(challenge) => {
            let expires_in = (challenge.expires_at - challenge.issued_at).num_seconds();
            let response = ChallengeResponse {
                message: challenge.message,
                nonce: challenge.nonce,
                expires_at: challenge
                    .expires_at
                    .to_rfc3339_opts(SecondsFormat::Secs, true),
                expires_in,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => err.response().into_response(),
    }
}
