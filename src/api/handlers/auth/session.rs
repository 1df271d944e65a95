//! Session orchestration: exchange a verified signature for tokens, rotate
//! refresh tokens, and revoke on logout.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::access_token::{sign_hs256, verify_hs256, AccessTokenClaims, TOKEN_VERSION};
use super::challenge::verify_challenge;
use super::error::AuthError;
use super::rate_limit::{RateLimitKind, RateLimiter};
use super::resolver::ResolvedRole;
use super::state::AuthState;
use super::token_storage::{
    create_refresh_token, find_refresh_token, get_refresh_token_by_value, revoke_all_for_address,
    rotate_refresh_token, NewRefreshToken,
};
use super::types::{RefreshRequest, SessionClaimsResponse, SessionResponse, VerifyRequest};
use super::utils::{
    extract_bearer_token, extract_client_ip, extract_user_agent, generate_refresh_token,
    hash_refresh_token, is_unique_violation, normalize_address, valid_address,
};

/// Minted session: a signed access token plus the raw refresh-token value.
#[derive(Debug)]
pub(super) struct Session {
    pub(super) access_token: String,
    pub(super) refresh_token: String,
    pub(super) expires_in: i64,
    pub(super) address: String,
    pub(super) role: String,
    pub(super) handle: Option<String>,
}

/// Exchange a verified challenge signature for a session.
pub(super) async fn authenticate(
    pool: &PgPool,
    auth_state: &AuthState,
    address: &str,
    raw_message: &str,
    signature: &str,
    client_ip: Option<&str>,
    user_agent: Option<&str>,
) -> Result<Session, AuthError> {
    verify_challenge(pool, auth_state, address, raw_message, signature).await?;
    mint_session(pool, auth_state, address, client_ip, user_agent).await
}

/// Rotate a refresh token and mint a fresh access token.
///
/// A presented value with no live row, or a rotation race lost to a
/// concurrent caller, is treated as reuse: the whole token family for the
/// subject is revoked before the failure is surfaced.
pub(super) async fn refresh(
    pool: &PgPool,
    auth_state: &AuthState,
    refresh_token_value: &str,
    client_ip: Option<&str>,
    user_agent: Option<&str>,
) -> Result<Session, AuthError> {
    let token_hash = hash_refresh_token(refresh_token_value);

    let Some(current) = get_refresh_token_by_value(pool, &token_hash).await? else {
        if let Some(stale) = find_refresh_token(pool, &token_hash).await? {
            let revoked = revoke_all_for_address(pool, &stale.address).await?;
            warn!(
                address = %stale.address,
                revoked,
                "Refresh token replay detected; token family revoked"
            );
        }
        return Err(AuthError::TokenReuseOrExpired);
    };

    let new_value = generate_refresh_token().map_err(AuthError::Store)?;
    let new_hash = hash_refresh_token(&new_value);
    let rotated = rotate_refresh_token(
        pool,
        current.id,
        &NewRefreshToken {
            address: &current.address,
            token_hash: &new_hash,
            expires_in_seconds: auth_state.config().refresh_ttl_seconds(),
            client_ip,
            user_agent,
        },
    )
    .await?;

    if rotated.is_none() {
        // A concurrent caller won the rotation; both presentations of the
        // same value means the family can no longer be trusted.
        let revoked = revoke_all_for_address(pool, &current.address).await?;
        warn!(
            address = %current.address,
            revoked,
            "Concurrent refresh rotation lost; token family revoked"
        );
        return Err(AuthError::TokenReuseOrExpired);
    }

    let (access_token, expires_in, resolved) =
        mint_access_token(auth_state, &current.address).await?;
    info!(address = %current.address, "Refresh token rotated");
    Ok(Session {
        access_token,
        refresh_token: new_value,
        expires_in,
        address: current.address,
        role: resolved.role,
        handle: resolved.handle,
    })
}

/// Best-effort revocation of the subject's refresh-token family.
///
/// Storage failures are logged and swallowed: logout must not fail the caller.
pub(super) async fn logout(pool: &PgPool, address: &str) -> bool {
    match revoke_all_for_address(pool, address).await {
        Ok(revoked) => {
            info!(address, revoked, "Logout revoked token family");
            true
        }
        Err(err) => {
            error!("Failed to revoke tokens during logout: {err}");
            false
        }
    }
}

async fn mint_session(
    pool: &PgPool,
    auth_state: &AuthState,
    address: &str,
    client_ip: Option<&str>,
    user_agent: Option<&str>,
) -> Result<Session, AuthError> {
    let (access_token, expires_in, resolved) = mint_access_token(auth_state, address).await?;

    let refresh_value = store_fresh_token(pool, auth_state, address, client_ip, user_agent).await?;

    info!(address, role = %resolved.role, "Session minted");
    Ok(Session {
        access_token,
        refresh_token: refresh_value,
        expires_in,
        address: address.to_string(),
        role: resolved.role,
        handle: resolved.handle,
    })
}

/// Generate and persist a refresh token, retrying on the (vanishingly rare)
/// value-hash collision rather than failing the sign-in.
async fn store_fresh_token(
    pool: &PgPool,
    auth_state: &AuthState,
    address: &str,
    client_ip: Option<&str>,
    user_agent: Option<&str>,
) -> Result<String, AuthError> {
    for _ in 0..3 {
        let refresh_value = generate_refresh_token().map_err(AuthError::Store)?;
        let refresh_hash = hash_refresh_token(&refresh_value);
        let result = create_refresh_token(
            pool,
            &NewRefreshToken {
                address,
                token_hash: &refresh_hash,
                expires_in_seconds: auth_state.config().refresh_ttl_seconds(),
                client_ip,
                user_agent,
            },
        )
        .await;

        match result {
            Ok(_) => return Ok(refresh_value),
            Err(err)
                if err
                    .downcast_ref::<sqlx::Error>()
                    .is_some_and(is_unique_violation) => {}
            Err(err) => return Err(AuthError::Store(err)),
        }
    }

    Err(AuthError::Store(anyhow::anyhow!(
        "failed to generate unique refresh token"
    )))
}

async fn mint_access_token(
    auth_state: &AuthState,
    address: &str,
) -> Result<(String, i64, ResolvedRole), AuthError> {
    // Role resolution is opportunistic: the registry being down must not
    // block the session exchange, so failures degrade to the default role.
    let resolved = match auth_state.resolver().resolve_role(address).await {
        Ok(resolved) => resolved,
        Err(err) => {
            warn!(address, "Role resolution failed, using default role: {err}");
            ResolvedRole {
                role: auth_state.config().default_role().to_string(),
                handle: None,
            }
        }
    };

    let now = Utc::now().timestamp();
    let expires_in = auth_state.config().access_ttl_seconds();
    let claims = AccessTokenClaims {
        v: TOKEN_VERSION,
        iss: auth_state.config().issuer().to_string(),
        sub: address.to_string(),
        role: resolved.role.clone(),
        handle: resolved.handle.clone(),
        iat: now,
        exp: now + expires_in,
        jti: Uuid::new_v4().to_string(),
    };
    let access_token = sign_hs256(auth_state.signing_secret(), &claims)
        .map_err(|err| AuthError::Store(anyhow::anyhow!("failed to sign access token: {err}")))?;

    Ok((access_token, expires_in, resolved))
}

fn session_response(session: Session) -> SessionResponse {
    SessionResponse {
        access_token: session.access_token,
        refresh_token: session.refresh_token,
        token_type: "Bearer".to_string(),
        expires_in: session.expires_in,
        address: session.address,
        role: session.role,
        handle: session.handle,
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/verify",
    request_body = VerifyRequest,
    responses(
        (status = 200, description = "Authenticated", body = SessionResponse),
        (status = 400, description = "Validation error", body = String),
        (status = 401, description = "Authentication failed", body = String),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "auth"
)]
pub async fn verify(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<VerifyRequest>>,
) -> impl IntoResponse {
    let request: VerifyRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    let address = normalize_address(&request.address);
    if !valid_address(&address) {
        return (StatusCode::BAD_REQUEST, "Invalid address".to_string()).into_response();
    }

    let client_ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);

    // Verification attempts count against the same tiers as issuance.
    let limiter = RateLimiter::new(pool.0.clone(), *auth_state.config().rate_limit());
    match limiter.record(&address, RateLimitKind::Address).await {
        Ok(status) if status.is_blocked => {
            return (StatusCode::TOO_MANY_REQUESTS, "Rate limited".to_string()).into_response();
        }
        Ok(_) => {}
        Err(err) => {
            error!("Failed to record verification attempt: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Authentication failed".to_string(),
            )
                .into_response();
        }
    }
    if let Some(ip) = client_ip.as_deref() {
        match limiter.record(ip, RateLimitKind::Ip).await {
            Ok(status) if status.is_blocked => {
                return (StatusCode::TOO_MANY_REQUESTS, "Rate limited".to_string())
                    .into_response();
            }
            Ok(_) => {}
            Err(err) => {
                error!("Failed to record verification attempt: {err}");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Authentication failed".to_string(),
                )
                    .into_response();
            }
        }
    }

    match authenticate(
        &pool,
        &auth_state,
        &address,
        &request.message,
        &request.signature,
        client_ip.as_deref(),
        user_agent.as_deref(),
    )
    .await
    {
        Ok(session) => (StatusCode::OK, Json(session_response(session))).into_response(),
        Err(err) => err.response().into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Session refreshed", body = SessionResponse),
        (status = 400, description = "Validation error", body = String),
        (status = 401, description = "Authentication failed", body = String)
    ),
    tag = "auth"
)]
pub async fn refresh_session(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<RefreshRequest>>,
) -> impl IntoResponse {
    let request: RefreshRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    let value = request.refresh_token.trim();
    if value.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing refresh token".to_string()).into_response();
    }

    let client_ip = extract_client_ip(&headers);
    let user_agent = extract_user_agent(&headers);

    match refresh(
        &pool,
        &auth_state,
        value,
        client_ip.as_deref(),
        user_agent.as_deref(),
    )
    .await
    {
        Ok(session) => (StatusCode::OK, Json(session_response(session))).into_response(),
        Err(err) => err.response().into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/v1/auth/session",
    responses(
        (status = 200, description = "Access token is valid", body = SessionClaimsResponse),
        (status = 204, description = "No valid access token")
    ),
    tag = "auth"
)]
pub async fn session(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    // Missing or invalid tokens are "no session", never an error, to avoid
    // leaking which check failed.
    let Some(token) = extract_bearer_token(&headers) else {
        return StatusCode::NO_CONTENT.into_response();
    };

    match verify_hs256(
        &token,
        auth_state.signing_secret(),
        auth_state.config().issuer(),
        Utc::now().timestamp(),
    ) {
        Ok(claims) => {
            let expires_at = DateTime::from_timestamp(claims.exp, 0)
                .map_or_else(String::new, |at| {
                    at.to_rfc3339_opts(SecondsFormat::Secs, true)
                });
            let response = SessionClaimsResponse {
                address: claims.sub,
                role: claims.role,
                handle: claims.handle,
                expires_at,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(_) => StatusCode::NO_CONTENT.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 204, description = "Session cleared")
    ),
    tag = "auth"
)]
pub async fn logout_session(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    // Logout succeeds from the caller's point of view no matter what; the
    // access token only tells us which family to revoke.
    if let Some(token) = extract_bearer_token(&headers) {
        if let Ok(claims) = verify_hs256(
            &token,
            auth_state.signing_secret(),
            auth_state.config().issuer(),
            Utc::now().timestamp(),
        ) {
            let _ = logout(&pool, &claims.sub).await;
        }
    }

    StatusCode::NO_CONTENT.into_response()
}
