//! Request/response types for auth endpoints.

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::rate_limit::RateLimitStatus;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ChallengeRequest {
    pub address: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ChallengeResponse {
    /// Full message text the wallet must sign, verbatim.
    pub message: String,
    pub nonce: String,
    pub expires_at: String,
    pub expires_in: i64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct VerifyRequest {
    pub address: String,
    /// The signed message copy, as rendered by the challenge endpoint.
    pub message: String,
    pub signature: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub address: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionClaimsResponse {
    pub address: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    pub expires_at: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RateLimitStatusResponse {
    pub is_blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<String>,
    pub attempt_count: i64,
}

impl From<RateLimitStatus> for RateLimitStatusResponse {
    fn from(status: RateLimitStatus) -> Self {
        Self {
            is_blocked: status.is_blocked,
            blocked_until: status
                .blocked_until
                .map(|until| until.to_rfc3339_opts(SecondsFormat::Secs, true)),
            attempt_count: status.attempt_count,
        }
    }
}
