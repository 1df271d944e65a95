//! Access tokens: short-lived HS256 credentials minted per session.
//!
//! Tokens are verified purely by signature and expiry; there is no store
//! lookup on the access path. Only refresh tokens are stateful.

use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

pub const TOKEN_VERSION: u8 = 1;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessTokenHeader {
    pub alg: String,
    pub typ: String,
}

impl AccessTokenHeader {
    fn hs256() -> Self {
        Self {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessTokenClaims {
    pub v: u8,
    pub iss: String,
    /// Normalized wallet address of the authenticated subject.
    pub sub: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("invalid key length")]
    InvalidKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("invalid token version")]
    InvalidVersion,
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, Error> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, Error> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| Error::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Create an HS256 signed access token (JWT).
///
/// # Errors
///
/// Returns an error if the claims cannot be encoded or the key is rejected.
pub fn sign_hs256(secret: &[u8], claims: &AccessTokenClaims) -> Result<String, Error> {
    let header_b64 = b64e_json(&AccessTokenHeader::hs256())?;
    let claims_b64 = b64e_json(claims)?;
    let signing_input = format!("{header_b64}.{claims_b64}");

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| Error::InvalidKey)?;
    mac.update(signing_input.as_bytes());
    let signature = mac.finalize().into_bytes();
    let signature_b64 = Base64UrlUnpadded::encode_string(&signature);

    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Verify an HS256 access token and return its decoded claims.
///
/// # Errors
///
/// Returns an error if:
/// - the token is malformed or contains invalid base64/json,
/// - the signature is invalid,
/// - the claims fail validation (`v`, `iss`, `exp`).
pub fn verify_hs256(
    token: &str,
    secret: &[u8],
    expected_issuer: &str,
    now_unix_seconds: i64,
) -> Result<AccessTokenClaims, Error> {
    let mut parts = token.split('.');
    let header_b64 = parts.next().ok_or(Error::TokenFormat)?;
    let claims_b64 = parts.next().ok_or(Error::TokenFormat)?;
    let sig_b64 = parts.next().ok_or(Error::TokenFormat)?;
    if parts.next().is_some() {
        return Err(Error::TokenFormat);
    }

    let header: AccessTokenHeader = b64d_json(header_b64)?;
    if header.alg != "HS256" {
        return Err(Error::UnsupportedAlg(header.alg));
    }

    let signing_input = format!("{header_b64}.{claims_b64}");
    let signature = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| Error::Base64)?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| Error::InvalidKey)?;
    mac.update(signing_input.as_bytes());
    // verify_slice is constant-time over the tag bytes.
    mac.verify_slice(&signature)
        .map_err(|_| Error::InvalidSignature)?;

    let claims: AccessTokenClaims = b64d_json(claims_b64)?;
    if claims.v != TOKEN_VERSION {
        return Err(Error::InvalidVersion);
    }
    if claims.iss != expected_issuer {
        return Err(Error::InvalidIssuer);
    }
    if claims.exp <= now_unix_seconds {
        return Err(Error::Expired);
    }

    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";
    const ISSUER: &str = "registry.example.org";

    fn claims(now: i64) -> AccessTokenClaims {
        AccessTokenClaims {
            v: TOKEN_VERSION,
            iss: ISSUER.to_string(),
            sub: "0x8ba1f109551bd432803012645ac136ddd64dba72".to_string(),
            role: "member".to_string(),
            handle: Some("alice.reg".to_string()),
            iat: now,
            exp: now + 3600,
            jti: "01941f29-7c00-7000-8000-000000000000".to_string(),
        }
    }

    #[test]
    fn sign_verify_round_trip() -> Result<(), Error> {
        let now = 1_700_000_000;
        let token = sign_hs256(SECRET, &claims(now))?;
        let verified = verify_hs256(&token, SECRET, ISSUER, now)?;
        assert_eq!(verified, claims(now));
        Ok(())
    }

    #[test]
    fn verify_rejects_wrong_secret() -> Result<(), Error> {
        let now = 1_700_000_000;
        let token = sign_hs256(SECRET, &claims(now))?;
        let result = verify_hs256(&token, b"another-secret-another-secret-xx", ISSUER, now);
        assert!(matches!(result, Err(Error::InvalidSignature)));
        Ok(())
    }

    #[test]
    fn verify_rejects_tampered_claims() -> Result<(), Error> {
        let now = 1_700_000_000;
        let token = sign_hs256(SECRET, &claims(now))?;
        let mut parts = token.split('.').map(str::to_string).collect::<Vec<_>>();
        let mut forged = claims(now);
        forged.role = "admin".to_string();
        parts[1] = b64e_json(&forged)?;
        let result = verify_hs256(&parts.join("."), SECRET, ISSUER, now);
        assert!(matches!(result, Err(Error::InvalidSignature)));
        Ok(())
    }

    #[test]
    fn verify_rejects_expired_token() -> Result<(), Error> {
        let now = 1_700_000_000;
        let token = sign_hs256(SECRET, &claims(now))?;
        let result = verify_hs256(&token, SECRET, ISSUER, now + 3600);
        assert!(matches!(result, Err(Error::Expired)));
        Ok(())
    }

    #[test]
    fn verify_rejects_wrong_issuer() -> Result<(), Error> {
        let now = 1_700_000_000;
        let token = sign_hs256(SECRET, &claims(now))?;
        let result = verify_hs256(&token, SECRET, "other.example.org", now);
        assert!(matches!(result, Err(Error::InvalidIssuer)));
        Ok(())
    }

    #[test]
    fn verify_rejects_malformed_token() {
        let result = verify_hs256("not-a-jwt", SECRET, ISSUER, 0);
        assert!(matches!(result, Err(Error::TokenFormat)));

        let result = verify_hs256("a.b.c.d", SECRET, ISSUER, 0);
        assert!(matches!(result, Err(Error::TokenFormat)));
    }

    #[test]
    fn handle_claim_is_omitted_when_absent() -> Result<(), Error> {
        let mut without_handle = claims(1_700_000_000);
        without_handle.handle = None;
        let encoded = b64e_json(&without_handle)?;
        let bytes = Base64UrlUnpadded::decode_vec(&encoded).map_err(|_| Error::Base64)?;
        let json: serde_json::Value = serde_json::from_slice(&bytes)?;
        assert!(json.get("handle").is_none());
        Ok(())
    }
}
