//! External collaborator seams: role resolution and signature verification.
//!
//! Both are consumed capabilities. Role resolution is opportunistic (callers
//! degrade to a default role on failure); signature verification is decisive
//! and fails closed when unavailable.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

/// Role and optional identity handle resolved for an address.
#[derive(Debug, Clone)]
pub struct ResolvedRole {
    pub role: String,
    pub handle: Option<String>,
}

#[async_trait]
pub trait RoleResolver: Send + Sync {
    async fn resolve_role(&self, address: &str) -> Result<ResolvedRole>;
}

#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    /// Check that `signature` over `message` recovers `expected_address`.
    async fn verify(&self, message: &str, signature: &str, expected_address: &str)
        -> Result<bool>;
}

/// Resolver used when no registry endpoint is configured: every subject gets
/// the configured default role and no handle.
#[derive(Debug, Clone)]
pub struct DefaultRoleResolver {
    role: String,
}

impl DefaultRoleResolver {
    #[must_use]
    pub fn new(role: String) -> Self {
        Self { role }
    }
}

#[async_trait]
impl RoleResolver for DefaultRoleResolver {
    async fn resolve_role(&self, _address: &str) -> Result<ResolvedRole> {
        Ok(ResolvedRole {
            role: self.role.clone(),
            handle: None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RemoteRoleResponse {
    role: String,
    handle: Option<String>,
}

/// Resolves roles against the external identity registry over HTTP.
#[derive(Debug, Clone)]
pub struct RemoteRoleResolver {
    client: Client,
    url: String,
}

impl RemoteRoleResolver {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: String) -> Result<Self> {
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .build()
            .context("failed to build role resolver client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl RoleResolver for RemoteRoleResolver {
    async fn resolve_role(&self, address: &str) -> Result<ResolvedRole> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "address": address }))
            .send()
            .await
            .context("role resolver request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("role resolver returned {status}"));
        }

        let body: RemoteRoleResponse = response
            .json()
            .await
            .context("role resolver returned invalid JSON")?;
        Ok(ResolvedRole {
            role: body.role,
            handle: body.handle,
        })
    }
}

/// Verifier used when no recovery endpoint is configured; rejects everything
/// so an unconfigured deployment cannot mint sessions.
#[derive(Debug, Clone)]
pub struct RejectAllVerifier;

#[async_trait]
impl SignatureVerifier for RejectAllVerifier {
    async fn verify(
        &self,
        _message: &str,
        _signature: &str,
        _expected_address: &str,
    ) -> Result<bool> {
        error!("No signature verifier configured; rejecting sign-in");
        Ok(false)
    }
}

/// Delegates signature recovery to the external verification service.
///
/// The service answers 202 when the signature recovers the expected address,
/// any other status otherwise.
#[derive(Debug, Clone)]
pub struct RemoteSignatureVerifier {
    client: Client,
    url: String,
}

impl RemoteSignatureVerifier {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: String) -> Result<Self> {
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .build()
            .context("failed to build signature verifier client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl SignatureVerifier for RemoteSignatureVerifier {
    async fn verify(
        &self,
        message: &str,
        signature: &str,
        expected_address: &str,
    ) -> Result<bool> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "message": message,
                "signature": signature,
                "address": expected_address,
            }))
            .send()
            .await
            .context("signature verifier request failed")?;

        Ok(response.status() == StatusCode::ACCEPTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_resolver_returns_configured_role() -> Result<()> {
        let resolver = DefaultRoleResolver::new("member".to_string());
        let resolved = resolver.resolve_role("0xabc").await?;
        assert_eq!(resolved.role, "member");
        assert!(resolved.handle.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn reject_all_verifier_rejects() -> Result<()> {
        let verifier = RejectAllVerifier;
        let accepted = verifier.verify("message", "signature", "0xabc").await?;
        assert!(!accepted);
        Ok(())
    }

    #[test]
    fn remote_role_response_parses_optional_handle() -> Result<()> {
        let body: RemoteRoleResponse = serde_json::from_str(r#"{"role":"editor"}"#)?;
        assert_eq!(body.role, "editor");
        assert!(body.handle.is_none());

        let body: RemoteRoleResponse =
            serde_json::from_str(r#"{"role":"editor","handle":"alice.reg"}"#)?;
        assert_eq!(body.handle.as_deref(), Some("alice.reg"));
        Ok(())
    }
}
