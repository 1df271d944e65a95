//! Auth configuration and shared request state.

use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use url::Url;

use super::resolver::{RoleResolver, SignatureVerifier};

const DEFAULT_CHALLENGE_TTL_SECONDS: i64 = 5 * 60;
const DEFAULT_ACCESS_TTL_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_REFRESH_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_STATEMENT: &str =
    "Sign this message to authenticate with the document registry.";
const DEFAULT_ROLE: &str = "member";
const DEFAULT_CHALLENGE_RETENTION_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 10 * 60;

const DEFAULT_RATE_WINDOW_SECONDS: i64 = 60 * 60;
// Relaxed defaults; production deployments tighten these via the builders.
const DEFAULT_RATE_TIERS: [(i64, i64); 3] = [
    (20, 60 * 60),
    (40, 3 * 60 * 60),
    (80, 12 * 60 * 60),
];

/// Rolling-window thresholds mapped to escalating block durations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    window_seconds: i64,
    /// Ascending (attempt threshold, block seconds) tiers.
    tiers: [(i64, i64); 3],
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: DEFAULT_RATE_WINDOW_SECONDS,
            tiers: DEFAULT_RATE_TIERS,
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn new(window_seconds: i64, tiers: [(i64, i64); 3]) -> Self {
        Self {
            window_seconds,
            tiers,
        }
    }

    #[must_use]
    pub fn window_seconds(&self) -> i64 {
        self.window_seconds
    }

    #[must_use]
    pub fn tiers(&self) -> &[(i64, i64); 3] {
        &self.tiers
    }

    /// Block duration for a post-increment attempt count; highest tier wins.
    #[must_use]
    pub fn block_seconds_for(&self, attempt_count: i64) -> Option<i64> {
        self.tiers
            .iter()
            .rev()
            .find(|(threshold, _)| attempt_count > *threshold)
            .map(|(_, block_seconds)| *block_seconds)
    }

    /// Attempt log rows are purged once older than the window plus grace.
    #[must_use]
    pub fn retention_seconds(&self) -> i64 {
        // A row may carry a block lasting past the counting window.
        let longest_block = self
            .tiers
            .iter()
            .map(|(_, block_seconds)| *block_seconds)
            .max()
            .unwrap_or(0);
        self.window_seconds + longest_block
    }
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    frontend_base_url: String,
    domain: String,
    statement: String,
    default_role: String,
    challenge_ttl_seconds: i64,
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
    challenge_retention_seconds: i64,
    sweep_interval_seconds: u64,
    rate_limit: RateLimitConfig,
}

impl AuthConfig {
    #[must_use]
    pub fn new(frontend_base_url: String) -> Self {
        let domain = Url::parse(&frontend_base_url)
            .ok()
            .and_then(|u: Url| u.host_str().map(ToString::to_string))
            .unwrap_or_else(|| "localhost".to_string());

        Self {
            frontend_base_url,
            domain,
            statement: DEFAULT_STATEMENT.to_string(),
            default_role: DEFAULT_ROLE.to_string(),
            challenge_ttl_seconds: DEFAULT_CHALLENGE_TTL_SECONDS,
            access_ttl_seconds: DEFAULT_ACCESS_TTL_SECONDS,
            refresh_ttl_seconds: DEFAULT_REFRESH_TTL_SECONDS,
            challenge_retention_seconds: DEFAULT_CHALLENGE_RETENTION_SECONDS,
            sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECONDS,
            rate_limit: RateLimitConfig::default(),
        }
    }

    #[must_use]
    pub fn with_statement(mut self, statement: String) -> Self {
        self.statement = statement;
        self
    }

    #[must_use]
    pub fn with_default_role(mut self, role: String) -> Self {
        self.default_role = role;
        self
    }

    #[must_use]
    pub fn with_challenge_ttl_seconds(mut self, seconds: i64) -> Self {
        self.challenge_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_challenge_retention_seconds(mut self, seconds: i64) -> Self {
        self.challenge_retention_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_sweep_interval_seconds(mut self, seconds: u64) -> Self {
        self.sweep_interval_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub(crate) fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Access tokens are issued and verified under the sign-in domain.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.domain
    }

    pub(super) fn statement(&self) -> &str {
        &self.statement
    }

    pub(crate) fn default_role(&self) -> &str {
        &self.default_role
    }

    pub(super) fn challenge_ttl_seconds(&self) -> i64 {
        self.challenge_ttl_seconds
    }

    pub(super) fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_seconds
    }

    pub(super) fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_ttl_seconds
    }

    pub(crate) fn challenge_retention_seconds(&self) -> i64 {
        self.challenge_retention_seconds
    }

    pub(crate) fn sweep_interval_seconds(&self) -> u64 {
        self.sweep_interval_seconds
    }

    pub(crate) fn rate_limit(&self) -> &RateLimitConfig {
        &self.rate_limit
    }
}

pub struct AuthState {
    config: AuthConfig,
    signing_secret: SecretString,
    verifier: Arc<dyn SignatureVerifier>,
    resolver: Arc<dyn RoleResolver>,
}

impl AuthState {
    pub fn new(
        config: AuthConfig,
        signing_secret: SecretString,
        verifier: Arc<dyn SignatureVerifier>,
        resolver: Arc<dyn RoleResolver>,
    ) -> Self {
        Self {
            config,
            signing_secret,
            verifier,
            resolver,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub(super) fn signing_secret(&self) -> &[u8] {
        self.signing_secret.expose_secret().as_bytes()
    }

    pub(super) fn verifier(&self) -> &dyn SignatureVerifier {
        self.verifier.as_ref()
    }

    pub(super) fn resolver(&self) -> &dyn RoleResolver {
        self.resolver.as_ref()
    }
}
