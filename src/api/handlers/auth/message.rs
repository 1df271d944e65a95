//! Structured sign-in message rendered for wallet signing.
//!
//! The message embeds the domain, subject address, statement, nonce, and the
//! validity window, one field per line, so wallets display it legibly and the
//! server can parse the nonce back out of a submitted copy.

use chrono::{DateTime, SecondsFormat, Utc};

const ADDRESS_PREAMBLE: &str = " wants you to sign in with your wallet address:";
const NONCE_PREFIX: &str = "Nonce: ";
const ISSUED_AT_PREFIX: &str = "Issued At: ";
const EXPIRATION_PREFIX: &str = "Expiration Time: ";

/// Parsed or to-be-rendered sign-in message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct SignInMessage {
    pub(super) domain: String,
    pub(super) address: String,
    pub(super) statement: String,
    pub(super) nonce: String,
    pub(super) issued_at: DateTime<Utc>,
    pub(super) expires_at: DateTime<Utc>,
}

impl SignInMessage {
    /// Render the canonical text the wallet signs.
    pub(super) fn render(&self) -> String {
        format!(
            "{domain}{preamble}\n{address}\n\n{statement}\n\n{nonce_prefix}{nonce}\n{issued_prefix}{issued}\n{expiration_prefix}{expires}",
            domain = self.domain,
            preamble = ADDRESS_PREAMBLE,
            address = self.address,
            statement = self.statement,
            nonce_prefix = NONCE_PREFIX,
            nonce = self.nonce,
            issued_prefix = ISSUED_AT_PREFIX,
            issued = rfc3339(self.issued_at),
            expiration_prefix = EXPIRATION_PREFIX,
            expires = rfc3339(self.expires_at),
        )
    }

    /// Parse a submitted message copy back into its fields.
    ///
    /// Returns `None` on any structural mismatch; callers treat that as an
    /// invalid challenge rather than an error worth distinguishing.
    pub(super) fn parse(raw: &str) -> Option<Self> {
        let mut lines = raw.lines();

        let header = lines.next()?;
        let domain = header.strip_suffix(ADDRESS_PREAMBLE)?.to_string();
        if domain.is_empty() {
            return None;
        }

        let address = lines.next()?.trim().to_string();
        if address.is_empty() {
            return None;
        }

        if !lines.next()?.is_empty() {
            return None;
        }
        let statement = lines.next()?.to_string();
        if !lines.next()?.is_empty() {
            return None;
        }

        let nonce = lines.next()?.strip_prefix(NONCE_PREFIX)?.to_string();
        if nonce.is_empty() {
            return None;
        }
        let issued_at = parse_rfc3339(lines.next()?.strip_prefix(ISSUED_AT_PREFIX)?)?;
        let expires_at = parse_rfc3339(lines.next()?.strip_prefix(EXPIRATION_PREFIX)?)?;

        Some(Self {
            domain,
            address,
            statement,
            nonce,
            issued_at,
            expires_at,
        })
    }
}

fn rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}
