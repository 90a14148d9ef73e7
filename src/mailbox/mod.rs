//! Mailbox source — where inbound messages come from and replies go to.

pub mod imap;
pub mod parse;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::config::{parse_opt, parse_or};
use crate::error::{ConfigError, MailboxError};

pub use imap::ImapMailbox;
pub use parse::parse_email;

/// One message as fetched from the mailbox, before parsing.
#[derive(Debug, Clone)]
pub struct RawEmail {
    /// Mailbox-local identifier, used only for diagnostics.
    pub uid: String,
    /// Full RFC 822 message.
    pub bytes: Vec<u8>,
}

/// An email to send.
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// A message source the producer polls and the API can send through.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Fetch the messages currently matching the configured search.
    ///
    /// May return messages already seen; deduplication happens at the store.
    async fn fetch_all(&self) -> Result<Vec<RawEmail>, MailboxError>;

    async fn send(&self, email: &OutgoingEmail) -> Result<(), MailboxError>;
}

// ── Configuration ───────────────────────────────────────────────────

/// Mailbox configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    /// Our own address. Mail from it is never ingested.
    pub from_address: String,
    pub folder: String,
    /// IMAP SEARCH criteria, e.g. `ALL` or `UNSEEN`.
    pub search: String,
    pub allowed_senders: Vec<String>,
}

impl MailboxConfig {
    /// Build config from environment variables.
    /// Returns `None` if `MAILBOX_IMAP_HOST` is not set (no mailbox).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>, ConfigError> {
        let Some(imap_host) = lookup("MAILBOX_IMAP_HOST").filter(|h| !h.is_empty()) else {
            return Ok(None);
        };

        let imap_port: u16 = parse_or(&lookup, "MAILBOX_IMAP_PORT", 993)?;
        let smtp_host = lookup("MAILBOX_SMTP_HOST")
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| imap_host.replace("imap", "smtp"));
        let smtp_port: u16 = parse_or(&lookup, "MAILBOX_SMTP_PORT", 587)?;

        let username = lookup("MAILBOX_USERNAME")
            .ok_or_else(|| ConfigError::MissingEnvVar("MAILBOX_USERNAME".into()))?;
        let password = lookup("MAILBOX_PASSWORD")
            .ok_or_else(|| ConfigError::MissingEnvVar("MAILBOX_PASSWORD".into()))?;
        let from_address = parse_opt::<String>(&lookup, "MAILBOX_FROM_ADDRESS")?
            .unwrap_or_else(|| username.clone());

        let allowed_senders: Vec<String> = lookup("MAILBOX_ALLOWED_SENDERS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Some(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password: SecretString::from(password),
            from_address,
            folder: lookup("MAILBOX_FOLDER").unwrap_or_else(|| "INBOX".into()),
            search: lookup("MAILBOX_SEARCH").unwrap_or_else(|| "ALL".into()),
            allowed_senders,
        }))
    }
}

// ── Sender filtering ────────────────────────────────────────────────

/// Check if a sender email passes the allowlist.
///
/// - Empty list → allow all
/// - `*` in list → allow all
/// - `@domain.com` or `domain.com` → domain match
/// - `user@domain.com` → exact email match
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() || allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email_lower = email.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            email_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            a.eq_ignore_ascii_case(email)
        } else {
            email_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ── Sender allowlist ────────────────────────────────────────────

    #[test]
    fn allowlist_empty_allows_all() {
        assert!(is_sender_allowed(&[], "anyone@example.com"));
    }

    #[test]
    fn allowlist_wildcard_allows_all() {
        assert!(is_sender_allowed(&["*".into()], "anyone@example.com"));
    }

    #[test]
    fn allowlist_exact_email_match() {
        let allowed = vec!["alice@example.com".to_string()];
        assert!(is_sender_allowed(&allowed, "alice@example.com"));
        assert!(is_sender_allowed(&allowed, "ALICE@example.com"));
        assert!(!is_sender_allowed(&allowed, "bob@example.com"));
    }

    #[test]
    fn allowlist_domain_forms() {
        let with_at = vec!["@example.com".to_string()];
        let bare = vec!["example.com".to_string()];
        for allowed in [&with_at, &bare] {
            assert!(is_sender_allowed(allowed, "bob@example.com"));
            assert!(is_sender_allowed(allowed, "bob@EXAMPLE.com"));
            assert!(!is_sender_allowed(allowed, "bob@other.com"));
        }
        assert!(!is_sender_allowed(&bare, "bob@notexample.com"));
    }

    // ── Config ──────────────────────────────────────────────────────

    #[test]
    fn config_absent_without_imap_host() {
        assert!(MailboxConfig::from_lookup(lookup_from(&[])).unwrap().is_none());
    }

    #[test]
    fn config_requires_credentials() {
        let err = MailboxConfig::from_lookup(lookup_from(&[(
            "MAILBOX_IMAP_HOST",
            "imap.example.com",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "MAILBOX_USERNAME"));
    }

    #[test]
    fn config_defaults() {
        let config = MailboxConfig::from_lookup(lookup_from(&[
            ("MAILBOX_IMAP_HOST", "imap.example.com"),
            ("MAILBOX_USERNAME", "me@example.com"),
            ("MAILBOX_PASSWORD", "hunter2"),
            ("MAILBOX_ALLOWED_SENDERS", " @example.com , boss@corp.com ,"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(config.imap_port, 993);
        assert_eq!(config.smtp_host, "smtp.example.com");
        assert_eq!(config.smtp_port, 587);
        assert_eq!(config.from_address, "me@example.com");
        assert_eq!(config.folder, "INBOX");
        assert_eq!(config.search, "ALL");
        assert_eq!(config.password.expose_secret(), "hunter2");
        assert_eq!(config.allowed_senders, vec!["@example.com", "boss@corp.com"]);
    }

    #[test]
    fn config_rejects_bad_port() {
        assert!(MailboxConfig::from_lookup(lookup_from(&[
            ("MAILBOX_IMAP_HOST", "imap.example.com"),
            ("MAILBOX_IMAP_PORT", "imaps"),
            ("MAILBOX_USERNAME", "me"),
            ("MAILBOX_PASSWORD", "pw"),
        ]))
        .is_err());
    }
}
