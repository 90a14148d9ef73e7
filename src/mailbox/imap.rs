//! IMAP (inbound) + SMTP (outbound) mailbox.
//!
//! IMAP is spoken directly over a blocking rustls stream and run inside
//! `spawn_blocking`. Messages are fetched with `BODY.PEEK[]` so polling never
//! changes their flags.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, StreamOwned};
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::error::MailboxError;
use crate::mailbox::{Mailbox, MailboxConfig, OutgoingEmail, RawEmail};

const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Mailbox backed by an IMAP server and an SMTP relay.
pub struct ImapMailbox {
    config: MailboxConfig,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    fn name(&self) -> &str {
        "imap"
    }

    async fn fetch_all(&self) -> Result<Vec<RawEmail>, MailboxError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || fetch_imap(&config))
            .await
            .map_err(|e| MailboxError::Join(e.to_string()))?
    }

    async fn send(&self, email: &OutgoingEmail) -> Result<(), MailboxError> {
        let config = self.config.clone();
        let email = email.clone();
        tokio::task::spawn_blocking(move || send_smtp(&config, &email))
            .await
            .map_err(|e| MailboxError::Join(e.to_string()))?
    }
}

// ── IMAP ────────────────────────────────────────────────────────────

/// Response to one tagged command.
struct Response {
    /// Untagged lines, without their trailing CRLF.
    lines: Vec<String>,
    /// Literal payloads (`{n}` blocks) in arrival order.
    literals: Vec<Vec<u8>>,
}

/// An IMAP connection over TLS.
struct ImapSession {
    stream: StreamOwned<ClientConnection, TcpStream>,
    next_tag: u32,
}

impl ImapSession {
    fn connect(host: &str, port: u16) -> Result<Self, MailboxError> {
        let connect_err = |reason: String| MailboxError::Connect {
            host: host.to_string(),
            reason,
        };

        let tcp = TcpStream::connect((host, port)).map_err(|e| connect_err(e.to_string()))?;
        tcp.set_read_timeout(Some(IO_TIMEOUT))
            .map_err(|e| connect_err(e.to_string()))?;
        tcp.set_write_timeout(Some(IO_TIMEOUT))
            .map_err(|e| connect_err(e.to_string()))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name =
            ServerName::try_from(host.to_string()).map_err(|e| connect_err(e.to_string()))?;
        let conn = ClientConnection::new(tls_config, server_name)
            .map_err(|e| connect_err(e.to_string()))?;

        let mut session = Self {
            stream: StreamOwned::new(conn, tcp),
            next_tag: 1,
        };
        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(connect_err(format!("unexpected greeting: {greeting}")));
        }
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => return Err(MailboxError::Protocol("connection closed".into())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        buf.truncate(buf.len() - 2);
                        return Ok(String::from_utf8_lossy(&buf).into_owned());
                    }
                }
                Err(e) => return Err(MailboxError::Protocol(e.to_string())),
            }
        }
    }

    fn read_literal(&mut self, len: usize) -> Result<Vec<u8>, MailboxError> {
        let mut buf = vec![0u8; len];
        self.stream
            .read_exact(&mut buf)
            .map_err(|e| MailboxError::Protocol(format!("literal read: {e}")))?;
        Ok(buf)
    }

    /// Send one command and collect everything up to its tagged completion.
    fn command(&mut self, cmd: &str) -> Result<Response, MailboxError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        self.stream
            .write_all(format!("{tag} {cmd}\r\n").as_bytes())
            .and_then(|()| self.stream.flush())
            .map_err(|e| MailboxError::Protocol(e.to_string()))?;

        let mut response = Response {
            lines: Vec::new(),
            literals: Vec::new(),
        };
        loop {
            let line = self.read_line()?;
            if let Some(status) = line.strip_prefix(&format!("{tag} ")) {
                if status.starts_with("OK") {
                    return Ok(response);
                }
                return Err(MailboxError::Rejected {
                    command: cmd.split_whitespace().next().unwrap_or(cmd).to_string(),
                    status: status.to_string(),
                });
            }
            if let Some(len) = literal_len(&line) {
                let literal = self.read_literal(len)?;
                response.literals.push(literal);
            }
            response.lines.push(line);
        }
    }

    fn login(&mut self, user: &str, password: &str) -> Result<(), MailboxError> {
        self.command(&format!("LOGIN {} {}", quote(user), quote(password)))
            .map(|_| ())
            .map_err(|_| MailboxError::Auth {
                user: user.to_string(),
            })
    }

    fn select(&mut self, folder: &str) -> Result<(), MailboxError> {
        self.command(&format!("SELECT {}", quote(folder))).map(|_| ())
    }

    fn uid_search(&mut self, criteria: &str) -> Result<Vec<String>, MailboxError> {
        let response = self.command(&format!("UID SEARCH {criteria}"))?;
        Ok(parse_search(&response.lines))
    }

    fn uid_fetch_body(&mut self, uid: &str) -> Result<Option<Vec<u8>>, MailboxError> {
        let response = self.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        Ok(response.literals.into_iter().next())
    }

    fn logout(mut self) {
        if let Err(e) = self.command("LOGOUT") {
            debug!(error = %e, "IMAP logout failed");
        }
    }
}

/// Fetch every message matching the configured search (blocking).
fn fetch_imap(config: &MailboxConfig) -> Result<Vec<RawEmail>, MailboxError> {
    let mut session = ImapSession::connect(&config.imap_host, config.imap_port)?;
    session.login(&config.username, config.password.expose_secret())?;
    session.select(&config.folder)?;

    let uids = session.uid_search(&config.search)?;
    debug!(folder = %config.folder, count = uids.len(), "IMAP search complete");

    let messages = collect_bodies(uids, |uid| session.uid_fetch_body(uid))?;

    session.logout();
    Ok(messages)
}

/// Fetch each UID in turn. A message the server refuses or returns without
/// a body is skipped; a broken connection ends the batch.
fn collect_bodies<F>(uids: Vec<String>, mut fetch: F) -> Result<Vec<RawEmail>, MailboxError>
where
    F: FnMut(&str) -> Result<Option<Vec<u8>>, MailboxError>,
{
    let mut messages = Vec::with_capacity(uids.len());
    for uid in uids {
        match fetch(&uid) {
            Ok(Some(bytes)) => messages.push(RawEmail { uid, bytes }),
            Ok(None) => warn!(uid = %uid, "IMAP fetch returned no body"),
            Err(e @ MailboxError::Rejected { .. }) => {
                warn!(uid = %uid, error = %e, "Skipping message that could not be fetched");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(messages)
}

/// Length of a trailing `{n}` literal marker, if the line ends with one.
fn literal_len(line: &str) -> Option<usize> {
    let body = line.strip_suffix('}')?;
    let open = body.rfind('{')?;
    body[open + 1..].trim_end_matches('+').parse().ok()
}

/// Numbers from `* SEARCH` responses.
fn parse_search(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().map(str::to_string))
        .collect()
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

// ── SMTP ────────────────────────────────────────────────────────────

fn send_smtp(config: &MailboxConfig, email: &OutgoingEmail) -> Result<(), MailboxError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    // 465 is implicit TLS; anything else negotiates STARTTLS.
    let builder = if config.smtp_port == 465 {
        SmtpTransport::relay(&config.smtp_host)
    } else {
        SmtpTransport::starttls_relay(&config.smtp_host)
    }
    .map_err(|e| MailboxError::Send(format!("SMTP relay error: {e}")))?;

    let transport = builder
        .port(config.smtp_port)
        .credentials(creds)
        .build();

    let message = Message::builder()
        .from(
            config
                .from_address
                .parse()
                .map_err(|e| MailboxError::Send(format!("Invalid from address: {e}")))?,
        )
        .to(email
            .to
            .parse()
            .map_err(|e| MailboxError::Send(format!("Invalid to address: {e}")))?)
        .subject(email.subject.as_str())
        .body(email.body.clone())
        .map_err(|e| MailboxError::Send(format!("Failed to build email: {e}")))?;

    transport
        .send(&message)
        .map_err(|e| MailboxError::Send(format!("SMTP send failed: {e}")))?;

    info!(to = %email.to, "Email sent");
    Ok(())
}
