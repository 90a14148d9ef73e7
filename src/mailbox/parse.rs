//! RFC 822 → queue item conversion.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};

use crate::error::MailboxError;
use crate::items::{MessagePayload, NewItem};
use crate::mailbox::RawEmail;

/// Parse a fetched message into a queue item.
///
/// The `Message-ID` header becomes the external id; a message without one is
/// rejected rather than given an id that would change on every fetch.
pub fn parse_email(raw: &RawEmail) -> Result<NewItem, MailboxError> {
    let parse_err = |reason: &str| MailboxError::Parse {
        uid: raw.uid.clone(),
        reason: reason.to_string(),
    };

    let parsed = MessageParser::default()
        .parse(raw.bytes.as_slice())
        .ok_or_else(|| parse_err("not an RFC 822 message"))?;

    let external_id = parsed
        .message_id()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| parse_err("missing Message-ID"))?;

    let timestamp = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0));

    let attachments = parsed
        .attachments()
        .map(|part| {
            MimeHeaders::attachment_name(part)
                .unwrap_or("unnamed")
                .to_string()
        })
        .collect();

    Ok(NewItem {
        external_id,
        payload: MessagePayload {
            subject: parsed.subject().unwrap_or("(no subject)").to_string(),
            sender: first_address(parsed.from()),
            recipient: first_address(parsed.to()),
            body: extract_text(&parsed),
            timestamp,
            attachments,
        },
    })
}

fn first_address(address: Option<&mail_parser::Address>) -> String {
    address
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
