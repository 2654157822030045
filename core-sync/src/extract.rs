//! Indexable fields from raw RFC 5322 bytes.

use chrono::{DateTime, TimeZone, Utc};
use core_archive::IndexFields;
use mail_parser::{Address, Message, MessageParser, MimeHeaders};

/// Extract the searchable fields of a message. Unparseable input yields
/// empty fields rather than an error so one bad message never stalls
/// indexing.
pub fn extract_fields(raw: &[u8]) -> IndexFields {
    let Some(message) = MessageParser::default().parse(raw) else {
        return IndexFields::default();
    };

    let recipients = [message.to(), message.cc(), message.bcc()]
        .into_iter()
        .flatten()
        .map(format_address)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ");

    IndexFields {
        subject: message.subject().unwrap_or_default().to_string(),
        sender: message.from().map(format_address).unwrap_or_default(),
        recipients,
        date: message_date(&message).map(|d| d.to_rfc3339()),
        body: body_text(&message),
        attachments: message
            .attachments()
            .filter_map(|part| part.attachment_name().map(str::to_string))
            .collect(),
    }
}

/// `Date` header as UTC, if present and valid.
pub fn parse_date(raw: &[u8]) -> Option<DateTime<Utc>> {
    MessageParser::default()
        .parse_headers(raw)
        .and_then(|message| message_date(&message))
}

/// `Message-ID` header, used as the cross-folder identity.
pub fn message_identity(raw_headers: &[u8]) -> Option<String> {
    MessageParser::default()
        .parse_headers(raw_headers)
        .and_then(|message| message.message_id().map(str::to_string))
        .filter(|id| !id.trim().is_empty())
}

fn message_date(message: &Message<'_>) -> Option<DateTime<Utc>> {
    message
        .date()
        .and_then(|date| Utc.timestamp_opt(date.to_timestamp(), 0).single())
}

fn body_text(message: &Message<'_>) -> String {
    let mut parts = Vec::new();
    let mut index = 0;
    while let Some(text) = message.body_text(index) {
        parts.push(text.into_owned());
        index += 1;
    }
    parts.join("\n")
}

fn format_address(address: &Address<'_>) -> String {
    let mut out = Vec::new();
    let mut push = |name: Option<&str>, email: Option<&str>| match (name, email) {
        (Some(name), Some(email)) => out.push(format!("{} <{}>", name, email)),
        (None, Some(email)) => out.push(email.to_string()),
        (Some(name), None) => out.push(name.to_string()),
        (None, None) => {}
    };

    match address {
        Address::List(addrs) => {
            for addr in addrs {
                push(addr.name.as_deref(), addr.address.as_deref());
            }
        }
        Address::Group(groups) => {
            for group in groups {
                for addr in &group.addresses {
                    push(addr.name.as_deref(), addr.address.as_deref());
                }
            }
        }
    }

    out.join(", ")
}
