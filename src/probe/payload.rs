use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transaction id stamped on the probe query.
pub const QUERY_ID: u16 = 0xAAAA;

const DNS_HEADER_LEN: usize = 12;
const FLAG_RECURSION_DESIRED: u16 = 0x0100;
const FLAG_RESPONSE: u8 = 0x80;
const QTYPE_A: u16 = 1;
const QCLASS_IN: u16 = 1;
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Query name cannot be empty")]
    EmptyName,
    #[error("Query name is {0} bytes, at most 253 allowed")]
    NameTooLong(usize),
    #[error("Invalid label '{0}' in query name (1 to 63 bytes required)")]
    InvalidLabel(String),
}

/// How the unwrapped reply is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExpectMode {
    /// A DNS response to the probe query
    #[default]
    Dns,
    /// The payload sent, byte for byte (loopback relays)
    Echo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMatch {
    /// Header carries our id, the response flag and a question section.
    DnsResponse,
    /// Not a well-formed answer, but it mentions the queried name.
    NameMentioned,
    Echo,
    Implausible,
}

impl ReplyMatch {
    pub fn is_plausible(self) -> bool {
        self != ReplyMatch::Implausible
    }
}

fn labels(name: &str) -> impl Iterator<Item = &str> {
    name.strip_suffix('.').unwrap_or(name).split('.')
}

pub fn validate_query_name(name: &str) -> Result<(), PayloadError> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if trimmed.is_empty() {
        return Err(PayloadError::EmptyName);
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(PayloadError::NameTooLong(trimmed.len()));
    }
    if let Some(bad) = labels(name).find(|l| l.is_empty() || l.len() > MAX_LABEL_LEN) {
        return Err(PayloadError::InvalidLabel(bad.to_string()));
    }
    Ok(())
}

/// Standard recursive A query for `name`.
pub fn build_dns_query(id: u16, name: &str) -> Result<Vec<u8>, PayloadError> {
    validate_query_name(name)?;

    let mut buf = Vec::with_capacity(DNS_HEADER_LEN + name.len() + 6);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&FLAG_RECURSION_DESIRED.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&[0u8; 6]);
    for label in labels(name) {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    buf.extend_from_slice(&QTYPE_A.to_be_bytes());
    buf.extend_from_slice(&QCLASS_IN.to_be_bytes());
    Ok(buf)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

fn is_dns_response(query: &[u8], reply: &[u8]) -> bool {
    if reply.len() < DNS_HEADER_LEN || query.len() < 2 {
        return false;
    }
    let question_count = u16::from_be_bytes([reply[4], reply[5]]);
    reply[..2] == query[..2] && reply[2] & FLAG_RESPONSE != 0 && question_count >= 1
}

pub fn evaluate(mode: ExpectMode, sent: &[u8], query_name: &str, reply: &[u8]) -> ReplyMatch {
    match mode {
        ExpectMode::Echo if reply == sent => ReplyMatch::Echo,
        ExpectMode::Echo => ReplyMatch::Implausible,
        ExpectMode::Dns if is_dns_response(sent, reply) => ReplyMatch::DnsResponse,
        ExpectMode::Dns if labels(query_name).any(|l| contains(reply, l.as_bytes())) => {
            ReplyMatch::NameMentioned
        }
        ExpectMode::Dns => ReplyMatch::Implausible,
    }
}

/// Lowercase hex of the first `max` bytes, with a trailing ellipsis when cut.
pub fn hex_preview(data: &[u8], max: usize) -> String {
    let mut out: String = data
        .iter()
        .take(max)
        .map(|b| format!("{:02x}", b))
        .collect();
    if data.len() > max {
        out.push_str("...");
    }
    out
}
