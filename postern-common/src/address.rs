//! Mailbox parsing and the RFC 5321 size rules applied to envelope paths.

use std::{
    fmt::{self, Display, Formatter},
    net::IpAddr,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// RFC 5321 4.5.3.1.3, counting the surrounding brackets
pub const MAX_PATH_LENGTH: usize = 256;
/// RFC 5321 4.5.3.1.1
pub const MAX_LOCAL_PART_LENGTH: usize = 64;
/// RFC 5321 4.5.3.1.2
pub const MAX_DOMAIN_LENGTH: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("path exceeds {MAX_PATH_LENGTH} characters")]
    PathTooLong,

    #[error("local part exceeds {MAX_LOCAL_PART_LENGTH} characters")]
    LocalPartTooLong,

    #[error("domain exceeds {MAX_DOMAIN_LENGTH} characters")]
    DomainTooLong,

    #[error("invalid address: {0}")]
    Malformed(String),
}

/// A mailbox as it appears in an envelope, `local_part@domain`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub local_part: String,
    pub domain: String,
}

impl Address {
    #[must_use]
    pub fn new(local_part: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local_part: local_part.into(),
            domain: domain.into(),
        }
    }

    /// Lower-cases the domain, which is the only part compared case-insensitively
    #[must_use]
    pub fn normalised(mut self) -> Self {
        self.domain = self.domain.to_ascii_lowercase();
        self
    }
}

impl FromStr for Address {
    type Err = AddressError;

    /// Parses an RFC 5321 `Mailbox`: a Dot-string or Quoted-string local part,
    /// then a domain or an address literal
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AddressError::Malformed(s.to_string());
        let (local, domain) = split_mailbox(s).ok_or_else(malformed)?;

        if is_local_part(local) && is_domain(domain) {
            Ok(Self::new(local, domain))
        } else {
            Err(malformed())
        }
    }
}

/// Splits at the `@` ending the local part, which for a quoted local part is
/// the one straight after the closing quote
fn split_mailbox(s: &str) -> Option<(&str, &str)> {
    let end = if s.starts_with('"') {
        quoted_end(s)?
    } else {
        s.find('@')?
    };

    let (local, rest) = s.split_at(end);
    Some((local, rest.strip_prefix('@')?))
}

/// Index just past the closing quote of a quoted string starting at 0
fn quoted_end(s: &str) -> Option<usize> {
    let mut escaped = false;
    for (idx, byte) in s.bytes().enumerate().skip(1) {
        match byte {
            _ if escaped => escaped = false,
            b'\\' => escaped = true,
            b'"' => return Some(idx + 1),
            _ => {}
        }
    }

    None
}

const fn is_atext(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || matches!(
            ch,
            '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '/' | '=' | '?' | '^' | '_'
                | '`' | '{' | '|' | '}' | '~'
        )
}

fn is_local_part(local: &str) -> bool {
    match local
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(quoted) => is_quoted_content(quoted),
        None => local
            .split('.')
            .all(|atom| !atom.is_empty() && atom.chars().all(is_atext)),
    }
}

/// `qtextSMTP` and `quoted-pairSMTP`
fn is_quoted_content(quoted: &str) -> bool {
    let mut bytes = quoted.bytes();
    while let Some(byte) = bytes.next() {
        let valid = match byte {
            b'\\' => bytes.next().is_some_and(|escaped| (32..=126).contains(&escaped)),
            32 | 33 | 35..=91 | 93..=126 => true,
            _ => false,
        };
        if !valid {
            return false;
        }
    }

    true
}

fn is_domain(domain: &str) -> bool {
    if let Some(literal) = domain.strip_prefix('[').and_then(|d| d.strip_suffix(']')) {
        return is_address_literal(literal);
    }

    !domain.is_empty() && domain.split('.').all(is_label)
}

/// `Let-dig [Ldh-str]`, at most 63 octets
fn is_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            bytes.len() <= 63
                && first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        }
        _ => false,
    }
}

/// IPv4, `IPv6:` or a `tag:content` general literal
fn is_address_literal(literal: &str) -> bool {
    if parse_ip_literal(literal).is_some() {
        return true;
    }

    literal.split_once(':').is_some_and(|(tag, content)| {
        is_label(tag)
            && !content.is_empty()
            && content
                .bytes()
                .all(|b| matches!(b, 33..=90 | 94..=126))
    })
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

/// The sender of a transaction. `MAIL FROM:<>` is the null reverse path used by bounces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReversePath {
    Null,
    Mailbox(Address),
}

impl ReversePath {
    #[must_use]
    pub const fn mailbox(&self) -> Option<&Address> {
        match self {
            Self::Null => None,
            Self::Mailbox(address) => Some(address),
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl Display for ReversePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Mailbox(address) => address.fmt(f),
        }
    }
}

/// Returns what sits between `<` and `>`, trimming whitespace around it
#[must_use]
pub fn unbracket(path: &str) -> Option<&str> {
    let path = path.trim();
    path.strip_prefix('<')?.strip_suffix('>').map(str::trim)
}

/// Removes an RFC 5321 4.1.1.3 source route, `@a,@b:user@c` becomes `user@c`
#[must_use]
pub fn strip_source_route(path: &str) -> &str {
    if !path.starts_with('@') {
        return path;
    }

    path.split_once(':').map_or(path, |(_, mailbox)| mailbox)
}

/// Accepts `1.2.3.4`, `[1.2.3.4]`, `::1` and `[IPv6:::1]`
#[must_use]
pub fn parse_ip_literal(value: &str) -> Option<IpAddr> {
    let inner = value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .unwrap_or(value);
    let inner = inner
        .strip_prefix("IPv6:")
        .or_else(|| inner.strip_prefix("ipv6:"))
        .unwrap_or(inner);

    inner.parse().ok()
}

/// Validates a non-null reverse path against the size limits.
///
/// `enforce_local_part` enables the optional 64 character local part cap.
pub fn validate_reverse_path(path: &str, enforce_local_part: bool) -> Result<Address, AddressError> {
    if path.len() > MAX_PATH_LENGTH {
        return Err(AddressError::PathTooLong);
    }

    let address = path.parse::<Address>()?;

    if enforce_local_part && address.local_part.len() > MAX_LOCAL_PART_LENGTH {
        return Err(AddressError::LocalPartTooLong);
    }

    if address.domain.len() > MAX_DOMAIN_LENGTH {
        return Err(AddressError::DomainTooLong);
    }

    Ok(address)
}

/// Parses a forward path, expanding a bare `postmaster` with the local system name
pub fn parse_forward_path(path: &str, system_name: &str) -> Result<Address, AddressError> {
    let path = strip_source_route(path);

    if path.eq_ignore_ascii_case("postmaster") {
        return Ok(Address::new(path, system_name).normalised());
    }

    path.parse::<Address>().map(Address::normalised)
}
