use std::{
    fmt::{self, Display},
    str::FromStr,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;

/// Return path of a message that is itself a bounce. A permanent failure
/// delivering it is a double bounce and is discarded.
pub const RETURN_PATH_NULL: &str = "";

/// Return path marking a bounce of a bounce. Never generated here, but
/// recognised and discarded.
pub const RETURN_PATH_TRIPLE_BOUNCE: &str = "#@[]";

/// Unique identifier of a queue record, sortable by creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Ulid);

impl MessageId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MessageId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Content address of a raw message: the hex SHA-256 of its bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobKey(String);

impl BlobKey {
    #[must_use]
    pub fn of(raw: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(raw)))
    }

    /// Accepts only the 64 lowercase hex characters produced by [`BlobKey::of`],
    /// which keeps keys safe to use as file names
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        (value.len() == 64
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)))
        .then(|| Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum QueueStatus {
    #[default]
    Ready = 0,
    /// Marked by an operator, removed on the next attempt
    Discarding = 1,
    /// Waiting for its next scheduled attempt
    Deferred = 2,
    /// Marked by an operator, bounced on the next attempt
    AdminBounce = 3,
}

impl Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ready => "ready",
            Self::Discarding => "discarding",
            Self::Deferred => "deferred",
            Self::AdminBounce => "admin-bounce",
        })
    }
}

/// One recipient's share of a queued message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: MessageId,
    /// Shared by every record created from the same SMTP transaction
    pub envelope_id: MessageId,
    pub key: BlobKey,
    /// The `Message-ID` header of the raw message
    pub message_id: String,
    pub mail_from: String,
    pub return_path: String,
    pub rcpt_to: String,
    /// The recipient's domain
    pub host: String,
    pub auth_user: Option<String>,
    pub status: QueueStatus,
    pub added_at: SystemTime,
    pub delivery_started_at: Option<SystemTime>,
    pub next_delivery_scheduled_at: SystemTime,
    pub delivery_failed_count: u32,
}

impl QueuedMessage {
    /// Time spent in the queue since the record was created
    #[must_use]
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.added_at).unwrap_or_default()
    }

    #[must_use]
    pub fn is_bounce(&self) -> bool {
        self.return_path == RETURN_PATH_NULL
    }

    #[must_use]
    pub fn is_triple_bounce(&self) -> bool {
        self.return_path == RETURN_PATH_TRIPLE_BOUNCE
    }

    /// Encodes the record for the work queue
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::serde::decode_from_slice(bytes, bincode::config::standard())?.0)
    }
}
