use std::net::SocketAddr;

use ahash::AHashMap;

use crate::{address::Address, envelope::Envelope};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsMetadata {
    pub protocol: String,
    pub cipher: String,
}

/// The view of an SMTP session handed to hooks.
///
/// Hooks may inspect and adjust it, and may queue reply lines in the outbox
/// which the session writes out before continuing.
#[derive(Debug, Clone)]
pub struct Context {
    pub id: String,
    pub peer: SocketAddr,
    pub system_name: String,
    pub helo: Option<String>,
    pub extended: bool,
    pub tls: Option<TlsMetadata>,
    pub auth_user: Option<String>,
    pub envelope: Envelope,
    /// The recipient being evaluated by `RCPT TO` hooks
    pub recipient: Option<Address>,
    /// A relay verdict set by a `RCPT TO` hook, consulted before any other check
    pub relay: Option<bool>,
    pub data: Option<Vec<u8>>,
    pub metadata: AHashMap<String, String>,
    outbox: Vec<String>,
}

impl Context {
    #[must_use]
    pub fn new(id: impl Into<String>, peer: SocketAddr, system_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            peer,
            system_name: system_name.into(),
            helo: None,
            extended: false,
            tls: None,
            auth_user: None,
            envelope: Envelope::default(),
            recipient: None,
            relay: None,
            data: None,
            metadata: AHashMap::default(),
            outbox: Vec::default(),
        }
    }

    /// Queue a raw reply line, e.g. `"250 ok"`, to be sent to the client
    pub fn reply(&mut self, line: impl Into<String>) {
        self.outbox.push(line.into());
    }

    pub fn take_replies(&mut self) -> Vec<String> {
        std::mem::take(&mut self.outbox)
    }

    #[must_use]
    pub fn has_replies(&self) -> bool {
        !self.outbox.is_empty()
    }

    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Drops the per-transaction state, keeping the connection level details
    pub fn reset_transaction(&mut self) {
        self.envelope.clear();
        self.recipient = None;
        self.relay = None;
        self.data = None;
    }
}
