use serde::{Deserialize, Serialize};

use crate::address::{Address, ReversePath};

/// The `MAIL FROM` / `RCPT TO` state of a single transaction
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    sender: Option<ReversePath>,
    recipients: Vec<Address>,
}

impl Envelope {
    /// Returns the sender for this transaction, if `MAIL FROM` was accepted
    #[inline]
    #[must_use]
    pub const fn sender(&self) -> Option<&ReversePath> {
        self.sender.as_ref()
    }

    #[inline]
    pub fn set_sender(&mut self, sender: ReversePath) {
        self.sender = Some(sender);
    }

    /// Returns the accepted recipients in the order they were given
    #[inline]
    #[must_use]
    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }

    /// Adds a recipient, returning `false` when it was already present
    pub fn add_recipient(&mut self, recipient: Address) -> bool {
        if self.recipients.contains(&recipient) {
            return false;
        }

        self.recipients.push(recipient);
        true
    }

    pub fn clear(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }
}
