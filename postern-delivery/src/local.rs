//! Delivery to mailboxes hosted on this server.

use std::{
    fmt::Debug,
    io,
    path::{Component, Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use postern_common::internal;
use postern_spool::MessageId;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum LocalDeliveryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The mailbox name cannot be mapped to a directory
    #[error("Invalid mailbox: {0}")]
    InvalidMailbox(String),
}

impl LocalDeliveryError {
    /// Whether retrying later cannot help
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::InvalidMailbox(_))
    }
}

#[async_trait]
pub trait LocalDelivery: Send + Sync + Debug {
    async fn deliver(
        &self,
        id: &MessageId,
        mailbox: &str,
        raw: &[u8],
    ) -> Result<(), LocalDeliveryError>;
}

/// One maildir per address under `root`. Messages are written to `tmp/`
/// and moved into `new/` once complete.
#[derive(Debug, Clone)]
pub struct Maildir {
    root: PathBuf,
    hostname: String,
}

impl Maildir {
    pub fn new(root: impl Into<PathBuf>, hostname: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            hostname: hostname.into(),
        }
    }

    /// The maildir of `mailbox`, refusing anything that would escape `root`
    pub fn mailbox_path(&self, mailbox: &str) -> Result<PathBuf, LocalDeliveryError> {
        let name = mailbox.to_ascii_lowercase();
        let relative = Path::new(&name);

        let mut components = relative.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(relative)),
            _ => Err(LocalDeliveryError::InvalidMailbox(mailbox.to_string())),
        }
    }

    fn file_name(&self) -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        format!("{secs}.{}.{}", Ulid::new(), self.hostname)
    }
}

#[async_trait]
impl LocalDelivery for Maildir {
    async fn deliver(
        &self,
        id: &MessageId,
        mailbox: &str,
        raw: &[u8],
    ) -> Result<(), LocalDeliveryError> {
        let path = self.mailbox_path(mailbox)?;
        for sub in ["tmp", "new", "cur"] {
            fs::create_dir_all(path.join(sub)).await?;
        }

        let name = self.file_name();
        let tmp = path.join("tmp").join(&name);

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(raw).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, path.join("new").join(&name)).await?;

        internal!(level = INFO, "Delivered {id} to local mailbox {mailbox}");
        Ok(())
    }
}
