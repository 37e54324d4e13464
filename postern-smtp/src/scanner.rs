use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanVerdict {
    pub infected: bool,
    /// Name of the detected signature
    pub signature: String,
}

impl ScanVerdict {
    #[must_use]
    pub const fn clean() -> Self {
        Self {
            infected: false,
            signature: String::new(),
        }
    }

    #[must_use]
    pub fn infected(signature: impl Into<String>) -> Self {
        Self {
            infected: true,
            signature: signature.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("Scanner failure: {0}")]
pub struct ScanError(pub String);

/// Inspects a message once it has been received in full
#[async_trait]
pub trait VirusScanner: Send + Sync + Debug {
    async fn scan(&self, message: &[u8]) -> Result<ScanVerdict, ScanError>;
}
