//! DKIM signing of outgoing messages.

use std::{fmt, path::PathBuf};

use ahash::AHashMap;
use async_trait::async_trait;
use mail_auth::{
    common::{
        crypto::{RsaKey, Sha256},
        headers::HeaderWriter,
    },
    dkim::DkimSigner,
};
use serde::Deserialize;
use thiserror::Error;

/// Headers covered by the signature
const SIGNED_HEADERS: [&str; 4] = ["From", "Subject", "Date", "Message-ID"];

#[derive(Debug, Error)]
pub enum DkimError {
    #[error("Unable to read key {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid private key for {0}")]
    Key(String),

    #[error("Unable to sign: {0}")]
    Sign(String),
}

/// A signing key as it appears in the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DkimKeyConfig {
    pub domain: String,
    pub selector: String,
    /// PEM file holding the RSA private key
    pub private_key: PathBuf,
}

#[derive(Clone, PartialEq, Eq)]
pub struct DkimKey {
    pub selector: String,
    pub private_key_pem: String,
}

impl fmt::Debug for DkimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DkimKey")
            .field("selector", &self.selector)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub trait DkimKeyStore: Send + Sync + fmt::Debug {
    /// The key used for mail from `domain`, if it has one
    async fn key_for(&self, domain: &str) -> Result<Option<DkimKey>, DkimError>;
}

/// Keys loaded once at start-up
#[derive(Debug, Default, Clone)]
pub struct StaticKeyStore {
    keys: AHashMap<String, DkimKey>,
}

impl StaticKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_key(mut self, domain: &str, key: DkimKey) -> Self {
        self.keys.insert(domain.to_ascii_lowercase(), key);
        self
    }

    /// Reads every configured key file
    pub fn load(configs: &[DkimKeyConfig]) -> Result<Self, DkimError> {
        configs.iter().try_fold(Self::new(), |store, config| {
            let pem = std::fs::read_to_string(&config.private_key).map_err(|source| {
                DkimError::Io {
                    path: config.private_key.clone(),
                    source,
                }
            })?;
            parse_key(&pem, &config.domain)?;

            Ok(store.with_key(
                &config.domain,
                DkimKey {
                    selector: config.selector.clone(),
                    private_key_pem: pem,
                },
            ))
        })
    }
}

#[async_trait]
impl DkimKeyStore for StaticKeyStore {
    async fn key_for(&self, domain: &str) -> Result<Option<DkimKey>, DkimError> {
        Ok(self.keys.get(&domain.to_ascii_lowercase()).cloned())
    }
}

fn parse_key(pem: &str, domain: &str) -> Result<RsaKey<Sha256>, DkimError> {
    RsaKey::<Sha256>::from_rsa_pem(pem)
        .or_else(|_| RsaKey::<Sha256>::from_pkcs8_pem(pem))
        .map_err(|_| DkimError::Key(domain.to_string()))
}

/// Signs `raw` for `domain` and returns it with the `DKIM-Signature`
/// header prepended
pub fn sign(raw: &[u8], domain: &str, key: &DkimKey) -> Result<Vec<u8>, DkimError> {
    let signature = DkimSigner::from_key(parse_key(&key.private_key_pem, domain)?)
        .domain(domain)
        .selector(&key.selector)
        .headers(SIGNED_HEADERS)
        .sign(raw)
        .map_err(|err| DkimError::Sign(err.to_string()))?;

    let mut signed = Vec::with_capacity(raw.len() + 512);
    signature.write_header(&mut signed);
    signed.extend_from_slice(raw);
    Ok(signed)
}
