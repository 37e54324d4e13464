use std::{fmt::Write, fs::File, io::BufReader, sync::Arc};

use postern_common::{context::TlsMetadata, tracing};
use postern_tracing::traced;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig, ServerConnection,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
    server::TlsStream,
};

use crate::{
    config::ServerTls,
    error::{ConnectionResult, TlsError, TlsResult},
};

const READ_CHUNK: usize = 4096;

/// A line read from the peer, terminator included
#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    Complete(Vec<u8>),
    /// No line feed within the limit
    TooLong,
    Eof,
}

impl Line {
    /// Whether `line` is properly terminated by `<CR><LF>`
    #[must_use]
    pub fn is_crlf(line: &[u8]) -> bool {
        line.ends_with(b"\r\n")
    }
}

fn metadata(conn: &ServerConnection) -> TlsResult<TlsMetadata> {
    Ok(TlsMetadata {
        protocol: conn
            .protocol_version()
            .ok_or(TlsError::ProtocolInfoMissing("protocol version"))?
            .as_str()
            .map_or_else(String::new, str::to_string),
        cipher: conn
            .negotiated_cipher_suite()
            .ok_or(TlsError::ProtocolInfoMissing("cipher suite"))?
            .suite()
            .as_str()
            .map_or_else(String::new, str::to_string),
    })
}

#[traced(instrument(level = tracing::Level::TRACE, skip_all), timing)]
fn load_certs(tls: &ServerTls) -> TlsResult<Vec<CertificateDer<'static>>> {
    let certificate = &tls.certificate;
    let error = |source| TlsError::CertificateLoad {
        path: certificate.display().to_string(),
        source,
    };

    rustls_pemfile::certs(&mut BufReader::new(File::open(certificate).map_err(error)?))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(error)
}

#[traced(instrument(level = tracing::Level::TRACE, skip_all), timing)]
fn load_key(tls: &ServerTls) -> TlsResult<PrivateKeyDer<'static>> {
    let path = tls.key.display().to_string();
    let error = |reason: String| TlsError::KeyLoad {
        path: path.clone(),
        reason,
    };

    let mut reader = BufReader::new(File::open(&tls.key).map_err(|e| error(e.to_string()))?);

    match rustls_pemfile::read_one(&mut reader).map_err(|e| error(e.to_string()))? {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
        Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
        _ => Err(error(
            "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)".to_string(),
        )),
    }
}

/// Reads the configured certificate chain and key into an acceptor
pub fn load_acceptor(tls: Option<&ServerTls>) -> TlsResult<TlsAcceptor> {
    let tls = tls.ok_or(TlsError::NotConfigured)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(tls)?, load_key(tls)?)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

pub enum Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    Plain {
        stream: Stream,
        /// Bytes read but not yet returned as a line
        buffer: Vec<u8>,
    },
    Tls {
        stream: Box<TlsStream<Stream>>,
        buffer: Vec<u8>,
    },
    /// Left behind by a failed upgrade
    Closed,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Connection<Stream> {
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub const fn new(stream: Stream) -> Self {
        Self::Plain {
            stream,
            buffer: Vec::new(),
        }
    }

    #[must_use]
    pub const fn is_secure(&self) -> bool {
        matches!(self, Self::Tls { .. })
    }

    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing)]
    pub(crate) async fn send<S: core::fmt::Display + Send + Sync>(
        &mut self,
        response: &S,
    ) -> ConnectionResult<usize> {
        let mut line = arrayvec::ArrayString::<1024>::new();
        write!(&mut line, "{response}\r\n")?;

        match self {
            Self::Plain { stream, .. } => {
                stream.write_all(line.as_bytes()).await?;
                stream.flush().await?;
            }
            Self::Tls { stream, .. } => {
                stream.write_all(line.as_bytes()).await?;
                stream.flush().await?;
            }
            Self::Closed => return Err(crate::error::ConnectionError::Closed),
        }

        Ok(line.len())
    }

    /// Reads up to and including the next line feed.
    ///
    /// Safe to cancel: bytes already read stay buffered for the next call.
    pub(crate) async fn read_line(&mut self, limit: usize) -> ConnectionResult<Line> {
        let mut chunk = [0; READ_CHUNK];

        loop {
            let (read, buffer) = match self {
                Self::Plain { stream, buffer } => {
                    if let Some(line) = take_line(buffer, limit) {
                        return Ok(line);
                    }
                    (stream.read(&mut chunk).await?, buffer)
                }
                Self::Tls { stream, buffer } => {
                    if let Some(line) = take_line(buffer, limit) {
                        return Ok(line);
                    }
                    (stream.read(&mut chunk).await?, buffer)
                }
                Self::Closed => return Ok(Line::Eof),
            };

            if read == 0 {
                return Ok(Line::Eof);
            }

            buffer.extend_from_slice(&chunk[..read]);
        }
    }

    /// Runs the server side of a TLS handshake.
    ///
    /// Anything the client pipelined before the handshake is discarded. A
    /// failed handshake leaves the plain stream in place.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing)]
    pub(crate) async fn upgrade(&mut self, acceptor: &TlsAcceptor) -> TlsResult<TlsMetadata> {
        tracing::debug!("Upgrading connection ...");

        let Self::Plain { stream, .. } = std::mem::replace(self, Self::Closed) else {
            return Err(TlsError::AlreadySecured);
        };

        let stream = match acceptor.accept(stream).into_fallible().await {
            Ok(stream) => stream,
            Err((err, stream)) => {
                *self = Self::Plain {
                    stream,
                    buffer: Vec::new(),
                };
                return Err(err.into());
            }
        };
        let info = metadata(stream.get_ref().1)?;

        *self = Self::Tls {
            stream: Box::new(stream),
            buffer: Vec::new(),
        };

        Ok(info)
    }
}

fn take_line(buffer: &mut Vec<u8>, limit: usize) -> Option<Line> {
    match buffer.iter().position(|&byte| byte == b'\n') {
        Some(end) if end < limit => Some(Line::Complete(buffer.drain(..=end).collect())),
        Some(_) => Some(Line::TooLong),
        None if buffer.len() >= limit => Some(Line::TooLong),
        None => None,
    }
}
