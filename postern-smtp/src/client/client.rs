//! The sending side of an SMTP conversation, over plain TCP or STARTTLS.

use std::{sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use md5::Md5;
use postern_common::{incoming, internal, outgoing, tracing};
use postern_tracing::traced;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{
        ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};

use super::{
    error::{ClientError, ClientResult},
    response::Response,
};

const READ_CHUNK: usize = 4096;

/// Replies larger than this are refused
const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

enum ClientConnection<Stream> {
    Plain(Stream),
    Tls(Box<TlsStream<Stream>>),
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> ClientConnection<Stream> {
    async fn send(&mut self, data: &[u8]) -> ClientResult<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> ClientResult<usize> {
        let read = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };

        if read == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(read)
    }

    async fn upgrade(self, server_name: &str, accept_invalid_certs: bool) -> ClientResult<Self> {
        let Self::Plain(stream) = self else {
            return Err(ClientError::Tls(String::from("Connection is already TLS")));
        };

        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            if let Err(err) = roots.add(cert) {
                tracing::debug!("Skipping native certificate: {err}");
            }
        }
        if !native.errors.is_empty() {
            tracing::warn!(?native.errors, "Some certificates could not be loaded");
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        if accept_invalid_certs {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerifier));
        }

        let name = ServerName::try_from(server_name.to_string())
            .map_err(|err| ClientError::Tls(format!("Invalid server name {server_name}: {err}")))?;

        let stream = TlsConnector::from(Arc::new(config))
            .connect(name, stream)
            .await
            .map_err(|err| ClientError::Tls(err.to_string()))?;

        Ok(Self::Tls(Box::new(stream)))
    }
}

/// Accepts any certificate, for peers that are only encrypted opportunistically
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// Drives one conversation with a remote server.
///
/// Every method sends a single command and returns the reply, whatever its
/// code; callers decide what a refusal means for the message.
pub struct SmtpClient<Stream: AsyncRead + AsyncWrite + Unpin + Send = TcpStream> {
    connection: Option<ClientConnection<Stream>>,
    buffer: Vec<u8>,
    server_name: String,
    accept_invalid_certs: bool,
    timeout: Duration,
    /// EHLO keywords, empty after a HELO fallback
    capabilities: Vec<String>,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> SmtpClient<Stream> {
    /// Wraps a connected stream. `server_name` is verified against the
    /// certificate presented after STARTTLS.
    pub fn new(stream: Stream, server_name: impl Into<String>) -> Self {
        Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: Vec::new(),
            server_name: server_name.into(),
            accept_invalid_certs: false,
            timeout: DEFAULT_TIMEOUT,
            capabilities: Vec::new(),
        }
    }

    #[must_use]
    pub const fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// How long to wait for each reply
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn is_secure(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    /// Whether the last EHLO advertised `keyword`
    #[must_use]
    pub fn supports(&self, keyword: &str) -> bool {
        self.capabilities.iter().any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|first| first.eq_ignore_ascii_case(keyword))
        })
    }

    /// Mechanisms listed on the `AUTH` capability line
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<String> {
        self.capabilities
            .iter()
            .filter_map(|line| {
                let (keyword, mechanisms) = line.split_once([' ', '='])?;
                keyword.eq_ignore_ascii_case("AUTH").then(|| {
                    mechanisms
                        .split_whitespace()
                        .map(str::to_ascii_uppercase)
                        .collect::<Vec<_>>()
                })
            })
            .flatten()
            .collect()
    }

    pub async fn read_greeting(&mut self) -> ClientResult<Response> {
        self.read_response().await
    }

    /// Sends a line and reads the reply
    pub async fn command(&mut self, line: &str) -> ClientResult<Response> {
        outgoing!("{line}");
        self.send(line).await?;
        self.read_response().await
    }

    /// Like [`SmtpClient::command`], without logging the line
    async fn secret(&mut self, line: &str) -> ClientResult<Response> {
        outgoing!("<credentials>");
        self.send(line).await?;
        self.read_response().await
    }

    async fn send(&mut self, line: &str) -> ClientResult<()> {
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(format!("{line}\r\n").as_bytes())
            .await
    }

    /// Sends EHLO, falling back to HELO when the server refuses it
    #[traced(instrument(level = tracing::Level::TRACE, skip(self)), timing(precision = "ms"))]
    pub async fn hello(&mut self, domain: &str) -> ClientResult<Response> {
        let response = self.command(&format!("EHLO {domain}")).await?;

        if response.is_permanent_error() {
            internal!(level = DEBUG, "EHLO refused with {}, trying HELO", response.code);
            self.capabilities.clear();
            return self.command(&format!("HELO {domain}")).await;
        }

        self.capabilities = response.lines.iter().skip(1).cloned().collect();
        Ok(response)
    }

    /// Sends STARTTLS and, when the server agrees, runs the handshake.
    ///
    /// The caller must greet again afterwards. A failed handshake leaves the
    /// client without a connection.
    #[traced(instrument(level = tracing::Level::TRACE, skip(self)), timing(precision = "ms"))]
    pub async fn starttls(&mut self) -> ClientResult<Response> {
        let response = self.command("STARTTLS").await?;
        if response.code != 220 {
            return Ok(response);
        }

        let connection = self.connection.take().ok_or(ClientError::ConnectionClosed)?;
        self.connection = Some(
            connection
                .upgrade(&self.server_name, self.accept_invalid_certs)
                .await?,
        );
        self.buffer.clear();
        self.capabilities.clear();

        Ok(response)
    }

    /// Authenticates with CRAM-MD5 when advertised, PLAIN otherwise
    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing(precision = "ms"))]
    pub async fn auth(&mut self, login: &str, password: &str) -> ClientResult<Response> {
        if self.auth_mechanisms().iter().any(|m| m == "CRAM-MD5") {
            let challenge = self.command("AUTH CRAM-MD5").await?;
            if challenge.code != 334 {
                return Ok(challenge);
            }

            let challenge = STANDARD
                .decode(challenge.message().trim())
                .map_err(|err| ClientError::Parse(format!("Invalid CRAM-MD5 challenge: {err}")))?;
            let digest = hmac_md5(password.as_bytes(), &challenge)?;

            return self
                .secret(&STANDARD.encode(format!("{login} {digest}")))
                .await;
        }

        let token = STANDARD.encode(format!("\0{login}\0{password}"));
        self.secret(&format!("AUTH PLAIN {token}")).await
    }

    pub async fn mail(&mut self, from: &str) -> ClientResult<Response> {
        self.command(&format!("MAIL FROM:<{from}>")).await
    }

    pub async fn rcpt(&mut self, to: &str) -> ClientResult<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// Sends DATA, returning once the server replies (`354` to go ahead)
    pub async fn data(&mut self) -> ClientResult<Response> {
        self.command("DATA").await
    }

    /// Writes the message dot-stuffed, followed by the terminating dot, and
    /// returns the reply to it
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, fields(bytes = raw.len())), timing(precision = "ms"))]
    pub async fn send_data(&mut self, raw: &[u8]) -> ClientResult<Response> {
        let payload = dot_stuff(raw);
        outgoing!("<{} bytes of message data>", payload.len());

        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(&payload)
            .await?;

        self.read_response().await
    }

    pub async fn quit(&mut self) -> ClientResult<Response> {
        self.command("QUIT").await
    }

    async fn read_response(&mut self) -> ClientResult<Response> {
        let mut chunk = [0; READ_CHUNK];

        loop {
            if let Some((response, consumed)) = Response::parse(&self.buffer)? {
                self.buffer.drain(..consumed);
                incoming!("{} {}", response.code, response.message());
                return Ok(response);
            }

            if self.buffer.len() > MAX_RESPONSE_SIZE {
                return Err(ClientError::Parse(format!(
                    "Response exceeds {MAX_RESPONSE_SIZE} bytes"
                )));
            }

            let connection = self.connection.as_mut().ok_or(ClientError::ConnectionClosed)?;
            let read = tokio::time::timeout(self.timeout, connection.read(&mut chunk))
                .await
                .map_err(|_| ClientError::Timeout(self.timeout.as_secs()))??;

            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

/// Escapes lines starting with a dot and appends the terminator
fn dot_stuff(raw: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(raw.len() + 5);
    let mut line_start = true;

    for &byte in raw {
        if line_start && byte == b'.' {
            payload.push(b'.');
        }
        payload.push(byte);
        line_start = byte == b'\n';
    }

    if !payload.is_empty() && !payload.ends_with(b"\r\n") {
        payload.extend_from_slice(b"\r\n");
    }
    payload.extend_from_slice(b".\r\n");
    payload
}

/// RFC 2195 response digest: HMAC-MD5 of the challenge keyed with the password
fn hmac_md5(key: &[u8], message: &[u8]) -> ClientResult<String> {
    let mut mac = Hmac::<Md5>::new_from_slice(key)
        .map_err(|err| ClientError::Parse(format!("Invalid CRAM-MD5 key: {err}")))?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}
