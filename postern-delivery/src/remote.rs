//! One SMTP conversation handing a queued message to a remote server.
//!
//! The conversation runs greeting → EHLO → STARTTLS (when advertised) →
//! AUTH (when the route has credentials) → MAIL → RCPT → DATA → QUIT. A
//! failed STARTTLS is retried in plaintext over a fresh connection when the
//! TLS policy allows it (RFC 3207 section 4.1).

use std::time::Duration;

use chrono::Utc;
use postern_common::{config::TlsConfig, internal};
use postern_smtp::client::{Response, SmtpClient};
use postern_spool::{QueuedMessage, Route};
use postern_tracing::traced;

use crate::{
    dkim::{self, DkimKeyStore},
    error::{DeliveryError, PermanentError, TemporaryError},
    route::RouteSelector,
};

/// Outcome of a STARTTLS attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsOutcome {
    Secured,
    RetryWithoutTls,
}

pub struct RemoteTransaction<'a> {
    pub record: &'a QueuedMessage,
    pub raw: &'a [u8],
    /// Name announced in EHLO
    pub me: &'a str,
    pub tls: TlsConfig,
    /// How long to wait for each reply
    pub timeout: Duration,
    pub routes: &'a RouteSelector,
    /// Signs the message when set
    pub keys: Option<&'a dyn DkimKeyStore>,
}

impl RemoteTransaction<'_> {
    #[traced(instrument(level = tracing::Level::INFO, skip(self), fields(id = %self.record.id, host = %self.record.host)), timing(precision = "ms"))]
    pub async fn execute(self) -> Result<Response, DeliveryError> {
        let payload = self.payload().await?;

        let routes = self
            .routes
            .routes(
                &self.record.mail_from,
                &self.record.host,
                self.record.auth_user.as_deref(),
            )
            .await?;

        let (mut client, route) = self.connect(&routes).await?;
        self.hello(&mut client).await?;

        if !self.tls.is_disabled() && client.supports("STARTTLS") {
            match self.negotiate_tls(&mut client).await? {
                TlsOutcome::RetryWithoutTls => {
                    internal!(
                        level = INFO,
                        "Reconnecting to {} without STARTTLS",
                        route.remote_host
                    );
                    drop(client);

                    let (plain, _) = self.connect(std::slice::from_ref(&route)).await?;
                    client = plain;
                    self.hello(&mut client).await?;
                }
                TlsOutcome::Secured => {}
            }
        }

        if let Some((login, password)) = route.credentials() {
            let response = client.auth(login, password).await?;
            if !response.is_success() {
                return Err(PermanentError::AuthenticationFailed(format!(
                    "{} {}",
                    response.code,
                    response.message()
                ))
                .into());
            }
        }

        accepted(client.mail(&self.record.mail_from).await?)?;
        accepted(client.rcpt(&self.record.rcpt_to).await?)?;
        client.data().await?.expect_code(354)?;

        let response = client.send_data(&payload).await?.expect_code(250)?;

        if let Err(err) = client.quit().await {
            internal!(level = DEBUG, "QUIT failed after delivery: {err}");
        }

        internal!(
            level = INFO,
            "Delivered {} to {} via {}: {}",
            self.record.id,
            self.record.rcpt_to,
            route.remote_host,
            response.message()
        );

        Ok(response)
    }

    /// The message as sent: trace header first, then the signature when
    /// the sender's domain has a key
    async fn payload(&self) -> Result<Vec<u8>, DeliveryError> {
        let mut payload = format!(
            "Received: postern deliverd remote {}; {}\r\n",
            self.record.id,
            Utc::now().to_rfc2822()
        )
        .into_bytes();
        payload.extend_from_slice(self.raw);

        let Some(keys) = self.keys else {
            return Ok(payload);
        };

        let Some((_, domain)) = self.record.mail_from.rsplit_once('@') else {
            return Ok(payload);
        };

        match keys.key_for(domain).await? {
            Some(key) => Ok(dkim::sign(&payload, domain, &key)?),
            None => Ok(payload),
        }
    }

    async fn connect(&self, routes: &[Route]) -> Result<(SmtpClient, Route), DeliveryError> {
        let (stream, route) = self.routes.connect(routes).await?;

        let mut client = SmtpClient::new(stream, route.remote_host.clone())
            .with_accept_invalid_certs(self.tls.accept_invalid_certs)
            .with_timeout(self.timeout);

        let greeting = client.read_greeting().await?;
        if greeting.code != 220 {
            return Err(greeting.into_error().into());
        }

        Ok((client, route))
    }

    async fn hello(&self, client: &mut SmtpClient) -> Result<(), DeliveryError> {
        accepted(client.hello(self.me).await?)?;
        Ok(())
    }

    async fn negotiate_tls(&self, client: &mut SmtpClient) -> Result<TlsOutcome, DeliveryError> {
        let failure = match client.starttls().await {
            Ok(response) if response.code == 220 => {
                self.hello(client).await?;
                internal!(level = DEBUG, "TLS negotiated via STARTTLS");
                return Ok(TlsOutcome::Secured);
            }
            Ok(response) => format!(
                "Server rejected STARTTLS: {} {}",
                response.code,
                response.message()
            ),
            Err(err) => format!("STARTTLS failed: {err}"),
        };

        if self.tls.allows_fallback() {
            internal!(level = INFO, "{failure}, retrying without TLS");
            Ok(TlsOutcome::RetryWithoutTls)
        } else {
            Err(TemporaryError::TlsHandshakeFailed(failure).into())
        }
    }
}

/// Anything other than a 2xx or 3xx is an error: 4xx temporary, 5xx permanent
fn accepted(response: Response) -> Result<Response, DeliveryError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(response.into_error().into())
    }
}
