use postern_common::{error::SessionError, internal, status::Status};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Flow, Session};
use crate::{connection::load_acceptor, state::State};

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub(super) async fn start_tls(&mut self) -> Result<Flow, SessionError> {
        if self.context.is_secure() {
            self.reply(
                Status::InsufficientStorage,
                "transaction is already over SSL/TLS",
            )
            .await?;
            return Ok(Flow::Continue);
        }

        if self.hello_missing().await? {
            return Ok(Flow::Continue);
        }

        let acceptor = match load_acceptor(self.config.tls.as_ref()) {
            Ok(acceptor) => acceptor,
            Err(err) => {
                internal!(level = ERROR, "Unable to load server keys: {err}");
                self.reply(
                    Status::InsufficientStorage,
                    "TLS failed unable to load server keys",
                )
                .await?;
                return Ok(Flow::Continue);
            }
        };

        self.reply(Status::ServiceReady, "Ready to start TLS nego")
            .await?;

        match self.connection.upgrade(&acceptor).await {
            Ok(info) => {
                internal!(level = DEBUG, "Secured via {} {}", info.protocol, info.cipher);
                self.context.tls = Some(info);
                self.context.helo = None;
                self.context.reset_transaction();
                self.helo_seen = false;
                self.state = State::Greeted;
                Ok(Flow::Continue)
            }
            Err(err) => {
                internal!(level = WARN, "TLS handshake failed: {err}");
                if self.connection.is_closed() {
                    return Ok(Flow::Close);
                }

                self.reply(Status::InsufficientStorage, "TLS handshake failed")
                    .await?;
                Ok(Flow::Continue)
            }
        }
    }
}
