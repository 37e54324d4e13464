use std::{fmt::Display, time::Duration};

use postern_common::{error::SessionError, internal, outgoing, status::Status};
use postern_hooks::{HookPoint, Outcome};
use tokio::io::{AsyncRead, AsyncWrite};

use super::Session;
use crate::connection::Line;

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    const fn idle(&self) -> Duration {
        Duration::from_secs(self.config.timeout)
    }

    /// Writes one reply line. The idle timer covers the write.
    pub(super) async fn send<S: Display + Send + Sync>(&mut self, line: &S) -> Result<(), SessionError> {
        outgoing!("{line}");

        match tokio::time::timeout(self.idle(), self.connection.send(line)).await {
            Ok(sent) => sent.map(|_| ()).map_err(SessionError::from),
            Err(_) => Err(SessionError::Timeout(self.config.timeout)),
        }
    }

    pub(super) async fn reply(&mut self, status: Status, message: &str) -> Result<(), SessionError> {
        self.send(&format!("{status} {message}")).await
    }

    /// Reads the next line, answering `420` and failing when the client stays
    /// silent for longer than the idle timeout
    pub(super) async fn read_line(&mut self, limit: usize) -> Result<Line, SessionError> {
        if let Ok(line) = tokio::time::timeout(self.idle(), self.connection.read_line(limit)).await {
            return Ok(line?);
        }

        internal!(level = DEBUG, "Client idle for {}s", self.config.timeout);
        self.reply(Status::Timeout, "Client timeout").await?;
        Err(SessionError::Timeout(self.config.timeout))
    }

    /// Runs the hooks for `point` and sends whatever replies they queued
    pub(super) async fn hook(&mut self, point: HookPoint) -> Result<Outcome, SessionError> {
        let outcome = self.services.hooks.dispatch(point, &mut self.context).await;
        self.flush_replies().await?;
        Ok(outcome)
    }

    pub(super) async fn flush_replies(&mut self) -> Result<(), SessionError> {
        for line in self.context.take_replies() {
            self.send(&line).await?;
        }
        Ok(())
    }
}
