use postern_common::{address::parse_ip_literal, error::SessionError, internal, status::Status};
use postern_hooks::HookPoint;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Flow, Session};
use crate::command::{Command, Verb};

const NEED_FQN: &str = "5.5.2 helo command rejected, need fully-qualified hostname or address";

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub(super) async fn hello(&mut self, command: &Command) -> Result<Flow, SessionError> {
        let next = match self.state.next(command.verb, self.helo_seen) {
            Ok(next) => next,
            Err(rejection) => {
                internal!(level = DEBUG, "HELO/EHLO already received");
                Self::pause().await;
                self.send(&rejection).await?;
                return Ok(Flow::Continue);
            }
        };

        self.context.extended = command.verb == Verb::Ehlo;
        self.context.helo = (!command.args.is_empty()).then(|| command.args.join(" "));

        let outcome = self.hook(HookPoint::Helo).await?;
        if outcome.drop {
            internal!(level = DEBUG, "Hook terminated the session on HELO");
            return Ok(Flow::Close);
        }

        if !outcome.done && self.config.helo_need_fqn && !self.qualified_hello(command).await? {
            self.context.helo = None;
            return Ok(Flow::Continue);
        }

        self.helo_seen = true;
        self.state = next;

        if command.verb == Verb::Helo {
            let system = self.config.system_name.clone();
            self.reply(Status::Ok, &system).await?;
            return Ok(Flow::Continue);
        }

        let mut lines = vec![
            self.config.system_name.clone(),
            format!("SIZE {}", self.config.max_databytes),
        ];
        if self.context.is_secure() {
            lines.push(String::from("AUTH LOGIN PLAIN"));
        } else if self.config.tls.is_some() {
            lines.push(String::from("STARTTLS"));
        }

        let last = lines.len() - 1;
        for (idx, line) in lines.iter().enumerate() {
            let separator = if idx == last { ' ' } else { '-' };
            self.send(&format!("{}{separator}{line}", Status::Ok)).await?;
        }

        Ok(Flow::Continue)
    }

    /// Checks the greeting names an address or a resolvable host, replying
    /// when it does not
    async fn qualified_hello(&mut self, command: &Command) -> Result<bool, SessionError> {
        let Some(name) = command.args.first() else {
            internal!(level = DEBUG, "HELO rejected, no hostname given");
            Self::pause().await;
            self.reply(Status::ParameterNotImplemented, NEED_FQN).await?;
            return Ok(false);
        };

        if parse_ip_literal(name).is_some() {
            return Ok(true);
        }

        match self.services.resolver.resolves(name).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                internal!(level = DEBUG, "HELO rejected, {name} is not fully qualified");
                Self::pause().await;
                self.reply(Status::ParameterNotImplemented, NEED_FQN).await?;
                Ok(false)
            }
            Err(err) => {
                internal!(level = WARN, "Unable to resolve HELO host {name}: {err}");
                let line = format!("unable to resolve {name}. Need fqdn or address in helo command");
                self.reply(Status::Unknown(404), &line).await?;
                Ok(false)
            }
        }
    }
}
