use base64::{Engine, engine::general_purpose::STANDARD};
use postern_common::{error::SessionError, internal, status::Status};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Flow, Session};
use crate::{command::Command, connection::Line};

/// RFC 4954 4
const AUTH_LINE_LIMIT: usize = 12288;

const USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
const PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

/// The outcome of a client response to a `334` prompt
enum Answer {
    Decoded(Vec<u8>),
    Malformed,
    Closed,
}

/// The credentials carried by an `AUTH` exchange
enum Credentials {
    Given(String, String),
    Malformed,
    Closed,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub(super) async fn auth(&mut self, command: &Command) -> Result<Flow, SessionError> {
        if !self.context.is_secure() {
            self.reply(
                Status::AuthRequired,
                "5.7.0 Must issue a STARTTLS command first",
            )
            .await?;
            return Ok(Flow::Continue);
        }

        let Some(mechanism) = command.args.first() else {
            self.reply(Status::ParametersNotRecognised, "5.5.2 Syntax error")
                .await?;
            return Ok(Flow::Continue);
        };

        let credentials = match mechanism.to_ascii_uppercase().as_str() {
            "PLAIN" => self.plain(command.args.get(1).map(String::as_str)).await?,
            "LOGIN" => self.login().await?,
            _ => {
                internal!(level = DEBUG, "Unsupported AUTH mechanism {mechanism}");
                self.reply(
                    Status::ParameterNotImplemented,
                    "5.7.4 unrecognized authentication type",
                )
                .await?;
                return Ok(Flow::Continue);
            }
        };

        let (login, password) = match credentials {
            Credentials::Given(login, password) => (login, password),
            Credentials::Malformed => {
                self.reply(Status::InvalidArguments, "5.5.4 malformed auth input")
                    .await?;
                return Ok(Flow::Continue);
            }
            Credentials::Closed => return Ok(Flow::Close),
        };

        self.authenticate(login, password).await
    }

    async fn authenticate(&mut self, login: String, password: String) -> Result<Flow, SessionError> {
        let user = match self.services.directory.user(&login).await {
            Ok(user) => Some(user),
            Err(err) if err.is_not_found() => None,
            Err(err) => {
                internal!(level = ERROR, "Unable to load user {login}: {err}");
                self.reply(
                    Status::InsufficientStorage,
                    "4.3.0 oops, problem with auth",
                )
                .await?;
                return Ok(Flow::Close);
            }
        };

        let user = user.filter(|user| {
            user.active && pwhash::bcrypt::verify(password.as_str(), &user.password_hash)
        });

        let Some(user) = user else {
            internal!(level = INFO, "Authentication failed for {login} from {}", self.context.peer);
            self.reply(Status::AuthFailed, "5.7.1 authentication failed")
                .await?;
            self.services
                .hooks
                .dispatch_auth(&login, &password, false, &mut self.context)
                .await;
            self.flush_replies().await?;
            return Ok(Flow::Close);
        };

        internal!(level = INFO, "Authenticated as {login}");
        self.auth_relay = user.auth_relay;
        self.context.auth_user = Some(login.clone());
        self.reply(Status::AuthSucceeded, "2.0.0 ok, go ahead").await?;

        let outcome = self
            .services
            .hooks
            .dispatch_auth(&login, &password, true, &mut self.context)
            .await;
        self.flush_replies().await?;

        Ok(if outcome.drop {
            Flow::Close
        } else {
            Flow::Continue
        })
    }

    /// `AUTH PLAIN`, with the response inline or after an empty prompt
    async fn plain(&mut self, inline: Option<&str>) -> Result<Credentials, SessionError> {
        let answer = match inline {
            Some(inline) => decode(inline.as_bytes()),
            None => self.challenge("").await?,
        };

        let decoded = match answer {
            Answer::Decoded(decoded) => decoded,
            Answer::Malformed => return Ok(Credentials::Malformed),
            Answer::Closed => return Ok(Credentials::Closed),
        };

        // authorization identity, authentication identity, password
        let mut parts = decoded.split(|&byte| byte == 0);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(login), Some(password), None) if !login.is_empty() => {
                Ok(Credentials::Given(
                    String::from_utf8_lossy(login).into_owned(),
                    String::from_utf8_lossy(password).into_owned(),
                ))
            }
            _ => Ok(Credentials::Malformed),
        }
    }

    /// `AUTH LOGIN`, prompting for each credential in turn
    async fn login(&mut self) -> Result<Credentials, SessionError> {
        let mut credentials = Vec::with_capacity(2);

        for prompt in [USERNAME_PROMPT, PASSWORD_PROMPT] {
            match self.challenge(prompt).await? {
                Answer::Decoded(decoded) => {
                    credentials.push(String::from_utf8_lossy(&decoded).into_owned());
                }
                Answer::Malformed => return Ok(Credentials::Malformed),
                Answer::Closed => return Ok(Credentials::Closed),
            }
        }

        let password = credentials.pop().unwrap_or_default();
        let login = credentials.pop().unwrap_or_default();
        Ok(Credentials::Given(login, password))
    }

    async fn challenge(&mut self, prompt: &str) -> Result<Answer, SessionError> {
        self.reply(Status::AuthContinue, prompt).await?;

        match self.read_line(AUTH_LINE_LIMIT).await? {
            Line::Complete(line) => Ok(decode(&line)),
            Line::TooLong => {
                self.reply(Status::LineTooLong, "SMTP line too long").await?;
                Ok(Answer::Closed)
            }
            Line::Eof => Ok(Answer::Closed),
        }
    }
}

fn decode(line: &[u8]) -> Answer {
    STANDARD
        .decode(line.trim_ascii())
        .map_or(Answer::Malformed, Answer::Decoded)
}
