//! Mock SMTP server for delivery tests
//!
//! The server answers every command with a configurable reply and records
//! what it received, including the unstuffed message content.
#![allow(dead_code)] // Not every test uses every knob

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    task::JoinHandle,
};

/// SMTP command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    StartTls,
    /// The whole AUTH line
    Auth(String),
    /// The reverse path, without brackets
    MailFrom(String),
    /// The forward path, without brackets
    RcptTo(String),
    Data,
    /// Message content after DATA, unstuffed and without the final dot
    MessageContent(Vec<u8>),
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl SmtpResponse {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Debug, Clone)]
struct MockServerConfig {
    greeting: SmtpResponse,
    ehlo_code: u16,
    capabilities: Vec<String>,
    helo_response: SmtpResponse,
    starttls_response: SmtpResponse,
    auth_response: SmtpResponse,
    mail_from_response: SmtpResponse,
    rcpt_to_response: SmtpResponse,
    data_response: SmtpResponse,
    data_end_response: SmtpResponse,
    quit_response: SmtpResponse,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            greeting: SmtpResponse::new(220, "mock.test ESMTP"),
            ehlo_code: 250,
            capabilities: vec![String::from("SIZE 10000"), String::from("8BITMIME")],
            helo_response: SmtpResponse::new(250, "Hello"),
            starttls_response: SmtpResponse::new(220, "Ready to start TLS"),
            auth_response: SmtpResponse::new(235, "2.7.0 Authentication successful"),
            mail_from_response: SmtpResponse::new(250, "OK"),
            rcpt_to_response: SmtpResponse::new(250, "OK"),
            data_response: SmtpResponse::new(354, "Start mail input; end with <CRLF>.<CRLF>"),
            data_end_response: SmtpResponse::new(250, "OK: Message accepted"),
            quit_response: SmtpResponse::new(221, "Bye"),
        }
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<RwLock<Vec<SmtpCommand>>>,
    connections: Arc<AtomicUsize>,
    accept: JoinHandle<()>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::default()
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands.read().await.clone()
    }

    /// The content of the first message received
    pub async fn message(&self) -> Option<Vec<u8>> {
        self.commands.read().await.iter().find_map(|command| match command {
            SmtpCommand::MessageContent(content) => Some(content.clone()),
            _ => None,
        })
    }

    /// Connections accepted so far
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    async fn handle_client(
        stream: TcpStream,
        config: Arc<MockServerConfig>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> std::io::Result<()> {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        write.write_all(&config.greeting.to_bytes()).await?;

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }

            let text = line.trim_end();
            let upper = text.to_ascii_uppercase();

            let (command, reply) = if let Some(domain) = upper.strip_prefix("EHLO ") {
                let mut reply = Vec::new();
                let lines = std::iter::once(String::from("mock.test"))
                    .chain(config.capabilities.iter().cloned())
                    .collect::<Vec<_>>();
                for (index, capability) in lines.iter().enumerate() {
                    let separator = if index + 1 == lines.len() { ' ' } else { '-' };
                    reply.extend_from_slice(
                        format!("{}{separator}{capability}\r\n", config.ehlo_code).as_bytes(),
                    );
                }
                (SmtpCommand::Ehlo(domain.to_ascii_lowercase()), reply)
            } else if let Some(domain) = upper.strip_prefix("HELO ") {
                (
                    SmtpCommand::Helo(domain.to_ascii_lowercase()),
                    config.helo_response.to_bytes(),
                )
            } else if upper == "STARTTLS" {
                commands.write().await.push(SmtpCommand::StartTls);
                write.write_all(&config.starttls_response.to_bytes()).await?;
                if config.starttls_response.code == 220 {
                    // No TLS here, dropping the connection fails the handshake
                    return Ok(());
                }
                continue;
            } else if upper.starts_with("AUTH ") {
                (SmtpCommand::Auth(text.to_string()), config.auth_response.to_bytes())
            } else if upper.starts_with("MAIL FROM:") {
                (
                    SmtpCommand::MailFrom(path(&text["MAIL FROM:".len()..])),
                    config.mail_from_response.to_bytes(),
                )
            } else if upper.starts_with("RCPT TO:") {
                (
                    SmtpCommand::RcptTo(path(&text["RCPT TO:".len()..])),
                    config.rcpt_to_response.to_bytes(),
                )
            } else if upper == "DATA" {
                commands.write().await.push(SmtpCommand::Data);
                write.write_all(&config.data_response.to_bytes()).await?;
                if config.data_response.code != 354 {
                    continue;
                }

                let content = read_content(&mut reader).await?;
                (SmtpCommand::MessageContent(content), config.data_end_response.to_bytes())
            } else if upper == "QUIT" {
                commands.write().await.push(SmtpCommand::Quit);
                write.write_all(&config.quit_response.to_bytes()).await?;
                return Ok(());
            } else {
                (
                    SmtpCommand::Other(text.to_string()),
                    SmtpResponse::new(502, "Command not implemented").to_bytes(),
                )
            };

            commands.write().await.push(command);
            write.write_all(&reply).await?;
        }
    }
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

fn path(value: &str) -> String {
    value
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

async fn read_content<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut content = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(content);
        }

        if line == b".\r\n" {
            return Ok(content);
        }

        let unstuffed = if line.starts_with(b"..") { &line[1..] } else { &line[..] };
        content.extend_from_slice(unstuffed);
    }
}

#[derive(Default)]
pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: &str) -> Self {
        self.config.greeting = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_ehlo_response(mut self, code: u16) -> Self {
        self.config.ehlo_code = code;
        self
    }

    /// Adds a keyword to the EHLO reply
    #[must_use]
    pub fn with_capability(mut self, capability: &str) -> Self {
        self.config.capabilities.push(capability.to_string());
        self
    }

    #[must_use]
    pub fn with_starttls_response(mut self, code: u16, message: &str) -> Self {
        self.config.starttls_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_auth_response(mut self, code: u16, message: &str) -> Self {
        self.config.auth_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: &str) -> Self {
        self.config.mail_from_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: &str) -> Self {
        self.config.rcpt_to_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, message: &str) -> Self {
        self.config.data_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: &str) -> Self {
        self.config.data_end_response = SmtpResponse::new(code, message);
        self
    }

    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let accept = {
            let commands = Arc::clone(&commands);
            let connections = Arc::clone(&connections);

            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::Relaxed);
                    let config = Arc::clone(&config);
                    let commands = Arc::clone(&commands);

                    tokio::spawn(async move {
                        if let Err(err) =
                            MockSmtpServer::handle_client(stream, config, commands).await
                        {
                            eprintln!("Mock server client error: {err}");
                        }
                    });
                }
            })
        };

        Ok(MockSmtpServer {
            addr,
            commands,
            connections,
            accept,
        })
    }
}
