//! SMTP client used by delivery to hand messages to remote servers.
//!
//! A conversation follows the usual order:
//!
//! ```no_run
//! use postern_smtp::client::SmtpClient;
//!
//! # async fn example() -> Result<(), postern_smtp::client::ClientError> {
//! let stream = tokio::net::TcpStream::connect("mx.example.org:25").await?;
//! let mut client = SmtpClient::new(stream, "mx.example.org");
//!
//! client.read_greeting().await?.expect_code(220)?;
//! client.hello("relay.example.com").await?;
//! client.mail("sender@example.com").await?.expect_code(250)?;
//! client.rcpt("rcpt@example.org").await?.expect_code(250)?;
//! client.data().await?.expect_code(354)?;
//! client.send_data(b"Subject: hi\r\n\r\nHello\r\n").await?.expect_code(250)?;
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

#[allow(clippy::module_inception)]
mod client;
mod error;
mod response;

pub use client::SmtpClient;
pub use error::{ClientError, ClientResult};
pub use response::Response;
