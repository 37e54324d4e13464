use std::{fs::File, io::BufReader as StdBufReader, net::IpAddr, path::PathBuf, sync::Arc};

use ahash::AHashMap;
use async_trait::async_trait;
use postern_common::{
    Signal, context::Context, dns::StaticResolver, error::SessionError, gate::Gate,
};
use postern_hooks::{Hook, HookError, HookPoint, Outcome, Registry};
use base64::{Engine, engine::general_purpose::STANDARD};
use postern_smtp::{ServerTls, Session, SmtpArgs, SmtpConfig};
use postern_spool::{DirectoryData, MemoryDirectory, QueueStatus, Spool, User};
use pretty_assertions::assert_eq;
use tokio::{
    io::{
        AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, Lines,
        ReadHalf, WriteHalf,
    },
    sync::broadcast,
    task::JoinHandle,
};
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};

const PEER: &str = "192.0.2.10:40000";

struct Client<Stream = DuplexStream> {
    lines: Lines<BufReader<ReadHalf<Stream>>>,
    write: WriteHalf<Stream>,
    session: JoinHandle<Result<(), SessionError>>,
    shutdown: broadcast::Sender<Signal>,
}

impl<Stream: AsyncRead + AsyncWrite> Client<Stream> {
    async fn send(&mut self, line: &str) {
        self.write
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    async fn reply(&mut self) -> String {
        self.lines.next_line().await.unwrap().unwrap()
    }

    async fn command(&mut self, line: &str) -> String {
        self.send(line).await;
        self.reply().await
    }

    /// Reads every line of a multi-line reply
    async fn replies(&mut self) -> Vec<String> {
        let mut replies = Vec::new();
        loop {
            let line = self.reply().await;
            let last = line.as_bytes().get(3) != Some(&b'-');
            replies.push(line);
            if last {
                return replies;
            }
        }
    }

    /// A TLS peer may drop the connection without a close_notify
    async fn closed(mut self) -> bool {
        !matches!(self.lines.next_line().await, Ok(Some(_)))
    }

    async fn transaction(&mut self, from: &str, to: &str) {
        assert_eq!(self.command(&format!("MAIL FROM:<{from}>")).await, "250 OK");
        assert_eq!(self.command(&format!("RCPT TO:<{to}>")).await, "250 OK");
    }
}

impl Client {
    /// Runs the client side of the handshake over the same stream
    async fn start_tls(self) -> Client<TlsStream<DuplexStream>> {
        let read = self.lines.into_inner().into_inner();
        let stream = read.unsplit(self.write);

        let stream = TlsConnector::from(Arc::new(client_tls()))
            .connect(ServerName::try_from("mx.test").unwrap(), stream)
            .await
            .unwrap();

        let (read, write) = tokio::io::split(stream);
        Client {
            lines: BufReader::new(read).lines(),
            write,
            session: self.session,
            shutdown: self.shutdown,
        }
    }
}

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// Trusts only the CA that signed the `mx.test` fixture certificate
fn client_tls() -> ClientConfig {
    let mut roots = RootCertStore::empty();
    let mut pem = StdBufReader::new(File::open(fixture("ca.pem")).unwrap());
    for cert in rustls_pemfile::certs(&mut pem) {
        roots.add(cert.unwrap()).unwrap();
    }

    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

fn directory() -> MemoryDirectory {
    MemoryDirectory::new(
        DirectoryData::default()
            .with_rcpt_host("local.test", true)
            .with_mailbox("bob@local.test"),
    )
}

fn args() -> SmtpArgs {
    SmtpArgs::builder()
        .with_config(SmtpConfig::default().with_system_name("mx.test"))
        .with_directory(Arc::new(directory()))
        .with_resolver(Arc::new(StaticResolver::new().with_host(
            "sender.test",
            vec!["198.51.100.7".parse::<IpAddr>().unwrap()],
        )))
}

async fn connect(args: SmtpArgs) -> Client {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let session = Session::create(server, PEER.parse().unwrap(), AHashMap::default(), args);

    let (shutdown, signal) = broadcast::channel(1);
    let session = tokio::spawn(session.run(signal));

    let (read, write) = tokio::io::split(client);
    Client {
        lines: BufReader::new(read).lines(),
        write,
        session,
        shutdown,
    }
}

async fn greeted(args: SmtpArgs) -> Client {
    let mut client = connect(args).await;
    assert!(client.reply().await.starts_with("220 mx.test ESMTP "));
    client
}

#[tokio::test]
async fn greeting_and_ehlo() {
    let mut client = connect(args()).await;

    let greeting = client.reply().await;
    assert!(greeting.starts_with("220 mx.test ESMTP "));
    assert!(greeting.contains(" - postern "));

    client.send("EHLO client.test").await;
    assert_eq!(client.replies().await, vec!["250-mx.test", "250 SIZE 0"]);

    assert_eq!(
        client.command("HELO client.test").await,
        "503 bad sequence, EHLO|HELO already recieved"
    );
}

#[tokio::test]
async fn hidden_signature_and_starttls_advertised() {
    let config = SmtpConfig::default()
        .with_system_name("mx.test")
        .with_hide_server_signature(true)
        .with_max_databytes(1000)
        .with_tls(Some(postern_smtp::ServerTls::new("cert.pem", "key.pem")));
    let mut client = connect(args().with_config(config)).await;

    let greeting = client.reply().await;
    assert!(!greeting.contains("postern"));

    client.send("EHLO client.test").await;
    assert_eq!(
        client.replies().await,
        vec!["250-mx.test", "250-SIZE 1000", "250 STARTTLS"]
    );
}

#[tokio::test]
async fn mail_before_hello() {
    let mandatory = SmtpConfig::default()
        .with_system_name("mx.test")
        .with_helo_mandatory(true);
    let mut client = greeted(args().with_config(mandatory)).await;
    assert_eq!(
        client.command("MAIL FROM:<alice@sender.test>").await,
        "503 5.5.2 Send hello first"
    );

    let mut client = greeted(args()).await;
    assert_eq!(client.command("MAIL FROM:<alice@sender.test>").await, "250 OK");
}

#[tokio::test]
async fn mail_from_validation() {
    let mut client = greeted(args()).await;
    client.command("EHLO client.test").await;
    client.replies().await;

    assert_eq!(
        client.command("MAIL TO:<alice@sender.test>").await,
        "501 5.5.4 Syntax: MAIL FROM:<address> [SIZE]"
    );
    assert_eq!(
        client.command("MAIL FROM:<alice@sender.test> BODY=8BITMIME").await,
        "501 5.5.4 Invalid arguments"
    );
    assert_eq!(
        client.command("MAIL FROM:<alice>").await,
        "501 5.1.7 Invalid address"
    );
    assert_eq!(
        client.command("MAIL FROM:<alice@nowhere.test>").await,
        "550 5.5.2 need fully-qualified hostname for domain part"
    );
    assert_eq!(
        client.command("MAIL FROM:<a<b>,c@sender.test>").await,
        "501 5.1.7 Invalid address"
    );
    assert_eq!(
        client.command(r#"MAIL FROM:<(x)"@sender.test>"#).await,
        "501 5.1.7 Invalid address"
    );
    assert_eq!(client.command("MAIL FROM:<>").await, "250 OK");
    assert_eq!(
        client.command("MAIL FROM: <alice@[192.0.2.1]> SIZE=100").await,
        "250 OK"
    );
}

#[tokio::test]
async fn declared_size_over_the_limit() {
    let config = SmtpConfig::default()
        .with_system_name("mx.test")
        .with_max_databytes(100);
    let mut client = greeted(args().with_config(config)).await;

    assert_eq!(
        client.command("MAIL FROM:<alice@sender.test> SIZE=101").await,
        "552 message exceeds fixed maximum message size"
    );
}

#[tokio::test]
async fn relay_denied() {
    let mut client = greeted(args()).await;
    client.command("HELO client.test").await;

    assert_eq!(client.command("MAIL FROM:<alice@sender.test>").await, "250 OK");
    assert_eq!(
        client.command("RCPT TO:<carol@remote.test>").await,
        "554 5.7.1 Relay access denied"
    );
    assert_eq!(
        client.command("DATA").await,
        "503 5.5.1 command out of sequence"
    );
}

#[tokio::test]
async fn relay_ip_allowed() {
    let directory = MemoryDirectory::new(
        DirectoryData::default().with_relay_ip("192.0.2.10".parse().unwrap()),
    );
    let mut client = greeted(args().with_directory(Arc::new(directory))).await;

    client.transaction("alice@sender.test", "carol@remote.test").await;
}

#[tokio::test]
async fn unknown_mailbox() {
    let config = SmtpConfig::default()
        .with_system_name("mx.test")
        .with_max_bad_rcpt(1);
    let mut client = greeted(args().with_config(config)).await;

    assert_eq!(client.command("MAIL FROM:<alice@sender.test>").await, "250 OK");
    assert_eq!(
        client.command("RCPT TO:<nobody@local.test>").await,
        "550 5.5.1 Sorry, no mailbox here by that name"
    );
    assert_eq!(
        client.command("DATA").await,
        "503 5.5.1 command out of sequence"
    );

    assert_eq!(
        client.command("RCPT TO:<nobody@local.test>").await,
        "550 5.5.1 Sorry, no mailbox here by that name"
    );
    assert!(client.closed().await);
}

#[tokio::test]
async fn rcpt_syntax_and_sequence() {
    let mut client = greeted(args()).await;

    assert_eq!(
        client.command("RCPT TO:<bob@local.test>").await,
        "503 5.5.1 bad sequence"
    );

    client.command("MAIL FROM:<alice@sender.test>").await;
    assert_eq!(
        client.command("RCPT <bob@local.test>").await,
        "501 5.5.4 syntax: RCPT TO:<address>"
    );
    assert_eq!(
        client.command("RCPT TO:<bob>").await,
        "501 5.5.4 Bad email format"
    );
    assert_eq!(
        client.command(r#"RCPT TO:<b"ob@local..test>"#).await,
        "501 5.5.4 Bad email format"
    );
    assert_eq!(
        client.command("RCPT TO:<bob@local.test.>").await,
        "501 5.5.4 Bad email format"
    );
    // Source routes are dropped and the domain compared case-insensitively
    assert_eq!(
        client.command("RCPT TO:<@relay.test:bob@LOCAL.TEST>").await,
        "250 OK"
    );
}

#[tokio::test]
async fn max_rcpt() {
    let config = SmtpConfig::default()
        .with_system_name("mx.test")
        .with_max_rcpt(1);
    let mut client = greeted(args().with_config(config)).await;

    client.transaction("alice@sender.test", "bob@local.test").await;
    assert_eq!(
        client.command("RCPT TO:<bob@local.test>").await,
        "451 4.5.3 max RCPT To commands reached for this sessions"
    );
}

#[tokio::test]
async fn local_delivery_is_queued() {
    let spool = Spool::memory();
    let mut client = greeted(args().with_spool(spool.clone())).await;

    client.command("HELO client.test").await;
    client.transaction("alice@sender.test", "bob@local.test").await;
    // Duplicates are accepted but stored once
    assert_eq!(client.command("RCPT TO:<bob@Local.Test>").await, "250 OK");

    assert_eq!(
        client.command("DATA").await,
        "354 End data with <CR><LF>.<CR><LF>"
    );
    client.send("Subject: hello").await;
    client.send("").await;
    client.send("..leading dot").await;
    let queued = client.command(".").await;
    assert!(queued.starts_with("250 2.0.0 OK: message queued "), "{queued}");

    assert_eq!(client.command("QUIT").await, "221 2.0.0 Bye");
    assert!(client.closed().await);

    let records = spool.queue.list().await.unwrap();
    assert_eq!(records.len(), 1);

    let record = &records[0];
    assert_eq!(record.status, QueueStatus::Ready);
    assert_eq!(record.rcpt_to, "bob@local.test");
    assert_eq!(record.host, "local.test");
    assert_eq!(record.mail_from, "alice@sender.test");
    assert!(queued.ends_with(&record.envelope_id.to_string()));

    let raw = String::from_utf8(spool.blobs.get(&record.key).await.unwrap().to_vec()).unwrap();
    assert!(raw.starts_with(
        "X-Env-From: alice@sender.test\r\nReceived: from unknown ([192.0.2.10] helo=[client.test])\r\n"
    ));
    assert!(raw.contains("        by mx.test with SMTP\r\n"));
    assert!(raw.contains("        for bob@local.test; "));
    assert!(raw.contains("Message-ID: <"));
    assert!(raw.contains("@sender.test>\r\n"));
    assert!(raw.ends_with("Subject: hello\r\n\r\n.leading dot\r\n"));
}

#[tokio::test]
async fn oversized_headers_close_the_session() {
    let spool = Spool::memory();
    let mut client = greeted(args().with_spool(spool.clone())).await;
    client.transaction("alice@sender.test", "bob@local.test").await;
    client.command("DATA").await;

    // 66 lines of 1000 bytes each
    let filler = format!("X-Filler: {}", "a".repeat(988));
    for _ in 0..66 {
        client.send(&filler).await;
    }

    assert_eq!(client.reply().await, "500 headers in this message are too long");
    assert!(client.closed().await);
    assert!(spool.queue.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn looping_message() {
    let spool = Spool::memory();
    let mut client = greeted(args().with_spool(spool.clone())).await;
    client.transaction("alice@sender.test", "bob@local.test").await;
    client.command("DATA").await;

    for hop in 0..11 {
        client.send(&format!("Received: from hop{hop}.test")).await;
    }
    client.send("").await;

    assert_eq!(
        client.reply().await,
        "554 5.4.6 too many hops, this message is looping"
    );
    assert!(client.closed().await);
    assert!(spool.queue.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn message_over_databytes() {
    let config = SmtpConfig::default()
        .with_system_name("mx.test")
        .with_max_databytes(64);
    let mut client = greeted(args().with_config(config)).await;
    client.transaction("alice@sender.test", "bob@local.test").await;
    client.command("DATA").await;

    client.send("Subject: big").await;
    client.send("").await;
    client.send(&"b".repeat(100)).await;

    assert_eq!(
        client.reply().await,
        "552 5.3.4 sorry, that message size exceeds my databytes limit"
    );
    assert!(client.closed().await);
}

#[tokio::test]
async fn line_handling() {
    let mut client = greeted(args()).await;

    client.write.write_all(b"NOOP\n").await.unwrap();
    assert_eq!(
        client.reply().await,
        "500 SMTP line malformed, not ending with <CR><LF>"
    );

    assert_eq!(client.command("NOOP").await, "250 2.0.0 OK");
    assert_eq!(client.command("rset").await, "250 2.0.0 OK");
    assert_eq!(client.command("EXPN staff").await, "252 Cannot EXPN");
    assert_eq!(client.command("HELP").await, "502 5.5.1 unimplemented");
    assert_eq!(
        client.command("AUTH PLAIN").await,
        "530 5.7.0 Must issue a STARTTLS command first"
    );

    client.send(&"a".repeat(600)).await;
    assert_eq!(client.reply().await, "500 SMTP line too long");
    assert!(client.closed().await);
}

#[tokio::test]
async fn verify() {
    let directory = MemoryDirectory::new(
        DirectoryData::default()
            .with_rcpt_host("local.test", true)
            .with_rcpt_host("relay.test", false)
            .with_mailbox("bob@local.test"),
    );
    let config = SmtpConfig::default()
        .with_system_name("mx.test")
        .with_max_vrfy(4);
    let mut client = greeted(args().with_config(config).with_directory(Arc::new(directory))).await;

    assert_eq!(client.command("VRFY bob@local.test").await, "250 bob@local.test");
    assert_eq!(client.command("VRFY carol@relay.test").await, "252 carol@relay.test");
    assert_eq!(
        client.command("VRFY eve@local.test").await,
        "551 5.5.1 eve@local.test no mailbox here by that name"
    );
    assert_eq!(
        client.command("VRFY a b").await,
        "551 5.5.4 syntax: VRFY <address>"
    );
    assert_eq!(
        client.command("VRFY bob@local.test").await,
        "551 5.5.3 too many VRFY commands for this sessions"
    );
}

#[tokio::test]
async fn connection_ceiling() {
    let sessions = Gate::new();
    let _held = sessions.enter(0);

    let config = SmtpConfig::default()
        .with_system_name("mx.test")
        .with_concurrency_incoming(1);
    let mut client = connect(args().with_config(config).with_sessions(sessions.clone())).await;

    let refusal = client.reply().await;
    assert!(refusal.starts_with(
        "421 sorry, the maximum number of connections has been reached, try again later "
    ));

    let session = client.session;
    assert!(session.await.unwrap().is_ok());
    assert_eq!(sessions.current(), 1);
}

#[tokio::test]
async fn shutdown_is_announced() {
    let mut client = greeted(args()).await;
    assert_eq!(client.command("NOOP").await, "250 2.0.0 OK");

    client.shutdown.send(Signal::Shutdown).unwrap();
    assert_eq!(client.reply().await, "421 Server shutting down");

    let session = client.session;
    assert!(session.await.unwrap().is_ok());
}

/// Grants relaying for one domain and ends the session on QUIT
#[derive(Debug)]
struct RelayHook;

#[async_trait]
impl Hook for RelayHook {
    fn name(&self) -> &str {
        "relay"
    }

    fn points(&self) -> &[HookPoint] {
        &[HookPoint::RcptTo, HookPoint::Connect]
    }

    async fn call(&self, point: HookPoint, ctx: &mut Context) -> Result<Outcome, HookError> {
        match point {
            HookPoint::Connect => {
                ctx.reply("220 custom banner");
                Ok(Outcome::done())
            }
            _ => {
                if ctx
                    .recipient
                    .as_ref()
                    .is_some_and(|rcpt| rcpt.domain == "partner.test")
                {
                    ctx.relay = Some(true);
                }
                Ok(Outcome::proceed())
            }
        }
    }
}

#[tokio::test]
async fn hooks_replace_greeting_and_grant_relay() {
    let hooks = Registry::new(vec![Arc::new(RelayHook)]);
    let mut client = connect(args().with_hooks(hooks)).await;

    assert_eq!(client.reply().await, "220 custom banner");
    client.transaction("alice@sender.test", "dave@partner.test").await;
    assert_eq!(
        client.command("RCPT TO:<erin@elsewhere.test>").await,
        "554 5.7.1 Relay access denied"
    );
}

/// Accepts every recipient of `taken.test` itself
#[derive(Debug)]
struct TakeoverHook;

#[async_trait]
impl Hook for TakeoverHook {
    fn name(&self) -> &str {
        "takeover"
    }

    fn points(&self) -> &[HookPoint] {
        &[HookPoint::RcptTo]
    }

    async fn call(&self, _: HookPoint, ctx: &mut Context) -> Result<Outcome, HookError> {
        match ctx.recipient.clone() {
            Some(rcpt) if rcpt.domain == "taken.test" => {
                ctx.envelope.add_recipient(rcpt);
                ctx.reply("250 taken by hook");
                Ok(Outcome::done())
            }
            Some(_) => {
                ctx.reply("450 try later");
                Ok(Outcome::done())
            }
            None => Ok(Outcome::proceed()),
        }
    }
}

#[tokio::test]
async fn recipients_added_by_a_hook_open_data() {
    let hooks = Registry::new(vec![Arc::new(TakeoverHook)]);
    let mut client = greeted(args().with_hooks(hooks)).await;

    assert_eq!(client.command("MAIL FROM:<alice@sender.test>").await, "250 OK");
    assert_eq!(client.command("RCPT TO:<carol@other.test>").await, "450 try later");
    assert_eq!(
        client.command("DATA").await,
        "503 5.5.1 command out of sequence"
    );

    assert_eq!(
        client.command("RCPT TO:<carol@taken.test>").await,
        "250 taken by hook"
    );
    assert!(client.command("DATA").await.starts_with("354 "));
}

fn secured_args(directory: DirectoryData) -> SmtpArgs {
    let config = SmtpConfig::default()
        .with_system_name("mx.test")
        .with_helo_mandatory(true)
        .with_tls(Some(ServerTls::new(
            fixture("server.pem"),
            fixture("server.key"),
        )));

    args()
        .with_config(config)
        .with_directory(Arc::new(MemoryDirectory::new(directory)))
}

fn user(login: &str, password: &str, auth_relay: bool) -> User {
    User {
        login: login.to_string(),
        password_hash: pwhash::bcrypt::hash(password).unwrap(),
        active: true,
        auth_relay,
    }
}

fn users() -> DirectoryData {
    DirectoryData::default()
        .with_rcpt_host("local.test", true)
        .with_mailbox("bob@local.test")
        .with_user(user("alice", "secret", true))
        .with_user(user("bob", "hunter2", false))
}

/// Greets, upgrades and greets again over TLS
async fn secured(directory: DirectoryData) -> Client<TlsStream<DuplexStream>> {
    let mut client = greeted(secured_args(directory)).await;
    client.send("EHLO client.test").await;
    client.replies().await;
    assert_eq!(client.command("STARTTLS").await, "220 Ready to start TLS nego");

    let mut client = client.start_tls().await;
    client.send("EHLO client.test").await;
    client.replies().await;
    client
}

fn plain_credentials(login: &str, password: &str) -> String {
    STANDARD.encode(format!("\0{login}\0{password}"))
}

#[tokio::test]
async fn starttls_starts_the_session_over() {
    let mut client = greeted(secured_args(users())).await;
    client.send("EHLO client.test").await;
    assert_eq!(
        client.replies().await,
        vec!["250-mx.test", "250-SIZE 0", "250 STARTTLS"]
    );
    assert_eq!(client.command("STARTTLS").await, "220 Ready to start TLS nego");

    let mut client = client.start_tls().await;
    assert_eq!(
        client.command("MAIL FROM:<alice@sender.test>").await,
        "503 5.5.2 Send hello first"
    );

    client.send("EHLO client.test").await;
    assert_eq!(
        client.replies().await,
        vec!["250-mx.test", "250-SIZE 0", "250 AUTH LOGIN PLAIN"]
    );
    assert_eq!(
        client.command("STARTTLS").await,
        "454 transaction is already over SSL/TLS"
    );
    client.transaction("alice@sender.test", "bob@local.test").await;
}

#[tokio::test]
async fn failed_handshake_keeps_the_plain_session() {
    let mut client = greeted(secured_args(users())).await;
    client.send("EHLO client.test").await;
    client.replies().await;
    assert_eq!(client.command("STARTTLS").await, "220 Ready to start TLS nego");

    client.send("this is not a client hello").await;
    // A TLS alert may precede the reply on the wire
    let reply = loop {
        let line = client.reply().await;
        if line.contains("454") {
            break line;
        }
    };
    assert!(reply.ends_with("454 TLS handshake failed"), "unexpected reply {reply}");

    assert_eq!(client.command("NOOP").await, "250 2.0.0 OK");
    client.transaction("alice@sender.test", "bob@local.test").await;
}

#[tokio::test]
async fn auth_plain_grants_relay() {
    let mut client = secured(users()).await;

    assert_eq!(
        client
            .command(&format!("AUTH PLAIN {}", plain_credentials("alice", "secret")))
            .await,
        "235 2.0.0 ok, go ahead"
    );
    client.transaction("alice@sender.test", "carol@remote.test").await;
}

#[tokio::test]
async fn auth_login_without_relay_rights() {
    let mut client = secured(users()).await;

    assert_eq!(client.command("AUTH LOGIN").await, "334 VXNlcm5hbWU6");
    assert_eq!(
        client.command(&STANDARD.encode("bob")).await,
        "334 UGFzc3dvcmQ6"
    );
    assert_eq!(
        client.command(&STANDARD.encode("hunter2")).await,
        "235 2.0.0 ok, go ahead"
    );

    assert_eq!(client.command("MAIL FROM:<bob@sender.test>").await, "250 OK");
    assert_eq!(
        client.command("RCPT TO:<carol@remote.test>").await,
        "554 5.7.1 Relay access denied"
    );
    assert_eq!(client.command("RCPT TO:<bob@local.test>").await, "250 OK");
}

#[tokio::test]
async fn wrong_password_ends_the_session() {
    let mut client = secured(users()).await;

    assert_eq!(
        client
            .command(&format!("AUTH PLAIN {}", plain_credentials("alice", "guess")))
            .await,
        "535 5.7.1 authentication failed"
    );
    assert!(client.closed().await);
}

#[tokio::test]
async fn unknown_user_ends_the_session() {
    let mut client = secured(users()).await;

    assert_eq!(
        client
            .command(&format!("AUTH PLAIN {}", plain_credentials("mallory", "secret")))
            .await,
        "535 5.7.1 authentication failed"
    );
    assert!(client.closed().await);
}
