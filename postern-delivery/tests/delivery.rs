mod support;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use postern_common::{
    Signal,
    address::Address,
    config::{TlsConfig, TlsPolicy},
    dns::StaticResolver,
    gate::Gate,
};
use postern_delivery::{
    DeliveryConfig, DeliveryController, DeliveryProcessor, LocalDelivery, LocalDeliveryError,
    Maildir,
};
use postern_spool::{
    BlobStore, DELIVERY_TOPIC, DirectoryData, Job, MemoryBlobStore, MemoryDirectory,
    MemoryQueueStore, MemoryWorkQueue, MessageId, QueueStatus, QueueStore, QueuedMessage, Route,
    Spool, Submission, WorkQueue,
};
use pretty_assertions::assert_eq;
use support::{
    mock_server::{MockSmtpServer, SmtpCommand},
    recording::{RecordingQueue, Settlement},
};
use tokio::sync::broadcast;

const RAW: &[u8] = b"From: alice@sender.test\r\nSubject: hi\r\nMessage-ID: <1@sender.test>\r\n\r\nHello\r\n.leading dot\r\n";

/// Counts attempts and fails each one the same way
#[derive(Debug, Default)]
struct FailingMailbox {
    permanent: bool,
    attempts: AtomicUsize,
}

#[async_trait]
impl LocalDelivery for FailingMailbox {
    async fn deliver(
        &self,
        _id: &MessageId,
        mailbox: &str,
        _raw: &[u8],
    ) -> Result<(), LocalDeliveryError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        if self.permanent {
            Err(LocalDeliveryError::InvalidMailbox(mailbox.to_string()))
        } else {
            Err(std::io::Error::other("disk full").into())
        }
    }
}

#[derive(Debug)]
struct PanickingMailbox;

#[async_trait]
impl LocalDelivery for PanickingMailbox {
    async fn deliver(
        &self,
        _id: &MessageId,
        _mailbox: &str,
        _raw: &[u8],
    ) -> Result<(), LocalDeliveryError> {
        panic!("mailbox exploded");
    }
}

struct Harness {
    controller: DeliveryController,
    spool: Spool,
    work: Arc<RecordingQueue>,
}

impl Harness {
    fn new(config: DeliveryConfig, data: DirectoryData) -> Self {
        let work = RecordingQueue::new(MemoryWorkQueue::new(
            Duration::from_secs(600),
            Duration::from_secs(3600),
        ));
        let spool = Spool::new(
            Arc::new(MemoryQueueStore::new()),
            Arc::new(MemoryBlobStore::new()),
            work.clone(),
        );
        let controller = DeliveryController::new(
            config,
            spool.clone(),
            Arc::new(MemoryDirectory::new(data)),
            Arc::new(StaticResolver::new()),
        );

        Self {
            controller,
            spool,
            work,
        }
    }

    fn with_local(mut self, local: Arc<dyn LocalDelivery>) -> Self {
        self.controller = self.controller.with_local_delivery(local);
        self
    }

    async fn submit(&self, mail_from: &str, rcpt: Address) -> MessageId {
        self.spool
            .submit(Submission {
                mail_from: mail_from.to_string(),
                rcpt_to: vec![rcpt],
                raw: RAW.to_vec(),
                auth_user: None,
            })
            .await
            .unwrap()
    }

    async fn next_job(&self) -> Job {
        tokio::time::timeout(Duration::from_secs(3600), self.work.consume(DELIVERY_TOPIC))
            .await
            .unwrap()
            .unwrap()
    }

    async fn records(&self) -> Vec<QueuedMessage> {
        self.spool.queue.list().await.unwrap()
    }

    /// Consumes and processes the next job
    async fn attempt(&self) -> Job {
        let job = self.next_job().await;
        self.controller.process(job.clone()).await;
        job
    }
}

fn config() -> DeliveryConfig {
    DeliveryConfig::default()
        .with_me("mx.test")
        .with_tls(TlsConfig::new(TlsPolicy::Strict))
}

fn remote() -> Address {
    Address::new("bob", "remote.test")
}

fn routed_to(server: &MockSmtpServer) -> DirectoryData {
    DirectoryData::default().with_route(
        Route::new("remote.test", "127.0.0.1").with_port(server.addr().port()),
    )
}

#[tokio::test]
async fn local_delivery_removes_the_record_once() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(
        config().with_maildir_path(dir.path()),
        DirectoryData::default().with_rcpt_host("local.test", true),
    )
    .with_local(Arc::new(Maildir::new(dir.path(), "mx.test")));

    harness
        .submit("alice@sender.test", Address::new("bob", "local.test"))
        .await;
    let key = harness.records().await[0].key.clone();

    let job = harness.attempt().await;

    assert!(harness.records().await.is_empty());
    assert_eq!(harness.work.settlements(), vec![Settlement::Acked(job.id)]);
    assert!(harness.spool.blobs.get(&key).await.unwrap_err().is_not_found());

    let new = dir.path().join("bob@local.test").join("new");
    let files = std::fs::read_dir(new)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect::<Vec<_>>();
    assert_eq!(files.len(), 1);
    assert_eq!(std::fs::read(&files[0]).unwrap(), RAW);
}

#[tokio::test]
async fn remote_delivery_through_a_route() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let harness = Harness::new(config(), routed_to(&server));

    harness.submit("alice@sender.test", remote()).await;
    let job = harness.attempt().await;

    assert!(harness.records().await.is_empty());
    assert_eq!(harness.work.settlements(), vec![Settlement::Acked(job.id)]);

    let commands = server.commands().await;
    assert_eq!(commands[0], SmtpCommand::Ehlo(String::from("mx.test")));
    assert!(commands.contains(&SmtpCommand::MailFrom(String::from("alice@sender.test"))));
    assert!(commands.contains(&SmtpCommand::RcptTo(String::from("bob@remote.test"))));
    assert_eq!(commands.last(), Some(&SmtpCommand::Quit));

    let message = String::from_utf8(server.message().await.unwrap()).unwrap();
    assert!(message.starts_with("Received: postern deliverd remote "));
    assert!(message.ends_with("\r\nHello\r\n.leading dot\r\n"));
}

#[tokio::test]
async fn rejected_recipient_is_bounced_to_the_sender() {
    let server = MockSmtpServer::builder()
        .with_rcpt_to_response(550, "5.1.1 no such user")
        .build()
        .await
        .unwrap();
    let harness = Harness::new(config(), routed_to(&server));

    harness.submit("alice@sender.test", remote()).await;
    let original = harness.records().await.remove(0);
    let job = harness.attempt().await;

    assert_eq!(harness.work.settlements(), vec![Settlement::Acked(job.id)]);

    let records = harness.records().await;
    assert_eq!(records.len(), 1);
    let bounce = &records[0];
    assert_ne!(bounce.id, original.id);
    assert_eq!(bounce.mail_from, "");
    assert_eq!(bounce.rcpt_to, "alice@sender.test");
    assert_eq!(bounce.host, "sender.test");
    assert_eq!(harness.work.waiting(DELIVERY_TOPIC), 1);

    let raw = harness.spool.blobs.get(&bounce.key).await.unwrap();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.contains("<bob@remote.test>:\r\nPermanent failure: Message rejected: 550 5.1.1 no such user"));
    assert!(text.contains("Subject: hi\r\n"));
}

#[tokio::test]
async fn bounces_are_never_bounced() {
    let server = MockSmtpServer::builder()
        .with_mail_from_response(550, "go away")
        .build()
        .await
        .unwrap();
    let harness = Harness::new(config(), routed_to(&server));

    for return_path in ["", "#@[]"] {
        harness.submit(return_path, remote()).await;
        harness.attempt().await;

        assert!(harness.records().await.is_empty(), "{return_path:?}");
        assert_eq!(harness.work.waiting(DELIVERY_TOPIC), 0);
    }

    assert!(
        harness
            .work
            .settlements()
            .iter()
            .all(|settlement| matches!(settlement, Settlement::Acked(_)))
    );
}

#[tokio::test(start_paused = true)]
async fn temporary_failures_are_deferred_with_a_growing_delay() {
    let mailbox = Arc::new(FailingMailbox::default());
    let harness = Harness::new(
        config(),
        DirectoryData::default().with_rcpt_host("local.test", true),
    )
    .with_local(mailbox.clone());

    harness
        .submit("alice@sender.test", Address::new("bob", "local.test"))
        .await;

    let first = harness.attempt().await;
    let after_first = harness.records().await.remove(0);
    assert_eq!(after_first.status, QueueStatus::Deferred);
    assert_eq!(after_first.delivery_failed_count, 1);

    let second = harness.attempt().await;
    let after_second = harness.records().await.remove(0);
    assert_eq!(after_second.delivery_failed_count, 2);
    assert!(after_second.next_delivery_scheduled_at > after_first.next_delivery_scheduled_at);

    assert_eq!(first.id, second.id);
    assert_eq!(
        harness.work.settlements(),
        vec![
            Settlement::Requeued(first.id, Duration::from_secs(60)),
            Settlement::Requeued(first.id, Duration::from_secs(120)),
        ]
    );
    assert_eq!(mailbox.attempts.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn expired_messages_are_bounced() {
    let harness = Harness::new(
        config().with_queue_lifetime_minutes(0),
        DirectoryData::default().with_rcpt_host("local.test", true),
    )
    .with_local(Arc::new(FailingMailbox::default()));

    harness
        .submit("alice@sender.test", Address::new("bob", "local.test"))
        .await;
    harness.attempt().await;

    let records = harness.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].rcpt_to, "alice@sender.test");

    let raw = harness.spool.blobs.get(&records[0].key).await.unwrap();
    assert!(String::from_utf8_lossy(&raw).contains(
        "I'm not going to try again, this message has been in the queue for too long."
    ));
}

#[tokio::test]
async fn permanent_local_failures_are_bounced() {
    let harness = Harness::new(
        config(),
        DirectoryData::default().with_rcpt_host("local.test", true),
    )
    .with_local(Arc::new(FailingMailbox {
        permanent: true,
        ..FailingMailbox::default()
    }));

    harness
        .submit("alice@sender.test", Address::new("bob", "local.test"))
        .await;
    harness.attempt().await;

    let records = harness.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].return_path, "");
}

#[tokio::test]
async fn admin_marks_are_honoured() {
    let harness = Harness::new(
        config(),
        DirectoryData::default().with_rcpt_host("local.test", true),
    )
    .with_local(Arc::new(FailingMailbox::default()));

    harness
        .submit("alice@sender.test", Address::new("bob", "local.test"))
        .await;
    let mut record = harness.records().await.remove(0);
    record.status = QueueStatus::AdminBounce;
    harness.spool.queue.update(&record).await.unwrap();

    harness.attempt().await;

    let records = harness.records().await;
    assert_eq!(records.len(), 1);
    let raw = harness.spool.blobs.get(&records[0].key).await.unwrap();
    assert!(String::from_utf8_lossy(&raw).contains("bounced by admin"));

    let mut bounce = records[0].clone();
    bounce.status = QueueStatus::Discarding;
    harness.spool.queue.update(&bounce).await.unwrap();

    harness.attempt().await;
    assert!(harness.records().await.is_empty());
    assert_eq!(harness.work.settlements().len(), 2);
}

#[tokio::test]
async fn full_remote_gate_requeues_without_connecting() {
    let server = MockSmtpServer::builder().build().await.unwrap();
    let gate = Gate::new();
    let harness = Harness::new(config().with_remote_concurrency(1), routed_to(&server));
    let harness = Harness {
        controller: harness.controller.with_remote_gate(gate.clone()),
        ..harness
    };

    let _busy = gate.enter(0);
    harness.submit("alice@sender.test", remote()).await;
    let job = harness.attempt().await;

    assert_eq!(
        harness.work.settlements(),
        vec![Settlement::Requeued(job.id, Duration::from_secs(60))]
    );
    assert_eq!(harness.records().await[0].delivery_failed_count, 0);
    assert_eq!(server.connections(), 0);
    assert_eq!(gate.current(), 1);
}

#[tokio::test]
async fn redelivered_job_for_a_finished_record_is_acked() {
    let harness = Harness::new(config(), DirectoryData::default());

    harness.submit("alice@sender.test", remote()).await;
    let record = harness.records().await.remove(0);
    harness.spool.remove(&record).await.unwrap();

    let job = harness.attempt().await;
    assert_eq!(harness.work.settlements(), vec![Settlement::Acked(job.id)]);
}

#[tokio::test]
async fn undecodable_jobs_are_acked_and_swept_back() {
    let harness = Harness::new(config().with_sweep_grace_secs(0), DirectoryData::default());

    harness.submit("alice@sender.test", remote()).await;
    let queued = harness.next_job().await;
    harness.work.ack(&queued).await.unwrap();

    harness
        .spool
        .work
        .publish(DELIVERY_TOPIC, b"not a record".to_vec())
        .await
        .unwrap();
    let junk = harness.attempt().await;
    assert_eq!(harness.work.settlements().last(), Some(&Settlement::Acked(junk.id)));
    assert_eq!(harness.records().await.len(), 1);

    let processor = DeliveryProcessor::new(harness.controller);
    assert_eq!(processor.sweep().await.unwrap(), 1);
    assert_eq!(processor.sweep().await.unwrap(), 0);
    assert_eq!(harness.work.waiting(DELIVERY_TOPIC), 1);
}

#[tokio::test]
async fn sweep_leaves_fresh_records_alone() {
    let harness = Harness::new(config(), DirectoryData::default());

    // A record whose job is not visible yet, as during a submission
    harness.submit("alice@sender.test", remote()).await;
    let job = harness.next_job().await;
    harness.work.ack(&job).await.unwrap();

    let processor = DeliveryProcessor::new(harness.controller);
    assert_eq!(processor.sweep().await.unwrap(), 0);
    assert_eq!(harness.work.waiting(DELIVERY_TOPIC), 0);

    let mut record = harness.spool.queue.list().await.unwrap().remove(0);
    record.next_delivery_scheduled_at = SystemTime::now() - Duration::from_secs(120);
    harness.spool.queue.update(&record).await.unwrap();

    assert_eq!(processor.sweep().await.unwrap(), 1);
    assert_eq!(processor.sweep().await.unwrap(), 0);
    assert_eq!(harness.work.waiting(DELIVERY_TOPIC), 1);
}

#[tokio::test]
async fn sweep_and_submission_interleaved() {
    let harness = Harness::new(config(), DirectoryData::default());
    let spool = harness.spool.clone();
    let processor = DeliveryProcessor::new(harness.controller);

    let submitting = tokio::spawn(async move {
        for _ in 0..50 {
            spool
                .submit(Submission {
                    mail_from: String::from("alice@sender.test"),
                    rcpt_to: vec![remote()],
                    raw: RAW.to_vec(),
                    auth_user: None,
                })
                .await
                .unwrap();
            tokio::task::yield_now().await;
        }
    });
    for _ in 0..50 {
        assert_eq!(processor.sweep().await.unwrap(), 0);
        tokio::task::yield_now().await;
    }
    submitting.await.unwrap();

    // One job per record, none from the sweep
    assert_eq!(harness.work.waiting(DELIVERY_TOPIC), 50);
}

#[tokio::test]
async fn panicking_attempt_leaves_the_job_in_flight() {
    let harness = Harness::new(
        config(),
        DirectoryData::default().with_rcpt_host("local.test", true),
    )
    .with_local(Arc::new(PanickingMailbox));

    harness
        .submit("alice@sender.test", Address::new("bob", "local.test"))
        .await;
    let job = harness.next_job().await;
    harness.controller.supervise(job).await;

    assert_eq!(harness.work.in_flight(), 1);
    assert!(harness.work.settlements().is_empty());
    assert_eq!(harness.records().await.len(), 1);
}

#[tokio::test]
async fn opportunistic_tls_falls_back_to_plaintext() {
    let server = MockSmtpServer::builder()
        .with_capability("STARTTLS")
        .build()
        .await
        .unwrap();
    let harness = Harness::new(
        config().with_tls(TlsConfig::new(TlsPolicy::Opportunistic)),
        routed_to(&server),
    );

    harness.submit("alice@sender.test", remote()).await;
    harness.attempt().await;

    assert!(harness.records().await.is_empty());
    assert_eq!(server.connections(), 2);
    assert!(server.commands().await.contains(&SmtpCommand::StartTls));
    assert!(server.message().await.is_some());
}

#[tokio::test]
async fn strict_tls_defers_on_handshake_failure() {
    let server = MockSmtpServer::builder()
        .with_capability("STARTTLS")
        .build()
        .await
        .unwrap();
    let harness = Harness::new(config(), routed_to(&server));

    harness.submit("alice@sender.test", remote()).await;
    let job = harness.attempt().await;

    assert_eq!(harness.records().await[0].status, QueueStatus::Deferred);
    assert_eq!(
        harness.work.settlements(),
        vec![Settlement::Requeued(job.id, Duration::from_secs(60))]
    );
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn refused_credentials_are_permanent() {
    let server = MockSmtpServer::builder()
        .with_capability("AUTH PLAIN LOGIN")
        .with_auth_response(535, "5.7.8 Authentication credentials invalid")
        .build()
        .await
        .unwrap();
    let data = DirectoryData::default().with_route(
        Route::new("remote.test", "127.0.0.1")
            .with_port(server.addr().port())
            .with_credentials("relay", "secret"),
    );
    let harness = Harness::new(config().with_tls(TlsConfig::new(TlsPolicy::Disabled)), data);

    harness.submit("alice@sender.test", remote()).await;
    harness.attempt().await;

    let commands = server.commands().await;
    assert!(
        commands
            .iter()
            .any(|command| matches!(command, SmtpCommand::Auth(line) if line.starts_with("AUTH PLAIN ")))
    );
    assert!(!commands.iter().any(|command| matches!(command, SmtpCommand::MailFrom(_))));

    let records = harness.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].rcpt_to, "alice@sender.test");
}

#[tokio::test]
async fn processor_delivers_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new(
        config().with_workers(2),
        DirectoryData::default().with_rcpt_host("local.test", true),
    )
    .with_local(Arc::new(Maildir::new(dir.path(), "mx.test")));
    let spool = harness.spool.clone();
    let processor = DeliveryProcessor::new(harness.controller);

    let (shutdown, receiver) = broadcast::channel(1);
    let serving = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.serve(receiver).await })
    };

    for local_part in ["bob", "carol"] {
        spool
            .submit(Submission {
                mail_from: String::from("alice@sender.test"),
                rcpt_to: vec![Address::new(local_part, "local.test")],
                raw: RAW.to_vec(),
                auth_user: None,
            })
            .await
            .unwrap();
    }

    tokio::time::timeout(Duration::from_secs(10), async {
        while !spool.queue.list().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shutdown.send(Signal::Shutdown).unwrap();
    serving.await.unwrap().unwrap();

    assert!(dir.path().join("bob@local.test/new").is_dir());
    assert!(dir.path().join("carol@local.test/new").is_dir());
}
