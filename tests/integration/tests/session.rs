use std::{
    borrow::Cow,
    io,
    pin::Pin,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use duplexify::Duplex;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, Cursor};
use smtp_message::{Email, EscapedDataReader};
use smtp_server::{
    interact, ConnectionMetadata, Decision, IsAlreadyTls, MailMetadata, Reply, ReplyCode,
};

/// Exercises the full EHLO/MAIL/RCPT/DATA/QUIT pipeline end to end through
/// `smtp_server::interact`, driven over an in-memory duplex pipe instead of
/// a real socket.
struct TestConfig {
    mails: Mutex<Vec<(Option<Email>, Vec<Email>, Vec<u8>)>>,
    spam_reject_threshold: usize,
    passthrough_tls: bool,
}

impl TestConfig {
    fn new() -> TestConfig {
        TestConfig {
            mails: Mutex::new(Vec::new()),
            spam_reject_threshold: usize::MAX,
            passthrough_tls: false,
        }
    }
}

#[async_trait]
impl smtp_server::Config for TestConfig {
    type ConnectionUserMeta = ();
    type MailUserMeta = ();

    fn hostname(&self) -> Cow<'static, str> {
        "test.example.org".into()
    }

    async fn new_mail(&self, _conn_meta: &mut ConnectionMetadata<()>) {}

    fn can_do_tls(&self, _conn_meta: &ConnectionMetadata<()>) -> bool {
        self.passthrough_tls
    }

    async fn tls_accept<IO>(
        &self,
        io: IO,
        _conn_meta: &mut ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> io::Result<duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>>
    where
        IO: 'static + Unpin + Send + AsyncRead + AsyncWrite,
    {
        // No real certificate material is available in-process; STARTTLS
        // tests only care that the session state resets, so the same
        // stream is handed back unencrypted.
        let (r, w) = io.split();
        Ok(Duplex::new(
            Box::pin(r) as Pin<Box<dyn Send + AsyncRead>>,
            Box::pin(w) as Pin<Box<dyn Send + AsyncWrite>>,
        ))
    }

    async fn filter_from(
        &self,
        _from: &mut Option<Email<&str>>,
        _meta: &mut MailMetadata<()>,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> Decision {
        Decision::Accept
    }

    async fn filter_to(
        &self,
        to: &mut Email<&str>,
        _meta: &mut MailMetadata<()>,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> Decision {
        if *to.localpart.raw() == "unknown" {
            Decision::Reject(Reply {
                code: ReplyCode::MAILBOX_UNAVAILABLE,
                ecode: None,
                text: vec!["No such user".into()],
            })
        } else {
            Decision::Accept
        }
    }

    async fn handle_mail<'a, R>(
        &self,
        reader: &mut EscapedDataReader<'a, R>,
        meta: MailMetadata<()>,
        _conn_meta: &mut ConnectionMetadata<()>,
    ) -> Decision
    where
        R: Send + Unpin + AsyncRead,
    {
        let mut text = Vec::new();
        reader.read_to_end(&mut text).await.expect("read failed");
        reader.complete();

        if text.len() >= self.spam_reject_threshold {
            return Decision::Reject(Reply {
                code: ReplyCode::POLICY_REASON,
                ecode: None,
                text: vec!["Message looks like spam".into()],
            });
        }

        self.mails
            .lock()
            .unwrap()
            .push((meta.from, meta.to, text));
        Decision::Accept
    }
}

fn run(cfg: Arc<TestConfig>, input: &[u8]) -> Vec<u8> {
    let resp = Box::leak(Box::new(Vec::new()));
    let resp_view = unsafe { &mut *(resp as *mut Vec<u8>) };
    let io = Duplex::new(Cursor::new(input), Cursor::new(resp_view));
    smol::block_on(interact(io, IsAlreadyTls::No, (), cfg)).unwrap();
    resp.clone()
}

#[test]
fn happy_path_accepts_a_simple_message() {
    let cfg = Arc::new(TestConfig::new());
    let input = b"EHLO client.example.org\r\n\
                  MAIL FROM:<alice@example.org>\r\n\
                  RCPT TO:<bob@example.com>\r\n\
                  DATA\r\n\
                  Hello, Bob!\r\n\
                  .\r\n\
                  QUIT\r\n";
    let out = run(cfg.clone(), input);
    let out = String::from_utf8(out).unwrap();
    assert!(out.starts_with("220 "));
    assert!(out.contains("354 Start mail input"));
    assert!(out.contains("250 2.0.0 Okay\r\n221"));

    let mails = cfg.mails.lock().unwrap();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].2, b"Hello, Bob!\r\n.\r\n");
}

#[test]
fn dot_stuffing_is_undone_before_delivery() {
    let cfg = Arc::new(TestConfig::new());
    // A leading dot on a content line is doubled on the wire (RFC 5321
    // 4.5.2) and must come back out as a single dot once unescaped.
    let input = b"EHLO client.example.org\r\n\
                  MAIL FROM:<alice@example.org>\r\n\
                  RCPT TO:<bob@example.com>\r\n\
                  DATA\r\n\
                  ..this line started with a dot\r\n\
                  .\r\n\
                  QUIT\r\n";
    run(cfg.clone(), input);

    let mails = cfg.mails.lock().unwrap();
    assert_eq!(mails.len(), 1);
    assert_eq!(&mails[0].2, b".this line started with a dot\r\n.\r\n");
}

#[test]
fn starttls_resets_session_state() {
    let cfg = Arc::new({
        let mut cfg = TestConfig::new();
        cfg.passthrough_tls = true;
        cfg
    });
    // After STARTTLS, the EHLO/MAIL state must be cleared: a MAIL FROM
    // without having said EHLO/HELO again is a bad sequence of commands.
    let input = b"EHLO client.example.org\r\n\
                  STARTTLS\r\n\
                  MAIL FROM:<alice@example.org>\r\n";
    let out = run(cfg, input);
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("220 2.0.0 Ready to start TLS") || out.contains("Start TLS"));
    assert!(out.trim_end().ends_with("503 5.5.1 Bad sequence of commands"));
}

#[test]
fn rejects_unknown_recipient() {
    let cfg = Arc::new(TestConfig::new());
    let input = b"EHLO client.example.org\r\n\
                  MAIL FROM:<alice@example.org>\r\n\
                  RCPT TO:<unknown@example.com>\r\n";
    let out = run(cfg, input);
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("No such user"));
}

#[test]
fn anti_spam_rejects_oversized_payload() {
    let cfg = Arc::new({
        let mut cfg = TestConfig::new();
        cfg.spam_reject_threshold = 10;
        cfg
    });
    let input = b"EHLO client.example.org\r\n\
                  MAIL FROM:<alice@example.org>\r\n\
                  RCPT TO:<bob@example.com>\r\n\
                  DATA\r\n\
                  This message is much longer than the configured threshold\r\n\
                  .\r\n\
                  QUIT\r\n";
    let out = run(cfg.clone(), input);
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("Message looks like spam"));
    assert!(cfg.mails.lock().unwrap().is_empty());
}
