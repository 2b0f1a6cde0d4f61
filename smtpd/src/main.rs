// TODO: split into multiple processes, with multiple uids (stretch goal: do not
// require root and allow the user to directly call multiple executables and
// pass it the pre-opened sockets)

mod config;

use std::{borrow::Cow, io, net::IpAddr, path::PathBuf, pin::Pin, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use easy_parallel::Parallel;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, StreamExt};
use smol::unblock;
use tracing::{error, info, warn};

use smtp_admission::{shutdown_channel, Admission, AdmissionError, Window};
use smtp_events::{Event, EventBus, StatisticsCollector};
use smtp_message::{Email, EnhancedReplyCode, Hostname, MaybeUtf8, Reply, ReplyCode};
use smtp_queue::{Priority, QueueId};
use smtp_queue_fs::FsStorage;
use smtp_server::Decision;

use config::{
    AllowAllMailboxFilter, AntiSpamCheck, AuthOutcome, Authenticator, Configuration,
    DenyAllAuthenticator, MailboxFilter, MessageStore, NullMessageStore,
};

const NUM_THREADS: usize = 4;
const QUEUE_DIR: &str = "/tmp/smtpd/queue";
const CERT_FILE: &str = "/tmp/smtpd/cert.pem";
const KEY_FILE: &str = "/tmp/smtpd/key.pem";

const DATABUF_SIZE: usize = 16 * 1024;

#[derive(serde::Deserialize, serde::Serialize)]
struct Meta;

type DynAsyncReadWrite =
    duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>;

/// Per-connection state handed to `smtp_server::interact`. Only the peer
/// address is needed by the hooks below; authentication state already
/// lives in `ConnectionMetadata::auth`.
struct ConnUserMeta {
    peer: IpAddr,
}

struct NoCertVerifier;

impl rustls::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _roots: &rustls::RootCertStore,
        _presented_certs: &[rustls::Certificate],
        _dns_name: webpki::DNSNameRef,
        _ocsp_response: &[u8],
    ) -> Result<rustls::ServerCertVerified, rustls::TLSError> {
        Ok(rustls::ServerCertVerified::assertion())
    }
}

struct ClientConfig(async_tls::TlsConnector);

#[async_trait]
impl smtp_client::Config for ClientConfig {
    fn ehlo_hostname(&self) -> Hostname<&str> {
        // TODO: this is ugly
        Hostname::parse_until(b"!")(b"localhost!")
            .expect("failed parsing static str")
            .1
    }

    async fn tls_connect<IO>(&self, io: IO) -> io::Result<DynAsyncReadWrite>
    where
        IO: 'static + Unpin + Send + AsyncRead + AsyncWrite,
    {
        let io = self.0.connect("", io).await?;
        let (r, w) = io.split();
        let io = duplexify::Duplex::new(
            Box::pin(r) as Pin<Box<dyn Send + AsyncRead>>,
            Box::pin(w) as Pin<Box<dyn Send + AsyncWrite>>,
        );
        Ok(io)
    }
}

struct QueueConfig {
    relay: config::RelayConfiguration,
}

#[async_trait]
impl smtp_queue::Config<Meta, <FsStorage<Meta> as smtp_queue::Storage<Meta>>::Error>
    for QueueConfig
{
    async fn next_interval(&self, _s: smtp_queue::ScheduleInfo) -> Option<Duration> {
        // `ScheduleInfo` does not carry an attempt counter, so every retry
        // backs off from the same base delay rather than growing with the
        // number of attempts already made.
        if self.relay.max_retry_count == 0 {
            return None;
        }
        Some(smtp_queue::retry_backoff(
            self.relay.base_delay,
            1,
            self.relay.max_delay,
            rand::random::<f64>(),
        ))
    }

    fn max_concurrent_deliveries(&self) -> usize {
        self.relay.max_concurrent_deliveries
    }

    fn message_lifetime(&self) -> Duration {
        self.relay.message_lifetime
    }

    fn bounce_sender(&self) -> Option<Email> {
        if !self.relay.enable_bounce_messages {
            return None;
        }
        let addr = format!("{}@{}", self.relay.bounce_sender, self.relay.local_domain);
        Email::<String>::parse_bracketed(format!("<{}>", addr).as_bytes()).ok()
    }

    async fn log_storage_error(
        &self,
        err: <FsStorage<Meta> as smtp_queue::Storage<Meta>>::Error,
        id: Option<QueueId>,
    ) {
        error!(error = ?err, queue_id = ?id, "Storage error");
    }

    async fn log_queued_mail_vanished(&self, id: QueueId) {
        error!(queue_id = ?id, "Queued mail vanished");
    }

    async fn log_inflight_mail_vanished(&self, id: QueueId) {
        error!(queue_id = ?id, "Inflight mail vanished");
    }

    async fn log_pending_cleanup_mail_vanished(&self, id: QueueId) {
        error!(queue_id = ?id, "Mail that was pending cleanup vanished");
    }

    async fn log_too_big_duration(&self, id: QueueId, too_big: Duration, new: Duration) {
        error!(queue_id = ?id, too_big = ?too_big, reset_to = ?new, "Ended up having too big a duration");
    }
}

fn transport_error_client_to_queue(
    err: smtp_client::TransportError,
) -> smtp_queue::TransportFailure {
    match err.severity() {
        smtp_client::TransportErrorSeverity::Local => smtp_queue::TransportFailure::Local,
        smtp_client::TransportErrorSeverity::NetworkTransient => {
            smtp_queue::TransportFailure::NetworkTransient
        }
        smtp_client::TransportErrorSeverity::MailTransient => {
            smtp_queue::TransportFailure::MailTransient
        }
        smtp_client::TransportErrorSeverity::MailboxTransient => {
            smtp_queue::TransportFailure::MailboxTransient
        }
        smtp_client::TransportErrorSeverity::MailSystemTransient => {
            smtp_queue::TransportFailure::MailSystemTransient
        }
        smtp_client::TransportErrorSeverity::MailPermanent => {
            smtp_queue::TransportFailure::MailPermanent
        }
        smtp_client::TransportErrorSeverity::MailboxPermanent => {
            smtp_queue::TransportFailure::MailboxPermanent
        }
        smtp_client::TransportErrorSeverity::MailSystemPermanent => {
            smtp_queue::TransportFailure::MailSystemPermanent
        }
    }
}

struct QueueTransport<C, P>(smtp_client::Client<C, P, ClientConfig>, config::RelayConfiguration)
where
    C: trust_dns_resolver::proto::DnsHandle,
    P: trust_dns_resolver::ConnectionProvider<Conn = C>;

#[async_trait]
impl<C, P> smtp_queue::Transport<Meta> for QueueTransport<C, P>
where
    C: trust_dns_resolver::proto::DnsHandle,
    P: trust_dns_resolver::ConnectionProvider<Conn = C>,
{
    type Destination = smtp_client::Destination;
    type Sender = QueueTransportSender;

    async fn destination(
        &self,
        meta: &smtp_queue::MailMetadata<Meta>,
    ) -> Result<Self::Destination, smtp_queue::TransportFailure> {
        // TODO: this should most likely be a const or similar; and definitely not
        // recomputed on each call to destination
        let localhost = Hostname::parse_until(b"!")(b"localhost!")
            .expect("failed to parse constant hostname")
            .1
            .to_owned();

        // Domain-specific routes, then the default smart host, then the
        // smart host list, take precedence over MX routing (config §4.4).
        let target_domain = meta
            .to
            .hostname
            .as_ref()
            .map(|h| h.to_string())
            .unwrap_or_else(|| "localhost".to_string());
        if let Some(smart_host) = self.1.smart_host_for(&target_domain) {
            let buf = format!("{}!", smart_host);
            let hostname = Hostname::parse_until(b"!")(buf.as_bytes())
                .map_err(|_| smtp_queue::TransportFailure::Local)?
                .1
                .to_owned();
            return self
                .0
                .get_destination(&hostname)
                .await
                .map_err(transport_error_client_to_queue);
        }

        if meta.to.hostname.is_some() && !self.1.use_mx_routing {
            return Err(smtp_queue::TransportFailure::MailPermanent);
        }

        self.0
            .get_destination(meta.to.hostname.as_ref().unwrap_or(&localhost))
            .await
            .map_err(transport_error_client_to_queue)
    }

    async fn connect(
        &self,
        dest: &Self::Destination,
    ) -> Result<Self::Sender, smtp_queue::TransportFailure> {
        self.0
            .connect(dest)
            .await
            .map(QueueTransportSender)
            .map_err(transport_error_client_to_queue)
    }
}

struct QueueTransportSender(smtp_client::Sender<ClientConfig>);

#[async_trait]
impl smtp_queue::TransportSender<Meta> for QueueTransportSender {
    async fn send<Reader>(
        &mut self,
        meta: &smtp_queue::MailMetadata<Meta>,
        mail: Reader,
    ) -> Result<(), smtp_queue::TransportFailure>
    where
        Reader: Send + AsyncRead,
    {
        self.0
            .send(meta.from.as_ref(), &meta.to, mail)
            .await
            .map_err(transport_error_client_to_queue)
    }
}

struct ServerConfig<T>
where
    T: smtp_queue::Transport<Meta>,
{
    acceptor: async_tls::TlsAcceptor,
    queue: smtp_queue::Queue<Meta, QueueConfig, FsStorage<Meta>, T>,
    config: Arc<Configuration>,
    events: Arc<EventBus>,
    authenticator: Arc<dyn Authenticator>,
    mailbox_filter: Arc<dyn MailboxFilter>,
    antispam: Arc<dyn AntiSpamCheck>,
    message_store: Arc<dyn MessageStore>,
}

#[async_trait]
impl<T> smtp_server::Config for ServerConfig<T>
where
    T: smtp_queue::Transport<Meta>,
{
    type ConnectionUserMeta = ConnUserMeta;
    type MailUserMeta = ();

    // TODO: this could have a default implementation if we were able to have a
    // default type of () for MailUserMeta without requiring unstable
    async fn new_mail(
        &self,
        _conn_meta: &mut smtp_server::ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Self::MailUserMeta {
        // ()
    }

    fn auth_requires_tls(
        &self,
        conn_meta: &smtp_server::ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> bool {
        !conn_meta.is_encrypted && !self.config.allow_plain_text_authentication
    }

    fn ehlo_okay(
        &self,
        conn_meta: &smtp_server::ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Reply<Cow<'static, str>> {
        let mut text = vec![MaybeUtf8::Utf8(self.hostname())];
        if self.config.enable_8bitmime {
            text.push(MaybeUtf8::Utf8("8BITMIME".into()));
        }
        text.push(MaybeUtf8::Utf8("ENHANCEDSTATUSCODES".into()));
        if self.config.enable_pipelining {
            text.push(MaybeUtf8::Utf8("PIPELINING".into()));
        }
        if self.config.enable_smtputf8 {
            text.push(MaybeUtf8::Utf8("SMTPUTF8".into()));
        }
        if self.config.enable_size_extension {
            text.push(MaybeUtf8::Utf8(
                format!("SIZE {}", self.config.max_message_size).into(),
            ));
        }
        if self.can_do_tls(conn_meta) {
            text.push(MaybeUtf8::Utf8("STARTTLS".into()));
        }
        if self.can_do_auth(conn_meta) && !self.auth_requires_tls(conn_meta) {
            text.push(MaybeUtf8::Utf8("AUTH PLAIN LOGIN".into()));
        }
        Reply {
            code: ReplyCode::OKAY,
            ecode: None,
            text,
        }
    }

    /// Note: if you don't want to implement TLS, you should override
    /// `can_do_tls` to return `false` so that STARTTLS is not advertized. This
    /// being said, returning an error here should have the same result in
    /// practice, except clients will try STARTTLS and fail
    async fn tls_accept<IO>(
        &self,
        io: IO,
        _conn_meta: &mut smtp_server::ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> io::Result<
        duplexify::Duplex<Pin<Box<dyn Send + AsyncRead>>, Pin<Box<dyn Send + AsyncWrite>>>,
    >
    where
        IO: 'static + Unpin + Send + AsyncRead + AsyncWrite,
    {
        self.events.fire(Event::TlsNegotiationStarted);
        match self.acceptor.accept(io).await {
            Ok(io) => {
                self.events.fire(Event::TlsNegotiationCompleted);
                let (r, w) = io.split();
                let io = duplexify::Duplex::new(
                    Box::pin(r) as Pin<Box<dyn Send + AsyncRead>>,
                    Box::pin(w) as Pin<Box<dyn Send + AsyncWrite>>,
                );
                Ok(io)
            }
            Err(e) => {
                self.events.fire(Event::TlsNegotiationFailed);
                Err(e)
            }
        }
    }

    async fn handle_auth(
        &self,
        mechanism: &str,
        _authzid: Option<&str>,
        authcid: &str,
        password: &str,
        _conn_meta: &mut smtp_server::ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision {
        self.events.fire(Event::AuthenticationAttempted {
            mechanism: mechanism.to_string(),
        });
        match self.authenticator.authenticate(authcid, password).await {
            AuthOutcome::Success { identity } => {
                self.events.fire(Event::AuthenticationSucceeded {
                    mechanism: mechanism.to_string(),
                    identity,
                });
                Decision::Accept
            }
            AuthOutcome::Failure { reason } => {
                warn!(mechanism, reason = %reason, "Authentication failed");
                self.events.fire(Event::AuthenticationFailed {
                    mechanism: mechanism.to_string(),
                });
                Decision::Reject(self.auth_failed())
            }
        }
    }

    async fn filter_from(
        &self,
        from: &mut Option<Email<&str>>,
        _meta: &mut smtp_server::MailMetadata<Self::MailUserMeta>,
        conn_meta: &mut smtp_server::ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision {
        if self.config.require_secure_connection && !conn_meta.is_encrypted {
            return Decision::Reject(Reply {
                code: ReplyCode::ENCRYPTION_REQUIRED_FOR_AUTH,
                ecode: Some(EnhancedReplyCode::PERMANENT_ENCRYPTION_NEEDED.into()),
                text: vec![MaybeUtf8::Utf8(
                    "Must issue a STARTTLS command first".into(),
                )],
            });
        }

        let owned = from.clone().map(|f| f.to_owned());
        if self
            .mailbox_filter
            .can_accept_from(conn_meta.user.peer, owned.as_ref(), 0)
        {
            Decision::Accept
        } else {
            Decision::Reject(self.internal_server_error())
        }
    }

    async fn filter_to(
        &self,
        to: &mut Email<&str>,
        meta: &mut smtp_server::MailMetadata<Self::MailUserMeta>,
        conn_meta: &mut smtp_server::ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision {
        if meta.to.len() >= self.config.max_recipients {
            return Decision::Reject(Reply {
                code: ReplyCode::INSUFFICIENT_STORAGE,
                ecode: Some(EnhancedReplyCode::PERMANENT_UNDEFINED.into()),
                text: vec![MaybeUtf8::Utf8("Too many recipients".into())],
            });
        }

        let to_owned = to.clone().to_owned();
        let authenticated = conn_meta.auth.is_some();
        if !self
            .config
            .peer_may_relay(conn_meta.user.peer, authenticated)
            && to_owned.hostname.as_ref().map(|h| h.to_string())
                != Some(self.config.relay.local_domain.clone())
        {
            return Decision::Reject(Reply {
                code: ReplyCode::TRANSACTION_FAILED,
                ecode: Some(EnhancedReplyCode::PERMANENT_UNDEFINED.into()),
                text: vec![MaybeUtf8::Utf8("Relaying denied".into())],
            });
        }

        if self
            .mailbox_filter
            .can_deliver_to(&to_owned, meta.from.as_ref())
        {
            Decision::Accept
        } else {
            Decision::Reject(self.internal_server_error())
        }
    }

    /// Note: the EscapedDataReader has an inner buffer size of
    /// [`RDBUF_SIZE`](RDBUF_SIZE), which means that reads should not happen
    /// with more than this buffer size.
    ///
    /// Also, note that there is no timeout applied here, so the implementation
    /// of this function is responsible for making sure that the client does not
    /// just stop sending anything to DOS the system.
    async fn handle_mail<'a, R>(
        &self,
        stream: &mut smtp_message::EscapedDataReader<'a, R>,
        meta: smtp_server::MailMetadata<Self::MailUserMeta>,
        conn_meta: &mut smtp_server::ConnectionMetadata<Self::ConnectionUserMeta>,
    ) -> Decision
    where
        R: Send + Unpin + AsyncRead,
    {
        let started_at = std::time::Instant::now();
        self.events.fire(Event::DataTransferStarted {
            from: meta.from.as_ref().map(|f| format!("{:?}", f)),
            recipients: meta.to.iter().map(|t| format!("{:?}", t)).collect(),
            cancel: false,
        });

        let mut enqueuer = match self.queue.enqueue().await {
            Ok(enqueuer) => enqueuer,
            Err(e) => {
                error!(error = ?e, "Internal server error while opening an enqueuer");
                return Decision::Reject(self.internal_server_error());
            }
        };
        // TODO: MUST add Received header at least
        // TODO: factor out with the similar logic in smtp-client
        let mut buf = [0; DATABUF_SIZE];
        let mut whole_message = Vec::new();
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => {
                    // End of stream
                    break;
                }
                Ok(n) => {
                    // Got n bytes
                    if whole_message.len() + n > self.config.max_message_size {
                        loop {
                            match stream.read(&mut buf).await {
                                Ok(0) => break,
                                Ok(_) => (),
                                Err(e) => {
                                    error!(error = ?e, "Internal server error while reading data from network");
                                    break;
                                }
                            }
                        }
                        self.events.fire(Event::DataTransferCompleted {
                            bytes: whole_message.len() as u64,
                            duration: started_at.elapsed(),
                            success: false,
                        });
                        return Decision::Reject(Reply {
                            code: ReplyCode::EXCEEDED_STORAGE,
                            ecode: Some(EnhancedReplyCode::PERMANENT_UNDEFINED.into()),
                            text: vec![MaybeUtf8::Utf8("Message exceeds maximum size".into())],
                        });
                    }
                    whole_message.extend_from_slice(&buf[..n]);
                    if let Err(e) = enqueuer.write_all(&buf[..n]).await {
                        error!(error = ?e, "Internal server error while writing data to queue");
                        loop {
                            match stream.read(&mut buf).await {
                                Ok(0) => break,
                                Ok(_) => (),
                                Err(e) => {
                                    error!(error = ?e, "Internal server error while reading data from network");
                                    break;
                                }
                            }
                        }
                        self.events.fire(Event::DataTransferCompleted {
                            bytes: whole_message.len() as u64,
                            duration: started_at.elapsed(),
                            success: false,
                        });
                        return Decision::Reject(self.internal_server_error());
                    }
                }
                Err(e) => {
                    error!(error = ?e, "Internal server error while reading data from network");
                    self.events.fire(Event::DataTransferCompleted {
                        bytes: whole_message.len() as u64,
                        duration: started_at.elapsed(),
                        success: false,
                    });
                    return Decision::Reject(self.internal_server_error());
                }
            }
        }

        if !stream.is_finished() {
            // Stream isn't finished, as we read until end-of-stream it means that there was
            // an error somewhere
            error!("Stream stopped returning any bytes without actually finishing");
            self.events.fire(Event::DataTransferCompleted {
                bytes: whole_message.len() as u64,
                duration: started_at.elapsed(),
                success: false,
            });
            return Decision::Reject(self.internal_server_error());
        }

        self.events.fire(Event::DataTransferCompleted {
            bytes: whole_message.len() as u64,
            duration: started_at.elapsed(),
            success: true,
        });

        let spam = self
            .antispam
            .check(&whole_message, conn_meta.user.peer)
            .await;
        if spam.score >= self.config.spam_reject_threshold {
            warn!(score = spam.score, reasons = ?spam.reasons, "Rejecting message as spam");
            self.events.fire(Event::MessageReceived { cancel: true });
            return Decision::Reject(self.internal_server_error());
        }

        let recipients: Vec<Email> = meta.to.clone();
        if !self
            .message_store
            .save(meta.from.as_ref(), &recipients, &whole_message)
            .await
        {
            error!("Message store refused to persist the message");
            self.events.fire(Event::MessageReceived { cancel: true });
            return Decision::Reject(self.internal_server_error());
        }

        // Stream is finished, let's complete it then commit the file to the queue and
        // accept
        stream.complete();
        if let Err(e) = enqueuer
            .commit(meta.from.clone(), Priority::Normal, meta.to.clone(), Meta)
            .await
        {
            error!(error = ?e, "Internal server error while committing mail");
            self.events.fire(Event::MessageReceived { cancel: true });
            Decision::Reject(self.internal_server_error())
        } else {
            self.events.fire(Event::MessageReceived { cancel: false });
            Decision::Accept
        }
    }

    fn hostname(&self) -> Cow<'static, str> {
        self.config.server_name.clone().into()
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    info!("smtpd starting up");

    let ex = Arc::new(smol::Executor::new());

    // TODO: figure out a better shutdown story than brutally killing the server
    // (ie. trigger signal not only when the socket fails)
    let (signal, shutdown) = smol::channel::unbounded::<()>();

    let (_, res): (_, anyhow::Result<()>) = Parallel::new()
        .each(0..NUM_THREADS, |_| smol::block_on(ex.run(shutdown.recv())))
        .finish(|| {
            smol::block_on(async {
                let cfg = Arc::new(Configuration::default());

                // Observability: a single event bus, with the built-in statistics
                // collector attached as one listener among any others a deployment
                // might register.
                let events = Arc::new(EventBus::new());
                let stats = Arc::new(StatisticsCollector::new());
                stats.attach(&events);

                // Admission control: per-IP connection cap, fixed-window rate
                // limiting and a shutdown token the accept loop consults before
                // handing off each freshly accepted socket.
                let (shutdown_trigger, shutdown_token) = shutdown_channel();
                let admission = Arc::new(Admission::new(
                    cfg.max_connections,
                    cfg.max_connections_per_ip,
                    cfg.rate_limit_per_minute.unwrap_or(u32::MAX),
                    Window::Minute,
                    shutdown_token,
                ));
                ex.spawn({
                    let admission = admission.clone();
                    async move { admission.run_reaper().await }
                })
                .detach();

                // Prepare the clients
                let mut tls_client_cfg =
                    rustls::ClientConfig::with_ciphersuites(&rustls::ALL_CIPHERSUITES);
                // TODO: see for configuring persistence, for more performance?
                tls_client_cfg
                    .dangerous()
                    .set_certificate_verifier(Arc::new(NoCertVerifier));
                let connector = async_tls::TlsConnector::from(tls_client_cfg);
                let client = smtp_client::Client::new(
                    async_std_resolver::resolver_from_system_conf()
                        .await
                        .with_context(|| "Configuring a resolver from system configuration")?,
                    Arc::new(ClientConfig(connector)),
                );

                // Spawn the queue
                let storage = FsStorage::new(PathBuf::from(QUEUE_DIR))
                    .await
                    .with_context(|| "Opening the queue storage folder")?;
                let queue = smtp_queue::Queue::new(
                    ex.clone(),
                    QueueConfig {
                        relay: cfg.relay.clone(),
                    },
                    storage,
                    QueueTransport(client, cfg.relay.clone()),
                )
                .await;

                // Spawn the server
                let tls_server_cfg = unblock(|| {
                    // Configure rustls
                    let mut tls_server_cfg = rustls::ServerConfig::with_ciphersuites(
                        rustls::NoClientAuth::new(),
                        &rustls::ALL_CIPHERSUITES,
                    );
                    // TODO: see for configuring persistence, for more performance?
                    // TODO: support SNI

                    // Load the certificates and keys
                    let cert = rustls::internal::pemfile::certs(&mut io::BufReader::new(
                        std::fs::File::open(CERT_FILE)
                            .with_context(|| "Opening the certificate file")?,
                    ))
                    .map_err(|()| anyhow!("Failed parsing the certificate file"))?;
                    let keys =
                        rustls::internal::pemfile::pkcs8_private_keys(&mut io::BufReader::new(
                            std::fs::File::open(KEY_FILE)
                                .with_context(|| "Opening the key file")?,
                        ))
                        .map_err(|()| anyhow!("Parsing the key file"))?;
                    anyhow::ensure!(keys.len() == 1, "Multiple keys found in the key file");
                    let key = keys.into_iter().next().unwrap();
                    tls_server_cfg
                        .set_single_cert(cert, key)
                        .with_context(|| "Setting the key and certificate")?;

                    Ok(tls_server_cfg)
                })
                .await?;
                let acceptor = async_tls::TlsAcceptor::from(tls_server_cfg);
                let server_cfg = Arc::new(ServerConfig {
                    acceptor,
                    queue,
                    config: cfg.clone(),
                    events: events.clone(),
                    authenticator: Arc::new(DenyAllAuthenticator),
                    mailbox_filter: Arc::new(AllowAllMailboxFilter),
                    antispam: Arc::new(config::NullAntiSpamCheck),
                    message_store: Arc::new(NullMessageStore),
                });
                let listener = smol::net::TcpListener::bind(("0.0.0.0", cfg.port))
                    .await
                    .with_context(|| "Binding on the listening port")?;
                let mut incoming = listener.incoming();

                info!("Server up, waiting for connections");
                while let Some(stream) = incoming.next().await {
                    let stream = stream.with_context(|| "Receiving a new incoming stream")?;
                    let peer = match stream.peer_addr() {
                        Ok(addr) => addr.ip(),
                        Err(e) => {
                            warn!(error = ?e, "Could not read peer address, dropping connection");
                            continue;
                        }
                    };

                    let acquired = match admission.try_admit(peer) {
                        Ok(acquired) => acquired,
                        Err(AdmissionError::ShuttingDown) => break,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "Refusing connection");
                            events.fire(Event::ConnectionRejected {
                                peer,
                                reason: e.to_string(),
                            });
                            continue;
                        }
                    };

                    events.fire(Event::SessionCreated { peer });
                    let admission = admission.clone();
                    let events = events.clone();
                    let server_cfg = server_cfg.clone();
                    ex.spawn(async move {
                        let res = smtp_server::interact(
                            stream,
                            smtp_server::IsAlreadyTls::No,
                            ConnUserMeta { peer },
                            server_cfg,
                        )
                        .await;
                        if let Err(e) = res {
                            events.fire(Event::ErrorOccurred {
                                message: e.to_string(),
                            });
                        }
                        events.fire(Event::SessionCompleted);
                        admission.release(acquired);
                    })
                    .detach();
                }

                // Close all the things
                shutdown_trigger.shutdown();
                std::mem::drop(signal);

                Ok(())
            })
        });

    if let Err(e) = res {
        error!(err = ?e, "Error while running smtpd");
    }
}
