mod bounce;
mod mail;
mod run;
mod send_queued_mail;
mod storage;
mod transport;

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::io::{AsyncRead, AsyncWrite};
use smol::Executor;
use smtp_message::Email;
use uuid::Uuid;

pub use bounce::is_auto_submitted;
pub use mail::{InflightMail, MailMetadata, QueuedMail};
pub use smtp_queue_types::{retry_backoff, Priority, QueueId, RelayMessage, RelayStatus, ScheduleInfo};
pub use storage::{Storage, StorageEnqueuer};
pub use transport::{Transport, TransportFailure, TransportSender};

/// Shared, in-memory tracking of every live [`RelayMessage`], keyed by its
/// parent queue identifier. Per-recipient delivery outcomes fold back into
/// the entry here so that status reporting and bounce generation see the
/// envelope as a whole; rebuilt from [`Storage::list_queue`]/`find_inflight`
/// on restart is the caller's responsibility if persistence across restarts
/// is needed; as shipped this is a best-effort in-memory view.
pub type RelayMessages<M> = Arc<DashMap<QueueId, RelayMessage<M>>>;

/// Policy hooks the queue calls out to: when to retry, how many deliveries
/// may run concurrently, bounce-message settings, and how to log the
/// handful of "should never happen, but the filesystem/network is not to be
/// trusted" situations that aren't otherwise actionable.
#[async_trait]
pub trait Config<M, E>: Send + Sync + 'static {
    /// Delay to wait before the next attempt, given how many attempts
    /// already happened. Returning `None` abandons the mail (it is then
    /// bounced or dropped, depending on the transport failure kind).
    async fn next_interval(&self, s: ScheduleInfo) -> Option<Duration>;

    /// Upper bound on concurrently in-flight delivery attempts. Defaults to
    /// unbounded; override to gate the worker pool with a real limit.
    fn max_concurrent_deliveries(&self) -> usize {
        usize::MAX
    }

    /// How long a message may remain in the queue before it is considered
    /// `Expired`.
    fn message_lifetime(&self) -> Duration {
        Duration::from_secs(4 * 24 * 3600)
    }

    /// Envelope sender to use for generated bounce messages, and the domain
    /// bounces are considered to originate from. Returning `None` disables
    /// bounce generation entirely.
    fn bounce_sender(&self) -> Option<Email> {
        None
    }

    async fn log_storage_error(&self, err: E, id: Option<QueueId>);
    async fn log_queued_mail_vanished(&self, id: QueueId);
    async fn log_inflight_mail_vanished(&self, id: QueueId);
    async fn log_pending_cleanup_mail_vanished(&self, id: QueueId);
    async fn log_too_big_duration(&self, id: QueueId, too_big: Duration, new: Duration);
}

/// A piece of mail being received: an `AsyncWrite` sink for its contents,
/// committed once per recipient so that each gets its own independently
/// retried `QueuedMail`.
pub struct Enqueuer<M, Stor: Storage<M>> {
    storage: Arc<Stor>,
    relay_messages: RelayMessages<M>,
    lifetime: Duration,
    buf: Vec<u8>,
    _phantom: std::marker::PhantomData<M>,
}

impl<M, Stor: Storage<M>> AsyncWrite for Enqueuer<M, Stor> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl<M: Clone, Stor: Storage<M>> Enqueuer<M, Stor> {
    /// Commits the buffered contents for every recipient of a single
    /// submitted message, fanning it out into one independently-scheduled
    /// `QueuedMail` per recipient and registering a [`RelayMessage`] that
    /// tracks the whole envelope across all of them.
    ///
    /// `metadata` is cloned into every per-recipient `MailMetadata`; if the
    /// `M` type needs to carry per-recipient data, fan it out before
    /// calling this.
    pub async fn commit(
        self,
        from: Option<Email>,
        priority: Priority,
        recipients: Vec<Email>,
        metadata: M,
    ) -> Result<Vec<Stor::QueuedMail>, Stor::Error> {
        let mut uuid_buf: [u8; 45] = Uuid::encode_buffer();
        let parent = QueueId::new(
            Uuid::new_v4()
                .to_hyphenated_ref()
                .encode_lower(&mut uuid_buf)
                .to_owned(),
        );

        self.relay_messages.insert(
            parent.clone(),
            RelayMessage::new(
                parent.clone(),
                metadata.clone(),
                from.clone(),
                priority,
                recipients.clone(),
                chrono::Utc::now(),
                self.lifetime,
                is_auto_submitted(&self.buf),
            ),
        );

        let mut queued = Vec::with_capacity(recipients.len());
        for to in recipients {
            let meta = MailMetadata {
                from: from.clone(),
                to,
                metadata: metadata.clone(),
                priority,
                parent: parent.clone(),
            };
            let mut enqueuer = self.storage.enqueue(meta).await?;
            futures::AsyncWriteExt::write_all(&mut enqueuer, &self.buf)
                .await
                .map_err(Stor::Error::from)?;
            futures::AsyncWriteExt::close(&mut enqueuer)
                .await
                .map_err(Stor::Error::from)?;
            let mut mail = enqueuer.commit().await.map_err(Stor::Error::from)?;
            self.storage
                .reschedule(&mut mail, chrono::Utc::now(), None)
                .await?;
            queued.push(mail);
        }
        Ok(queued)
    }
}

/// Ties a [`Storage`] backend to a [`Transport`], dispatching queued mail as
/// it comes due and sweeping stale in-flight entries back onto the queue
/// after a crash.
pub struct Queue<M, Cfg, Stor, Transp>
where
    Stor: Storage<M>,
    Transp: Transport<M>,
    Cfg: Config<M, Stor::Error>,
{
    config: Arc<Cfg>,
    storage: Arc<Stor>,
    transport: Arc<Transp>,
    relay_messages: RelayMessages<M>,
    _phantom: std::marker::PhantomData<M>,
}

impl<M, Cfg, Stor, Transp> Queue<M, Cfg, Stor, Transp>
where
    M: 'static + Clone + Send + Sync,
    Stor: Storage<M>,
    Transp: Transport<M>,
    Cfg: Config<M, Stor::Error>,
{
    /// Spawns the background dispatch and crash-recovery sweep loops onto
    /// `ex`, and returns a handle usable to enqueue new mail.
    pub async fn new(
        ex: Arc<Executor<'static>>,
        config: Cfg,
        storage: Stor,
        transport: Transp,
    ) -> Queue<M, Cfg, Stor, Transp> {
        let config = Arc::new(config);
        let storage = Arc::new(storage);
        let transport = Arc::new(transport);
        let relay_messages: RelayMessages<M> = Arc::new(DashMap::new());
        run::spawn(
            ex,
            config.clone(),
            storage.clone(),
            transport.clone(),
            relay_messages.clone(),
        );
        Queue {
            config,
            storage,
            transport,
            relay_messages,
            _phantom: std::marker::PhantomData,
        }
    }

    pub async fn enqueue(&self) -> Result<Enqueuer<M, Stor>, Stor::Error> {
        Ok(Enqueuer {
            storage: self.storage.clone(),
            relay_messages: self.relay_messages.clone(),
            lifetime: self.config.message_lifetime(),
            buf: Vec::new(),
            _phantom: std::marker::PhantomData,
        })
    }
}
