use std::{future::Future, io, pin::Pin};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{io::AsyncWrite, Stream};
use smtp_queue_types::QueueId;

use crate::mail::{InflightMail, MailMetadata, QueuedMail};

/// An in-progress enqueue: written to like any `AsyncWrite`, then committed
/// to turn it into a queued, schedulable mail.
#[async_trait]
pub trait StorageEnqueuer<QM>: Send + AsyncWrite {
    async fn commit(self) -> io::Result<QM>;
}

/// Persistence backend for the queue: everything the dispatcher, sweep and
/// cleanup tasks need to durably track mails across restarts.
#[async_trait]
pub trait Storage<U>: Sized + Send + Sync + 'static {
    type Error: Send + std::fmt::Debug + From<io::Error>;
    type Enqueuer: StorageEnqueuer<Self::QueuedMail>;
    type InflightMail: InflightMail;
    type QueuedMail: QueuedMail;
    type Reader: Send + futures::AsyncRead;

    async fn list_queue(
        &self,
    ) -> Pin<Box<dyn Send + Stream<Item = Result<Self::QueuedMail, (Self::Error, Option<QueueId>)>>>>;

    async fn find_inflight(
        &self,
    ) -> Pin<
        Box<dyn Send + Stream<Item = Result<Self::InflightMail, (Self::Error, Option<QueueId>)>>>,
    >;

    async fn read_inflight(
        &self,
        mail: &Self::InflightMail,
    ) -> Result<(MailMetadata<U>, Self::Reader), Self::Error>;

    fn enqueue<'s, 'a>(
        &'s self,
        meta: MailMetadata<U>,
    ) -> Pin<Box<dyn 'a + Send + Future<Output = Result<Self::Enqueuer, Self::Error>>>>
    where
        's: 'a;

    async fn reschedule(
        &self,
        mail: &mut Self::QueuedMail,
        at: DateTime<Utc>,
        last_attempt: Option<DateTime<Utc>>,
    ) -> Result<(), Self::Error>;

    fn send_start<'s, 'a>(
        &'s self,
        mail: Self::QueuedMail,
    ) -> Pin<
        Box<
            dyn 'a
                + Send
                + Future<Output = Result<Option<Self::InflightMail>, (Self::QueuedMail, Self::Error)>>,
        >,
    >
    where
        's: 'a;

    fn send_done<'s, 'a>(
        &'s self,
        mail: Self::InflightMail,
    ) -> Pin<Box<dyn 'a + Send + Future<Output = Result<(), (Self::InflightMail, Self::Error)>>>>
    where
        's: 'a;

    fn send_cancel<'s, 'a>(
        &'s self,
        mail: Self::InflightMail,
    ) -> Pin<
        Box<
            dyn 'a
                + Send
                + Future<
                    Output = Result<Option<Self::QueuedMail>, (Self::InflightMail, Self::Error)>,
                >,
        >,
    >
    where
        's: 'a;

    /// Removes a mail for good: permanent failure, or transient failure with
    /// retries exhausted. Unlike `send_cancel`, which puts the mail back onto
    /// the ready queue with its old (already past) schedule, this drops it
    /// from storage entirely so the dispatch loop does not immediately pick
    /// it back up.
    fn send_terminate<'s, 'a>(
        &'s self,
        mail: Self::InflightMail,
    ) -> Pin<Box<dyn 'a + Send + Future<Output = Result<(), (Self::InflightMail, Self::Error)>>>>
    where
        's: 'a;
}
