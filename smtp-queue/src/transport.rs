use async_trait::async_trait;
use futures::io::AsyncRead;

use crate::mail::MailMetadata;

/// Coarse classification of a delivery failure, aligned 1:1 with
/// `smtp_client::TransportErrorSeverity` so that a `Transport` backed by
/// `smtp-client` can map errors over with a single `match`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportFailure {
    /// Failed locally, before anything was sent over the network.
    Local,
    /// Network-level failure that may not recur on retry.
    NetworkTransient,
    /// Remote said to retry this mail later.
    MailTransient,
    /// Remote said to retry delivery to this mailbox later.
    MailboxTransient,
    /// Remote mail system asked for a retry later.
    MailSystemTransient,
    /// Remote permanently refused this mail.
    MailPermanent,
    /// Remote mailbox will never accept this mail.
    MailboxPermanent,
    /// Remote mail system will never accept this mail.
    MailSystemPermanent,
}

impl TransportFailure {
    /// Whether the mail should be retried later, as opposed to bounced.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportFailure::NetworkTransient
                | TransportFailure::MailTransient
                | TransportFailure::MailboxTransient
                | TransportFailure::MailSystemTransient
        )
    }
}

/// Resolves and opens connections to the destinations mails are routed to.
#[async_trait]
pub trait Transport<M>: Send + Sync + 'static {
    type Destination: Send + Sync;
    type Sender: TransportSender<M>;

    async fn destination(
        &self,
        meta: &MailMetadata<M>,
    ) -> Result<Self::Destination, TransportFailure>;

    async fn connect(&self, dest: &Self::Destination) -> Result<Self::Sender, TransportFailure>;
}

/// A single, already-connected delivery channel, reusable across sends.
#[async_trait]
pub trait TransportSender<M>: Send {
    async fn send<Reader>(
        &mut self,
        meta: &MailMetadata<M>,
        mail: Reader,
    ) -> Result<(), TransportFailure>
    where
        Reader: Send + AsyncRead;
}
