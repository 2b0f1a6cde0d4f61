use chrono::{DateTime, Utc};
use smtp_message::Email;
use smtp_queue_types::{Priority, QueueId};

/// Envelope for a single recipient's delivery attempt. A message with
/// multiple recipients is fanned out into one `MailMetadata` per recipient at
/// enqueue time, each tracked (and retried) independently -- the same
/// approach this workspace's filesystem storage already assumes. `parent`
/// ties every per-recipient mail for a single submitted message back to the
/// shared [`crate::RelayMessage`] tracking that message's envelope-wide
/// status, so that per-recipient outcomes can be folded back into it.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct MailMetadata<M> {
    pub from: Option<Email>,
    pub to: Email,
    pub metadata: M,
    pub priority: Priority,
    pub parent: QueueId,
}

pub trait QueuedMail: Send {
    fn id(&self) -> QueueId;
    fn scheduled_at(&self) -> DateTime<Utc>;
    fn last_attempt(&self) -> Option<DateTime<Utc>>;
    fn priority(&self) -> Priority;
}

pub trait InflightMail: Send {
    fn id(&self) -> QueueId;
}
