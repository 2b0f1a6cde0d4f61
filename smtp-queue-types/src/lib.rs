use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use smtp_message::Email;

#[derive(Clone, Copy, Debug, serde::Deserialize, serde::Serialize)]
pub struct ScheduleInfo {
    pub at: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
}

impl ScheduleInfo {
    pub fn last_interval(&self) -> Result<Option<Duration>, time::OutOfRangeError> {
        self.last_attempt
            .map(|last| (last - self.at).to_std())
            .transpose()
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Deserialize, serde::Serialize)]
pub struct QueueId(pub Arc<String>);

impl QueueId {
    pub fn new<S: ToString>(s: S) -> QueueId {
        QueueId(Arc::new(s.to_string()))
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Relative urgency of a queued message. Ties within a priority tier are
/// broken by queued-time order (the ready queue is itself FIFO per tier).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, serde::Deserialize, serde::Serialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Priority {
        Priority::Normal
    }
}

/// Coarse lifecycle state of a queued message, derived from its
/// pending/delivered/failed recipient sets rather than stored directly.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum RelayStatus {
    Queued,
    InProgress,
    Deferred,
    Delivered,
    PartiallyDelivered,
    Failed,
    Expired,
    Cancelled,
}

/// The whole-message view of an outbound delivery, fanned out into one
/// per-recipient [`crate`] mail by the queue but tracked here as a single
/// unit so that status reporting and bounce generation see the envelope as
/// a whole rather than as N independent recipients.
///
/// Invariant: `pending`, `delivered` and `failed` partition the original
/// recipient list — every recipient appears in exactly one of the three.
#[derive(Clone, Debug)]
pub struct RelayMessage<M> {
    pub id: QueueId,
    pub metadata: M,
    pub from: Option<Email>,
    pub priority: Priority,
    pub queued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub pending: Vec<Email>,
    pub delivered: Vec<Email>,
    pub failed: Vec<(Email, String)>,
    pub retry_count: u32,
    pub next_delivery: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub smart_host: Option<String>,
    pub cancelled: bool,
    /// Whether the submitted message itself carried an `Auto-Submitted`
    /// header with a value other than `no`. Checked before generating a
    /// bounce for this message, so that a bounce never gets bounced back.
    pub auto_submitted: bool,
}

impl<M> RelayMessage<M> {
    pub fn new(
        id: QueueId,
        metadata: M,
        from: Option<Email>,
        priority: Priority,
        recipients: Vec<Email>,
        queued_at: DateTime<Utc>,
        lifetime: Duration,
        auto_submitted: bool,
    ) -> RelayMessage<M> {
        let lifetime = chrono::Duration::from_std(lifetime).unwrap_or(chrono::Duration::max_value());
        RelayMessage {
            id,
            metadata,
            from,
            priority,
            queued_at,
            expires_at: queued_at + lifetime,
            pending: recipients,
            delivered: Vec::new(),
            failed: Vec::new(),
            retry_count: 0,
            next_delivery: None,
            last_attempt: None,
            last_error: None,
            smart_host: None,
            cancelled: false,
            auto_submitted,
        }
    }

    /// Derives the coarse lifecycle status from the recipient sets and the
    /// clock, per the data model's `pending ∪ delivered ∪ failed` partition
    /// invariant — status is never stored directly.
    pub fn status(&self, now: DateTime<Utc>) -> RelayStatus {
        if self.cancelled {
            return RelayStatus::Cancelled;
        }
        if !self.pending.is_empty() {
            if now > self.expires_at {
                return RelayStatus::Expired;
            }
            return match (self.retry_count, self.next_delivery) {
                (0, _) => RelayStatus::Queued,
                (_, Some(next)) if next > now => RelayStatus::Deferred,
                _ => RelayStatus::InProgress,
            };
        }
        match (self.delivered.is_empty(), self.failed.is_empty()) {
            (false, true) => RelayStatus::Delivered,
            (true, false) => RelayStatus::Failed,
            (false, false) => RelayStatus::PartiallyDelivered,
            (true, true) => RelayStatus::Delivered,
        }
    }

    pub fn is_terminal(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status(now),
            RelayStatus::Delivered
                | RelayStatus::Failed
                | RelayStatus::PartiallyDelivered
                | RelayStatus::Expired
                | RelayStatus::Cancelled
        )
    }
}

/// `base * 2^min(retry_count, 10)`, clamped to `max` and jittered by up to
/// ±10%. `jitter_unit` is expected to be uniform in `[0, 1)`; callers supply
/// it (typically from `rand`) so that this stays a pure, testable function.
pub fn retry_backoff(base: Duration, retry_count: u32, max: Duration, jitter_unit: f64) -> Duration {
    let exp = 1u64 << retry_count.min(10);
    let scaled = base
        .checked_mul(exp as u32)
        .unwrap_or(max)
        .min(max);
    let jitter = 0.9 + jitter_unit.clamp(0.0, 1.0) * 0.2;
    Duration::from_secs_f64(scaled.as_secs_f64() * jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_clamps() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(4 * 3600);
        let d0 = retry_backoff(base, 0, max, 0.5);
        assert!(d0 >= Duration::from_secs(54) && d0 <= Duration::from_secs(66));
        let d_big = retry_backoff(base, 20, max, 0.5);
        assert!(d_big <= max);
    }

    #[test]
    fn priority_orders_urgent_highest() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    fn email(addr: &str) -> Email {
        Email::<String>::parse_bracketed(format!("<{}>", addr).as_bytes()).unwrap()
    }

    #[test]
    fn relay_message_status_follows_partition() {
        let now = Utc::now();
        let mut msg = RelayMessage::new(
            QueueId::new("m1"),
            (),
            None,
            Priority::Normal,
            vec![email("a@x.com"), email("b@x.com")],
            now,
            Duration::from_secs(4 * 24 * 3600),
            false,
        );
        assert_eq!(msg.status(now), RelayStatus::Queued);

        msg.retry_count = 1;
        assert_eq!(msg.status(now), RelayStatus::InProgress);

        msg.pending.clear();
        msg.delivered = vec![email("a@x.com")];
        msg.failed = vec![(email("b@x.com"), "timed out".to_string())];
        assert_eq!(msg.status(now), RelayStatus::PartiallyDelivered);

        msg.cancelled = true;
        assert_eq!(msg.status(now), RelayStatus::Cancelled);
    }

    #[test]
    fn relay_message_expires_with_pending_recipients() {
        let queued_at = Utc::now() - chrono::Duration::days(5);
        let msg = RelayMessage::new(
            QueueId::new("m2"),
            (),
            None,
            Priority::Normal,
            vec![email("a@x.com")],
            queued_at,
            Duration::from_secs(4 * 24 * 3600),
            false,
        );
        assert_eq!(msg.status(Utc::now()), RelayStatus::Expired);
    }
}
