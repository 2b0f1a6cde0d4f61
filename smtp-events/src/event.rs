use std::{net::IpAddr, time::Duration};

use chrono::{DateTime, Utc};

/// Something that happened in a session or at the admission layer, fired
/// through an [`crate::bus::EventBus`] for every registered listener to
/// observe (and, for the handful of variants that carry a `cancel` flag,
/// to veto).
#[derive(Clone, Debug)]
pub enum Event {
    SessionCreated {
        peer: IpAddr,
    },
    CommandReceived {
        verb: String,
        raw: String,
    },
    CommandExecuted {
        verb: String,
        success: bool,
        duration: Duration,
    },
    AuthenticationAttempted {
        mechanism: String,
    },
    AuthenticationSucceeded {
        mechanism: String,
        identity: String,
    },
    AuthenticationFailed {
        mechanism: String,
    },
    TlsNegotiationStarted,
    TlsNegotiationCompleted,
    TlsNegotiationFailed,
    DataTransferStarted {
        from: Option<String>,
        recipients: Vec<String>,
        cancel: bool,
    },
    DataTransferCompleted {
        bytes: u64,
        duration: Duration,
        success: bool,
    },
    MessageReceived {
        cancel: bool,
    },
    SessionCompleted,
    ErrorOccurred {
        message: String,
    },
    ConnectionRejected {
        peer: IpAddr,
        reason: String,
    },
    RateLimitExceeded {
        key: String,
        current: u32,
        limit: u32,
        window: Duration,
        reset_at: DateTime<Utc>,
    },
}

impl Event {
    /// Short machine-readable name of the event's kind, used by the
    /// statistics collector and by log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::SessionCreated { .. } => "session_created",
            Event::CommandReceived { .. } => "command_received",
            Event::CommandExecuted { .. } => "command_executed",
            Event::AuthenticationAttempted { .. } => "authentication_attempted",
            Event::AuthenticationSucceeded { .. } => "authentication_succeeded",
            Event::AuthenticationFailed { .. } => "authentication_failed",
            Event::TlsNegotiationStarted => "tls_negotiation_started",
            Event::TlsNegotiationCompleted => "tls_negotiation_completed",
            Event::TlsNegotiationFailed => "tls_negotiation_failed",
            Event::DataTransferStarted { .. } => "data_transfer_started",
            Event::DataTransferCompleted { .. } => "data_transfer_completed",
            Event::MessageReceived { .. } => "message_received",
            Event::SessionCompleted => "session_completed",
            Event::ErrorOccurred { .. } => "error_occurred",
            Event::ConnectionRejected { .. } => "connection_rejected",
            Event::RateLimitExceeded { .. } => "rate_limit_exceeded",
        }
    }
}
