use std::io;

use smtp_message::{Email, Hostname, Reply};

/// Result of a policy hook, generic over the payload carried on acceptance.
#[must_use]
#[derive(Debug)]
pub enum Decision<T> {
    Accept {
        reply: Reply,
        res: T,
    },
    Reject {
        reply: Reply,
    },
    Kill {
        reply: Option<Reply>,
        res: io::Result<()>,
    },
}

/// Like [`Decision`], but for hooks that only ever produce a reply (no
/// side payload to carry on acceptance).
#[must_use]
#[derive(Debug)]
pub enum DecisionWithResponse {
    Accept(Reply),
    Reject(Reply),
    Kill {
        reply: Option<Reply>,
        res: io::Result<()>,
    },
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct MailMetadata<U> {
    pub user: U,
    pub from: Option<Email>,
    pub to: Vec<Email>,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct HelloInfo {
    pub is_ehlo: bool,
    pub hostname: Hostname,
}

/// Result of a successful `AUTH` exchange, attached to a session once the
/// client has authenticated.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AuthInfo {
    pub mechanism: String,
    pub authenticated_as: String,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct ConnectionMetadata<U> {
    pub user: U,
    pub hello: Option<HelloInfo>,
    pub is_encrypted: bool,
    pub auth: Option<AuthInfo>,
}

bitflags::bitflags! {
    /// ESMTP extensions a given session has advertised or negotiated.
    #[derive(Default)]
    pub struct Extensions: u8 {
        const STARTTLS = 0b0000_0001;
        const AUTH = 0b0000_0010;
        const EIGHT_BIT_MIME = 0b0000_0100;
        const ENHANCED_STATUS_CODES = 0b0000_1000;
        const PIPELINING = 0b0001_0000;
        const SMTP_UTF8 = 0b0010_0000;
    }
}

/// Opaque identifier for a single accepted TCP connection, used to correlate
/// log lines and event-bus notifications for that connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    #[inline]
    pub fn new(id: u64) -> SessionId {
        SessionId(id)
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_displays_with_prefix() {
        assert_eq!(SessionId::new(42).to_string(), "session-42");
    }

    #[test]
    fn extensions_compose() {
        let ext = Extensions::STARTTLS | Extensions::AUTH;
        assert!(ext.contains(Extensions::STARTTLS));
        assert!(ext.contains(Extensions::AUTH));
        assert!(!ext.contains(Extensions::PIPELINING));
    }
}
