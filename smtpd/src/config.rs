use std::{collections::HashMap, net::IpAddr, time::Duration};

use async_trait::async_trait;
use ipnet::IpNet;
use smtp_message::Email;

/// Plain-data snapshot of every recognized configuration key. Filled in
/// with its documented defaults by [`Configuration::default`]; callers
/// override whichever fields they care about before building the server.
#[derive(Clone, Debug)]
pub struct Configuration {
    pub port: u16,
    pub endpoints: Vec<String>,
    pub server_name: String,
    pub greeting: String,

    pub max_message_size: usize,
    pub max_recipients: usize,
    pub max_connections: u32,
    pub max_connections_per_ip: u32,

    pub require_authentication: bool,
    pub allow_plain_text_authentication: bool,

    pub require_secure_connection: bool,

    pub enable_pipelining: bool,
    pub enable_8bitmime: bool,
    pub enable_smtputf8: bool,
    pub enable_size_extension: bool,

    pub connection_timeout: Duration,
    pub command_timeout: Duration,
    pub data_timeout: Duration,

    pub rate_limit_per_minute: Option<u32>,

    /// Sessions whose cumulative `AntiSpamCheck` score reaches this are
    /// rejected outright during `DATA`.
    pub spam_reject_threshold: i64,

    pub relay: RelayConfiguration,
}

#[derive(Clone, Debug)]
pub struct RelayConfiguration {
    pub enabled: bool,
    pub require_authentication: bool,
    /// Peer networks allowed to relay through this server without
    /// authenticating, e.g. the operator's own LAN.
    pub relay_networks: Vec<IpNet>,
    pub default_smart_host: Option<String>,
    /// Per-destination-domain smart hosts, consulted before
    /// `default_smart_host` and MX routing.
    pub domain_routing: HashMap<String, String>,
    /// Smart hosts tried in order once `domain_routing` and
    /// `default_smart_host` don't apply to a given destination.
    pub smart_hosts: Vec<String>,
    pub use_mx_routing: bool,
    /// Resolvers consulted for MX lookups; empty means "use the system
    /// resolver configuration".
    pub dns_servers: Vec<IpAddr>,
    pub max_concurrent_deliveries: usize,
    pub max_retry_count: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub message_lifetime: Duration,
    pub enable_bounce_messages: bool,
    pub bounce_sender: String,
    pub local_domain: String,
}

impl RelayConfiguration {
    /// Looks up the smart host a message to `domain` should be routed
    /// through, following the precedence from spec §4.4: a domain-specific
    /// route first, then the default smart host, then the (ordered) smart
    /// host list. Returns `None` when none of those apply, meaning the
    /// caller should fall back to MX routing (or refuse if that's also
    /// disabled).
    pub fn smart_host_for(&self, domain: &str) -> Option<&str> {
        self.domain_routing
            .get(domain)
            .map(String::as_str)
            .or(self.default_smart_host.as_deref())
            .or_else(|| self.smart_hosts.first().map(String::as_str))
    }
}

impl Default for Configuration {
    fn default() -> Configuration {
        Configuration {
            port: 25,
            endpoints: vec!["0.0.0.0".to_string()],
            server_name: "localhost".to_string(),
            greeting: "ESMTP ready".to_string(),

            max_message_size: 32 * 1024 * 1024,
            max_recipients: 100,
            max_connections: 1000,
            max_connections_per_ip: 10,

            require_authentication: false,
            allow_plain_text_authentication: false,

            require_secure_connection: false,

            enable_pipelining: true,
            enable_8bitmime: true,
            enable_smtputf8: true,
            enable_size_extension: true,

            connection_timeout: Duration::from_secs(5 * 60),
            command_timeout: Duration::from_secs(60),
            data_timeout: Duration::from_secs(10 * 60),

            rate_limit_per_minute: None,
            spam_reject_threshold: 10,

            relay: RelayConfiguration::default(),
        }
    }
}

impl Configuration {
    /// Whether a session from `peer`, having authenticated or not per
    /// `authenticated`, is allowed to enqueue mail for delivery elsewhere
    /// (spec §4.4's enqueue contract: authenticated sessions, or sessions
    /// from a configured relay network, may relay; everyone else may only
    /// submit mail the `MailboxFilter` accepts for local delivery).
    pub fn peer_may_relay(&self, peer: IpAddr, authenticated: bool) -> bool {
        if authenticated {
            return true;
        }
        if self.relay.require_authentication {
            return false;
        }
        self.relay
            .relay_networks
            .iter()
            .any(|net| net.contains(&peer))
    }
}

impl Default for RelayConfiguration {
    fn default() -> RelayConfiguration {
        RelayConfiguration {
            enabled: false,
            require_authentication: false,
            relay_networks: Vec::new(),
            default_smart_host: None,
            domain_routing: HashMap::new(),
            smart_hosts: Vec::new(),
            use_mx_routing: true,
            dns_servers: Vec::new(),
            max_concurrent_deliveries: 10,
            max_retry_count: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(4 * 3600),
            message_lifetime: Duration::from_secs(5 * 24 * 3600),
            enable_bounce_messages: true,
            bounce_sender: "postmaster".to_string(),
            local_domain: "localhost".to_string(),
        }
    }
}

/// Outcome of [`Authenticator::authenticate`].
pub enum AuthOutcome {
    Success { identity: String },
    Failure { reason: String },
}

/// External collaborator deciding whether a set of PLAIN/LOGIN credentials
/// identifies a real user. The default `DenyAll` implementation is the safe
/// choice for a server that does not want to accept `AUTH` at all.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> AuthOutcome;
}

pub struct DenyAllAuthenticator;

#[async_trait]
impl Authenticator for DenyAllAuthenticator {
    async fn authenticate(&self, _username: &str, _password: &str) -> AuthOutcome {
        AuthOutcome::Failure {
            reason: "authentication is not configured".to_string(),
        }
    }
}

/// External collaborator deciding sender/recipient acceptance, independent
/// of mailbox existence (that's the message store's job via `save`'s
/// return value).
pub trait MailboxFilter: Send + Sync {
    fn can_accept_from(&self, peer: IpAddr, sender: Option<&Email>, message_size: usize) -> bool;
    fn can_deliver_to(&self, recipient: &Email, sender: Option<&Email>) -> bool;
}

pub struct AllowAllMailboxFilter;

impl MailboxFilter for AllowAllMailboxFilter {
    fn can_accept_from(&self, _peer: IpAddr, _sender: Option<&Email>, _message_size: usize) -> bool {
        true
    }

    fn can_deliver_to(&self, _recipient: &Email, _sender: Option<&Email>) -> bool {
        true
    }
}

/// One spam-scoring component; the pipeline in `smtpd` sums the scores of
/// every configured checker before comparing against `RejectThreshold`/
/// `TempFailThreshold`.
#[async_trait]
pub trait AntiSpamCheck: Send + Sync {
    async fn check(&self, message: &[u8], peer: IpAddr) -> SpamScore;
}

pub struct SpamScore {
    pub score: i64,
    pub reasons: Vec<String>,
}

/// Scores every message at zero. Useful as a default when no spam filtering
/// pipeline is configured.
pub struct NullAntiSpamCheck;

#[async_trait]
impl AntiSpamCheck for NullAntiSpamCheck {
    async fn check(&self, _message: &[u8], _peer: IpAddr) -> SpamScore {
        SpamScore {
            score: 0,
            reasons: Vec::new(),
        }
    }
}

/// External sink a message is handed to once a session has fully accepted
/// it. `save` must be idempotent: the core may call it again for the same
/// message after a crash recovery.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save(&self, from: Option<&Email>, to: &[Email], data: &[u8]) -> bool;
}

/// Discards everything. Useful as a default when the only intended use of
/// the server is outbound relay.
pub struct NullMessageStore;

#[async_trait]
impl MessageStore for NullMessageStore {
    async fn save(&self, _from: Option<&Email>, _to: &[Email], _data: &[u8]) -> bool {
        true
    }
}
