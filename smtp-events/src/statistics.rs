use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Mutex,
    },
};

use dashmap::DashMap;

use crate::Event;

const THROUGHPUT_WINDOW_SECS: i64 = 60;

#[derive(Default)]
struct CommandStats {
    attempts: AtomicU64,
    successes: AtomicU64,
}

#[derive(Default)]
struct PerIp {
    connections: AtomicU64,
    rejections: AtomicU64,
}

/// Built-in listener maintaining the counters a `StatisticsCollector`
/// listener is expected to expose: sessions, messages, per-verb command
/// histograms, bytes transferred, per-IP connection aggregates, per-
/// mechanism authentication outcomes, TLS upgrades, and rejection reasons.
/// Recent-second timestamps are kept to compute throughput over a sliding
/// one-minute window.
pub struct StatisticsCollector {
    sessions: AtomicU64,
    sessions_active: AtomicI64,
    messages_received: AtomicU64,
    messages_cancelled: AtomicU64,
    bytes_transferred: AtomicU64,
    tls_upgrades: AtomicU64,
    commands: DashMap<String, CommandStats>,
    auth_successes: DashMap<String, AtomicU64>,
    auth_failures: DashMap<String, AtomicU64>,
    rejection_reasons: DashMap<String, AtomicU64>,
    per_ip: DashMap<IpAddr, PerIp>,
    recent_message_timestamps: Mutex<Vec<chrono::DateTime<chrono::Utc>>>,
}

impl StatisticsCollector {
    pub fn new() -> StatisticsCollector {
        StatisticsCollector {
            sessions: AtomicU64::new(0),
            sessions_active: AtomicI64::new(0),
            messages_received: AtomicU64::new(0),
            messages_cancelled: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            tls_upgrades: AtomicU64::new(0),
            commands: DashMap::new(),
            auth_successes: DashMap::new(),
            auth_failures: DashMap::new(),
            rejection_reasons: DashMap::new(),
            per_ip: DashMap::new(),
            recent_message_timestamps: Mutex::new(Vec::new()),
        }
    }

    /// Registers this collector as a listener on `bus`. Keep the returned
    /// `Arc` around to later read the counters back out.
    pub fn attach(self: &std::sync::Arc<Self>, bus: &crate::EventBus) {
        let this = self.clone();
        bus.register(move |event| this.record(event));
    }

    fn record(&self, event: &Event) {
        match event {
            Event::SessionCreated { peer } => {
                self.sessions.fetch_add(1, Ordering::Relaxed);
                self.sessions_active.fetch_add(1, Ordering::Relaxed);
                self.per_ip
                    .entry(*peer)
                    .or_insert_with(Default::default)
                    .connections
                    .fetch_add(1, Ordering::Relaxed);
            }
            Event::SessionCompleted => {
                self.sessions_active.fetch_sub(1, Ordering::Relaxed);
            }
            Event::CommandExecuted { verb, success, .. } => {
                let stats = self.commands.entry(verb.clone()).or_insert_with(Default::default);
                stats.attempts.fetch_add(1, Ordering::Relaxed);
                if *success {
                    stats.successes.fetch_add(1, Ordering::Relaxed);
                }
            }
            Event::AuthenticationSucceeded { mechanism, .. } => {
                self.auth_successes
                    .entry(mechanism.clone())
                    .or_insert_with(Default::default)
                    .fetch_add(1, Ordering::Relaxed);
            }
            Event::AuthenticationFailed { mechanism } => {
                self.auth_failures
                    .entry(mechanism.clone())
                    .or_insert_with(Default::default)
                    .fetch_add(1, Ordering::Relaxed);
            }
            Event::TlsNegotiationCompleted => {
                self.tls_upgrades.fetch_add(1, Ordering::Relaxed);
            }
            Event::DataTransferCompleted { bytes, success, .. } => {
                if *success {
                    self.bytes_transferred.fetch_add(*bytes, Ordering::Relaxed);
                }
            }
            Event::MessageReceived { cancel } => {
                if *cancel {
                    self.messages_cancelled.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.messages_received.fetch_add(1, Ordering::Relaxed);
                    let mut ts = self
                        .recent_message_timestamps
                        .lock()
                        .expect("statistics mutex poisoned");
                    ts.push(chrono::Utc::now());
                }
            }
            Event::ConnectionRejected { peer, reason } => {
                self.per_ip
                    .entry(*peer)
                    .or_insert_with(Default::default)
                    .rejections
                    .fetch_add(1, Ordering::Relaxed);
                self.rejection_reasons
                    .entry(reason.clone())
                    .or_insert_with(Default::default)
                    .fetch_add(1, Ordering::Relaxed);
            }
            Event::RateLimitExceeded { .. } => {
                self.rejection_reasons
                    .entry("rate_limited".to_string())
                    .or_insert_with(Default::default)
                    .fetch_add(1, Ordering::Relaxed);
            }
            _ => (),
        }
    }

    pub fn sessions_total(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    pub fn sessions_active(&self) -> i64 {
        self.sessions_active.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    /// Messages accepted in the last sixty seconds, pruning older entries
    /// as a side effect.
    pub fn messages_per_minute(&self) -> usize {
        let now = chrono::Utc::now();
        let mut ts = self
            .recent_message_timestamps
            .lock()
            .expect("statistics mutex poisoned");
        ts.retain(|t| (now - *t).num_seconds() <= THROUGHPUT_WINDOW_SECS);
        ts.len()
    }

    pub fn command_counts(&self, verb: &str) -> (u64, u64) {
        self.commands
            .get(verb)
            .map(|s| {
                (
                    s.attempts.load(Ordering::Relaxed),
                    s.successes.load(Ordering::Relaxed),
                )
            })
            .unwrap_or((0, 0))
    }
}

impl Default for StatisticsCollector {
    fn default() -> StatisticsCollector {
        StatisticsCollector::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventBus;
    use std::sync::Arc;

    #[test]
    fn tracks_sessions_and_messages() {
        let bus = EventBus::new();
        let stats = Arc::new(StatisticsCollector::new());
        stats.attach(&bus);

        let peer: IpAddr = "10.0.0.1".parse().unwrap();
        bus.fire(Event::SessionCreated { peer });
        bus.fire(Event::MessageReceived { cancel: false });
        bus.fire(Event::SessionCompleted);

        assert_eq!(stats.sessions_total(), 1);
        assert_eq!(stats.sessions_active(), 0);
        assert_eq!(stats.messages_received(), 1);
        assert_eq!(stats.messages_per_minute(), 1);
    }
}
