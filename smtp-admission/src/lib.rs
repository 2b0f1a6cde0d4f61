mod connection_counter;
mod rate_limit;
mod shutdown;

use std::{
    net::IpAddr,
    sync::atomic::{AtomicU32, Ordering},
};

pub use connection_counter::{Acquired, ConnectionCounter, REAP_INTERVAL};
pub use rate_limit::{RateLimitExceeded, RateLimiter, Window};
pub use shutdown::{shutdown_channel, ShutdownToken, ShutdownTrigger};

/// Why a connection was refused before a session was even started.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("too many connections from {0}")]
    TooManyConnections(IpAddr),
    #[error("server is at its global connection limit ({0})")]
    TooManyConnectionsGlobal(u32),
    #[error("rate limit exceeded for {ip}: {current}/{limit} per {window:?}")]
    RateLimited {
        ip: IpAddr,
        current: u32,
        limit: u32,
        window: std::time::Duration,
    },
    #[error("server is shutting down")]
    ShuttingDown,
}

/// Everything the accept loop consults before handing a freshly-accepted
/// socket off to a session: the global connection cap, the per-IP cap, the
/// rate limiter, and the shutdown signal.
pub struct Admission {
    max_connections: u32,
    total: AtomicU32,
    counter: ConnectionCounter,
    limiter: RateLimiter<IpAddr>,
    shutdown: ShutdownToken,
}

impl Admission {
    pub fn new(
        max_connections: u32,
        max_connections_per_ip: u32,
        rate_limit: u32,
        rate_window: Window,
        shutdown: ShutdownToken,
    ) -> Admission {
        Admission {
            max_connections,
            total: AtomicU32::new(0),
            counter: ConnectionCounter::new(max_connections_per_ip),
            limiter: RateLimiter::new(rate_limit, rate_window),
            shutdown,
        }
    }

    /// Tries to admit a new connection from `ip`. On success, the caller
    /// must pass the returned [`Acquired`] to [`Admission::release`] once
    /// the connection is done.
    pub fn try_admit(&self, ip: IpAddr) -> Result<Acquired, AdmissionError> {
        if self.shutdown.is_shutting_down() {
            return Err(AdmissionError::ShuttingDown);
        }
        if self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n >= self.max_connections {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .is_err()
        {
            return Err(AdmissionError::TooManyConnectionsGlobal(
                self.max_connections,
            ));
        }
        let acquired = match self.counter.acquire(ip) {
            Some(acquired) => acquired,
            None => {
                self.total.fetch_sub(1, Ordering::SeqCst);
                return Err(AdmissionError::TooManyConnections(ip));
            }
        };
        if let Err(e) = self.limiter.check_and_increment(ip) {
            self.counter.release(acquired);
            self.total.fetch_sub(1, Ordering::SeqCst);
            return Err(AdmissionError::RateLimited {
                ip,
                current: e.current,
                limit: e.limit,
                window: e.window,
            });
        }
        Ok(acquired)
    }

    pub fn release(&self, acquired: Acquired) {
        self.counter.release(acquired);
        self.total.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Runs the per-IP-counter reaper forever, sleeping [`REAP_INTERVAL`]
    /// between sweeps. Intended to be spawned once onto the executor
    /// alongside the accept loop.
    pub async fn run_reaper(&self) {
        loop {
            smol::Timer::after(REAP_INTERVAL).await;
            self.counter.reap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_refuses_new_connections() {
        smol::block_on(async {
            let (trigger, token) = shutdown_channel();
            let admission = Admission::new(1000, 10, 100, Window::Minute, token);
            let ip: IpAddr = "1.2.3.4".parse().unwrap();
            assert!(admission.try_admit(ip).is_ok());
            trigger.shutdown();
            // Let the close propagate.
            smol::Timer::after(std::time::Duration::from_millis(1)).await;
            match admission.try_admit(ip) {
                Err(AdmissionError::ShuttingDown) => (),
                other => panic!("expected ShuttingDown, got {:?}", other),
            }
        });
    }

    #[test]
    fn enforces_global_limit_across_distinct_ips() {
        smol::block_on(async {
            let (_trigger, token) = shutdown_channel();
            let admission = Admission::new(1, 10, 100, Window::Minute, token);
            let a: IpAddr = "1.2.3.4".parse().unwrap();
            let b: IpAddr = "5.6.7.8".parse().unwrap();
            let acquired = admission.try_admit(a).expect("first should succeed");
            match admission.try_admit(b) {
                Err(AdmissionError::TooManyConnectionsGlobal(1)) => (),
                other => panic!("expected TooManyConnectionsGlobal, got {:?}", other),
            }
            admission.release(acquired);
            admission.try_admit(b).expect("should succeed after release");
        });
    }
}
