use std::{
    net::IpAddr,
    sync::Mutex,
    time::{Duration, Instant},
};

use dashmap::DashMap;

/// How long an idle (`active == 0`) per-IP entry survives before the reaper
/// is allowed to remove it.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// How often the reaper sweeps the table.
pub const REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct Entry {
    active: u32,
    last_access: Instant,
    marked_for_removal: bool,
}

/// Per-IP concurrent connection tracker, gating admission at
/// `MaxConnectionsPerIP`.
///
/// Acquire/release each take the per-entry lock only for the instant it
/// takes to check and update three fields; the outer map is a concurrent
/// hash map so unrelated IPs never contend. A background reaper removes
/// entries for IPs that have gone idle, in two passes (mark, then sweep
/// still-marked entries) so that a release racing a fresh acquire can never
/// observe its entry vanish out from under it.
pub struct ConnectionCounter {
    limit: u32,
    table: DashMap<IpAddr, Mutex<Entry>>,
}

#[derive(Debug)]
pub struct Acquired {
    ip: IpAddr,
}

impl Acquired {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl ConnectionCounter {
    pub fn new(limit: u32) -> ConnectionCounter {
        ConnectionCounter {
            limit,
            table: DashMap::new(),
        }
    }

    /// Tries to reserve one connection slot for `ip`. Returns `None` if the
    /// per-IP limit is already reached. Callers must pass the returned
    /// [`Acquired`] back to [`ConnectionCounter::release`] once the
    /// connection closes.
    pub fn acquire(&self, ip: IpAddr) -> Option<Acquired> {
        let entry = self
            .table
            .entry(ip)
            .or_insert_with(|| {
                Mutex::new(Entry {
                    active: 0,
                    last_access: Instant::now(),
                    marked_for_removal: false,
                })
            });
        let mut entry = entry.lock().expect("connection counter mutex poisoned");
        if entry.active >= self.limit || entry.marked_for_removal {
            None
        } else {
            entry.active += 1;
            entry.last_access = Instant::now();
            Some(Acquired { ip })
        }
    }

    pub fn release(&self, acquired: Acquired) {
        if let Some(entry) = self.table.get(&acquired.ip) {
            let mut entry = entry.lock().expect("connection counter mutex poisoned");
            entry.active = entry.active.saturating_sub(1);
            entry.last_access = Instant::now();
        }
    }

    pub fn active(&self, ip: IpAddr) -> u32 {
        self.table
            .get(&ip)
            .map(|e| e.lock().expect("connection counter mutex poisoned").active)
            .unwrap_or(0)
    }

    /// Removes table entries that have been idle for at least
    /// [`IDLE_TIMEOUT`], in two passes: the first marks candidates, the
    /// second removes only entries still marked (and still idle) by the
    /// time it runs. Run this periodically, e.g. every [`REAP_INTERVAL`].
    pub fn reap(&self) {
        let now = Instant::now();
        let mut candidates = Vec::new();
        for entry in self.table.iter() {
            let mut e = entry.lock().expect("connection counter mutex poisoned");
            if e.active == 0 && now.duration_since(e.last_access) >= IDLE_TIMEOUT {
                e.marked_for_removal = true;
                candidates.push(*entry.key());
            }
        }
        for ip in candidates {
            let should_remove = self.table.get(&ip).map_or(false, |entry| {
                let e = entry.lock().expect("connection counter mutex poisoned");
                e.marked_for_removal && e.active == 0
            });
            if should_remove {
                self.table.remove(&ip);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforces_per_ip_limit() {
        let counter = ConnectionCounter::new(2);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let a = counter.acquire(ip).expect("first should succeed");
        let b = counter.acquire(ip).expect("second should succeed");
        assert!(counter.acquire(ip).is_none(), "third should be refused");
        counter.release(a);
        let c = counter.acquire(ip).expect("after release should succeed");
        counter.release(b);
        counter.release(c);
    }

    #[test]
    fn distinct_ips_do_not_contend() {
        let counter = ConnectionCounter::new(1);
        let a: IpAddr = "1.2.3.4".parse().unwrap();
        let b: IpAddr = "5.6.7.8".parse().unwrap();
        let ga = counter.acquire(a).expect("a should succeed");
        let gb = counter.acquire(b).expect("b should succeed");
        counter.release(ga);
        counter.release(gb);
    }
}
