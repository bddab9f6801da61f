//! Idle connection pool keyed by target identity.
//!
//! Connections are parked after a reusable HTTP/1.1 exchange and handed out
//! again to requests with an identical [`Target`]. Acquire removes the entry
//! from the map, so a connection is never shared. Sockets are probed and
//! closed outside the lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, trace};

use crate::config::PoolConfig;
use crate::metrics;
use crate::target::Target;
use crate::transport::{Connection, Liveness};

struct PoolEntry {
    conn: Connection,
    idle_since: Instant,
}

pub struct ConnectionPool {
    config: PoolConfig,
    /// Oldest entry first.
    idle: Mutex<HashMap<Target, Vec<PoolEntry>>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Take the most recently parked live connection for `target`.
    ///
    /// Expired entries are closed. Entries whose probe reports EOF or stray
    /// bytes are discarded and the search continues.
    pub fn acquire(&self, target: &Target) -> Option<Connection> {
        loop {
            let (entry, expired) = self.take_newest(target);
            for stale in expired {
                trace!(%target, "idle connection expired");
                self.evict(stale.conn);
            }
            let mut conn = entry?.conn;
            match conn.probe() {
                Liveness::Alive => {
                    conn.from_pool = true;
                    conn.should_store = false;
                    debug!(%target, "reusing pooled connection");
                    return Some(conn);
                }
                liveness => {
                    debug!(%target, ?liveness, "discarding dead pooled connection");
                    self.evict(conn);
                }
            }
        }
    }

    fn take_newest(&self, target: &Target) -> (Option<PoolEntry>, Vec<PoolEntry>) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = idle.get_mut(target) else {
            return (None, Vec::new());
        };

        let mut expired = Vec::new();
        if let Some(timeout) = self.config.idle_timeout() {
            let now = Instant::now();
            let live_from = entries
                .iter()
                .position(|e| now.saturating_duration_since(e.idle_since) < timeout)
                .unwrap_or(entries.len());
            expired = entries.drain(..live_from).collect();
        }
        let newest = entries.pop();
        if entries.is_empty() {
            idle.remove(target);
        }
        drop(idle);

        let taken = expired.len() + usize::from(newest.is_some());
        metrics::CONNECTIONS_IDLE.sub(taken as i64);
        (newest, expired)
    }

    /// Park `conn` if its last exchange left it reusable, otherwise close
    /// it. Beyond `max_idle_per_target` the oldest entry is closed.
    pub fn release_idle(&self, mut conn: Connection) {
        if !self.config.enabled || !conn.should_store || conn.timed_out || !conn.is_open() {
            self.evict(conn);
            return;
        }
        conn.validated = false;
        conn.from_pool = false;

        let target = conn.target().clone();
        let overflow = {
            let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            let entries = idle.entry(target.clone()).or_default();
            entries.push(PoolEntry {
                conn,
                idle_since: Instant::now(),
            });
            metrics::CONNECTIONS_IDLE.increment();
            (entries.len() > self.config.max_idle_per_target).then(|| entries.remove(0))
        };
        trace!(%target, "connection parked");

        if let Some(oldest) = overflow {
            metrics::CONNECTIONS_IDLE.decrement();
            debug!(%target, "idle cap reached, closing oldest connection");
            self.evict(oldest.conn);
        }
    }

    /// Close `conn` unconditionally.
    pub fn evict(&self, mut conn: Connection) {
        trace!(target = %conn.target(), "evicting connection");
        conn.close();
        metrics::CONNECTIONS_EVICTED.increment();
    }

    /// Close every idle connection.
    pub fn clear(&self) {
        let drained: Vec<PoolEntry> = {
            let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            idle.drain().flat_map(|(_, entries)| entries).collect()
        };
        metrics::CONNECTIONS_IDLE.sub(drained.len() as i64);
        for entry in drained {
            self.evict(entry.conn);
        }
    }

    /// Idle connections currently parked for `target`.
    pub fn idle_count(&self, target: &Target) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(target)
            .map_or(0, Vec::len)
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.clear();
    }
}
