//! forelay/src/metrics.rs
//! Session-level traffic counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub total_conn: AtomicU64,
    pub active_conn: AtomicU64,
    pub bytes_to_upstream: AtomicU64,
    pub bytes_to_client: AtomicU64,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_conn: u64,
    pub active_conn: u64,
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
}

impl Metrics {
    pub fn conn_opened(&self) {
        self.total_conn.fetch_add(1, Ordering::SeqCst);
        self.active_conn.fetch_add(1, Ordering::SeqCst);
    }

    pub fn conn_closed(&self) {
        self.active_conn.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn add_transfer(&self, to_upstream: u64, to_client: u64) {
        self.bytes_to_upstream.fetch_add(to_upstream, Ordering::SeqCst);
        self.bytes_to_client.fetch_add(to_client, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_conn: self.total_conn.load(Ordering::SeqCst),
            active_conn: self.active_conn.load(Ordering::SeqCst),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::SeqCst),
            bytes_to_client: self.bytes_to_client.load(Ordering::SeqCst),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::default();
        m.conn_opened();
        m.conn_opened();
        m.conn_closed();
        m.add_transfer(100, 250);
        let snap = m.snapshot();
        assert_eq!(snap.total_conn, 2);
        assert_eq!(snap.active_conn, 1);
        assert_eq!(snap.bytes_to_upstream, 100);
        assert_eq!(snap.bytes_to_client, 250);
    }

    #[test]
    fn snapshot_serializes() {
        let m = Metrics::default();
        m.conn_opened();
        let json = m.to_json();
        assert!(json.contains("\"total_conn\":1"));
    }
}
