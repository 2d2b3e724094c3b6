//! forelay/src/blacklist.rs
//! Short-term exclusion of upstreams that recently failed to connect.

use crate::types::UpstreamDirective;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::warn;

/// Tracks temporarily unreachable upstreams. An entry is active until its
/// expiry; expired entries are removed lazily on lookup.
pub struct Blacklist {
    entries: DashMap<UpstreamDirective, Instant>,
    cooldown: Duration,
}

impl Blacklist {
    pub fn new(cooldown: Duration) -> Self {
        Blacklist {
            entries: DashMap::new(),
            cooldown,
        }
    }

    /// Records a connect failure; the directive is skipped until the
    /// cooldown elapses. Auth failures must never end up here.
    pub fn mark_bad(&self, directive: &UpstreamDirective) {
        if self.cooldown.is_zero() {
            return;
        }
        warn!(%directive, cooldown = ?self.cooldown, "blacklisting upstream");
        self.entries
            .insert(directive.clone(), Instant::now() + self.cooldown);
    }

    pub fn is_bad(&self, directive: &UpstreamDirective) -> bool {
        if let Some(entry) = self.entries.get(directive) {
            if *entry > Instant::now() {
                return true;
            }
            // Release the shard guard before removing the expired entry.
            drop(entry);
            self.entries.remove(directive);
        }
        false
    }

    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, expiry| *expiry > now);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of currently active entries.
    pub fn active_len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| *e.value() > now).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directive() -> UpstreamDirective {
        UpstreamDirective::Http {
            host: "dead".into(),
            port: 8080,
        }
    }

    #[test]
    fn marked_directive_is_bad_until_expiry() {
        let bl = Blacklist::new(Duration::from_millis(30));
        assert!(!bl.is_bad(&directive()));
        bl.mark_bad(&directive());
        assert!(bl.is_bad(&directive()));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!bl.is_bad(&directive()));
        // Lazy removal took the entry out.
        assert_eq!(bl.active_len(), 0);
    }

    #[test]
    fn entries_are_keyed_by_kind_and_endpoint() {
        let bl = Blacklist::new(Duration::from_secs(60));
        bl.mark_bad(&directive());
        let same_endpoint_socks = UpstreamDirective::Socks5 {
            host: "dead".into(),
            port: 8080,
        };
        assert!(bl.is_bad(&directive()));
        assert!(!bl.is_bad(&same_endpoint_socks));
    }

    #[test]
    fn zero_cooldown_disables_blacklisting() {
        let bl = Blacklist::new(Duration::ZERO);
        bl.mark_bad(&directive());
        assert!(!bl.is_bad(&directive()));
    }

    #[test]
    fn cleanup_sweeps_expired_entries() {
        let bl = Blacklist::new(Duration::from_millis(10));
        bl.mark_bad(&directive());
        std::thread::sleep(Duration::from_millis(20));
        bl.cleanup_expired();
        assert_eq!(bl.active_len(), 0);
    }
}
