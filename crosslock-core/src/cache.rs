//! In-memory hot cache.
//!
//! Advisory mirror of the authoritative store: a miss or stale entry always
//! degrades to a repository read. Holds non-terminal swaps (terminal swaps
//! linger for a grace period), raw chain events, and recent admin query
//! results.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::event::ChainEvent;
use crate::swap::SwapSession;

#[derive(Debug)]
pub struct HotCache {
    swaps: DashMap<String, (SwapSession, Instant, Option<Duration>)>,
    events: DashMap<String, (ChainEvent, Instant)>,
    queries: DashMap<String, (serde_json::Value, Instant)>,
    event_ttl: Duration,
    query_ttl: Duration,
    terminal_grace: Duration,
}

impl HotCache {
    pub fn new(event_ttl: Duration, query_ttl: Duration, terminal_grace: Duration) -> Self {
        Self {
            swaps: DashMap::new(),
            events: DashMap::new(),
            queries: DashMap::new(),
            event_ttl,
            query_ttl,
            terminal_grace,
        }
    }

    pub fn get_swap(&self, swap_id: &str) -> Option<SwapSession> {
        if let Some(entry) = self.swaps.get(swap_id) {
            match entry.2 {
                Some(ttl) if entry.1.elapsed() >= ttl => {}
                _ => return Some(entry.0.clone()),
            }
        }
        self.swaps.remove(swap_id);
        None
    }

    /// Caches a swap. Terminal swaps get the grace-period TTL so late
    /// readers still see the final state before eviction.
    pub fn set_swap(&self, swap: SwapSession) {
        let ttl = if swap.status.is_terminal() {
            Some(self.terminal_grace)
        } else {
            None
        };
        self.swaps
            .insert(swap.swap_id.clone(), (swap, Instant::now(), ttl));
    }

    pub fn remove_swap(&self, swap_id: &str) {
        self.swaps.remove(swap_id);
    }

    pub fn get_event(&self, key: &str) -> Option<ChainEvent> {
        if let Some(entry) = self.events.get(key) {
            if entry.1.elapsed() < self.event_ttl {
                return Some(entry.0.clone());
            }
        }
        self.events.remove(key);
        None
    }

    pub fn set_event(&self, event: &ChainEvent) {
        self.events
            .insert(event.idempotency_key(), (event.clone(), Instant::now()));
    }

    pub fn get_query(&self, key: &str) -> Option<serde_json::Value> {
        if let Some(entry) = self.queries.get(key) {
            if entry.1.elapsed() < self.query_ttl {
                return Some(entry.0.clone());
            }
        }
        self.queries.remove(key);
        None
    }

    pub fn set_query(&self, key: String, value: serde_json::Value) {
        self.queries.insert(key, (value, Instant::now()));
    }

    pub fn invalidate_queries(&self) {
        self.queries.clear();
    }

    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.swaps.retain(|_, (_, inserted, ttl)| match ttl {
            Some(ttl) => now.duration_since(*inserted) < *ttl,
            None => true,
        });
        self.events
            .retain(|_, (_, inserted)| now.duration_since(*inserted) < self.event_ttl);
        self.queries
            .retain(|_, (_, inserted)| now.duration_since(*inserted) < self.query_ttl);
    }

    pub fn swap_count(&self) -> usize {
        self.swaps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Chain;
    use crate::swap::{NewSwap, SwapStatus};
    use chrono::Utc;

    fn hex32(byte: u8) -> String {
        format!("0x{}", hex::encode([byte; 32]))
    }

    fn swap() -> SwapSession {
        NewSwap {
            source_chain: Chain::Evm,
            source_contract_id: &hex32(0xaa),
            hashlock: &hex32(0xbb),
            initiator: "0x01",
            receiver: "0x02",
            token: "0x00",
            amount: "1000",
            timelock: (Utc::now().timestamp() + 600) as u64,
            source_tx_hash: &hex32(0x11),
        }
        .build()
        .unwrap()
    }

    fn cache() -> HotCache {
        HotCache::new(
            Duration::from_secs(60),
            Duration::from_millis(10),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_non_terminal_swap_survives() {
        let cache = cache();
        let s = swap();
        let id = s.swap_id.clone();
        cache.set_swap(s);
        std::thread::sleep(Duration::from_millis(20));
        cache.cleanup_expired();
        assert!(cache.get_swap(&id).is_some());
    }

    #[test]
    fn test_terminal_swap_evicted_after_grace() {
        let cache = cache();
        let mut s = swap();
        s.transition(SwapStatus::SourceLocked).unwrap();
        s.transition(SwapStatus::Failed).unwrap();
        let id = s.swap_id.clone();
        cache.set_swap(s);
        assert!(cache.get_swap(&id).is_some());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get_swap(&id).is_none());
    }

    #[test]
    fn test_query_cache_expires() {
        let cache = cache();
        cache.set_query("swaps:all".into(), serde_json::json!([1, 2, 3]));
        assert!(cache.get_query("swaps:all").is_some());
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get_query("swaps:all").is_none());
    }
}
