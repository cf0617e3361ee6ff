//! Chain observers.
//!
//! One observer per chain turns raw chain data into canonical
//! [`ChainEvent`]s with at-least-once delivery. Every event passes through
//! the processed-events index before it reaches the bus, so downstream
//! consumers see each on-chain occurrence exactly once. Cursors advance in
//! the same transaction as the events they cover.

pub mod evm;
pub mod movechain;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::bus::BusSender;
use crate::cache::HotCache;
use crate::error::RelayerError;
use crate::event::ChainEvent;
use crate::storage::{RecordOutcome, RelayerStorage};

/// Health snapshot published by each observer for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ObserverHealth {
    pub source: String,
    pub cursor: Option<u64>,
    pub chain_head: Option<u64>,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub live_push: bool,
}

impl ObserverHealth {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            cursor: None,
            chain_head: None,
            consecutive_failures: 0,
            last_success: None,
            live_push: false,
        }
    }

    /// Lag between the chain head and the durable cursor.
    pub fn lag(&self) -> Option<u64> {
        match (self.chain_head, self.cursor) {
            (Some(head), Some(cursor)) => Some(head.saturating_sub(cursor)),
            _ => None,
        }
    }
}

pub type SharedHealth = Arc<RwLock<ObserverHealth>>;

pub async fn mark_success(health: &SharedHealth, cursor: Option<u64>, head: u64) {
    let mut h = health.write().await;
    if cursor.is_some() {
        h.cursor = cursor;
    }
    h.chain_head = Some(head);
    h.consecutive_failures = 0;
    h.last_success = Some(Utc::now());
}

pub async fn mark_failure(health: &SharedHealth) {
    let mut h = health.write().await;
    h.consecutive_failures = h.consecutive_failures.saturating_add(1);
}

/// Bounded exponential backoff with jitter. Persistent failure degrades the
/// health snapshot; it never crashes the service.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(8));
        self.attempt = self.attempt.saturating_add(1);
        let capped = exp.min(self.max);
        let jitter = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4);
        capped + Duration::from_millis(jitter)
    }
}

/// Shared pipeline tail: dedupe the event, advance the cursor atomically,
/// and forward first sightings to the bus.
#[derive(Clone)]
pub struct EventSink {
    pub storage: Arc<RelayerStorage>,
    pub cache: Arc<HotCache>,
    pub bus: BusSender,
    pub source: &'static str,
}

impl EventSink {
    pub async fn deliver(
        &self,
        event: ChainEvent,
        cursor_position: u64,
    ) -> Result<RecordOutcome, RelayerError> {
        let outcome = self
            .storage
            .record_event_with_cursor(&event, self.source, cursor_position)
            .await?;
        match outcome {
            RecordOutcome::Applied => {
                self.cache.set_event(&event);
                self.bus.publish(event).await?;
            }
            RecordOutcome::Duplicate => {
                tracing::debug!(
                    "{}: dropped duplicate event {}",
                    self.source,
                    event.idempotency_key()
                );
            }
        }
        Ok(outcome)
    }

    /// Cursor-only advance for windows that contained no matching events.
    pub async fn advance_empty(&self, cursor_position: u64) -> Result<(), RelayerError> {
        self.storage
            .advance_cursor(self.source, cursor_position)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_is_bounded() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        assert!(first >= Duration::from_millis(100));
        assert!(second >= Duration::from_millis(200));
        for _ in 0..20 {
            let d = backoff.next_delay();
            assert!(d <= Duration::from_secs(5) + Duration::from_millis(1250 + 1));
        }
        backoff.reset();
        assert!(backoff.next_delay() < Duration::from_millis(200));
    }

    #[test]
    fn test_health_lag() {
        let mut health = ObserverHealth::new("evm");
        assert_eq!(health.lag(), None);
        health.cursor = Some(90);
        health.chain_head = Some(100);
        assert_eq!(health.lag(), Some(10));
        health.cursor = Some(110);
        assert_eq!(health.lag(), Some(0));
    }
}
