//! Push hub: fans swap lifecycle transitions out to subscribed clients.
//!
//! The hub is a consumer of the coordinator's lifecycle channel; it never
//! calls back into the coordinator. Each subscriber owns a bounded outbound
//! queue drained by its transport task; a subscriber that cannot keep up is
//! marked dead and reaped instead of stalling anyone else.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::config::PushConfig;
use crate::error::RelayerError;
use crate::swap::SwapSession;

/// Topic-scoped subscription channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    SwapUpdates,
    HtlcEvents,
    SystemEvents,
    WithdrawalEvents,
}

/// What happened to a swap, as published by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    Created,
    Updated,
    StatusChanged,
    Error,
}

#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub swap: SwapSession,
    pub note: Option<String>,
}

/// Wire envelope for every outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub message_type: PushMessageType,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushMessageType {
    Heartbeat,
    SwapCreated,
    SwapUpdated,
    SwapStatusChanged,
    SwapError,
    SwapSubscribed,
    SwapUnsubscribed,
    Error,
}

impl PushMessage {
    pub fn new(message_type: PushMessageType, data: serde_json::Value) -> Self {
        Self {
            message_type,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(PushMessageType::Heartbeat, serde_json::json!({}))
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self::new(
            PushMessageType::Error,
            serde_json::json!({ "message": detail.into() }),
        )
    }

    fn from_lifecycle(event: &LifecycleEvent) -> Self {
        let message_type = match event.kind {
            LifecycleKind::Created => PushMessageType::SwapCreated,
            LifecycleKind::Updated => PushMessageType::SwapUpdated,
            LifecycleKind::StatusChanged => PushMessageType::SwapStatusChanged,
            LifecycleKind::Error => PushMessageType::SwapError,
        };
        let mut data = serde_json::to_value(&event.swap).unwrap_or_default();
        if let (Some(object), Some(note)) = (data.as_object_mut(), &event.note) {
            object.insert("note".into(), serde_json::json!(note));
        }
        Self::new(message_type, data)
    }
}

struct Subscriber {
    sender: mpsc::Sender<PushMessage>,
    topics: HashSet<Topic>,
    swap_ids: HashSet<String>,
    last_seen: DateTime<Utc>,
    alive: bool,
}

/// Session registry and broadcast fan-out.
pub struct PushHub {
    subscribers: DashMap<Uuid, Subscriber>,
    config: PushConfig,
}

impl PushHub {
    pub fn new(config: PushConfig) -> Self {
        Self {
            subscribers: DashMap::new(),
            config,
        }
    }

    /// Registers a session and hands back its outbound queue. The transport
    /// task drains the receiver and owns the socket.
    pub fn register(&self) -> (Uuid, mpsc::Receiver<PushMessage>) {
        let (tx, rx) = mpsc::channel(self.config.send_queue_depth);
        let client_id = Uuid::new_v4();
        self.subscribers.insert(
            client_id,
            Subscriber {
                sender: tx,
                topics: HashSet::new(),
                swap_ids: HashSet::new(),
                last_seen: Utc::now(),
                alive: true,
            },
        );
        tracing::info!("push session registered: {client_id}");
        (client_id, rx)
    }

    pub fn unregister(&self, client_id: &Uuid) {
        if self.subscribers.remove(client_id).is_some() {
            tracing::info!("push session closed: {client_id}");
        }
    }

    pub fn subscribe_topics(&self, client_id: &Uuid, topics: &[Topic]) -> Result<(), RelayerError> {
        let mut entry = self
            .subscribers
            .get_mut(client_id)
            .ok_or_else(|| RelayerError::Push(format!("unknown session {client_id}")))?;
        entry.topics.extend(topics.iter().copied());
        Ok(())
    }

    pub fn unsubscribe_topics(
        &self,
        client_id: &Uuid,
        topics: &[Topic],
    ) -> Result<(), RelayerError> {
        let mut entry = self
            .subscribers
            .get_mut(client_id)
            .ok_or_else(|| RelayerError::Push(format!("unknown session {client_id}")))?;
        for topic in topics {
            entry.topics.remove(topic);
        }
        Ok(())
    }

    pub fn subscribe_swap(&self, client_id: &Uuid, swap_id: &str) -> Result<(), RelayerError> {
        let mut entry = self
            .subscribers
            .get_mut(client_id)
            .ok_or_else(|| RelayerError::Push(format!("unknown session {client_id}")))?;
        entry.swap_ids.insert(swap_id.to_string());
        Ok(())
    }

    pub fn unsubscribe_swap(&self, client_id: &Uuid, swap_id: &str) -> Result<(), RelayerError> {
        let mut entry = self
            .subscribers
            .get_mut(client_id)
            .ok_or_else(|| RelayerError::Push(format!("unknown session {client_id}")))?;
        entry.swap_ids.remove(swap_id);
        Ok(())
    }

    /// Client activity (any inbound frame, including pong).
    pub fn touch(&self, client_id: &Uuid) {
        if let Some(mut entry) = self.subscribers.get_mut(client_id) {
            entry.last_seen = Utc::now();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Direct send to one session. Non-blocking: a full queue marks the
    /// session dead for the reaper.
    pub fn send_to(&self, client_id: &Uuid, message: PushMessage) {
        if let Some(mut entry) = self.subscribers.get_mut(client_id) {
            if entry.sender.try_send(message).is_err() {
                entry.alive = false;
            }
        }
    }

    /// Routes a lifecycle event to every session holding a relevant topic
    /// or an explicit subscription to this swap id.
    pub fn broadcast_lifecycle(&self, event: &LifecycleEvent) {
        use crate::swap::SwapStatus;

        let message = PushMessage::from_lifecycle(event);
        let swap_id = &event.swap.swap_id;
        let withdrawal_related = matches!(
            event.swap.status,
            SwapStatus::PreimageRevealed | SwapStatus::Completed
        );
        for mut entry in self.subscribers.iter_mut() {
            let wants = entry.topics.contains(&Topic::SwapUpdates)
                || entry.swap_ids.contains(swap_id)
                || (event.kind == LifecycleKind::Created
                    && entry.topics.contains(&Topic::HtlcEvents))
                || (withdrawal_related && entry.topics.contains(&Topic::WithdrawalEvents))
                || (event.kind == LifecycleKind::Error
                    && entry.topics.contains(&Topic::SystemEvents));
            if !wants {
                continue;
            }
            if entry.sender.try_send(message.clone()).is_err() {
                entry.alive = false;
            }
        }
    }

    fn sweep(&self) {
        let idle_cutoff = Utc::now()
            - chrono::Duration::seconds(self.config.idle_timeout_secs as i64);
        let mut reaped = Vec::new();
        for mut entry in self.subscribers.iter_mut() {
            if !entry.alive || entry.last_seen < idle_cutoff {
                reaped.push(*entry.key());
                continue;
            }
            if entry.sender.try_send(PushMessage::heartbeat()).is_err() {
                entry.alive = false;
                reaped.push(*entry.key());
            }
        }
        for client_id in reaped {
            self.subscribers.remove(&client_id);
            tracing::info!("push session reaped: {client_id}");
        }
    }

    /// Drives heartbeats/liveness and drains the coordinator's lifecycle
    /// channel until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut lifecycle: mpsc::Receiver<LifecycleEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_secs));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = lifecycle.recv() => {
                    match event {
                        Some(event) => self.broadcast_lifecycle(&event),
                        None => break,
                    }
                }
                _ = heartbeat.tick() => self.sweep(),
                _ = shutdown.changed() => break,
            }
        }

        // Going away: one final error frame, then drop the queues.
        for entry in self.subscribers.iter() {
            let _ = entry.sender.try_send(PushMessage::error("server shutting down"));
        }
        self.subscribers.clear();
        tracing::info!("push hub stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Chain;
    use crate::swap::{NewSwap, SwapStatus};

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

    fn hub() -> PushHub {
        PushHub::new(PushConfig {
            heartbeat_secs: 15,
            idle_timeout_secs: 30,
            send_queue_depth: 4,
        })
    }

    fn lifecycle(kind: LifecycleKind, swap: SwapSession) -> LifecycleEvent {
        LifecycleEvent {
            kind,
            swap,
            note: None,
        }
    }

    #[tokio::test]
    async fn test_topic_subscriber_receives_lifecycle() {
        let hub = hub();
        let (client_id, mut rx) = hub.register();
        hub.subscribe_topics(&client_id, &[Topic::SwapUpdates]).unwrap();

        hub.broadcast_lifecycle(&lifecycle(LifecycleKind::Created, swap()));
        let message = rx.recv().await.unwrap();
        assert_eq!(message.message_type, PushMessageType::SwapCreated);
    }

    #[tokio::test]
    async fn test_swap_id_subscriber_receives_only_its_swap() {
        let hub = hub();
        let (client_id, mut rx) = hub.register();
        let target = swap();
        hub.subscribe_swap(&client_id, &target.swap_id).unwrap();

        // Unrelated swap: not routed.
        let mut other = swap();
        other.swap_id = "ffffffffffffffff".into();
        hub.broadcast_lifecycle(&lifecycle(LifecycleKind::StatusChanged, other));
        // Subscribed swap: routed.
        hub.broadcast_lifecycle(&lifecycle(LifecycleKind::StatusChanged, target));

        let message = rx.recv().await.unwrap();
        assert_eq!(message.message_type, PushMessageType::SwapStatusChanged);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribed_session_gets_nothing() {
        let hub = hub();
        let (_client_id, mut rx) = hub.register();
        hub.broadcast_lifecycle(&lifecycle(LifecycleKind::Created, swap()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_marked_dead_and_reaped() {
        let hub = hub();
        let (client_id, _rx) = hub.register();
        hub.subscribe_topics(&client_id, &[Topic::SwapUpdates]).unwrap();

        // Fill the bounded queue (depth 4) past capacity; _rx never drains.
        for _ in 0..6 {
            hub.broadcast_lifecycle(&lifecycle(LifecycleKind::Updated, swap()));
        }
        hub.sweep();
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_session_is_reaped() {
        let hub = PushHub::new(PushConfig {
            heartbeat_secs: 15,
            idle_timeout_secs: 0,
            send_queue_depth: 4,
        });
        let (client_id, _rx) = hub.register();
        // last_seen == now, cutoff == now; any passage of time idles it out.
        tokio::time::sleep(Duration::from_millis(5)).await;
        hub.sweep();
        assert!(hub.subscribers.get(&client_id).is_none());
    }

    #[tokio::test]
    async fn test_withdrawal_topic_sees_completions_only() {
        let hub = hub();
        let (client_id, mut rx) = hub.register();
        hub.subscribe_topics(&client_id, &[Topic::WithdrawalEvents])
            .unwrap();

        // SOURCE_LOCKED update: not withdrawal-related.
        let mut locked = swap();
        locked.transition(SwapStatus::SourceLocked).unwrap();
        hub.broadcast_lifecycle(&lifecycle(LifecycleKind::StatusChanged, locked));
        assert!(rx.try_recv().is_err());

        let mut done = swap();
        done.transition(SwapStatus::SourceLocked).unwrap();
        done.transition(SwapStatus::BothLocked).unwrap();
        done.transition(SwapStatus::PreimageRevealed).unwrap();
        done.transition(SwapStatus::Completed).unwrap();
        hub.broadcast_lifecycle(&lifecycle(LifecycleKind::StatusChanged, done));
        assert_eq!(
            rx.recv().await.unwrap().message_type,
            PushMessageType::SwapStatusChanged
        );
    }

    #[tokio::test]
    async fn test_error_lifecycle_reaches_system_topic() {
        let hub = hub();
        let (client_id, mut rx) = hub.register();
        hub.subscribe_topics(&client_id, &[Topic::SystemEvents]).unwrap();

        hub.broadcast_lifecycle(&LifecycleEvent {
            kind: LifecycleKind::Error,
            swap: swap(),
            note: Some("timeout".into()),
        });
        let message = rx.recv().await.unwrap();
        assert_eq!(message.message_type, PushMessageType::SwapError);
        assert_eq!(message.data["note"], "timeout");
    }

    #[tokio::test]
    async fn test_pong_refreshes_liveness() {
        let hub = PushHub::new(PushConfig {
            heartbeat_secs: 15,
            idle_timeout_secs: 1,
            send_queue_depth: 4,
        });
        let (client_id, mut rx) = hub.register();
        hub.touch(&client_id);
        hub.sweep();
        assert_eq!(hub.subscriber_count(), 1);
        // The sweep sent a heartbeat.
        assert_eq!(
            rx.recv().await.unwrap().message_type,
            PushMessageType::Heartbeat
        );
    }
}
