use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crosslock_core::Topic;

/// Standard REST response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SwapListParams {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub store_reachable: bool,
    pub subscribers: usize,
    pub swaps_by_status: Vec<(String, i64)>,
    pub evm: serde_json::Value,
    pub move_chain: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct RefundResponse {
    pub swap_id: String,
    pub refund_tx_hashes: Vec<String>,
}

/// Inbound client frames on the push channel.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { topics: Vec<Topic> },
    Unsubscribe { topics: Vec<Topic> },
    SubscribeSwap { swap_id: String },
    UnsubscribeSwap { swap_id: String },
    GetSwaps {
        status: Option<String>,
        limit: Option<i64>,
    },
    GetSwap { swap_id: String },
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","topics":["swap_updates"]}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { ref topics } if topics == &[Topic::SwapUpdates]));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe_swap","swap_id":"abcd"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::SubscribeSwap { ref swap_id } if swap_id == "abcd"));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Pong));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"nope"}"#).is_err());
    }
}
