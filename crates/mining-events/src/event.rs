use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Kind of event carried on the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "miner.starting")]
    MinerStarting,
    #[serde(rename = "miner.started")]
    MinerStarted,
    #[serde(rename = "miner.stopping")]
    MinerStopping,
    #[serde(rename = "miner.stopped")]
    MinerStopped,
    #[serde(rename = "miner.stats")]
    MinerStats,
    #[serde(rename = "miner.error")]
    MinerError,
    #[serde(rename = "miner.connected")]
    MinerConnected,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "state.sync")]
    StateSync,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MinerStarting => "miner.starting",
            EventType::MinerStarted => "miner.started",
            EventType::MinerStopping => "miner.stopping",
            EventType::MinerStopped => "miner.stopped",
            EventType::MinerStats => "miner.stats",
            EventType::MinerError => "miner.error",
            EventType::MinerConnected => "miner.connected",
            EventType::Pong => "pong",
            EventType::StateSync => "state.sync",
        }
    }

    /// Pong and state-sync go to a subscriber regardless of its miner filter
    pub fn bypasses_filter(&self) -> bool {
        matches!(self, EventType::Pong | EventType::StateSync)
    }
}

/// Immutable event envelope: `{type, timestamp, data}` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Event {
            event_type,
            timestamp: Utc::now(),
            data: None,
        }
    }

    /// Event carrying `data`. A payload that fails to serialize is logged and
    /// the event goes out without one.
    pub fn with_data<T: Serialize>(event_type: EventType, data: &T) -> Self {
        let data = match serde_json::to_value(data) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Failed to serialize {} payload: {}", event_type.as_str(), e);
                None
            }
        };
        Event {
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn pong() -> Self {
        Event::new(EventType::Pong)
    }

    pub fn state_sync(state: Value) -> Self {
        Event {
            event_type: EventType::StateSync,
            timestamp: Utc::now(),
            data: Some(state),
        }
    }

    /// Miner this event is about, if any
    pub fn miner_name(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|data| data.get("name"))
            .and_then(Value::as_str)
    }

    /// Decode the payload into a typed record
    pub fn payload<T: DeserializeOwned>(&self) -> Option<T> {
        self.data
            .clone()
            .and_then(|data| serde_json::from_value(data).ok())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Payload of lifecycle and error events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinerEventData {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub miner_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MinerEventData {
    pub fn named(name: impl Into<String>) -> Self {
        MinerEventData {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Payload of `miner.stats` events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinerStatsData {
    pub name: String,
    pub hashrate: u64,
    pub shares: u64,
    pub rejected: u64,
    pub uptime: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub algorithm: String,
    #[serde(default)]
    pub diff_current: u64,
}

/// Messages a subscriber may send on the stream
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Restrict miner-scoped events to these names; empty or `*` means all
    Subscribe {
        #[serde(default)]
        miners: Vec<String>,
    },
    Ping,
}
