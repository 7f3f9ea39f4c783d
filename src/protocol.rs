//! Wire protocol shared by both ends of the bridge
//!
//! Every frame carries one JSON [`Envelope`]. The envelope that starts a call
//! names the method; replies and stream items carry only the transaction id and
//! a payload. A bare `{"tx_id": ...}` asks the server to drop a subscription.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Prefix on fully qualified method names (`/YtMusic/DoPlay`)
pub const DEFAULT_SERVICE_PREFIX: &str = "/YtMusic/";

/// Caller-generated token correlating a call with its replies
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct TxId(String);

impl TxId {
    /// Generate a fresh transaction id
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TxId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TxId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The logical message carried inside one frame
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub tx_id: TxId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    /// Application failure reported by the handler, in place of `message`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Create the envelope that initiates a call
    pub fn call(tx_id: TxId, method: impl Into<String>, message: Value) -> Self {
        Self {
            tx_id,
            method: Some(method.into()),
            message: Some(message),
            error: None,
        }
    }

    /// Create a reply or stream item
    pub fn reply(tx_id: TxId, message: Value) -> Self {
        Self {
            tx_id,
            method: None,
            message: Some(message),
            error: None,
        }
    }

    /// Create a failed reply
    pub fn failure(tx_id: TxId, error: impl Into<String>) -> Self {
        Self {
            tx_id,
            method: None,
            message: None,
            error: Some(error.into()),
        }
    }

    /// Create the bare envelope that cancels a stream subscription
    pub fn unsubscribe(tx_id: TxId) -> Self {
        Self {
            tx_id,
            method: None,
            message: None,
            error: None,
        }
    }

    pub fn is_unsubscribe(&self) -> bool {
        self.method.is_none() && self.message.is_none() && self.error.is_none()
    }

    /// Serialize to the JSON bytes that go inside a frame
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Parse one frame's payload
    pub fn decode(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}

/// Operations of the playback service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    DoPlay,
    DoPause,
    DoNext,
    DoPrevious,
    DoPlayQueueIndex,
    SetVolume,
    GetVolume,
    GetNowPlaying,
    GetPlayerState,
    GetQueueState,
    PlayerState,
    Volume,
    NowPlaying,
    QueueState,
}

impl Method {
    pub const ALL: [Method; 14] = [
        Method::DoPlay,
        Method::DoPause,
        Method::DoNext,
        Method::DoPrevious,
        Method::DoPlayQueueIndex,
        Method::SetVolume,
        Method::GetVolume,
        Method::GetNowPlaying,
        Method::GetPlayerState,
        Method::GetQueueState,
        Method::PlayerState,
        Method::Volume,
        Method::NowPlaying,
        Method::QueueState,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Method::DoPlay => "DoPlay",
            Method::DoPause => "DoPause",
            Method::DoNext => "DoNext",
            Method::DoPrevious => "DoPrevious",
            Method::DoPlayQueueIndex => "DoPlayQueueIndex",
            Method::SetVolume => "SetVolume",
            Method::GetVolume => "GetVolume",
            Method::GetNowPlaying => "GetNowPlaying",
            Method::GetPlayerState => "GetPlayerState",
            Method::GetQueueState => "GetQueueState",
            Method::PlayerState => "PlayerState",
            Method::Volume => "Volume",
            Method::NowPlaying => "NowPlaying",
            Method::QueueState => "QueueState",
        }
    }

    /// Streaming methods push items until unsubscribed
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Method::PlayerState | Method::Volume | Method::NowPlaying | Method::QueueState
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .iter()
            .copied()
            .find(|method| method.name() == s)
            .ok_or_else(|| format!("Unknown method: {}", s))
    }
}

/// Join a service prefix and a method name (`/YtMusic/` + `DoPlay`)
pub fn qualify(prefix: &str, method: &str) -> String {
    if method.starts_with('/') {
        method.to_string()
    } else {
        format!("{}{}", prefix, method)
    }
}

/// Strip the service prefix from an incoming method name.
///
/// Unqualified names are accepted as-is. Names qualified with a different
/// service return `None`.
pub fn unqualify<'a>(prefix: &str, method: &'a str) -> Option<&'a str> {
    if let Some(name) = method.strip_prefix(prefix) {
        Some(name)
    } else if method.starts_with('/') {
        None
    } else {
        Some(method)
    }
}

/// Empty request or response
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Empty {}

/// Playback state as reported by the embedded player
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    #[default]
    Unstarted,
    Ended,
    Playing,
    Paused,
    Buffering,
    VideoQueued,
}

impl PlayerState {
    /// Map the player's numeric state code
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(PlayerState::Unstarted),
            0 => Some(PlayerState::Ended),
            1 => Some(PlayerState::Playing),
            2 => Some(PlayerState::Paused),
            3 => Some(PlayerState::Buffering),
            5 => Some(PlayerState::VideoQueued),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            PlayerState::Unstarted => -1,
            PlayerState::Ended => 0,
            PlayerState::Playing => 1,
            PlayerState::Paused => 2,
            PlayerState::Buffering => 3,
            PlayerState::VideoQueued => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerState::Unstarted => "Unstarted",
            PlayerState::Ended => "Ended",
            PlayerState::Playing => "Playing",
            PlayerState::Paused => "Paused",
            PlayerState::Buffering => "Buffering",
            PlayerState::VideoQueued => "Queued",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayerStateMsg {
    pub state: PlayerState,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VolumeMsg {
    pub volume: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlayQueueIndexMsg {
    pub index: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NowPlayingMsg {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub cover_url: String,
    #[serde(default)]
    pub thumbnail_url: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub thumbnail_url: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueueStateMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_index: Option<u32>,
    #[serde(default)]
    pub items: Vec<QueueItem>,
}
