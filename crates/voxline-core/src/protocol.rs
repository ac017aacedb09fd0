//! Voxline wire protocol: HTTP bodies and JSON-over-WebSocket messages.

use serde::{Deserialize, Serialize};

use crate::frame::ControlSignal;
use crate::session::SessionConfig;

/// Response body of `POST /api/start-session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub status: String,
    pub websocket_url: String,
    pub config: SessionConfig,
}

/// Response body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
}

/// Actions a client may request through a `control` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Interrupt,
    End,
    UserStartedSpeaking,
    UserStoppedSpeaking,
}

impl ControlAction {
    pub fn to_signal(self) -> ControlSignal {
        match self {
            Self::Interrupt => ControlSignal::Interrupt,
            Self::End => ControlSignal::EndSession,
            Self::UserStartedSpeaking => ControlSignal::UserStartedSpeaking,
            Self::UserStoppedSpeaking => ControlSignal::UserStoppedSpeaking,
        }
    }
}

/// Client -> server WebSocket message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Base64-encoded 16-bit little-endian PCM.
    Audio {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sample_rate: Option<u32>,
    },
    Control { action: ControlAction },
    /// Liveness check, answered immediately outside the pipeline.
    Test {
        #[serde(default)]
        text: String,
    },
}

/// Terminal outcome reported in `session_ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndStatus {
    Completed,
    Error,
}

/// Server -> client WebSocket message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Audio { data: String, sample_rate: u32 },
    BotText { text: String, is_final: bool },
    BotResponse { text: String, session_id: String },
    /// Non-terminal problem with a single client message.
    Error { message: String },
    /// Sent exactly once, right before the socket closes.
    SessionEnded {
        session_id: String,
        status: EndStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ServerMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionEnded { .. })
    }
}
