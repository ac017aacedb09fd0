//! Session model: lifecycle states and per-session provider selection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of a session: `Pending → Active → Draining → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Registered, transport not yet connected.
    Pending,
    /// Transport connected, pipeline running.
    Active,
    /// End requested or remote gone; in-flight frames flushing.
    Draining,
    /// All stage resources released. Terminal.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    /// The single state reachable from this one.
    pub fn successor(self) -> Self {
        match self {
            Self::Pending => Self::Active,
            Self::Active => Self::Draining,
            Self::Draining | Self::Closed => Self::Closed,
        }
    }

    /// Validate a transition. No state may be skipped; `Closed` may be re-entered.
    pub fn transition(self, to: Self) -> Result<Self, InvalidTransition> {
        if self.successor() == to {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

/// Provider selection posted to `start-session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_stt")]
    pub stt: String,

    #[serde(default = "default_llm")]
    pub llm: String,

    #[serde(default = "default_tts")]
    pub tts: String,

    /// Overrides the configured system prompt for this session only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_language() -> String {
    "en-US".into()
}

fn default_stt() -> String {
    "deepgram".into()
}

fn default_llm() -> String {
    "openai".into()
}

fn default_tts() -> String {
    "elevenlabs".into()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            stt: default_stt(),
            llm: default_llm(),
            tts: default_tts(),
            system_prompt: None,
        }
    }
}

/// Generate a fresh opaque session id.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
