//! Frames: the units of data that move through a pipeline.
//!
//! A frame is immutable once produced. Ownership moves from the producing
//! stage into the link queue and from there into the consuming stage; no
//! frame is ever shared between two stages.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::context::ConversationContext;

/// A chunk of opaque audio. The pipeline never decodes it; provider adapters do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Bytes,
    /// Milliseconds since the session's transport connected.
    pub timestamp_ms: u64,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(data: impl Into<Bytes>, timestamp_ms: u64, sample_rate: u32) -> Self {
        Self {
            data: data.into(),
            timestamp_ms,
            sample_rate,
        }
    }
}

/// Out-of-band events delivered alongside data frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlSignal {
    UserStartedSpeaking,
    UserStoppedSpeaking,
    BotStartedSpeaking,
    BotStoppedSpeaking,
    /// Abandon the in-flight bot turn.
    Interrupt,
    EndSession,
    /// The language model began a response.
    ResponseStarted,
    /// The language model finished a response without being interrupted.
    ResponseCompleted { text: String },
}

impl ControlSignal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UserStartedSpeaking => "user_started_speaking",
            Self::UserStoppedSpeaking => "user_stopped_speaking",
            Self::BotStartedSpeaking => "bot_started_speaking",
            Self::BotStoppedSpeaking => "bot_stopped_speaking",
            Self::Interrupt => "interrupt",
            Self::EndSession => "end_session",
            Self::ResponseStarted => "response_started",
            Self::ResponseCompleted { .. } => "response_completed",
        }
    }
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The atomic unit moving through a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Audio(AudioFrame),
    Transcript { text: String, is_final: bool },
    GenerationRequest(ConversationContext),
    TextToken { text: String, is_final: bool },
    Control(ControlSignal),
}

impl Frame {
    pub fn transcript(text: impl Into<String>, is_final: bool) -> Self {
        Self::Transcript {
            text: text.into(),
            is_final,
        }
    }

    pub fn token(text: impl Into<String>, is_final: bool) -> Self {
        Self::TextToken {
            text: text.into(),
            is_final,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Self::Control(_))
    }

    pub fn as_control(&self) -> Option<&ControlSignal> {
        match self {
            Self::Control(signal) => Some(signal),
            _ => None,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Audio(_) => "audio",
            Self::Transcript { .. } => "transcript",
            Self::GenerationRequest(_) => "generation_request",
            Self::TextToken { .. } => "text_token",
            Self::Control(signal) => signal.name(),
        }
    }
}

impl From<ControlSignal> for Frame {
    fn from(signal: ControlSignal) -> Self {
        Self::Control(signal)
    }
}

impl From<AudioFrame> for Frame {
    fn from(audio: AudioFrame) -> Self {
        Self::Audio(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_signal_serialization() {
        let json = serde_json::to_value(ControlSignal::UserStartedSpeaking).unwrap();
        assert_eq!(json["kind"], "user_started_speaking");

        let completed = ControlSignal::ResponseCompleted {
            text: "hi".into(),
        };
        let json = serde_json::to_value(&completed).unwrap();
        assert_eq!(json["kind"], "response_completed");
        assert_eq!(json["text"], "hi");
    }

    #[test]
    fn test_frame_labels() {
        assert_eq!(Frame::transcript("hello", true).label(), "transcript");
        assert_eq!(Frame::from(ControlSignal::Interrupt).label(), "interrupt");
        assert!(Frame::from(ControlSignal::EndSession).is_control());
        assert!(!Frame::token("a", false).is_control());
    }
}
