//! The stage contract.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use voxline_core::frame::{ControlSignal, Frame};

use crate::error::StageError;

/// Lazy, finite output of one `process` call.
pub type FrameStream = BoxStream<'static, Result<Frame, StageError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    TransportInput,
    SpeechToText,
    ContextAggregator,
    LanguageModel,
    TextToSpeech,
    TransportOutput,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransportInput => "transport_input",
            Self::SpeechToText => "speech_to_text",
            Self::ContextAggregator => "context_aggregator",
            Self::LanguageModel => "language_model",
            Self::TextToSpeech => "text_to_speech",
            Self::TransportOutput => "transport_output",
        }
    }

    /// Stages whose in-flight work is abandoned on `Interrupt`.
    pub fn is_interruptible(self) -> bool {
        matches!(
            self,
            Self::LanguageModel | Self::TextToSpeech | Self::TransportOutput
        )
    }

    /// Stages that begin new work and stamp their output with the current epoch.
    /// Every other stage inherits the epoch of the frame it is processing.
    pub fn stamps_epoch(self) -> bool {
        matches!(self, Self::TransportInput)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task context handed to [`Stage::setup`].
#[derive(Debug, Clone)]
pub struct StageContext {
    pub session_id: String,
    pub cancel: CancellationToken,
}

/// One transformation step.
///
/// `process` is synchronous bookkeeping that returns an owned lazy stream; the
/// stage may keep mutating its own state from `handle_control` while that
/// stream is still being polled. Dropping the stream cancels whatever
/// provider call it was suspended on.
#[async_trait]
pub trait Stage: Send {
    fn kind(&self) -> StageKind;

    async fn setup(&mut self, _ctx: &StageContext) -> Result<(), StageError> {
        Ok(())
    }

    /// Frames this stage originates on its own. Only the first stage has one.
    fn take_source(&mut self) -> Option<FrameStream> {
        None
    }

    fn process(&mut self, frame: Frame) -> FrameStream;

    /// Out-of-band control delivery. Runs before the next item of any
    /// in-flight stream is taken.
    fn handle_control(&mut self, _signal: &ControlSignal) {}

    async fn teardown(&mut self) {}
}

/// Stream yielding `frame` unchanged.
pub fn pass(frame: Frame) -> FrameStream {
    Box::pin(futures::stream::once(async move { Ok(frame) }))
}

/// Stream yielding nothing.
pub fn nothing() -> FrameStream {
    Box::pin(futures::stream::empty())
}

/// Stream yielding the given frames in order.
pub fn frames(items: Vec<Frame>) -> FrameStream {
    Box::pin(futures::stream::iter(items.into_iter().map(Ok)))
}
