//! Provider capability traits.
//!
//! Every external collaborator of a pipeline is expressed as a small trait:
//! [`SpeechToText`], [`LanguageModel`], [`TextToSpeech`] and [`AudioTransport`].
//! Concrete providers are selected by configuration through a
//! [`ProviderResolver`]; the pipeline never names a concrete type.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use voxline_core::context::ConversationContext;
use voxline_core::frame::{AudioFrame, ControlSignal};

pub mod channel;
pub mod deepgram;
pub mod elevenlabs;
pub mod error;
pub mod openai;
pub mod resolver;
pub mod sse;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod whisper;

pub use error::ProviderError;
pub use resolver::{ConfigResolver, ProviderResolver, ProviderSet};

/// Streamed text deltas from a language model.
pub type TokenStream = BoxStream<'static, Result<String, ProviderError>>;

/// Streamed 16-bit PCM chunks from a speech synthesizer.
pub type AudioStream = BoxStream<'static, Result<Bytes, ProviderError>>;

/// Speech-to-text: one finished utterance in, one transcript out.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    fn id(&self) -> &str;

    /// Transcribe little-endian 16-bit mono PCM.
    async fn transcribe(&self, pcm: Bytes, sample_rate: u32) -> Result<String, ProviderError>;
}

/// Language model: conversation turns in, token stream out.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn id(&self) -> &str;

    async fn stream(&self, context: &ConversationContext) -> Result<TokenStream, ProviderError>;
}

/// Text-to-speech: text in, audio chunks out.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    fn id(&self) -> &str;

    /// Sample rate of the PCM this provider produces.
    fn sample_rate(&self) -> u32;

    async fn synthesize(&self, text: &str) -> Result<AudioStream, ProviderError>;
}

/// Something the remote party sent over a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Audio(AudioFrame),
    /// Voice-activity edges or explicit client requests.
    Control(ControlSignal),
    Disconnected,
}

/// Live bidirectional audio link to the remote party.
#[async_trait]
pub trait AudioTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Whether the transport reports speech start/stop itself.
    fn reports_voice_activity(&self) -> bool {
        false
    }

    /// Confirm the remote connection is live.
    async fn connect(&self) -> Result<(), ProviderError>;

    /// Inbound event stream. Only the first caller receives it.
    fn take_events(&self) -> Option<BoxStream<'static, TransportEvent>>;

    async fn send_audio(&self, audio: &AudioFrame) -> Result<(), ProviderError>;

    /// Relay generated text to the remote party, if the transport supports it.
    async fn send_text(&self, _text: &str, _is_final: bool) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Release the link. Idempotent.
    async fn disconnect(&self);
}

pub type SharedTransport = Arc<dyn AudioTransport>;
