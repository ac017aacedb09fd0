//! The six stages of a voice pipeline.

pub mod aggregator;
pub mod input;
pub mod llm;
pub mod output;
pub mod stt;
pub mod tts;

pub use aggregator::ContextAggregatorStage;
pub use input::TransportInputStage;
pub use llm::LanguageModelStage;
pub use output::TransportOutputStage;
pub use stt::SpeechToTextStage;
pub use tts::TextToSpeechStage;
