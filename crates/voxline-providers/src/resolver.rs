//! Config-driven provider selection.

use std::sync::Arc;

use tracing::debug;

use voxline_core::config::Config;
use voxline_core::session::SessionConfig;

use crate::deepgram::DeepgramStt;
use crate::elevenlabs::ElevenLabsTts;
use crate::openai::OpenAiLanguageModel;
use crate::whisper::WhisperStt;
use crate::{LanguageModel, ProviderError, SpeechToText, TextToSpeech};

pub const STT_PROVIDERS: &[&str] = &["deepgram", "openai", "groq"];
pub const LLM_PROVIDERS: &[&str] = &["openai", "openrouter", "ollama"];
pub const TTS_PROVIDERS: &[&str] = &["elevenlabs"];

/// The three model providers one session runs with.
#[derive(Clone)]
pub struct ProviderSet {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
}

/// Turns a session's provider choice into live providers.
pub trait ProviderResolver: Send + Sync {
    /// Cheap check run when a session is requested. Rejects unknown ids.
    fn validate(&self, session: &SessionConfig) -> Result<(), ProviderError>;

    /// Build providers when the session's transport connects.
    fn resolve(&self, session: &SessionConfig) -> Result<ProviderSet, ProviderError>;
}

/// Resolver backed by the `providers` section of the config file.
pub struct ConfigResolver {
    config: Arc<Config>,
}

impl ConfigResolver {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

fn check(kind: &str, id: &str, known: &[&str]) -> Result<(), ProviderError> {
    if known.contains(&id) {
        Ok(())
    } else {
        Err(ProviderError::fatal(format!(
            "unknown {kind} provider '{id}' (expected one of: {})",
            known.join(", ")
        )))
    }
}

impl ProviderResolver for ConfigResolver {
    fn validate(&self, session: &SessionConfig) -> Result<(), ProviderError> {
        check("stt", &session.stt, STT_PROVIDERS)?;
        check("llm", &session.llm, LLM_PROVIDERS)?;
        check("tts", &session.tts, TTS_PROVIDERS)?;
        Ok(())
    }

    fn resolve(&self, session: &SessionConfig) -> Result<ProviderSet, ProviderError> {
        self.validate(session)?;

        let stt_cfg = self.config.provider_or_default(&session.stt);
        let stt: Arc<dyn SpeechToText> = match session.stt.as_str() {
            "deepgram" => Arc::new(DeepgramStt::from_config(&stt_cfg, &session.language)?),
            _ => Arc::new(WhisperStt::from_config(&stt_cfg, &session.language)?),
        };

        let llm_cfg = self.config.provider_or_default(&session.llm);
        let llm: Arc<dyn LanguageModel> =
            Arc::new(OpenAiLanguageModel::from_config(&llm_cfg, &self.config.llm())?);

        let tts_cfg = self.config.provider_or_default(&session.tts);
        let tts: Arc<dyn TextToSpeech> = Arc::new(ElevenLabsTts::from_config(&tts_cfg)?);

        debug!(stt = %session.stt, llm = %session.llm, tts = %session.tts, "Resolved providers");
        Ok(ProviderSet { stt, llm, tts })
    }
}
