//! Whisper-style transcription over the OpenAI `audio/transcriptions` API (OpenAI, Groq).

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use voxline_core::config::ProviderConfig;
use voxline_media::pcm::pcm_to_wav;

use crate::{ProviderError, SpeechToText};

const OPENAI_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const GROQ_URL: &str = "https://api.groq.com/openai/v1/audio/transcriptions";

pub struct WhisperStt {
    provider_id: String,
    url: String,
    api_key: String,
    model: String,
    language: Option<String>,
    client: reqwest::Client,
}

/// Endpoint and default model for a whisper provider id.
pub fn provider_defaults(id: &str) -> Option<(&'static str, &'static str)> {
    match id {
        "openai" | "whisper" => Some((OPENAI_URL, "whisper-1")),
        "groq" => Some((GROQ_URL, "whisper-large-v3-turbo")),
        _ => None,
    }
}

/// ISO-639-1 prefix of a locale tag ("en-US" -> "en").
pub fn language_code(locale: &str) -> Option<String> {
    let code = locale.split(['-', '_']).next()?.trim().to_lowercase();
    (!code.is_empty()).then_some(code)
}

impl WhisperStt {
    pub fn from_config(provider: &ProviderConfig, language: &str) -> Result<Self, ProviderError> {
        let (default_url, default_model) = provider_defaults(&provider.id).ok_or_else(|| {
            ProviderError::fatal(format!("'{}' is not a whisper provider", provider.id))
        })?;
        let api_key = provider
            .resolve_api_key()
            .ok_or_else(|| ProviderError::missing_api_key(&provider.id))?;

        let url = match provider.base_url.as_deref() {
            Some(base) => format!("{}/v1/audio/transcriptions", base.trim_end_matches('/')),
            None => default_url.to_string(),
        };

        Ok(Self {
            provider_id: provider.id.clone(),
            url,
            api_key,
            model: provider.model.clone().unwrap_or_else(|| default_model.into()),
            language: language_code(language),
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl SpeechToText for WhisperStt {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn transcribe(&self, pcm: Bytes, sample_rate: u32) -> Result<String, ProviderError> {
        let wav = pcm_to_wav(&pcm, sample_rate, 1);

        debug!(url = %self.url, model = %self.model, wav_bytes = wav.len(), "Sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| ProviderError::fatal(e.to_string()))?;

        let mut form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "text")
            .part("file", part);
        if let Some(lang) = &self.language {
            form = form.text("language", lang.clone());
        }

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(&self.provider_id, status, &body));
        }

        let text = resp.text().await?;
        Ok(text.trim().to_string())
    }
}
