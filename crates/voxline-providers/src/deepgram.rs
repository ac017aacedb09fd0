//! Deepgram pre-recorded transcription (`/v1/listen`).

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tracing::debug;

use voxline_core::config::ProviderConfig;
use voxline_media::pcm::pcm_to_wav;

use crate::{ProviderError, SpeechToText};

const DEEPGRAM_BASE_URL: &str = "https://api.deepgram.com";
const DEFAULT_MODEL: &str = "nova-2";

pub struct DeepgramStt {
    base_url: String,
    api_key: String,
    model: String,
    language: String,
    client: reqwest::Client,
}

impl DeepgramStt {
    pub fn from_config(provider: &ProviderConfig, language: &str) -> Result<Self, ProviderError> {
        let api_key = provider
            .resolve_api_key()
            .ok_or_else(|| ProviderError::missing_api_key(&provider.id))?;

        Ok(Self {
            base_url: provider
                .base_url
                .as_deref()
                .unwrap_or(DEEPGRAM_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: provider.model.clone().unwrap_or_else(|| DEFAULT_MODEL.into()),
            language: language.to_string(),
            client: reqwest::Client::new(),
        })
    }

    pub fn listen_url(&self) -> String {
        format!(
            "{}/v1/listen?model={}&language={}&smart_format=true",
            self.base_url, self.model, self.language
        )
    }
}

#[derive(Debug, Deserialize)]
struct ListenResponse {
    results: ListenResults,
}

#[derive(Debug, Deserialize)]
struct ListenResults {
    #[serde(default)]
    channels: Vec<ListenChannel>,
}

#[derive(Debug, Deserialize)]
struct ListenChannel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

/// Pull the best transcript out of a `/v1/listen` response body.
fn extract_transcript(body: &str) -> Result<String, ProviderError> {
    let parsed: ListenResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::fatal(format!("unexpected deepgram response: {e}")))?;
    Ok(parsed
        .results
        .channels
        .into_iter()
        .next()
        .and_then(|c| c.alternatives.into_iter().next())
        .map(|a| a.transcript.trim().to_string())
        .unwrap_or_default())
}

#[async_trait]
impl SpeechToText for DeepgramStt {
    fn id(&self) -> &str {
        "deepgram"
    }

    async fn transcribe(&self, pcm: Bytes, sample_rate: u32) -> Result<String, ProviderError> {
        let wav = pcm_to_wav(&pcm, sample_rate, 1);
        debug!(model = %self.model, language = %self.language, wav_bytes = wav.len(), "Sending audio to Deepgram");

        let resp = self
            .client
            .post(self.listen_url())
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "audio/wav")
            .body(wav)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status("deepgram", status, &body));
        }

        let body = resp.text().await?;
        extract_transcript(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_transcript() {
        let body = r#"{"metadata":{},"results":{"channels":[{"alternatives":[{"transcript":" hello there ","confidence":0.98}]}]}}"#;
        assert_eq!(extract_transcript(body).unwrap(), "hello there");
    }

    #[test]
    fn test_extract_empty_channels() {
        let body = r#"{"results":{"channels":[]}}"#;
        assert_eq!(extract_transcript(body).unwrap(), "");
    }

    #[test]
    fn test_extract_malformed_is_fatal() {
        assert!(matches!(extract_transcript("not json"), Err(ProviderError::Fatal(_))));
    }

    #[test]
    fn test_listen_url() {
        let mut provider = ProviderConfig::named("deepgram");
        provider.api_key = Some("dg-key".into());
        let stt = DeepgramStt::from_config(&provider, "en-US").unwrap();
        let url = stt.listen_url();
        assert!(url.starts_with("https://api.deepgram.com/v1/listen?"));
        assert!(url.contains("model=nova-2"));
        assert!(url.contains("language=en-US"));
    }
}
