//! ElevenLabs streaming text-to-speech.
//!
//! Audio is requested as raw PCM 16-bit 16kHz mono.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio_stream::StreamExt;
use tracing::debug;

use voxline_core::config::ProviderConfig;

use crate::{AudioStream, ProviderError, TextToSpeech};

const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io";
const DEFAULT_VOICE: &str = "pNInz6obpgDQGcFmaJgB";
const DEFAULT_MODEL: &str = "eleven_turbo_v2";
const OUTPUT_SAMPLE_RATE: u32 = 16_000;

pub struct ElevenLabsTts {
    base_url: String,
    api_key: String,
    voice: String,
    model: String,
    client: reqwest::Client,
}

impl ElevenLabsTts {
    pub fn from_config(provider: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = provider
            .resolve_api_key()
            .ok_or_else(|| ProviderError::missing_api_key(&provider.id))?;

        Ok(Self {
            base_url: provider
                .base_url
                .as_deref()
                .unwrap_or(ELEVENLABS_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            voice: provider.voice.clone().unwrap_or_else(|| DEFAULT_VOICE.into()),
            model: provider.model.clone().unwrap_or_else(|| DEFAULT_MODEL.into()),
            client: reqwest::Client::new(),
        })
    }

    /// Streaming endpoint for the configured voice.
    pub fn stream_url(&self) -> String {
        format!(
            "{}/v1/text-to-speech/{}/stream?output_format=pcm_{OUTPUT_SAMPLE_RATE}",
            self.base_url, self.voice
        )
    }
}

/// Re-chunks a byte stream so every emitted chunk holds whole 16-bit samples.
#[derive(Default)]
struct SampleAligner {
    carry: Option<u8>,
}

impl SampleAligner {
    fn align(&mut self, chunk: &[u8]) -> Option<Bytes> {
        let mut buf = BytesMut::with_capacity(chunk.len() + 1);
        if let Some(b) = self.carry.take() {
            buf.extend_from_slice(&[b]);
        }
        buf.extend_from_slice(chunk);
        if buf.len() % 2 == 1 {
            self.carry = buf.last().copied();
            buf.truncate(buf.len() - 1);
        }
        (!buf.is_empty()).then(|| buf.freeze())
    }
}

#[async_trait]
impl TextToSpeech for ElevenLabsTts {
    fn id(&self) -> &str {
        "elevenlabs"
    }

    fn sample_rate(&self) -> u32 {
        OUTPUT_SAMPLE_RATE
    }

    async fn synthesize(&self, text: &str) -> Result<AudioStream, ProviderError> {
        debug!(voice = %self.voice, model = %self.model, text_len = text.len(), "Starting TTS stream");

        let resp = self
            .client
            .post(self.stream_url())
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status("elevenlabs", status, &body));
        }

        let mut aligner = SampleAligner::default();
        let audio = resp
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => Ok(aligner.align(&bytes)),
                Err(e) => Err(ProviderError::transient(format!("TTS stream error: {e}"))),
            })
            .filter_map(|item| item.transpose());

        Ok(Box::pin(audio))
    }
}
