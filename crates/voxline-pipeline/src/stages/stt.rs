//! Speech-to-Text: buffers one utterance, transcribes it when the user stops.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::debug;

use voxline_core::frame::{ControlSignal, Frame};
use voxline_media::pcm::duration_ms;
use voxline_providers::SpeechToText;

use crate::error::StageError;
use crate::retry::RetryPolicy;
use crate::stage::{FrameStream, Stage, StageKind, nothing, pass};

pub struct SpeechToTextStage {
    stt: Arc<dyn SpeechToText>,
    retry: RetryPolicy,
    buffer: BytesMut,
    capturing: bool,
    sample_rate: u32,
}

impl SpeechToTextStage {
    pub fn new(stt: Arc<dyn SpeechToText>, retry: RetryPolicy, sample_rate: u32) -> Self {
        Self {
            stt,
            retry,
            buffer: BytesMut::new(),
            capturing: false,
            sample_rate,
        }
    }

    /// Transcribe `pcm`, then forward the closing control.
    fn transcribe(&self, pcm: Bytes, closing: Frame) -> FrameStream {
        let stt = self.stt.clone();
        let retry = self.retry;
        let sample_rate = self.sample_rate;

        let transcript = futures::stream::once(async move {
            let started = std::time::Instant::now();
            let text = retry
                .run("transcription", || {
                    let stt = stt.clone();
                    let pcm = pcm.clone();
                    async move { stt.transcribe(pcm, sample_rate).await }
                })
                .await?;
            debug!(provider = stt.id(), chars = text.len(), latency_ms = started.elapsed().as_millis() as u64, "Utterance transcribed");
            Ok::<_, StageError>(text)
        });

        let out = futures::stream::StreamExt::flat_map(transcript, move |result| {
            let items: Vec<_> = match result {
                Ok(text) if text.trim().is_empty() => vec![Ok(closing.clone())],
                Ok(text) => vec![Ok(Frame::transcript(text.trim(), true)), Ok(closing.clone())],
                Err(e) => vec![Err(e)],
            };
            futures::stream::iter(items)
        });
        Box::pin(out)
    }
}

#[async_trait]
impl Stage for SpeechToTextStage {
    fn kind(&self) -> StageKind {
        StageKind::SpeechToText
    }

    fn process(&mut self, frame: Frame) -> FrameStream {
        match frame {
            Frame::Audio(audio) => {
                if self.capturing {
                    self.sample_rate = audio.sample_rate;
                    self.buffer.extend_from_slice(&audio.data);
                }
                nothing()
            }
            Frame::Control(ControlSignal::UserStartedSpeaking) => {
                self.capturing = true;
                self.buffer.clear();
                pass(frame)
            }
            Frame::Control(ControlSignal::UserStoppedSpeaking) => {
                self.capturing = false;
                let pcm = self.buffer.split().freeze();
                if pcm.is_empty() {
                    return pass(frame);
                }
                debug!(audio_ms = duration_ms(pcm.len(), self.sample_rate), "Utterance complete");
                self.transcribe(pcm, frame)
            }
            other => pass(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_stream::StreamExt;
    use voxline_core::frame::AudioFrame;
    use voxline_providers::ProviderError;
    use voxline_providers::testing::ScriptedStt;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            factor: 2,
        }
    }

    fn audio() -> Frame {
        Frame::Audio(AudioFrame::new(vec![1u8; 640], 0, 16_000))
    }

    async fn collect(stream: FrameStream) -> Vec<Result<Frame, StageError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_utterance_to_transcript() {
        let stt = Arc::new(ScriptedStt::new(["hello"]));
        let mut stage = SpeechToTextStage::new(stt.clone(), fast_retry(), 16_000);

        // audio outside an utterance is not captured
        assert!(collect(stage.process(audio())).await.is_empty());

        let started = collect(stage.process(ControlSignal::UserStartedSpeaking.into())).await;
        assert_eq!(started, vec![Ok(Frame::Control(ControlSignal::UserStartedSpeaking))]);
        assert!(collect(stage.process(audio())).await.is_empty());

        let out = collect(stage.process(ControlSignal::UserStoppedSpeaking.into())).await;
        assert_eq!(
            out,
            vec![
                Ok(Frame::transcript("hello", true)),
                Ok(Frame::Control(ControlSignal::UserStoppedSpeaking)),
            ]
        );
        assert_eq!(stt.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_utterance_skips_provider() {
        let stt = Arc::new(ScriptedStt::new(["unused"]));
        let mut stage = SpeechToTextStage::new(stt.clone(), fast_retry(), 16_000);
        collect(stage.process(ControlSignal::UserStartedSpeaking.into())).await;
        let out = collect(stage.process(ControlSignal::UserStoppedSpeaking.into())).await;
        assert_eq!(out, vec![Ok(Frame::Control(ControlSignal::UserStoppedSpeaking))]);
        assert_eq!(stt.calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_to_fatal() {
        let stt = Arc::new(ScriptedStt::failing(ProviderError::transient("timeout")));
        let mut stage = SpeechToTextStage::new(stt.clone(), fast_retry(), 16_000);
        collect(stage.process(ControlSignal::UserStartedSpeaking.into())).await;
        collect(stage.process(audio())).await;

        let out = collect(stage.process(ControlSignal::UserStoppedSpeaking.into())).await;
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Err(e) if !e.is_transient()));
        assert_eq!(stt.calls(), 3);
    }
}
