//! Text-to-Speech: synthesizes whole sentences as tokens stream in.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, trace};

use voxline_core::frame::{AudioFrame, ControlSignal, Frame};
use voxline_media::pcm::duration_ms;
use voxline_providers::{AudioStream, TextToSpeech};

use crate::error::StageError;
use crate::retry::RetryPolicy;
use crate::stage::{FrameStream, Stage, StageKind, pass};

const SENTENCE_ENDINGS: &[char] = &['.', '!', '?', '\n'];

pub struct TextToSpeechStage {
    tts: Arc<dyn TextToSpeech>,
    retry: RetryPolicy,
    pending: String,
    /// Playback offset of the next synthesized chunk within the current turn.
    clock_ms: Arc<AtomicU64>,
}

impl TextToSpeechStage {
    pub fn new(tts: Arc<dyn TextToSpeech>, retry: RetryPolicy) -> Self {
        Self {
            tts,
            retry,
            pending: String::new(),
            clock_ms: Default::default(),
        }
    }

    /// Split off every complete sentence from the pending buffer.
    fn take_sentences(&mut self) -> Option<String> {
        let cut = self
            .pending
            .char_indices()
            .filter(|(i, c)| {
                SENTENCE_ENDINGS.contains(c)
                    && self.pending[i + c.len_utf8()..]
                        .chars()
                        .next()
                        .is_none_or(char::is_whitespace)
            })
            .map(|(i, c)| i + c.len_utf8())
            .last()?;
        let rest = self.pending.split_off(cut);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    /// Synthesize `text`, then emit `trailer`.
    fn speak(&self, text: String, trailer: Frame) -> FrameStream {
        let tts = self.tts.clone();
        let retry = self.retry;
        let clock = self.clock_ms.clone();
        let sample_rate = tts.sample_rate();

        enum Step {
            Open(String),
            Audio(AudioStream),
            Trailer,
            Done,
        }

        let state = (Step::Open(text), Some(trailer));
        let stream = futures::stream::unfold(state, move |(step, mut trailer)| {
            let tts = tts.clone();
            let clock = clock.clone();
            async move {
                let mut step = step;
                loop {
                    match step {
                        Step::Open(text) => {
                            debug!(provider = tts.id(), chars = text.len(), "Synthesizing");
                            let opened = retry
                                .run("synthesis", || {
                                    let tts = tts.clone();
                                    let text = text.clone();
                                    async move { tts.synthesize(&text).await }
                                })
                                .await;
                            match opened {
                                Ok(audio) => step = Step::Audio(audio),
                                Err(e) => return Some((Err(e), (Step::Done, None))),
                            }
                        }
                        Step::Audio(mut audio) => {
                            match futures::StreamExt::next(&mut audio).await {
                                Some(Ok(chunk)) => {
                                    let offset = clock.fetch_add(
                                        duration_ms(chunk.len(), sample_rate),
                                        Ordering::Relaxed,
                                    );
                                    trace!(bytes = chunk.len(), offset, "Synthesized chunk");
                                    let frame = Frame::Audio(AudioFrame::new(chunk, offset, sample_rate));
                                    return Some((Ok(frame), (Step::Audio(audio), trailer)));
                                }
                                Some(Err(e)) => {
                                    let err = StageError::fatal(format!("synthesis stream failed: {e}"));
                                    return Some((Err(err), (Step::Done, None)));
                                }
                                None => step = Step::Trailer,
                            }
                        }
                        Step::Trailer => {
                            return trailer.take().map(|t| (Ok(t), (Step::Done, None)));
                        }
                        Step::Done => return None,
                    }
                }
            }
        });
        Box::pin(stream)
    }
}

#[async_trait]
impl Stage for TextToSpeechStage {
    fn kind(&self) -> StageKind {
        StageKind::TextToSpeech
    }

    fn process(&mut self, frame: Frame) -> FrameStream {
        match frame {
            Frame::TextToken { ref text, is_final } => {
                self.pending.push_str(text);
                let speech = if is_final {
                    Some(std::mem::take(&mut self.pending))
                } else {
                    self.take_sentences()
                };
                match speech {
                    Some(s) if !s.trim().is_empty() => self.speak(s.trim().to_string(), frame),
                    _ => pass(frame),
                }
            }
            Frame::Control(ControlSignal::ResponseCompleted { .. }) => {
                self.clock_ms.store(0, Ordering::Relaxed);
                let rest = std::mem::take(&mut self.pending);
                if rest.trim().is_empty() {
                    pass(frame)
                } else {
                    self.speak(rest.trim().to_string(), frame)
                }
            }
            other => pass(other),
        }
    }

    fn handle_control(&mut self, signal: &ControlSignal) {
        if *signal == ControlSignal::Interrupt {
            if !self.pending.is_empty() {
                debug!(dropped_chars = self.pending.len(), "Discarding unspoken text");
            }
            self.pending.clear();
            self.clock_ms.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;
    use voxline_providers::testing::ScriptedTts;

    fn labels(out: &[Result<Frame, StageError>]) -> Vec<&'static str> {
        out.iter().map(|f| f.as_ref().unwrap().label()).collect()
    }

    #[test]
    fn test_sentence_split() {
        let mut stage = TextToSpeechStage::new(Arc::new(ScriptedTts::new(1)), RetryPolicy::default());
        stage.pending = "Hello there. How are".into();
        assert_eq!(stage.take_sentences().as_deref(), Some("Hello there."));
        assert_eq!(stage.pending, " How are");

        stage.pending = "Pi is 3.14 today".into();
        assert_eq!(stage.take_sentences(), None);

        stage.pending = "Yes! Really?".into();
        assert_eq!(stage.take_sentences().as_deref(), Some("Yes! Really?"));
        assert!(stage.pending.is_empty());
    }

    #[tokio::test]
    async fn test_audio_precedes_its_text() {
        let tts = Arc::new(ScriptedTts::new(2));
        let mut stage = TextToSpeechStage::new(tts.clone(), RetryPolicy::default());

        let out: Vec<_> = stage.process(Frame::token("Hello", false)).collect().await;
        assert_eq!(labels(&out), vec!["text_token"]);

        let out: Vec<_> = stage.process(Frame::token(" world.", false)).collect().await;
        assert_eq!(labels(&out), vec!["audio", "audio", "text_token"]);
        assert_eq!(tts.texts(), vec!["Hello world."]);

        match &out[1] {
            Ok(Frame::Audio(audio)) => assert_eq!(audio.timestamp_ms, 20),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_final_token_flushes_remainder() {
        let tts = Arc::new(ScriptedTts::new(1));
        let mut stage = TextToSpeechStage::new(tts.clone(), RetryPolicy::default());
        let _ = stage.process(Frame::token("no punctuation", false)).collect::<Vec<_>>().await;
        let out: Vec<_> = stage.process(Frame::token("", true)).collect().await;
        assert_eq!(labels(&out), vec!["audio", "text_token"]);
        assert_eq!(tts.texts(), vec!["no punctuation"]);
    }

    #[tokio::test]
    async fn test_interrupt_clears_pending_text() {
        let tts = Arc::new(ScriptedTts::new(1));
        let mut stage = TextToSpeechStage::new(tts.clone(), RetryPolicy::default());
        let _ = stage.process(Frame::token("half a sent", false)).collect::<Vec<_>>().await;
        stage.handle_control(&ControlSignal::Interrupt);
        let out: Vec<_> = stage.process(Frame::token("", true)).collect().await;
        assert_eq!(labels(&out), vec!["text_token"]);
        assert!(tts.texts().is_empty());
    }

    #[tokio::test]
    async fn test_synthesis_failure_is_fatal() {
        let tts = Arc::new(ScriptedTts::failing(voxline_providers::ProviderError::fatal("bad voice")));
        let mut stage = TextToSpeechStage::new(tts, RetryPolicy::default());
        let out: Vec<_> = stage.process(Frame::token("Hi.", false)).collect().await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_err());
    }
}
