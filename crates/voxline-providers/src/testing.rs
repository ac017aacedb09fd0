//! Scripted in-memory providers for pipeline and gateway tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use voxline_core::context::ConversationContext;
use voxline_core::session::SessionConfig;

use crate::{
    AudioStream, LanguageModel, ProviderError, ProviderResolver, ProviderSet, SpeechToText,
    TextToSpeech, TokenStream,
};

/// STT that replays queued transcripts, then repeats a fallback.
pub struct ScriptedStt {
    replies: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: Result<String, ProviderError>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedStt {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            fallback: Ok(String::new()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fails every call with `err`.
    pub fn failing(err: ProviderError) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: Err(err),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Replays `replies` (errors included) in order.
    pub fn sequence(replies: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: Ok(String::new()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleeps `delay` before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    fn id(&self) -> &str {
        "scripted-stt"
    }

    async fn transcribe(&self, _pcm: Bytes, _sample_rate: u32) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Opens a gated [`ScriptedLlm`].
#[derive(Clone)]
pub struct LlmGate(Arc<watch::Sender<bool>>);

impl LlmGate {
    pub fn open(&self) {
        self.0.send_replace(true);
    }
}

/// LLM that streams the same reply for every request.
pub struct ScriptedLlm {
    reply: Vec<String>,
    token_delay: Duration,
    gate: Option<watch::Receiver<bool>>,
    contexts: Mutex<Vec<ConversationContext>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reply: tokens.into_iter().map(Into::into).collect(),
            token_delay: Duration::ZERO,
            gate: None,
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Hold every stream before its first token until the gate opens.
    pub fn gated(mut self) -> (Self, LlmGate) {
        let (tx, rx) = watch::channel(false);
        self.gate = Some(rx);
        (self, LlmGate(Arc::new(tx)))
    }

    /// Contexts received so far, one per request.
    pub fn contexts(&self) -> Vec<ConversationContext> {
        self.contexts.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    fn id(&self) -> &str {
        "scripted-llm"
    }

    async fn stream(&self, context: &ConversationContext) -> Result<TokenStream, ProviderError> {
        if let Ok(mut seen) = self.contexts.lock() {
            seen.push(context.clone());
        }
        let gate = self.gate.clone();
        let delay = self.token_delay;
        let tokens: VecDeque<String> = self.reply.iter().cloned().collect();

        let stream = futures::stream::unfold((tokens, gate), move |(mut tokens, mut gate)| async move {
            if let Some(mut rx) = gate.take() {
                if rx.wait_for(|open| *open).await.is_err() {
                    return None;
                }
            }
            let token = tokens.pop_front()?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Some((Ok(token), (tokens, None)))
        });
        Ok(Box::pin(stream))
    }
}

/// TTS that returns `chunks` frames of constant PCM per request.
pub struct ScriptedTts {
    chunks: usize,
    chunk_bytes: usize,
    chunk_delay: Duration,
    fail: Option<ProviderError>,
    texts: Mutex<Vec<String>>,
}

impl ScriptedTts {
    pub fn new(chunks: usize) -> Self {
        Self {
            chunks,
            // 20ms at 16kHz
            chunk_bytes: 640,
            chunk_delay: Duration::ZERO,
            fail: None,
            texts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn failing(err: ProviderError) -> Self {
        Self {
            fail: Some(err),
            ..Self::new(0)
        }
    }

    /// Text of every synthesis request so far.
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TextToSpeech for ScriptedTts {
    fn id(&self) -> &str {
        "scripted-tts"
    }

    fn sample_rate(&self) -> u32 {
        16_000
    }

    async fn synthesize(&self, text: &str) -> Result<AudioStream, ProviderError> {
        if let Ok(mut texts) = self.texts.lock() {
            texts.push(text.to_string());
        }
        if let Some(err) = &self.fail {
            return Err(err.clone());
        }
        let chunk = Bytes::from(vec![0x11u8; self.chunk_bytes]);
        let delay = self.chunk_delay;
        let stream = futures::stream::unfold(self.chunks, move |remaining| {
            let chunk = chunk.clone();
            async move {
                if remaining == 0 {
                    return None;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Some((Ok(chunk), remaining - 1))
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Resolver that hands out the same provider set to every session.
pub struct StaticResolver {
    set: ProviderSet,
}

impl StaticResolver {
    pub fn new(set: ProviderSet) -> Self {
        Self { set }
    }

    /// Echo-style providers: every utterance transcribes to `transcript`.
    pub fn echo(transcript: &str, reply: &str) -> Self {
        let stt = ScriptedStt {
            replies: Mutex::new(VecDeque::new()),
            fallback: Ok(transcript.to_string()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        };
        Self::new(ProviderSet {
            stt: Arc::new(stt),
            llm: Arc::new(ScriptedLlm::new([reply.to_string()])),
            tts: Arc::new(ScriptedTts::new(2)),
        })
    }
}

impl ProviderResolver for StaticResolver {
    fn validate(&self, _session: &SessionConfig) -> Result<(), ProviderError> {
        Ok(())
    }

    fn resolve(&self, _session: &SessionConfig) -> Result<ProviderSet, ProviderError> {
        Ok(self.set.clone())
    }
}
