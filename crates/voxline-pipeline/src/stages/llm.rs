//! Language-Model: streams a reply for each generation request.
//!
//! Every generation is bracketed by `ResponseStarted` and
//! `ResponseCompleted { text }`. An interrupted generation never completes.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::StreamExt;
use tracing::debug;

use voxline_core::context::ConversationContext;
use voxline_core::frame::{ControlSignal, Frame};
use voxline_providers::{LanguageModel, TokenStream};

use crate::error::StageError;
use crate::retry::RetryPolicy;
use crate::stage::{FrameStream, Stage, StageKind, pass};

pub struct LanguageModelStage {
    llm: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
}

impl LanguageModelStage {
    pub fn new(llm: Arc<dyn LanguageModel>, retry: RetryPolicy) -> Self {
        Self { llm, retry }
    }
}

enum Phase {
    Start,
    Open,
    Streaming(TokenStream),
    Finish,
    Done,
}

struct Generation {
    llm: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    context: ConversationContext,
    text: String,
    phase: Phase,
}

impl Generation {
    async fn next(mut self) -> Option<(Result<Frame, StageError>, Self)> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Start => {
                    self.phase = Phase::Open;
                    return Some((Ok(Frame::Control(ControlSignal::ResponseStarted)), self));
                }
                Phase::Open => {
                    let llm = self.llm.clone();
                    let context = &self.context;
                    let opened = self
                        .retry
                        .run("generation", || {
                            let llm = llm.clone();
                            async move { llm.stream(context).await }
                        })
                        .await;
                    match opened {
                        Ok(tokens) => self.phase = Phase::Streaming(tokens),
                        Err(e) => return Some((Err(e), self)),
                    }
                }
                Phase::Streaming(mut tokens) => match tokens.next().await {
                    Some(Ok(token)) => {
                        self.text.push_str(&token);
                        self.phase = Phase::Streaming(tokens);
                        return Some((Ok(Frame::token(token, false)), self));
                    }
                    // Tokens already went downstream, so a broken stream cannot be replayed.
                    Some(Err(e)) => {
                        return Some((Err(StageError::fatal(format!("generation stream failed: {e}"))), self));
                    }
                    None => {
                        self.phase = Phase::Finish;
                        return Some((Ok(Frame::token("", true)), self));
                    }
                },
                Phase::Finish => {
                    debug!(provider = self.llm.id(), chars = self.text.len(), "Generation complete");
                    let text = std::mem::take(&mut self.text);
                    return Some((Ok(Frame::Control(ControlSignal::ResponseCompleted { text })), self));
                }
                Phase::Done => return None,
            }
        }
    }
}

#[async_trait]
impl Stage for LanguageModelStage {
    fn kind(&self) -> StageKind {
        StageKind::LanguageModel
    }

    fn process(&mut self, frame: Frame) -> FrameStream {
        match frame {
            Frame::GenerationRequest(context) => {
                let generation = Generation {
                    llm: self.llm.clone(),
                    retry: self.retry,
                    context,
                    text: String::new(),
                    phase: Phase::Start,
                };
                Box::pin(futures::stream::unfold(generation, Generation::next))
            }
            other => pass(other),
        }
    }
}
