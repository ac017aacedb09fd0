//! Context-Aggregator: owns the session's conversation history.

use async_trait::async_trait;
use tracing::debug;

use voxline_core::context::ConversationContext;
use voxline_core::frame::{ControlSignal, Frame};

use crate::stage::{FrameStream, Stage, StageKind, nothing, pass};

pub struct ContextAggregatorStage {
    context: ConversationContext,
}

impl ContextAggregatorStage {
    pub fn new(system_prompt: &str) -> Self {
        Self {
            context: ConversationContext::with_system_prompt(system_prompt),
        }
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }
}

#[async_trait]
impl Stage for ContextAggregatorStage {
    fn kind(&self) -> StageKind {
        StageKind::ContextAggregator
    }

    fn process(&mut self, frame: Frame) -> FrameStream {
        match frame {
            Frame::Transcript { text, is_final: true } => {
                if !self.context.push_user(&text) {
                    return nothing();
                }
                debug!(turns = self.context.len(), "User turn appended");
                pass(Frame::GenerationRequest(self.context.clone()))
            }
            // Interim transcripts never mutate the history.
            Frame::Transcript { .. } => nothing(),
            other => pass(other),
        }
    }

    fn handle_control(&mut self, signal: &ControlSignal) {
        if let ControlSignal::ResponseCompleted { text } = signal {
            if self.context.push_assistant(text) {
                debug!(turns = self.context.len(), "Assistant turn appended");
            }
        }
    }
}
