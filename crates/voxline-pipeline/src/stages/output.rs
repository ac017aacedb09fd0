//! Transport-Output: delivers bot audio and text to the remote party.

use async_trait::async_trait;
use tracing::debug;

use voxline_core::frame::{ControlSignal, Frame};
use voxline_providers::SharedTransport;

use crate::error::StageError;
use crate::stage::{FrameStream, Stage, StageKind, frames, nothing};

pub struct TransportOutputStage {
    transport: SharedTransport,
    /// A bot turn has reached the transport and not yet been closed.
    speaking: bool,
}

impl TransportOutputStage {
    pub fn new(transport: SharedTransport) -> Self {
        Self {
            transport,
            speaking: false,
        }
    }
}

#[async_trait]
impl Stage for TransportOutputStage {
    fn kind(&self) -> StageKind {
        StageKind::TransportOutput
    }

    fn process(&mut self, frame: Frame) -> FrameStream {
        match frame {
            Frame::Audio(audio) => {
                let opens_turn = !self.speaking;
                self.speaking = true;
                let transport = self.transport.clone();
                let send = futures::stream::once(async move {
                    transport.send_audio(&audio).await.map_err(StageError::from)
                });
                let out = futures::stream::StreamExt::filter_map(send, move |sent| async move {
                    match sent {
                        Ok(()) if opens_turn => {
                            Some(Ok(Frame::Control(ControlSignal::BotStartedSpeaking)))
                        }
                        Ok(()) => None,
                        Err(e) => Some(Err(e)),
                    }
                });
                Box::pin(out)
            }
            Frame::TextToken { text, is_final } => {
                if text.is_empty() && !is_final {
                    return nothing();
                }
                let transport = self.transport.clone();
                let send = futures::stream::once(async move {
                    transport
                        .send_text(&text, is_final)
                        .await
                        .map_err(StageError::from)
                });
                let out = futures::stream::StreamExt::filter_map(send, |sent| async move {
                    sent.err().map(Err)
                });
                Box::pin(out)
            }
            Frame::Control(ControlSignal::ResponseCompleted { .. }) if self.speaking => {
                self.speaking = false;
                debug!("Bot turn delivered");
                frames(vec![Frame::Control(ControlSignal::BotStoppedSpeaking)])
            }
            _ => nothing(),
        }
    }

    fn handle_control(&mut self, signal: &ControlSignal) {
        if *signal == ControlSignal::Interrupt && self.speaking {
            debug!("Bot turn interrupted");
            self.speaking = false;
        }
    }
}
