//! Transport-Input: turns transport events into frames.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use voxline_core::config::VadConfig;
use voxline_core::frame::{ControlSignal, Frame};
use voxline_media::vad::{VadEvent, VadSegmenter, VoiceActivityDetector};
use voxline_providers::{SharedTransport, TransportEvent};

use crate::error::StageError;
use crate::stage::{FrameStream, Stage, StageContext, StageKind, pass};

pub struct TransportInputStage {
    transport: SharedTransport,
    vad: Option<VadSegmenter>,
}

impl TransportInputStage {
    /// Local VAD is attached only when enabled and the transport does not report speech itself.
    pub fn new(transport: SharedTransport, vad: &VadConfig, sample_rate: u32) -> Self {
        let vad = (vad.enabled && !transport.reports_voice_activity()).then(|| {
            VadSegmenter::new(
                VoiceActivityDetector::with_stop_ms(vad.threshold, vad.stop_ms),
                sample_rate,
            )
        });
        Self { transport, vad }
    }
}

/// Map one transport event to frames. `None` ends the source.
fn frames_for(event: TransportEvent, vad: &mut Option<VadSegmenter>) -> Option<Vec<Frame>> {
    match event {
        TransportEvent::Audio(audio) => {
            let Some(seg) = vad.as_mut() else {
                return Some(vec![Frame::Audio(audio)]);
            };
            let edges = seg.push(&audio.data);
            let mut out = Vec::with_capacity(edges.len() + 1);
            // Speech onsets precede the audio that carries them, offsets follow it.
            out.extend(
                edges
                    .iter()
                    .filter(|e| **e == VadEvent::SpeechStarted)
                    .map(|_| Frame::Control(ControlSignal::UserStartedSpeaking)),
            );
            out.push(Frame::Audio(audio));
            out.extend(
                edges
                    .iter()
                    .filter(|e| **e == VadEvent::SpeechEnded)
                    .map(|_| Frame::Control(ControlSignal::UserStoppedSpeaking)),
            );
            Some(out)
        }
        TransportEvent::Control(signal) => Some(vec![Frame::Control(signal)]),
        TransportEvent::Disconnected => None,
    }
}

struct SourceState {
    events: BoxStream<'static, TransportEvent>,
    vad: Option<VadSegmenter>,
    queued: VecDeque<Frame>,
    done: bool,
}

#[async_trait]
impl Stage for TransportInputStage {
    fn kind(&self) -> StageKind {
        StageKind::TransportInput
    }

    async fn setup(&mut self, ctx: &StageContext) -> Result<(), StageError> {
        self.transport.connect().await?;
        info!(session_id = %ctx.session_id, transport = self.transport.id(), local_vad = self.vad.is_some(), "Transport connected");
        Ok(())
    }

    fn take_source(&mut self) -> Option<FrameStream> {
        let events = self.transport.take_events()?;
        let state = SourceState {
            events,
            vad: self.vad.take(),
            queued: Default::default(),
            done: false,
        };

        let source = futures::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(frame) = st.queued.pop_front() {
                    return Some((Ok(frame), st));
                }
                if st.done {
                    return None;
                }
                let event = match st.events.next().await {
                    Some(event) => event,
                    None => TransportEvent::Disconnected,
                };
                match frames_for(event, &mut st.vad) {
                    Some(frames) => {
                        if frames
                            .iter()
                            .any(|f| f.as_control() == Some(&ControlSignal::EndSession))
                        {
                            debug!("End of session requested by remote");
                            st.done = true;
                        }
                        st.queued.extend(frames);
                    }
                    None => {
                        debug!("Remote disconnected");
                        st.done = true;
                        st.queued.push_back(Frame::Control(ControlSignal::EndSession));
                    }
                }
            }
        });
        Some(Box::pin(source))
    }

    fn process(&mut self, frame: Frame) -> FrameStream {
        pass(frame)
    }

    async fn teardown(&mut self) {
        self.transport.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use voxline_core::frame::AudioFrame;
    use voxline_media::pcm::samples_to_le_bytes;
    use voxline_providers::channel::ChannelTransport;

    fn vad_config() -> VadConfig {
        VadConfig {
            enabled: true,
            threshold: 100.0,
            stop_ms: 40,
        }
    }

    fn audio(level: i16, samples: usize) -> TransportEvent {
        let bytes = samples_to_le_bytes(&vec![level; samples]);
        TransportEvent::Audio(AudioFrame::new(bytes, 0, 16_000))
    }

    #[tokio::test]
    async fn test_local_vad_brackets_utterance() {
        let (transport, handle) = ChannelTransport::pair("t", 16);
        let mut stage = TransportInputStage::new(Arc::new(transport), &vad_config(), 16_000);
        let source = stage.take_source().unwrap();

        handle.inbound.send(audio(1000, 320)).await.unwrap();
        handle.inbound.send(audio(0, 640)).await.unwrap();
        drop(handle);

        let labels: Vec<&str> = source.map(|f| f.unwrap().label()).collect().await;
        assert_eq!(
            labels,
            vec![
                "user_started_speaking",
                "audio",
                "audio",
                "user_stopped_speaking",
                "end_session",
            ]
        );
    }

    #[tokio::test]
    async fn test_remote_vad_skips_detector() {
        let (transport, handle) = ChannelTransport::pair("t", 16);
        let transport = transport.with_voice_activity(true);
        let mut stage = TransportInputStage::new(Arc::new(transport), &vad_config(), 16_000);
        let mut source = stage.take_source().unwrap();

        handle.inbound.send(audio(1000, 320)).await.unwrap();
        let first = source.next().await.unwrap().unwrap();
        assert!(matches!(first, Frame::Audio(_)));
    }

    #[tokio::test]
    async fn test_end_session_stops_source() {
        let (transport, handle) = ChannelTransport::pair("t", 16);
        let mut stage = TransportInputStage::new(Arc::new(transport), &vad_config(), 16_000);
        let mut source = stage.take_source().unwrap();

        handle
            .inbound
            .send(TransportEvent::Control(ControlSignal::EndSession))
            .await
            .unwrap();
        handle.inbound.send(audio(1000, 320)).await.unwrap();

        let frame = source.next().await.unwrap().unwrap();
        assert_eq!(frame, Frame::Control(ControlSignal::EndSession));
        assert!(source.next().await.is_none());
        assert!(stage.take_source().is_none());
    }
}
