//! In-process transport backed by tokio channels.
//!
//! The gateway bridges a WebSocket onto a [`ChannelTransport`]; tests drive one
//! directly through its [`TransportHandle`].

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use voxline_core::frame::AudioFrame;

use crate::{AudioTransport, ProviderError, TransportEvent};

/// Something the pipeline wants delivered to the remote party.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportOutput {
    Audio(AudioFrame),
    Text { text: String, is_final: bool },
}

pub struct ChannelTransport {
    id: String,
    reports_vad: bool,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    outbound: mpsc::Sender<TransportOutput>,
    closed: AtomicBool,
}

/// The remote side of a [`ChannelTransport`].
pub struct TransportHandle {
    pub inbound: mpsc::Sender<TransportEvent>,
    pub outbound: mpsc::Receiver<TransportOutput>,
}

impl ChannelTransport {
    /// Create a connected transport/handle pair.
    pub fn pair(id: impl Into<String>, capacity: usize) -> (Self, TransportHandle) {
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let transport = Self {
            id: id.into(),
            reports_vad: false,
            events: Mutex::new(Some(in_rx)),
            outbound: out_tx,
            closed: AtomicBool::new(false),
        };
        (
            transport,
            TransportHandle {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }

    /// Mark the remote side as sending its own voice-activity controls.
    pub fn with_voice_activity(mut self, reports: bool) -> Self {
        self.reports_vad = reports;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outbound.is_closed()
    }

    async fn deliver(&self, output: TransportOutput) -> Result<(), ProviderError> {
        if self.is_closed() {
            debug!(transport = %self.id, "Transport closed, dropping output");
            return Ok(());
        }
        if self.outbound.send(output).await.is_err() {
            // Remote went away; the inbound side reports the disconnect.
            debug!(transport = %self.id, "Remote receiver dropped");
        }
        Ok(())
    }
}

#[async_trait]
impl AudioTransport for ChannelTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn reports_voice_activity(&self) -> bool {
        self.reports_vad
    }

    async fn connect(&self) -> Result<(), ProviderError> {
        if self.is_closed() {
            return Err(ProviderError::fatal(format!("transport {} is closed", self.id)));
        }
        Ok(())
    }

    fn take_events(&self) -> Option<BoxStream<'static, TransportEvent>> {
        let rx = self.events.lock().ok()?.take()?;
        let disconnected = futures::stream::once(async { TransportEvent::Disconnected });
        Some(Box::pin(ReceiverStream::new(rx).chain(disconnected)))
    }

    async fn send_audio(&self, audio: &AudioFrame) -> Result<(), ProviderError> {
        self.deliver(TransportOutput::Audio(audio.clone())).await
    }

    async fn send_text(&self, text: &str, is_final: bool) -> Result<(), ProviderError> {
        self.deliver(TransportOutput::Text {
            text: text.to_string(),
            is_final,
        })
        .await
    }

    async fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(transport = %self.id, "Transport disconnected");
        }
    }
}
