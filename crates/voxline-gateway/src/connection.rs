//! One session's WebSocket: bridges the socket onto a [`ChannelTransport`]
//! and runs the session's pipeline until it ends.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use voxline_core::frame::AudioFrame;
use voxline_core::protocol::{ClientMessage, EndStatus, ServerMessage};
use voxline_core::session::SessionState;
use voxline_media::pcm::duration_ms;
use voxline_pipeline::{Pipeline, PipelineTask, TaskOptions, TaskState};
use voxline_providers::TransportEvent;
use voxline_providers::channel::{ChannelTransport, TransportOutput};

use crate::registry::Session;
use crate::state::AppState;

/// Extra time on top of the drain grace before a stuck task is aborted.
const TEARDOWN_SLACK: Duration = Duration::from_secs(1);

/// Handle an upgraded `/ws/{session_id}` connection.
pub async fn handle_session_socket(state: Arc<AppState>, session: Arc<Session>, ws: WebSocket) {
    let (mut ws_tx, ws_rx) = ws.split();
    let session_id = session.id.clone();

    if let Err(current) = session.activate() {
        warn!(session_id = %session_id, state = current.as_str(), "Rejecting second connection");
        let msg = ended(&session_id, EndStatus::Error, Some(format!("session is already {}", current.as_str())));
        if let Ok(text) = serde_json::to_string(&msg) {
            let _ = ws_tx.send(Message::Text(text.into())).await;
        }
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    }
    info!(session_id = %session_id, "WebSocket connected");

    #[cfg(feature = "metrics")]
    crate::metrics::record_session_connected();

    // Every server message goes through one writer; it closes the socket
    // after the terminal message.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let terminal = msg.is_terminal();
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!(error = %e, "Failed to encode server message"),
            }
            if terminal {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    });

    let outcome = run_session(&state, &session, ws_rx, &out_tx).await;

    let (status, reason) = match &outcome {
        TaskState::Failed(reason) => (EndStatus::Error, Some(reason.clone())),
        _ => (EndStatus::Completed, None),
    };
    let _ = out_tx.send(ended(&session_id, status, reason));
    drop(out_tx);
    if tokio::time::timeout(TEARDOWN_SLACK, writer).await.is_err() {
        debug!(session_id = %session_id, "Socket writer did not finish");
    }

    session.advance_to(SessionState::Closed);
    state.registry.remove(&session_id).await;

    #[cfg(feature = "metrics")]
    crate::metrics::record_session_closed(outcome.as_str());

    info!(session_id = %session_id, outcome = %outcome, "WebSocket session closed");
}

fn ended(session_id: &str, status: EndStatus, reason: Option<String>) -> ServerMessage {
    ServerMessage::SessionEnded {
        session_id: session_id.to_string(),
        status,
        reason,
    }
}

/// Build and run the pipeline, pumping socket traffic until it finishes.
async fn run_session(
    state: &Arc<AppState>,
    session: &Arc<Session>,
    mut ws_rx: SplitStream<WebSocket>,
    out_tx: &mpsc::UnboundedSender<ServerMessage>,
) -> TaskState {
    let session_id = session.id.clone();
    let pipeline_config = state.config.pipeline();

    let providers = match state.resolver.resolve(&session.config) {
        Ok(providers) => providers,
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Provider setup failed");
            return TaskState::Failed(e.to_string());
        }
    };

    let (transport, handle) = ChannelTransport::pair(session_id.clone(), pipeline_config.queue_capacity);
    let pipeline = match Pipeline::voice(
        Arc::new(transport),
        providers,
        &pipeline_config,
        &state.system_prompt(&session.config),
    ) {
        Ok(pipeline) => pipeline,
        Err(e) => return TaskState::Failed(e.to_string()),
    };

    let options = TaskOptions::from(&pipeline_config);
    let drain_grace = options.drain_grace;
    let task = Arc::new(PipelineTask::new(session_id.clone(), pipeline, options));
    session.attach_task(task.clone());

    if let Err(e) = state.runner.spawn(task.clone(), |_| {}) {
        error!(session_id = %session_id, error = %e, "Could not start pipeline");
        return TaskState::Failed(e.to_string());
    }

    let mirror = mirror_task_state(session.clone(), &task);
    let pump = pump_outbound(handle.outbound, out_tx.clone());
    let inbound = handle.inbound;

    let completion = task.await_completion();
    tokio::pin!(completion);
    let mut clock_ms = 0u64;
    let sample_rate = pipeline_config.input_sample_rate;

    let finished = loop {
        tokio::select! {
            outcome = &mut completion => break Some(outcome),
            msg = ws_rx.next() => {
                let event = match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Audio { data, sample_rate: rate }) => match BASE64.decode(data.as_bytes()) {
                            Ok(pcm) => Some(audio_event(pcm, &mut clock_ms, rate.unwrap_or(sample_rate))),
                            Err(e) => {
                                let _ = out_tx.send(ServerMessage::Error { message: format!("invalid audio payload: {e}") });
                                None
                            }
                        },
                        Ok(ClientMessage::Control { action }) => {
                            debug!(session_id = %session_id, ?action, "Client control");
                            Some(TransportEvent::Control(action.to_signal()))
                        }
                        Ok(ClientMessage::Test { text }) => {
                            let _ = out_tx.send(ServerMessage::BotResponse {
                                text,
                                session_id: session_id.clone(),
                            });
                            None
                        }
                        Err(e) => {
                            warn!(session_id = %session_id, error = %e, "Invalid client message");
                            let _ = out_tx.send(ServerMessage::Error { message: format!("invalid message: {e}") });
                            None
                        }
                    },
                    Some(Ok(Message::Binary(pcm))) => Some(audio_event(pcm.to_vec(), &mut clock_ms, sample_rate)),
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(session_id = %session_id, "Client closed the socket");
                        break None;
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, error = %e, "WebSocket error");
                        break None;
                    }
                    Some(Ok(_)) => None,
                };
                if let Some(event) = event {
                    if inbound.send(event).await.is_err() {
                        debug!(session_id = %session_id, "Pipeline stopped reading input");
                    }
                }
            }
        }
    };

    let outcome = match finished {
        Some(outcome) => outcome,
        None => {
            // Remote is gone: end the input stream and let in-flight work drain.
            drop(inbound);
            match tokio::time::timeout(drain_grace + TEARDOWN_SLACK, &mut completion).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(session_id = %session_id, "Pipeline did not drain in time, aborting");
                    task.abort();
                    task.state()
                }
            }
        }
    };

    // Flush bot output produced before the end.
    if tokio::time::timeout(TEARDOWN_SLACK, pump).await.is_err() {
        debug!(session_id = %session_id, "Outbound pump did not finish");
    }
    mirror.abort();

    #[cfg(feature = "metrics")]
    {
        crate::metrics::record_interruptions(task.interruptions());
        if let TaskState::Failed(reason) = &outcome {
            crate::metrics::record_stage_error(reason);
        }
    }

    outcome
}

fn audio_event(pcm: Vec<u8>, clock_ms: &mut u64, sample_rate: u32) -> TransportEvent {
    let timestamp_ms = *clock_ms;
    *clock_ms += duration_ms(pcm.len(), sample_rate);
    TransportEvent::Audio(AudioFrame::new(pcm, timestamp_ms, sample_rate))
}

/// Forward pipeline output to the socket writer until the transport goes away.
fn pump_outbound(
    mut outbound: mpsc::Receiver<TransportOutput>,
    out_tx: mpsc::UnboundedSender<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(output) = outbound.recv().await {
            let msg = match output {
                TransportOutput::Audio(audio) => ServerMessage::Audio {
                    data: BASE64.encode(&audio.data),
                    sample_rate: audio.sample_rate,
                },
                TransportOutput::Text { text, is_final } => ServerMessage::BotText { text, is_final },
            };
            if out_tx.send(msg).is_err() {
                break;
            }
        }
    })
}

/// Keep the session's lifecycle in step with its task.
fn mirror_task_state(session: Arc<Session>, task: &PipelineTask) -> JoinHandle<()> {
    let mut states = task.subscribe_state();
    tokio::spawn(async move {
        loop {
            let current = states.borrow_and_update().clone();
            match current {
                TaskState::Draining => {
                    session.advance_to(SessionState::Draining);
                }
                s if s.is_terminal() => {
                    session.advance_to(SessionState::Draining);
                    return;
                }
                _ => {}
            }
            if states.changed().await.is_err() {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_clock_advances() {
        let mut clock = 0;
        let first = audio_event(vec![0u8; 640], &mut clock, 16_000);
        let second = audio_event(vec![0u8; 320], &mut clock, 16_000);
        match (first, second) {
            (TransportEvent::Audio(a), TransportEvent::Audio(b)) => {
                assert_eq!(a.timestamp_ms, 0);
                assert_eq!(b.timestamp_ms, 20);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(clock, 30);
    }

    #[test]
    fn test_ended_message() {
        let msg = ended("s1", EndStatus::Error, Some("boom".into()));
        assert!(msg.is_terminal());
    }
}
