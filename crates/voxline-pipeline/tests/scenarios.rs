//! End-to-end pipeline scenarios over an in-process transport.
//!
//! Run with: `cargo test -p voxline-pipeline --test scenarios`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use voxline_core::config::PipelineConfig;
use voxline_core::context::Role;
use voxline_core::frame::{AudioFrame, ControlSignal, Frame};
use voxline_pipeline::stage::nothing;
use voxline_pipeline::stages::{TransportInputStage, TransportOutputStage};
use voxline_pipeline::{
    ConversationState, FrameStream, Pipeline, PipelineError, PipelineTask, Stage, StageKind,
    TaskOptions, TaskState,
};
use voxline_providers::channel::{ChannelTransport, TransportHandle, TransportOutput};
use voxline_providers::testing::{ScriptedLlm, ScriptedStt, ScriptedTts};
use voxline_providers::{ProviderError, ProviderSet, TransportEvent};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.retry.base_delay_ms = 1;
    config.drain_grace_ms = 1_000;
    config
}

struct Harness {
    task: Arc<PipelineTask>,
    handle: TransportHandle,
}

impl Harness {
    fn new(providers: ProviderSet) -> Self {
        let config = config();
        let (transport, handle) = ChannelTransport::pair("scenario", 256);
        let transport = Arc::new(transport.with_voice_activity(true));
        let pipeline = Pipeline::voice(transport, providers, &config, "be brief").unwrap();
        let task = Arc::new(PipelineTask::new("scenario", pipeline, TaskOptions::from(&config)));
        task.start().unwrap();
        Self { task, handle }
    }

    async fn send(&self, event: TransportEvent) {
        self.handle.inbound.send(event).await.unwrap();
    }

    async fn utterance(&self) {
        self.send(TransportEvent::Control(ControlSignal::UserStartedSpeaking)).await;
        self.send(TransportEvent::Audio(AudioFrame::new(vec![7u8; 3200], 0, 16_000)))
            .await;
        self.send(TransportEvent::Control(ControlSignal::UserStoppedSpeaking)).await;
    }

    async fn barge_in(&self) {
        self.send(TransportEvent::Control(ControlSignal::UserStartedSpeaking)).await;
    }
}

async fn wait_conversation(rx: &mut watch::Receiver<ConversationState>, want: ConversationState) {
    timeout(WAIT, rx.wait_for(|s| *s == want))
        .await
        .expect("conversation state not reached")
        .unwrap();
}

/// Read outbound until the final text marker of one bot turn.
async fn read_turn(handle: &mut TransportHandle) -> (usize, String) {
    let mut audio = 0;
    let mut text = String::new();
    loop {
        match timeout(WAIT, handle.outbound.recv()).await.unwrap() {
            Some(TransportOutput::Audio(_)) => audio += 1,
            Some(TransportOutput::Text { is_final: true, .. }) => return (audio, text),
            Some(TransportOutput::Text { text: t, .. }) => text.push_str(&t),
            None => return (audio, text),
        }
    }
}

#[tokio::test]
async fn test_full_turn_and_assistant_history() {
    let llm = Arc::new(ScriptedLlm::new(["Hello!", " How can I help?"]));
    let tts = Arc::new(ScriptedTts::new(3));
    let mut h = Harness::new(ProviderSet {
        stt: Arc::new(ScriptedStt::new(["hi", "what time is it"])),
        llm: llm.clone(),
        tts: tts.clone(),
    });

    h.utterance().await;
    let (audio, text) = read_turn(&mut h.handle).await;
    assert_eq!(audio, 6);
    assert_eq!(text, "Hello! How can I help?");
    assert_eq!(tts.texts(), vec!["Hello!", "How can I help?"]);

    sleep(Duration::from_millis(100)).await;
    h.utterance().await;
    read_turn(&mut h.handle).await;

    let contexts = llm.contexts();
    assert_eq!(contexts.len(), 2);
    let second = contexts[1].turns();
    assert_eq!(second.len(), 4);
    assert_eq!(second[2].role, Role::Assistant);
    assert_eq!(second[2].content, "Hello! How can I help?");
    assert_eq!(second[3].content, "what time is it");

    h.task.cancel();
    assert_eq!(h.task.await_completion().await, TaskState::Cancelled);
}

#[tokio::test]
async fn test_barge_in_during_generation() {
    let (llm, gate) = ScriptedLlm::new(["Sure, here is a long answer."]).gated();
    let llm = Arc::new(llm);
    let mut h = Harness::new(ProviderSet {
        stt: Arc::new(ScriptedStt::new(["hello"])),
        llm: llm.clone(),
        tts: Arc::new(ScriptedTts::new(2)),
    });
    let mut conversation = h.task.conversation_state();

    h.utterance().await;
    wait_conversation(&mut conversation, ConversationState::BotGenerating).await;

    h.barge_in().await;
    wait_conversation(&mut conversation, ConversationState::UserSpeaking).await;
    assert_eq!(h.task.interruptions(), 1);
    assert_eq!(h.task.epoch(), 1);

    gate.open();
    sleep(Duration::from_millis(200)).await;
    while let Ok(out) = h.handle.outbound.try_recv() {
        assert!(!matches!(out, TransportOutput::Audio(_)), "audio after barge-in");
    }
    assert_eq!(*conversation.borrow(), ConversationState::UserSpeaking);
    assert_eq!(llm.contexts().len(), 1);

    h.task.cancel();
    h.task.await_completion().await;
}

#[tokio::test]
async fn test_newer_utterance_supersedes_pending_reply() {
    let stt = ScriptedStt::new(["first question", "second question"])
        .with_delay(Duration::from_millis(300));
    let llm = Arc::new(ScriptedLlm::new(["Only this."]));
    let mut h = Harness::new(ProviderSet {
        stt: Arc::new(stt),
        llm: llm.clone(),
        tts: Arc::new(ScriptedTts::new(2)),
    });

    // The second utterance ends while the first is still being transcribed.
    h.utterance().await;
    sleep(Duration::from_millis(50)).await;
    h.utterance().await;

    let (audio, text) = read_turn(&mut h.handle).await;
    assert_eq!(audio, 2);
    assert_eq!(text, "Only this.");

    sleep(Duration::from_millis(500)).await;
    assert!(h.handle.outbound.try_recv().is_err(), "a second bot turn was delivered");
    assert_eq!(h.task.interruptions(), 1);

    let contexts = llm.contexts();
    assert_eq!(contexts.len(), 1);
    let turns = contexts[0].turns();
    assert_eq!(turns.last().unwrap().content, "second question");

    h.task.cancel();
    assert_eq!(h.task.await_completion().await, TaskState::Cancelled);
}

#[tokio::test]
async fn test_interrupt_while_bot_speaking_stops_audio() {
    const CHUNKS: usize = 50;
    let tts = ScriptedTts::new(CHUNKS).with_chunk_delay(Duration::from_millis(20));
    let h = Harness::new(ProviderSet {
        stt: Arc::new(ScriptedStt::new(["tell me a story"])),
        llm: Arc::new(ScriptedLlm::new(["Once upon a time."])),
        tts: Arc::new(tts),
    });
    let mut conversation = h.task.conversation_state();
    let Harness { task, handle } = h;
    let TransportHandle { inbound, mut outbound } = handle;

    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    tokio::spawn(async move {
        while let Some(out) = outbound.recv().await {
            if matches!(out, TransportOutput::Audio(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    inbound
        .send(TransportEvent::Control(ControlSignal::UserStartedSpeaking))
        .await
        .unwrap();
    inbound
        .send(TransportEvent::Audio(AudioFrame::new(vec![7u8; 3200], 0, 16_000)))
        .await
        .unwrap();
    inbound
        .send(TransportEvent::Control(ControlSignal::UserStoppedSpeaking))
        .await
        .unwrap();
    wait_conversation(&mut conversation, ConversationState::BotSpeaking).await;
    sleep(Duration::from_millis(60)).await;

    inbound
        .send(TransportEvent::Control(ControlSignal::UserStartedSpeaking))
        .await
        .unwrap();
    wait_conversation(&mut conversation, ConversationState::UserSpeaking).await;

    sleep(Duration::from_millis(50)).await;
    let at_interrupt = delivered.load(Ordering::SeqCst);
    sleep(Duration::from_millis(300)).await;
    let later = delivered.load(Ordering::SeqCst);
    assert_eq!(at_interrupt, later, "audio kept flowing after interrupt");
    assert!(later < CHUNKS);

    task.cancel();
    task.await_completion().await;
}

#[tokio::test]
async fn test_transient_stt_failures_fail_task() {
    let stt = Arc::new(ScriptedStt::failing(ProviderError::transient("503 from upstream")));
    let h = Harness::new(ProviderSet {
        stt: stt.clone(),
        llm: Arc::new(ScriptedLlm::new(["unused"])),
        tts: Arc::new(ScriptedTts::new(1)),
    });

    h.utterance().await;
    match timeout(WAIT, h.task.await_completion()).await.unwrap() {
        TaskState::Failed(reason) => {
            assert!(reason.contains("speech_to_text"), "{reason}");
            assert!(reason.contains("after 3 attempts"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(stt.calls(), 3);
    assert_eq!(h.task.pending_frames(), 0);
}

#[tokio::test]
async fn test_cancel_mid_turn_releases_everything() {
    let h = Harness::new(ProviderSet {
        stt: Arc::new(ScriptedStt::new(["go"])),
        llm: Arc::new(ScriptedLlm::new(["A long reply."])),
        tts: Arc::new(ScriptedTts::new(100).with_chunk_delay(Duration::from_millis(20))),
    });
    let mut conversation = h.task.conversation_state();
    h.utterance().await;
    wait_conversation(&mut conversation, ConversationState::BotSpeaking).await;

    h.task.cancel();
    let state = timeout(Duration::from_millis(1_000), h.task.await_completion())
        .await
        .expect("task did not stop within grace");
    assert_eq!(state, TaskState::Cancelled);
    assert_eq!(h.task.pending_frames(), 0);
    assert!(matches!(h.task.start(), Err(PipelineError::TaskAlreadyRunning(_))));
}

#[tokio::test]
async fn test_remote_end_drains_to_completion() {
    let mut h = Harness::new(ProviderSet {
        stt: Arc::new(ScriptedStt::new(["bye"])),
        llm: Arc::new(ScriptedLlm::new(["Goodbye."])),
        tts: Arc::new(ScriptedTts::new(2)),
    });
    let mut states = h.task.subscribe_state();

    h.utterance().await;
    h.send(TransportEvent::Control(ControlSignal::EndSession)).await;
    timeout(WAIT, states.wait_for(|s| *s == TaskState::Draining || s.is_terminal()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(timeout(WAIT, h.task.await_completion()).await.unwrap(), TaskState::Completed);
    let (audio, _) = read_turn(&mut h.handle).await;
    assert_eq!(audio, 2);
}

/// Records audio timestamps in arrival order.
struct Recorder {
    seen: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl Stage for Recorder {
    fn kind(&self) -> StageKind {
        StageKind::SpeechToText
    }

    fn process(&mut self, frame: Frame) -> FrameStream {
        if let Frame::Audio(audio) = frame {
            self.seen.lock().unwrap().push(audio.timestamp_ms);
        }
        nothing()
    }
}

#[tokio::test]
async fn test_links_preserve_order_under_backpressure() {
    let (transport, handle) = ChannelTransport::pair("fifo", 4);
    let transport = Arc::new(transport.with_voice_activity(true));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::builder()
        .stage(TransportInputStage::new(transport.clone(), &Default::default(), 16_000))
        .stage(Recorder { seen: seen.clone() })
        .stage(TransportOutputStage::new(transport))
        .build()
        .unwrap();
    let options = TaskOptions {
        queue_capacity: 2,
        ..TaskOptions::default()
    };
    let task = PipelineTask::new("fifo", pipeline, options);
    task.start().unwrap();

    for ts in 0..200u64 {
        handle
            .inbound
            .send(TransportEvent::Audio(AudioFrame::new(vec![0u8; 32], ts, 16_000)))
            .await
            .unwrap();
    }
    drop(handle);

    assert_eq!(timeout(WAIT, task.await_completion()).await.unwrap(), TaskState::Completed);
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, (0..200).collect::<Vec<_>>());
}

#[test]
fn test_pipeline_without_output_is_rejected() {
    let (transport, _handle) = ChannelTransport::pair("bad", 4);
    let result = Pipeline::builder()
        .stage(TransportInputStage::new(Arc::new(transport), &Default::default(), 16_000))
        .stage(Recorder {
            seen: Default::default(),
        })
        .build();
    assert!(matches!(result, Err(PipelineError::InvalidPipelineConfiguration(_))));
}
