//! Running one pipeline: stage workers, control fan-out and lifecycle.
//!
//! Each stage runs as its own worker. Adjacent workers are joined by a
//! bounded FIFO link; control signals raised by any stage go through the
//! task's bus, where the [`InterruptionController`] sees them before they are
//! fanned out to every stage's control channel.
//!
//! Every frame carries the interruption epoch it was produced under. An
//! interrupt advances the epoch at the moment it is raised, so interruptible
//! stages discard queued frames of the abandoned turn without waiting for
//! the broadcast to reach them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use voxline_core::config::PipelineConfig;
use voxline_core::frame::{ControlSignal, Frame};

use crate::error::{PipelineError, StageError};
use crate::interruption::{ConversationState, InterruptionController};
use crate::pipeline::Pipeline;
use crate::stage::{FrameStream, Stage, StageContext, StageKind};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    /// Every stage finished setup and frames are flowing.
    Running,
    /// End of session requested; in-flight work is being flushed.
    Draining,
    Completed,
    Failed(String),
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub queue_capacity: usize,
    pub drain_grace: Duration,
    pub allow_interruptions: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for TaskOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity.max(1),
            drain_grace: Duration::from_millis(config.drain_grace_ms),
            allow_interruptions: config.allow_interruptions,
        }
    }
}

struct Envelope {
    frame: Frame,
    epoch: u64,
}

/// State every worker and the supervisor see.
struct Shared {
    epoch: AtomicU64,
    controller: Mutex<InterruptionController>,
    bus: mpsc::UnboundedSender<ControlSignal>,
    cancel: CancellationToken,
    cancelled: AtomicBool,
    state: watch::Sender<TaskState>,
}

impl Shared {
    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Raise a control signal produced by a stage.
    ///
    /// A signal from `origin_epoch` older than the current epoch belongs to an
    /// interrupted turn and is dropped. Returns whether it was published.
    fn publish(&self, signal: ControlSignal, origin_epoch: Option<u64>) -> bool {
        // Held across the epoch check so an interrupt cannot land in between.
        let mut controller = lock(&self.controller);
        if origin_epoch.is_some_and(|epoch| epoch < self.current_epoch()) {
            return false;
        }
        let interrupt = controller.observe(&signal);
        if signal == ControlSignal::Interrupt || interrupt.is_some() {
            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(epoch, "Interruption epoch advanced");
        }
        let _ = self.bus.send(signal);
        if let Some(interrupt) = interrupt {
            let _ = self.bus.send(interrupt);
        }
        true
    }

    fn set_state(&self, next: TaskState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

/// What a worker does after handling one control signal or emission.
enum Flow {
    Continue,
    /// Drop the in-flight `process` stream.
    Abandon,
    Stop,
}

fn apply_control(stage: &mut dyn Stage, kind: StageKind, signal: &ControlSignal) -> Flow {
    stage.handle_control(signal);
    match signal {
        ControlSignal::Interrupt if kind.is_interruptible() => Flow::Abandon,
        ControlSignal::EndSession if kind == StageKind::TransportInput => Flow::Stop,
        _ => Flow::Continue,
    }
}

type WorkerExit = (Box<dyn Stage>, StageKind, Result<(), StageError>);

struct Worker {
    stage: Box<dyn Stage>,
    kind: StageKind,
    input: Option<mpsc::Receiver<Envelope>>,
    output: Option<mpsc::Sender<Envelope>>,
    control: mpsc::UnboundedReceiver<ControlSignal>,
    shared: Arc<Shared>,
}

impl Worker {
    async fn run(mut self) -> WorkerExit {
        debug!(stage = %self.kind, "Stage worker started");
        let result = match self.stage.take_source() {
            Some(mut source) => self.drive(&mut source, None, 0).await.map(|_| ()),
            None => self.run_links().await,
        };
        if let Err(e) = &result {
            warn!(stage = %self.kind, error = %e, "Stage worker failed");
        } else {
            debug!(stage = %self.kind, "Stage worker stopped");
        }
        (self.stage, self.kind, result)
    }

    async fn run_links(&mut self) -> Result<(), StageError> {
        let Some(mut input) = self.input.take() else {
            return Ok(());
        };
        let result = loop {
            let envelope = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => break Ok(()),
                Some(signal) = self.control.recv() => {
                    apply_control(self.stage.as_mut(), self.kind, &signal);
                    continue;
                }
                envelope = input.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break Ok(()),
                },
            };

            if self.kind.is_interruptible()
                && !envelope.frame.is_control()
                && envelope.epoch < self.shared.current_epoch()
            {
                trace!(stage = %self.kind, frame = envelope.frame.label(), "Dropping stale frame");
                continue;
            }

            let trigger = envelope.frame.as_control().cloned();
            let mut stream = self.stage.process(envelope.frame);
            match self.drive(&mut stream, trigger.as_ref(), envelope.epoch).await {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        input.close();
        while input.try_recv().is_ok() {}
        result
    }

    /// Poll one stream to its end. `Ok(false)` means the worker must stop.
    async fn drive(
        &mut self,
        stream: &mut FrameStream,
        trigger: Option<&ControlSignal>,
        epoch: u64,
    ) -> Result<bool, StageError> {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return Ok(false),
                Some(signal) = self.control.recv() => {
                    match apply_control(self.stage.as_mut(), self.kind, &signal) {
                        Flow::Continue => continue,
                        Flow::Abandon => {
                            debug!(stage = %self.kind, "Abandoning interrupted work");
                            return Ok(true);
                        }
                        Flow::Stop => return Ok(false),
                    }
                }
                item = stream.next() => item,
            };
            match item {
                Some(Ok(frame)) => match self.emit(frame, trigger, epoch).await {
                    Flow::Continue => {}
                    Flow::Abandon => return Ok(true),
                    Flow::Stop => return Ok(false),
                },
                Some(Err(e)) => return Err(e),
                None => return Ok(true),
            }
        }
    }

    /// Publish and forward one produced frame.
    async fn emit(&mut self, frame: Frame, trigger: Option<&ControlSignal>, epoch: u64) -> Flow {
        let forwarded = matches!((&frame, trigger), (Frame::Control(s), Some(t)) if s == t);
        if self.kind.is_interruptible() && !forwarded && epoch < self.shared.current_epoch() {
            trace!(stage = %self.kind, frame = frame.label(), "Discarding output of interrupted turn");
            return Flow::Continue;
        }
        if let Frame::Control(signal) = &frame {
            let origin = self.kind.is_interruptible().then_some(epoch);
            if !forwarded && !self.shared.publish(signal.clone(), origin) {
                trace!(
                    stage = %self.kind,
                    signal = signal.name(),
                    "Discarding control of interrupted turn"
                );
                return Flow::Continue;
            }
        }

        let Some(output) = &self.output else {
            return Flow::Continue;
        };
        let epoch = if self.kind.stamps_epoch() {
            self.shared.current_epoch()
        } else {
            epoch
        };

        // Wait for room downstream, still answering control.
        loop {
            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return Flow::Stop,
                Some(signal) = self.control.recv() => {
                    match apply_control(self.stage.as_mut(), self.kind, &signal) {
                        Flow::Continue => continue,
                        other => return other,
                    }
                }
                permit = output.reserve() => {
                    return match permit {
                        Ok(permit) => {
                            permit.send(Envelope { frame, epoch });
                            Flow::Continue
                        }
                        Err(_) => Flow::Stop,
                    };
                }
            }
        }
    }
}

/// One session's pipeline run.
///
/// All methods take `&self`; a task is normally shared behind an `Arc`
/// between its owner and the [`Runner`](crate::Runner).
pub struct PipelineTask {
    id: String,
    options: TaskOptions,
    pipeline: Mutex<Option<Pipeline>>,
    bus: Mutex<Option<mpsc::UnboundedReceiver<ControlSignal>>>,
    shared: Arc<Shared>,
    links: Mutex<Vec<mpsc::WeakSender<Envelope>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PipelineTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineTask")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl PipelineTask {
    pub fn new(id: impl Into<String>, pipeline: Pipeline, options: TaskOptions) -> Self {
        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(TaskState::Idle);
        let shared = Arc::new(Shared {
            epoch: AtomicU64::new(0),
            controller: Mutex::new(InterruptionController::new(options.allow_interruptions)),
            bus: bus_tx,
            cancel: CancellationToken::new(),
            cancelled: AtomicBool::new(false),
            state,
        });
        Self {
            id: id.into(),
            options,
            pipeline: Mutex::new(Some(pipeline)),
            bus: Mutex::new(Some(bus_rx)),
            shared,
            links: Mutex::new(Vec::new()),
            handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wire the stages together and start running them in the background.
    pub fn start(&self) -> Result<(), PipelineError> {
        let already = || PipelineError::TaskAlreadyRunning(self.id.clone());
        let pipeline = lock(&self.pipeline).take().ok_or_else(already)?;
        let bus = lock(&self.bus).take().ok_or_else(already)?;

        let stages = pipeline.into_stages();
        let mut workers = Vec::with_capacity(stages.len());
        let mut controls = Vec::with_capacity(stages.len());
        let mut links = Vec::new();
        let mut upstream: Option<mpsc::Receiver<Envelope>> = None;
        let last = stages.len() - 1;

        for (i, stage) in stages.into_iter().enumerate() {
            let kind = stage.kind();
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            controls.push((kind, control_tx));

            let output = (i < last).then(|| {
                let (tx, rx) = mpsc::channel(self.options.queue_capacity);
                links.push(tx.downgrade());
                (tx, rx)
            });
            let (output, next) = match output {
                Some((tx, rx)) => (Some(tx), Some(rx)),
                None => (None, None),
            };

            workers.push(Worker {
                stage,
                kind,
                input: upstream.take(),
                output,
                control: control_rx,
                shared: self.shared.clone(),
            });
            upstream = next;
        }
        *lock(&self.links) = links;

        let supervisor = Supervisor {
            id: self.id.clone(),
            drain_grace: self.options.drain_grace,
            shared: self.shared.clone(),
            workers,
            controls,
            bus,
        };
        info!(session_id = %self.id, "Starting pipeline task");
        let span = info_span!("pipeline_task", session_id = %self.id);
        let handle = tokio::spawn(supervisor.run().instrument(span));
        *lock(&self.handle) = Some(handle);
        Ok(())
    }

    /// Request cancellation. Returns immediately; see [`await_completion`](Self::await_completion).
    pub fn cancel(&self) {
        if self.state().is_terminal() {
            return;
        }
        if !self.shared.cancelled.swap(true, Ordering::SeqCst) {
            info!(session_id = %self.id, "Cancelling pipeline task");
        }
        self.shared.cancel.cancel();
        let _ = self.shared.bus.send(ControlSignal::EndSession);
    }

    /// Resolve once the task reaches a terminal state. A task that was never
    /// started resolves to [`TaskState::Idle`] at once.
    pub async fn await_completion(&self) -> TaskState {
        if lock(&self.pipeline).is_some() {
            return self.state();
        }
        let mut rx = self.shared.state.subscribe();
        match rx.wait_for(TaskState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    /// Hard stop without teardown, for tasks that ignore cancellation.
    pub fn abort(&self) {
        self.shared.cancel.cancel();
        if let Some(handle) = lock(&self.handle).as_ref() {
            handle.abort();
        }
        if !self.state().is_terminal() {
            warn!(session_id = %self.id, "Aborting pipeline task");
            self.shared.state.send_replace(TaskState::Cancelled);
        }
    }

    pub fn state(&self) -> TaskState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TaskState> {
        self.shared.state.subscribe()
    }

    pub fn conversation_state(&self) -> watch::Receiver<ConversationState> {
        lock(&self.shared.controller).subscribe()
    }

    pub fn interruptions(&self) -> u64 {
        lock(&self.shared.controller).interruptions()
    }

    /// Current interruption epoch.
    pub fn epoch(&self) -> u64 {
        self.shared.current_epoch()
    }

    /// Frames queued between stages and not yet taken by the next one.
    pub fn pending_frames(&self) -> usize {
        lock(&self.links)
            .iter()
            .filter_map(mpsc::WeakSender::upgrade)
            .map(|tx| tx.max_capacity() - tx.capacity())
            .sum()
    }
}

impl Drop for PipelineTask {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

struct Supervisor {
    id: String,
    drain_grace: Duration,
    shared: Arc<Shared>,
    workers: Vec<Worker>,
    controls: Vec<(StageKind, mpsc::UnboundedSender<ControlSignal>)>,
    bus: mpsc::UnboundedReceiver<ControlSignal>,
}

impl Supervisor {
    async fn run(mut self) {
        let cancel = self.shared.cancel.clone();
        let ctx = StageContext {
            session_id: self.id.clone(),
            cancel: cancel.clone(),
        };
        let mut failure: Option<String> = None;

        for worker in &mut self.workers {
            let kind = worker.kind;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = worker.stage.setup(&ctx) => Some(result),
            };
            match outcome {
                Some(Ok(())) => debug!(stage = %kind, "Stage ready"),
                Some(Err(source)) => {
                    let err = PipelineError::Stage { stage: kind, source };
                    error!(error = %err, "Stage setup failed");
                    failure = Some(err.to_string());
                    break;
                }
                None => break,
            }
        }

        let mut stages = if failure.is_none() && !cancel.is_cancelled() {
            self.shared.set_state(TaskState::Running);
            info!(stages = self.workers.len(), "Pipeline running");
            self.supervise(&mut failure).await
        } else {
            self.workers.drain(..).map(|w| w.stage).collect()
        };

        // One grace period covers the teardown of every stage.
        let deadline = Instant::now() + self.drain_grace;
        let teardowns = stages.iter_mut().map(|stage| async move {
            let kind = stage.kind();
            if tokio::time::timeout_at(deadline, stage.teardown()).await.is_err() {
                warn!(stage = %kind, "Stage teardown timed out");
            }
        });
        futures::future::join_all(teardowns).await;

        let outcome = match failure {
            Some(reason) => TaskState::Failed(reason),
            None if self.shared.cancelled.load(Ordering::SeqCst) => TaskState::Cancelled,
            None => TaskState::Completed,
        };
        info!(state = %outcome, epoch = self.shared.current_epoch(), "Pipeline task finished");
        self.shared.set_state(outcome);
    }

    async fn supervise(&mut self, failure: &mut Option<String>) -> Vec<Box<dyn Stage>> {
        let mut workers = JoinSet::new();
        for worker in self.workers.drain(..) {
            workers.spawn(worker.run().in_current_span());
        }

        let mut stages = Vec::new();
        let mut drain_deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                biased;
                Some(signal) = self.bus.recv() => {
                    if signal == ControlSignal::EndSession && drain_deadline.is_none() {
                        info!(grace_ms = self.drain_grace.as_millis() as u64, "Draining pipeline");
                        self.shared.set_state(TaskState::Draining);
                        drain_deadline = Some(Instant::now() + self.drain_grace);
                    }
                    self.fan_out(signal);
                }
                joined = workers.join_next() => match joined {
                    Some(Ok((stage, kind, Ok(())))) => {
                        trace!(stage = %kind, "Stage worker joined");
                        stages.push(stage);
                    }
                    Some(Ok((stage, kind, Err(source)))) => {
                        let err = PipelineError::Stage { stage: kind, source };
                        error!(error = %err, "Pipeline failed");
                        failure.get_or_insert_with(|| err.to_string());
                        stages.push(stage);
                        self.shared.cancel.cancel();
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Stage worker panicked");
                        failure.get_or_insert_with(|| format!("stage worker panicked: {e}"));
                        self.shared.cancel.cancel();
                    }
                    None => break,
                },
                _ = drain_timer(drain_deadline) => {
                    warn!("Drain grace elapsed, cancelling remaining work");
                    drain_deadline = None;
                    self.shared.cancel.cancel();
                }
            }
        }
        stages
    }

    fn fan_out(&self, signal: ControlSignal) {
        trace!(signal = signal.name(), "Broadcasting control");
        for (kind, tx) in &self.controls {
            if signal == ControlSignal::Interrupt && !kind.is_interruptible() {
                continue;
            }
            let _ = tx.send(signal.clone());
        }
    }
}

async fn drain_timer(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{frames, nothing, pass};
    use async_trait::async_trait;
    use std::sync::Arc;
    use voxline_providers::TransportEvent;
    use voxline_providers::channel::{ChannelTransport, TransportHandle};

    use crate::stages::{TransportInputStage, TransportOutputStage};

    /// Records what it sees and forwards tokens unchanged.
    struct Tap {
        kind: StageKind,
        seen: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Stage for Tap {
        fn kind(&self) -> StageKind {
            self.kind
        }

        fn process(&mut self, frame: Frame) -> FrameStream {
            if let Frame::TextToken { text, .. } = &frame {
                lock(&self.seen).push(text.clone());
                if self.fail_on == Some(text.as_str()) {
                    return Box::pin(futures::stream::once(async {
                        Err(StageError::fatal("tap failure"))
                    }));
                }
            }
            match frame {
                Frame::Audio(_) => nothing(),
                other => pass(other),
            }
        }
    }

    fn tap(kind: StageKind) -> (Tap, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Tap {
                kind,
                seen: seen.clone(),
                fail_on: None,
            },
            seen,
        )
    }

    fn task_with(middle: Tap, options: TaskOptions) -> (PipelineTask, TransportHandle) {
        let (transport, handle) = ChannelTransport::pair("t", 64);
        let transport = Arc::new(transport.with_voice_activity(true));
        let pipeline = Pipeline::builder()
            .stage(TransportInputStage::new(transport.clone(), &Default::default(), 16_000))
            .stage(middle)
            .stage(TransportOutputStage::new(transport))
            .build()
            .unwrap();
        (PipelineTask::new("task-1", pipeline, options), handle)
    }

    fn utterance_end() -> TransportEvent {
        TransportEvent::Control(ControlSignal::UserStoppedSpeaking)
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let (p, _) = tap(StageKind::ContextAggregator);
        let (task, _handle) = task_with(p, TaskOptions::default());
        task.start().unwrap();
        assert!(matches!(task.start(), Err(PipelineError::TaskAlreadyRunning(id)) if id == "task-1"));
        task.cancel();
        assert_eq!(task.await_completion().await, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn test_never_started_resolves_idle() {
        let (p, _) = tap(StageKind::ContextAggregator);
        let (task, _handle) = task_with(p, TaskOptions::default());
        assert_eq!(task.await_completion().await, TaskState::Idle);
        assert_eq!(task.pending_frames(), 0);
    }

    #[tokio::test]
    async fn test_remote_disconnect_completes() {
        let (p, _) = tap(StageKind::ContextAggregator);
        let (task, handle) = task_with(p, TaskOptions::default());
        let mut states = task.subscribe_state();
        task.start().unwrap();
        states.wait_for(|s| *s == TaskState::Running).await.unwrap();

        handle.inbound.send(utterance_end()).await.unwrap();
        drop(handle);
        assert_eq!(task.await_completion().await, TaskState::Completed);
        assert_eq!(task.pending_frames(), 0);
    }

    #[tokio::test]
    async fn test_stage_failure_fails_task() {
        let (transport, handle) = ChannelTransport::pair("t", 64);
        let transport = Arc::new(transport.with_voice_activity(true));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let failing = Tap {
            kind: StageKind::ContextAggregator,
            seen: seen.clone(),
            fail_on: Some("boom"),
        };
        // Turns the end of an utterance into a token.
        struct Tokenizer;
        #[async_trait]
        impl Stage for Tokenizer {
            fn kind(&self) -> StageKind {
                StageKind::SpeechToText
            }
            fn process(&mut self, frame: Frame) -> FrameStream {
                match frame {
                    Frame::Control(ControlSignal::UserStoppedSpeaking) => {
                        frames(vec![Frame::token("boom", true)])
                    }
                    other => pass(other),
                }
            }
        }

        let pipeline = Pipeline::builder()
            .stage(TransportInputStage::new(transport.clone(), &Default::default(), 16_000))
            .stage(Tokenizer)
            .stage(failing)
            .stage(TransportOutputStage::new(transport))
            .build()
            .unwrap();
        let task = PipelineTask::new("task-f", pipeline, TaskOptions::default());
        task.start().unwrap();

        handle.inbound.send(utterance_end()).await.unwrap();
        match task.await_completion().await {
            TaskState::Failed(reason) => assert!(reason.contains("context_aggregator")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(lock(&seen).as_slice(), ["boom"]);
    }

    #[tokio::test]
    async fn test_remote_end_session_drains() {
        let (p, _) = tap(StageKind::ContextAggregator);
        let (task, handle) = task_with(p, TaskOptions::default());
        let mut states = task.subscribe_state();
        task.start().unwrap();
        states.wait_for(|s| *s == TaskState::Running).await.unwrap();

        handle
            .inbound
            .send(TransportEvent::Control(ControlSignal::EndSession))
            .await
            .unwrap();
        assert_eq!(task.await_completion().await, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_explicit_interrupt_advances_epoch() {
        let (p, _) = tap(StageKind::ContextAggregator);
        let (task, handle) = task_with(p, TaskOptions::default());
        let mut conversation = task.conversation_state();
        task.start().unwrap();

        handle
            .inbound
            .send(TransportEvent::Control(ControlSignal::Interrupt))
            .await
            .unwrap();
        conversation
            .wait_for(|s| *s == ConversationState::UserSpeaking)
            .await
            .unwrap();
        assert_eq!(task.epoch(), 1);
        assert_eq!(task.interruptions(), 1);

        task.cancel();
        assert_eq!(task.await_completion().await, TaskState::Cancelled);
    }

    /// Never finishes tearing down.
    struct StuckTeardown(StageKind);

    #[async_trait]
    impl Stage for StuckTeardown {
        fn kind(&self) -> StageKind {
            self.0
        }

        fn process(&mut self, frame: Frame) -> FrameStream {
            pass(frame)
        }

        async fn teardown(&mut self) {
            std::future::pending::<()>().await
        }
    }

    #[tokio::test]
    async fn test_teardown_shares_one_grace_period() {
        let (transport, _handle) = ChannelTransport::pair("t", 64);
        let transport = Arc::new(transport);
        let pipeline = Pipeline::builder()
            .stage(TransportInputStage::new(transport.clone(), &Default::default(), 16_000))
            .stage(StuckTeardown(StageKind::SpeechToText))
            .stage(StuckTeardown(StageKind::ContextAggregator))
            .stage(StuckTeardown(StageKind::LanguageModel))
            .stage(TransportOutputStage::new(transport))
            .build()
            .unwrap();
        let grace = Duration::from_millis(200);
        let options = TaskOptions {
            drain_grace: grace,
            ..TaskOptions::default()
        };
        let task = PipelineTask::new("task-t", pipeline, options);
        let mut states = task.subscribe_state();
        task.start().unwrap();
        states.wait_for(|s| *s == TaskState::Running).await.unwrap();

        let started = Instant::now();
        task.cancel();
        assert_eq!(task.await_completion().await, TaskState::Cancelled);
        let elapsed = started.elapsed();
        assert!(elapsed >= grace, "{elapsed:?}");
        assert!(elapsed < grace * 2, "three stuck stages took {elapsed:?}");
    }

    #[test]
    fn test_task_state_display() {
        assert_eq!(TaskState::Failed("x".into()).to_string(), "failed: x");
        assert_eq!(TaskState::Draining.to_string(), "draining");
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }
}
