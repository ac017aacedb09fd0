//! Barge-in state machine.
//!
//! ```text
//! Idle -> UserSpeaking -> BotGenerating -> BotSpeaking -> Idle
//!            ^------------- Interrupt (from any state) --'
//! ```

use std::fmt;

use tokio::sync::watch;
use tracing::{debug, info};

use voxline_core::frame::ControlSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationState {
    Idle,
    UserSpeaking,
    BotGenerating,
    BotSpeaking,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::UserSpeaking => "user_speaking",
            Self::BotGenerating => "bot_generating",
            Self::BotSpeaking => "bot_speaking",
        };
        f.write_str(s)
    }
}

/// Observes every control signal of one task and decides when to interrupt.
pub struct InterruptionController {
    state: ConversationState,
    /// Between `UserStartedSpeaking` and `UserStoppedSpeaking`.
    user_speaking: bool,
    /// An utterance has ended and no response has started for it yet.
    awaiting_reply: bool,
    allow_interruptions: bool,
    interruptions: u64,
    tx: watch::Sender<ConversationState>,
}

impl InterruptionController {
    pub fn new(allow_interruptions: bool) -> Self {
        let (tx, _) = watch::channel(ConversationState::Idle);
        Self {
            state: ConversationState::Idle,
            user_speaking: false,
            awaiting_reply: false,
            allow_interruptions,
            interruptions: 0,
            tx,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.tx.subscribe()
    }

    /// Number of interrupts applied so far.
    pub fn interruptions(&self) -> u64 {
        self.interruptions
    }

    /// Apply `signal`. Returns `Some(Interrupt)` when the signal must trigger barge-in.
    ///
    /// An explicit `Interrupt` is applied but not echoed back.
    pub fn observe(&mut self, signal: &ControlSignal) -> Option<ControlSignal> {
        use ConversationState::*;

        let interrupt = match signal {
            // A new utterance supersedes the bot turn and any reply still
            // pending for an earlier utterance.
            ControlSignal::UserStartedSpeaking => {
                let barge_in =
                    matches!(self.state, BotGenerating | BotSpeaking) || self.awaiting_reply;
                self.user_speaking = true;
                self.set(UserSpeaking);
                let interrupt = barge_in && self.allow_interruptions;
                if interrupt {
                    self.awaiting_reply = false;
                }
                interrupt
            }
            ControlSignal::UserStoppedSpeaking => {
                if self.user_speaking {
                    self.awaiting_reply = true;
                }
                self.user_speaking = false;
                false
            }
            ControlSignal::ResponseStarted => {
                self.awaiting_reply = false;
                self.set(BotGenerating);
                false
            }
            ControlSignal::BotStartedSpeaking => {
                // A late edge from an interrupted turn must not reopen the window.
                if self.state == BotGenerating || self.state == Idle {
                    self.set(BotSpeaking);
                }
                false
            }
            ControlSignal::BotStoppedSpeaking => {
                if self.state == BotSpeaking {
                    self.set(Idle);
                }
                false
            }
            ControlSignal::Interrupt => {
                self.interruptions += 1;
                self.awaiting_reply = false;
                self.set(UserSpeaking);
                return None;
            }
            ControlSignal::EndSession | ControlSignal::ResponseCompleted { .. } => false,
        };

        if interrupt {
            self.interruptions += 1;
            info!(trigger = signal.name(), "Barge-in: interrupting bot turn");
            Some(ControlSignal::Interrupt)
        } else {
            None
        }
    }

    fn set(&mut self, next: ConversationState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Conversation state");
            self.state = next;
            self.tx.send_replace(next);
        }
    }
}
