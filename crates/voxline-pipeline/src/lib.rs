//! Voice pipeline execution for Voxline.
//!
//! A [`Pipeline`] is an ordered chain of [`Stage`]s from transport input to
//! transport output. A [`PipelineTask`] runs one pipeline for one session and
//! a [`Runner`] keeps track of every task in the process.

pub mod error;
pub mod interruption;
pub mod pipeline;
pub mod retry;
pub mod runner;
pub mod stage;
pub mod stages;
pub mod task;

pub use error::{PipelineError, StageError};
pub use interruption::{ConversationState, InterruptionController};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use retry::RetryPolicy;
pub use runner::Runner;
pub use stage::{FrameStream, Stage, StageContext, StageKind};
pub use task::{PipelineTask, TaskOptions, TaskState};
