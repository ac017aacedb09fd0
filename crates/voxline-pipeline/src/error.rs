//! Pipeline error taxonomy.

use thiserror::Error;

use voxline_providers::ProviderError;

use crate::stage::StageKind;

/// Failure raised by a single stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// Retryable provider failure. Stages retry these themselves.
    #[error("transient provider error: {0}")]
    TransientProvider(String),

    /// Unretryable. Ends the owning task.
    #[error("fatal stage error: {0}")]
    FatalStage(String),
}

impl StageError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::FatalStage(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientProvider(_))
    }
}

impl From<ProviderError> for StageError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Transient(msg) => Self::TransientProvider(msg),
            ProviderError::Fatal(msg) => Self::FatalStage(msg),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline configuration: {0}")]
    InvalidPipelineConfiguration(String),

    #[error("task {0} is already running")]
    TaskAlreadyRunning(String),

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: StageKind,
        #[source]
        source: StageError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_mapping() {
        let transient: StageError = ProviderError::transient("timeout").into();
        assert!(transient.is_transient());

        let fatal: StageError = ProviderError::fatal("401").into();
        assert_eq!(fatal, StageError::FatalStage("401".into()));
    }

    #[test]
    fn test_stage_error_display() {
        let err = PipelineError::Stage {
            stage: StageKind::SpeechToText,
            source: StageError::fatal("gave up"),
        };
        assert_eq!(err.to_string(), "speech_to_text stage failed: fatal stage error: gave up");
    }
}
