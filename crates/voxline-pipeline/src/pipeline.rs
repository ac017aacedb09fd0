//! Ordered stage lists and their validation.

use voxline_core::config::PipelineConfig;
use voxline_providers::{ProviderSet, SharedTransport};

use crate::error::PipelineError;
use crate::retry::RetryPolicy;
use crate::stage::{Stage, StageKind};
use crate::stages::{
    ContextAggregatorStage, LanguageModelStage, SpeechToTextStage, TextToSpeechStage,
    TransportInputStage, TransportOutputStage,
};

/// A validated, not yet running, chain of stages.
///
/// The first stage is always the transport input and the last the transport
/// output; neither appears anywhere else.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("stages", &self.kinds()).finish()
    }
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Result<Self, PipelineError> {
        let kinds: Vec<StageKind> = stages.iter().map(|s| s.kind()).collect();
        validate(&kinds)?;
        Ok(Self { stages })
    }

    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// The standard voice chain: input, STT, context, LLM, TTS, output.
    pub fn voice(
        transport: SharedTransport,
        providers: ProviderSet,
        config: &PipelineConfig,
        system_prompt: &str,
    ) -> Result<Self, PipelineError> {
        let retry = RetryPolicy::from(&config.retry);
        Self::builder()
            .stage(TransportInputStage::new(
                transport.clone(),
                &config.vad,
                config.input_sample_rate,
            ))
            .stage(SpeechToTextStage::new(providers.stt, retry, config.input_sample_rate))
            .stage(ContextAggregatorStage::new(system_prompt))
            .stage(LanguageModelStage::new(providers.llm, retry))
            .stage(TextToSpeechStage::new(providers.tts, retry))
            .stage(TransportOutputStage::new(transport))
            .build()
    }

    pub fn kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub(crate) fn into_stages(self) -> Vec<Box<dyn Stage>> {
        self.stages
    }
}

fn validate(kinds: &[StageKind]) -> Result<(), PipelineError> {
    let invalid = |msg: String| Err(PipelineError::InvalidPipelineConfiguration(msg));

    let (Some(first), Some(last)) = (kinds.first(), kinds.last()) else {
        return invalid("pipeline has no stages".into());
    };
    if *first != StageKind::TransportInput {
        return invalid(format!("first stage must be transport_input, got {first}"));
    }
    if *last != StageKind::TransportOutput {
        return invalid(format!("last stage must be transport_output, got {last}"));
    }
    for kind in [StageKind::TransportInput, StageKind::TransportOutput] {
        let count = kinds.iter().filter(|k| **k == kind).count();
        if count > 1 {
            return invalid(format!("{kind} appears {count} times"));
        }
    }
    Ok(())
}

#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Box<dyn Stage>>,
}

impl PipelineBuilder {
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn boxed(mut self, stage: Box<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        Pipeline::new(self.stages)
    }
}
