//! Pipeline step framework
//!
//! A [`Pipeline`] is an ordered list of [`PipelineStep`] handlers plus an
//! assembler that turns the step outputs into the task result. The executor
//! is generic over this list; nothing outside this module branches on the
//! pipeline kind.

pub mod analysis;
pub mod interview;
pub mod screening;
pub mod video;

use crate::input::PipelineInput;
use crate::task::{FailureKind, PipelineKind};
use async_trait::async_trait;
use recruit_llm::{LlmClient, LlmError};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Outputs of the completed steps, keyed by step name in execution order.
pub type StepOutputs = Map<String, Value>;

/// Failure of a single step
#[derive(Debug, Error)]
pub enum StepError {
    /// The LLM call failed after the client's own retries
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// The entity data cannot support this pipeline
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A bug or broken invariant inside the step
    #[error("Step failed: {0}")]
    Internal(String),
}

impl StepError {
    /// The model answered, but not in the expected shape
    pub fn malformed(message: impl Into<String>) -> Self {
        StepError::Llm(LlmError::InvalidResponse(message.into()))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            StepError::Llm(err) => err.kind().into(),
            StepError::InvalidInput(_) => FailureKind::InvalidInput,
            StepError::Internal(_) => FailureKind::Internal,
        }
    }
}

/// What a step can see while it runs.
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    pub input: &'a PipelineInput,
    pub outputs: &'a StepOutputs,
    pub llm: &'a LlmClient,
}

impl<'a> StepContext<'a> {
    /// Output of an earlier step; a missing one is an ordering bug
    pub fn output(&self, step: &str) -> Result<&'a Value, StepError> {
        self.outputs
            .get(step)
            .ok_or_else(|| StepError::Internal(format!("output of step '{}' is missing", step)))
    }
}

/// One named unit of pipeline work.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    /// Stable name, recorded in failure details
    fn name(&self) -> &'static str;

    /// Human-readable label shown while the step runs
    fn label(&self) -> &'static str {
        self.name()
    }

    async fn execute(&self, ctx: StepContext<'_>) -> Result<Value, StepError>;
}

/// Builds the task result from the step outputs
pub type Assembler = fn(&StepOutputs) -> Value;

/// A fixed ordered sequence of steps for one pipeline kind.
pub struct Pipeline {
    kind: PipelineKind,
    steps: Vec<Arc<dyn PipelineStep>>,
    assemble: Assembler,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("kind", &self.kind)
            .field("steps", &self.step_names())
            .finish()
    }
}

impl Pipeline {
    pub fn new(kind: PipelineKind, assemble: Assembler) -> Self {
        Self {
            kind,
            steps: Vec::new(),
            assemble,
        }
    }

    /// Append a step
    pub fn with_step(mut self, step: impl PipelineStep + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn steps(&self) -> &[Arc<dyn PipelineStep>] {
        &self.steps
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn assemble(&self, outputs: &StepOutputs) -> Value {
        (self.assemble)(outputs)
    }
}

/// Pipelines by kind
#[derive(Debug, Default, Clone)]
pub struct PipelineRegistry {
    pipelines: HashMap<PipelineKind, Arc<Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four recruitment pipelines
    pub fn standard() -> Self {
        Self::new()
            .with(screening::pipeline())
            .with(video::pipeline())
            .with(interview::pipeline())
            .with(analysis::pipeline())
    }

    /// Register a pipeline, replacing any previous one of the same kind
    pub fn with(mut self, pipeline: Pipeline) -> Self {
        self.pipelines.insert(pipeline.kind(), Arc::new(pipeline));
        self
    }

    pub fn get(&self, kind: PipelineKind) -> Option<Arc<Pipeline>> {
        self.pipelines.get(&kind).cloned()
    }
}

// Helpers shared by the step implementations

/// Output of `step` for assemblers; `Null` if the step produced nothing
pub(crate) fn step_output<'a>(outputs: &'a StepOutputs, step: &str) -> &'a Value {
    outputs.get(step).unwrap_or(&Value::Null)
}

/// Required non-blank text field of the entity
pub(crate) fn require_text<'a>(value: Option<&'a String>, what: &str) -> Result<&'a str, StepError> {
    match value.map(|s| s.trim()) {
        Some(text) if !text.is_empty() => Ok(text),
        _ => Err(StepError::InvalidInput(format!("{} is empty", what))),
    }
}

/// First `max` characters of `text`
pub(crate) fn excerpt(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Numeric field of an LLM answer, clamped into `[min, max]`
pub(crate) fn number_field(value: &Value, key: &str, min: f64, max: f64) -> Result<f64, StepError> {
    let number = match value.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    number
        .filter(|n| n.is_finite())
        .map(|n| n.clamp(min, max))
        .ok_or_else(|| StepError::malformed(format!("field '{}' is missing or not a number", key)))
}

/// String field of an LLM answer, empty when absent
pub(crate) fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// String-array field of an LLM answer, empty when absent
pub(crate) fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Round to one decimal place
pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Non-blank free text from the model
pub(crate) fn require_answer(text: String, what: &str) -> Result<String, StepError> {
    if text.trim().is_empty() {
        Err(StepError::malformed(format!("{} is empty", what)))
    } else {
        Ok(text)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_standard_registry_shapes() {
        let registry = PipelineRegistry::standard();

        let screening = registry.get(PipelineKind::Screening).unwrap();
        assert_eq!(
            screening.step_names(),
            vec!["ParseResume", "MatchCriteria", "ScoreCandidate", "Summarize"]
        );
        assert_eq!(
            registry.get(PipelineKind::Video).unwrap().step_names(),
            vec!["LoadTranscript", "AssessPersonality", "Summarize"]
        );
        assert_eq!(
            registry.get(PipelineKind::Interview).unwrap().step_names(),
            vec!["PrepareContext", "GenerateQuestions", "RecordQuestions"]
        );
        assert_eq!(
            registry.get(PipelineKind::Analysis).unwrap().step_names(),
            vec![
                "BuildProfile",
                "EvaluateDimensions",
                "ScoreRecommendation",
                "GenerateReport"
            ]
        );
    }

    #[test]
    fn test_number_field_clamps_and_parses() {
        let answer = json!({"a": 120, "b": "42.5", "c": "n/a", "d": -3});
        assert_eq!(number_field(&answer, "a", 0.0, 100.0).unwrap(), 100.0);
        assert_eq!(number_field(&answer, "b", 0.0, 100.0).unwrap(), 42.5);
        assert_eq!(number_field(&answer, "d", 0.0, 100.0).unwrap(), 0.0);

        let err = number_field(&answer, "c", 0.0, 100.0).unwrap_err();
        assert_eq!(err.kind(), FailureKind::LlmInvalidResponse);
        assert!(number_field(&answer, "missing", 0.0, 1.0).is_err());
    }

    #[test]
    fn test_step_error_kinds() {
        assert_eq!(
            StepError::from(LlmError::Timeout("t".into())).kind(),
            FailureKind::LlmTimeout
        );
        assert_eq!(
            StepError::InvalidInput("x".into()).kind(),
            FailureKind::InvalidInput
        );
        assert_eq!(StepError::Internal("x".into()).kind(), FailureKind::Internal);
    }

    #[test]
    fn test_text_helpers() {
        assert!(require_text(None, "resume").is_err());
        assert!(require_text(Some(&"  ".to_string()), "resume").is_err());
        assert_eq!(require_text(Some(&" cv ".to_string()), "resume").unwrap(), "cv");
        assert_eq!(excerpt("héllo", 2), "hé");
        assert_eq!(round1(72.46), 72.5);
        assert_eq!(
            string_list(&json!({"s": ["a", " ", 3, "b"]}), "s"),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
