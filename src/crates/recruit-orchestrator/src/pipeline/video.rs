//! Video interview assessment
//!
//! `LoadTranscript -> AssessPersonality -> Summarize`. The transcript is
//! produced upstream; this pipeline only reads it.

use super::{
    excerpt, number_field, require_answer, require_text, round1, step_output, Pipeline,
    PipelineStep, StepContext, StepError, StepOutputs,
};
use crate::task::PipelineKind;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

/// Big Five traits, in report order
pub const BIG_FIVE_TRAITS: [&str; 5] = [
    "openness",
    "conscientiousness",
    "extraversion",
    "agreeableness",
    "neuroticism",
];

const TRANSCRIPT_EXCERPT_CHARS: usize = 12_000;

pub fn pipeline() -> Pipeline {
    Pipeline::new(PipelineKind::Video, assemble)
        .with_step(LoadTranscript)
        .with_step(AssessPersonality)
        .with_step(Summarize)
}

fn assemble(outputs: &StepOutputs) -> Value {
    json!({
        "big_five": step_output(outputs, "AssessPersonality")["big_five"],
        "summary": step_output(outputs, "Summarize")["summary"],
    })
}

pub struct LoadTranscript;

#[async_trait]
impl PipelineStep for LoadTranscript {
    fn name(&self) -> &'static str {
        "LoadTranscript"
    }

    fn label(&self) -> &'static str {
        "Loading transcript"
    }

    async fn execute(&self, ctx: StepContext<'_>) -> Result<Value, StepError> {
        let text = require_text(ctx.input.video_transcript.as_ref(), "video transcript")?;
        Ok(json!({
            "transcript": excerpt(text, TRANSCRIPT_EXCERPT_CHARS),
            "words": text.split_whitespace().count(),
        }))
    }
}

pub struct AssessPersonality;

#[async_trait]
impl PipelineStep for AssessPersonality {
    fn name(&self) -> &'static str {
        "AssessPersonality"
    }

    fn label(&self) -> &'static str {
        "Assessing personality"
    }

    async fn execute(&self, ctx: StepContext<'_>) -> Result<Value, StepError> {
        let transcript = ctx.output("LoadTranscript")?;

        let system = "You are an organisational psychologist. Rate the candidate on the Big \
            Five traits from 0 to 100 based only on the interview transcript. Answer with \
            JSON: {\"openness\": n, \"conscientiousness\": n, \"extraversion\": n, \
            \"agreeableness\": n, \"neuroticism\": n, \"observations\": \"...\"}";
        let user = format!(
            "Candidate: {}\nPosition: {}\n\nTranscript:\n{}",
            ctx.input.candidate_name,
            ctx.input.position.title,
            transcript["transcript"].as_str().unwrap_or_default(),
        );

        let answer = ctx.llm.complete_json(system, &user, Some(0.3)).await?;

        let mut big_five = Map::new();
        for trait_name in BIG_FIVE_TRAITS {
            let score = round1(number_field(&answer, trait_name, 0.0, 100.0)?);
            big_five.insert(trait_name.to_string(), json!(score));
        }

        Ok(json!({
            "big_five": big_five,
            "observations": answer.get("observations").cloned().unwrap_or(Value::Null),
        }))
    }
}

pub struct Summarize;

#[async_trait]
impl PipelineStep for Summarize {
    fn name(&self) -> &'static str {
        "Summarize"
    }

    fn label(&self) -> &'static str {
        "Writing summary"
    }

    async fn execute(&self, ctx: StepContext<'_>) -> Result<Value, StepError> {
        let personality = ctx.output("AssessPersonality")?;

        let system = "You are an HR assistant. Summarise a video interview assessment for a \
            recruiter in at most 150 words: communication style, personality profile and \
            any risks worth probing in the next round.";
        let user = format!(
            "Candidate: {}\nPosition: {}\nAssessment: {}",
            ctx.input.candidate_name, ctx.input.position.title, personality
        );

        let summary = require_answer(ctx.llm.complete(system, &user).await?, "summary")?;
        Ok(json!({ "summary": summary }))
    }
}
