//! Résumé screening
//!
//! `ParseResume -> MatchCriteria -> ScoreCandidate -> Summarize`. Three
//! reviewer perspectives (HR, technical, hiring manager) are scored by the
//! model and combined with fixed weights.

use super::{
    excerpt, number_field, require_answer, require_text, round1, step_output, string_list,
    Pipeline, PipelineStep, StepContext, StepError, StepOutputs,
};
use crate::task::PipelineKind;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

/// Weight of each reviewer in the comprehensive score
pub const HR_WEIGHT: f64 = 0.3;
pub const TECHNICAL_WEIGHT: f64 = 0.4;
pub const MANAGER_WEIGHT: f64 = 0.3;

/// Résumé text handed to the model
const RESUME_EXCERPT_CHARS: usize = 8000;

pub fn pipeline() -> Pipeline {
    Pipeline::new(PipelineKind::Screening, assemble)
        .with_step(ParseResume)
        .with_step(MatchCriteria)
        .with_step(ScoreCandidate)
        .with_step(Summarize)
}

fn assemble(outputs: &StepOutputs) -> Value {
    let score = step_output(outputs, "ScoreCandidate");
    json!({
        "score": score["comprehensive_score"],
        "dimension_scores": score["dimension_scores"],
        "skill_match": step_output(outputs, "MatchCriteria"),
        "summary": step_output(outputs, "Summarize")["summary"],
    })
}

/// Skills from `candidates` mentioned anywhere in `text`, case-insensitively
fn mentioned<'a>(text_lower: &str, candidates: &'a [String]) -> Vec<&'a String> {
    candidates
        .iter()
        .filter(|skill| {
            let skill = skill.trim().to_lowercase();
            !skill.is_empty() && text_lower.contains(&skill)
        })
        .collect()
}

pub struct ParseResume;

#[async_trait]
impl PipelineStep for ParseResume {
    fn name(&self) -> &'static str {
        "ParseResume"
    }

    fn label(&self) -> &'static str {
        "Parsing résumé"
    }

    async fn execute(&self, ctx: StepContext<'_>) -> Result<Value, StepError> {
        let text = require_text(ctx.input.resume_text.as_ref(), "résumé")?;
        let lower = text.to_lowercase();

        let position = &ctx.input.position;
        let mut skills: Vec<&String> = mentioned(&lower, &position.required_skills);
        skills.extend(mentioned(&lower, &position.optional_skills));

        Ok(json!({
            "text": excerpt(text, RESUME_EXCERPT_CHARS),
            "chars": text.chars().count(),
            "skills_mentioned": skills,
        }))
    }
}

pub struct MatchCriteria;

#[async_trait]
impl PipelineStep for MatchCriteria {
    fn name(&self) -> &'static str {
        "MatchCriteria"
    }

    fn label(&self) -> &'static str {
        "Matching requirements"
    }

    async fn execute(&self, ctx: StepContext<'_>) -> Result<Value, StepError> {
        let mentioned_skills = string_list(ctx.output("ParseResume")?, "skills_mentioned");
        let position = &ctx.input.position;

        let (matched_required, missing_required): (Vec<&String>, Vec<&String>) = position
            .required_skills
            .iter()
            .partition(|skill| mentioned_skills.contains(skill));
        let matched_optional: Vec<&String> = position
            .optional_skills
            .iter()
            .filter(|skill| mentioned_skills.contains(skill))
            .collect();

        let coverage = if position.required_skills.is_empty() {
            100.0
        } else {
            round1(matched_required.len() as f64 * 100.0 / position.required_skills.len() as f64)
        };

        debug!(
            matched = matched_required.len(),
            missing = missing_required.len(),
            coverage,
            "Screening criteria matched"
        );

        Ok(json!({
            "matched_required": matched_required,
            "missing_required": missing_required,
            "matched_optional": matched_optional,
            "required_coverage": coverage,
        }))
    }
}

pub struct ScoreCandidate;

#[async_trait]
impl PipelineStep for ScoreCandidate {
    fn name(&self) -> &'static str {
        "ScoreCandidate"
    }

    fn label(&self) -> &'static str {
        "Scoring candidate"
    }

    async fn execute(&self, ctx: StepContext<'_>) -> Result<Value, StepError> {
        let resume = ctx.output("ParseResume")?;
        let matching = ctx.output("MatchCriteria")?;
        let position = &ctx.input.position;

        let system = "You are a hiring panel of three reviewers: an HR expert (experience, \
            education, stability), a technical expert (required and optional skills, depth) \
            and a hiring manager (projects, teamwork, leadership). Each gives a score from 0 \
            to 100. Answer with JSON: {\"hr_score\": n, \"technical_score\": n, \
            \"manager_score\": n, \"rationale\": \"...\"}";
        let user = format!(
            "Position: {}\nDescription: {}\nRequired skills: {}\nOptional skills: {}\n\
             Minimum experience (years): {}\nEducation: {}\n\nSkill match: {}\n\n\
             Candidate: {}\nRésumé:\n{}",
            position.title,
            position.description,
            position.required_skills.join(", "),
            position.optional_skills.join(", "),
            position
                .min_experience_years
                .map(|y| y.to_string())
                .unwrap_or_else(|| "-".to_string()),
            position.education.join(", "),
            matching,
            ctx.input.candidate_name,
            resume["text"].as_str().unwrap_or_default(),
        );

        let answer = ctx.llm.complete_json(system, &user, Some(0.3)).await?;

        let hr = number_field(&answer, "hr_score", 0.0, 100.0)?;
        let technical = number_field(&answer, "technical_score", 0.0, 100.0)?;
        let manager = number_field(&answer, "manager_score", 0.0, 100.0)?;

        Ok(json!({
            "dimension_scores": {
                "hr_score": hr,
                "technical_score": technical,
                "manager_score": manager,
            },
            "comprehensive_score": comprehensive_score(hr, technical, manager),
            "rationale": answer.get("rationale").cloned().unwrap_or(Value::Null),
        }))
    }
}

/// Weighted reviewer score, one decimal
pub fn comprehensive_score(hr: f64, technical: f64, manager: f64) -> f64 {
    round1(hr * HR_WEIGHT + technical * TECHNICAL_WEIGHT + manager * MANAGER_WEIGHT)
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
        let score = ctx.output("ScoreCandidate")?;
        let matching = ctx.output("MatchCriteria")?;

        let system = "You are an HR assistant. Summarise a screening result for a recruiter \
            in at most 150 words: overall fit, main strengths, main gaps, and a suggested \
            next step.";
        let user = format!(
            "Candidate: {}\nPosition: {}\nScores: {}\nSkill match: {}",
            ctx.input.candidate_name, ctx.input.position.title, score, matching
        );

        let summary = require_answer(ctx.llm.complete(system, &user).await?, "summary")?;
        Ok(json!({ "summary": summary }))
    }
}
