//! Interview question generation
//!
//! `PrepareContext -> GenerateQuestions -> RecordQuestions`. Questions and
//! interest points are generated from the résumé against the position; the
//! model answer is streamed.

use super::{
    excerpt, require_text, step_output, string_field, string_list, Pipeline, PipelineStep,
    StepContext, StepError, StepOutputs,
};
use crate::task::PipelineKind;
use async_trait::async_trait;
use chrono::Utc;
use recruit_llm::parse_json_block;
use serde_json::{json, Value};
use tracing::debug;

pub const DEFAULT_QUESTION_COUNT: u64 = 3;
pub const DEFAULT_INTEREST_POINTS: u64 = 2;
const MAX_QUESTION_COUNT: u64 = 10;
const MAX_INTEREST_POINTS: u64 = 5;
const DEFAULT_DIFFICULTY: u64 = 6;
const RESUME_EXCERPT_CHARS: usize = 5000;

pub fn pipeline() -> Pipeline {
    Pipeline::new(PipelineKind::Interview, assemble)
        .with_step(PrepareContext)
        .with_step(GenerateQuestions)
        .with_step(RecordQuestions)
}

fn assemble(outputs: &StepOutputs) -> Value {
    let recorded = step_output(outputs, "RecordQuestions");
    json!({
        "questions": recorded["questions"],
        "interest_points": recorded["interest_points"],
        "generated_at": recorded["generated_at"],
    })
}

pub struct PrepareContext;

#[async_trait]
impl PipelineStep for PrepareContext {
    fn name(&self) -> &'static str {
        "PrepareContext"
    }

    fn label(&self) -> &'static str {
        "Preparing context"
    }

    async fn execute(&self, ctx: StepContext<'_>) -> Result<Value, StepError> {
        let resume = require_text(ctx.input.resume_text.as_ref(), "résumé")?;
        let position = &ctx.input.position;

        let count = ctx
            .input
            .param_u64("count", DEFAULT_QUESTION_COUNT)
            .clamp(1, MAX_QUESTION_COUNT);
        let interest_points = ctx
            .input
            .param_u64("interest_points", DEFAULT_INTEREST_POINTS)
            .min(MAX_INTEREST_POINTS);

        let title = if position.title.trim().is_empty() {
            "Unspecified position"
        } else {
            position.title.trim()
        };

        Ok(json!({
            "resume": excerpt(resume, RESUME_EXCERPT_CHARS),
            "job_title": title,
            "job_description": position.description,
            "requirements": {
                "required_skills": position.required_skills,
                "optional_skills": position.optional_skills,
                "min_experience_years": position.min_experience_years,
                "education": position.education,
            },
            "count": count,
            "interest_point_count": interest_points,
        }))
    }
}

pub struct GenerateQuestions;

#[async_trait]
impl PipelineStep for GenerateQuestions {
    fn name(&self) -> &'static str {
        "GenerateQuestions"
    }

    fn label(&self) -> &'static str {
        "Generating questions"
    }

    async fn execute(&self, ctx: StepContext<'_>) -> Result<Value, StepError> {
        let context = ctx.output("PrepareContext")?;
        let count = context["count"].as_u64().unwrap_or(DEFAULT_QUESTION_COUNT) as usize;
        let point_count = context["interest_point_count"]
            .as_u64()
            .unwrap_or(DEFAULT_INTEREST_POINTS) as usize;

        let system = "You are a senior interviewer who designs targeted questions from a \
            candidate's résumé. Answer with JSON: {\"questions\": [{\"question\": \"...\", \
            \"category\": \"...\", \"difficulty\": 1-10, \"expected_skills\": [\"...\"]}], \
            \"interest_points\": [{\"content\": \"...\", \"reason\": \"...\", \
            \"question\": \"...\"}]}";
        let user = format!(
            "Position: {}\nDescription: {}\nRequirements: {}\n\nRésumé:\n{}\n\n\
             Write {} questions and {} interest points worth probing.",
            context["job_title"].as_str().unwrap_or_default(),
            context["job_description"].as_str().unwrap_or_default(),
            context["requirements"],
            context["resume"].as_str().unwrap_or_default(),
            count,
            point_count,
        );

        let text = ctx.llm.complete_streamed(system, &user).await?;
        let answer = parse_json_block(&text)?;

        let questions: Vec<Value> = answer
            .get("questions")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(normalize_question).take(count).collect())
            .unwrap_or_default();
        if questions.is_empty() {
            return Err(StepError::malformed("model returned no questions"));
        }

        let interest_points: Vec<Value> = answer
            .get("interest_points")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(normalize_interest_point)
                    .take(point_count)
                    .collect()
            })
            .unwrap_or_default();

        debug!(
            questions = questions.len(),
            interest_points = interest_points.len(),
            "Interview questions generated"
        );

        Ok(json!({
            "questions": questions,
            "interest_points": interest_points,
        }))
    }
}

/// Question in the stored shape; `None` when it has no text
fn normalize_question(raw: &Value) -> Option<Value> {
    let (question, category, difficulty, skills) = match raw {
        Value::String(text) => (text.trim().to_string(), String::new(), None, Vec::new()),
        Value::Object(_) => (
            string_field(raw, "question"),
            string_field(raw, "category"),
            raw.get("difficulty").and_then(Value::as_u64),
            string_list(raw, "expected_skills"),
        ),
        _ => return None,
    };
    if question.is_empty() {
        return None;
    }

    Some(json!({
        "question": question,
        "category": if category.is_empty() { "resume".to_string() } else { category },
        "difficulty": difficulty.unwrap_or(DEFAULT_DIFFICULTY).clamp(1, 10),
        "expected_skills": skills,
        "source": "resume",
    }))
}

/// Interest point as `{content, reason, question}`; bare strings get a default question
fn normalize_interest_point(raw: &Value) -> Option<Value> {
    match raw {
        Value::Object(_) => {
            let mut content = string_field(raw, "content");
            if content.is_empty() {
                content = string_field(raw, "point");
            }
            if content.is_empty() {
                return None;
            }
            Some(json!({
                "content": content,
                "reason": string_field(raw, "reason"),
                "question": string_field(raw, "question"),
            }))
        }
        Value::String(text) if !text.trim().is_empty() => {
            let content = text.trim();
            Some(json!({
                "content": content,
                "reason": "",
                "question": format!("Tell us about your experience with {}.", content),
            }))
        }
        _ => None,
    }
}

pub struct RecordQuestions;

#[async_trait]
impl PipelineStep for RecordQuestions {
    fn name(&self) -> &'static str {
        "RecordQuestions"
    }

    fn label(&self) -> &'static str {
        "Recording questions"
    }

    async fn execute(&self, ctx: StepContext<'_>) -> Result<Value, StepError> {
        let generated = ctx.output("GenerateQuestions")?;

        let questions: Vec<Value> = generated["questions"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .enumerate()
                    .map(|(i, q)| {
                        let mut q = q.clone();
                        if let Value::Object(map) = &mut q {
                            map.insert("number".into(), json!(i + 1));
                        }
                        q
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(json!({
            "questions": questions,
            "interest_points": generated["interest_points"],
            "generated_at": Utc::now().to_rfc3339(),
        }))
    }
}
