//! Comprehensive candidate analysis
//!
//! `BuildProfile -> EvaluateDimensions -> ScoreRecommendation -> GenerateReport`.
//! Every piece of evidence gathered so far (résumé, earlier pipeline reports,
//! interview transcript) is folded into one profile and scored against a
//! weighted five-dimension rubric.

use super::{
    excerpt, number_field, require_answer, round1, step_output, string_field, string_list,
    Pipeline, PipelineStep, StepContext, StepError, StepOutputs,
};
use crate::task::PipelineKind;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

const RESUME_EXCERPT_CHARS: usize = 3000;

/// One rubric dimension
#[derive(Debug, Clone, Copy)]
pub struct Dimension {
    pub key: &'static str,
    pub name: &'static str,
    pub weight: f64,
    pub aspects: &'static [&'static str],
}

pub const DIMENSIONS: [Dimension; 5] = [
    Dimension {
        key: "professional_competency",
        name: "Professional competency",
        weight: 0.30,
        aspects: &[
            "command of core skills",
            "depth of domain knowledge",
            "problem solving",
            "learning potential",
        ],
    },
    Dimension {
        key: "work_experience",
        name: "Work experience",
        weight: 0.25,
        aspects: &[
            "relevance of experience",
            "project complexity",
            "measurable outcomes",
            "scope of responsibility",
        ],
    },
    Dimension {
        key: "soft_skills",
        name: "Soft skills",
        weight: 0.20,
        aspects: &[
            "communication",
            "teamwork",
            "handling pressure",
            "initiative and ownership",
        ],
    },
    Dimension {
        key: "cultural_fit",
        name: "Cultural fit",
        weight: 0.15,
        aspects: &[
            "professional values",
            "work attitude",
            "career direction",
            "expected stability",
        ],
    },
    Dimension {
        key: "interview_performance",
        name: "Interview performance",
        weight: 0.10,
        aspects: &[
            "logical answers",
            "depth of thinking",
            "adaptability",
            "self-awareness",
        ],
    },
];

/// Hiring recommendation derived from the final score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub level: &'static str,
    pub label: &'static str,
    pub action: &'static str,
    pub score: f64,
}

/// (level, minimum score, label, action), highest first
const LEVELS: [(&str, f64, &str, &str); 4] = [
    (
        "strong_recommend",
        85.0,
        "Strongly recommended",
        "Exceeds the requirements; fast-track the offer",
    ),
    (
        "recommend",
        70.0,
        "Recommended",
        "Meets the requirements; proceed to offer",
    ),
    (
        "cautious",
        55.0,
        "Consider with caution",
        "Some risk; evaluate further before deciding",
    ),
    (
        "not_recommend",
        0.0,
        "Not recommended",
        "Does not meet the requirements",
    ),
];

/// Map a 1-5 dimension score onto 0-100
pub fn normalize_dimension_score(score: f64) -> f64 {
    (score.clamp(1.0, 5.0) - 1.0) / 4.0 * 100.0
}

/// Weighted mean of normalised `(score, weight)` pairs, one decimal
pub fn final_score(scores: &[(f64, f64)]) -> f64 {
    let total_weight: f64 = scores.iter().map(|(_, w)| w).sum();
    if total_weight <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = scores
        .iter()
        .map(|(score, weight)| normalize_dimension_score(*score) * weight)
        .sum();
    round1(weighted / total_weight)
}

pub fn recommend(score: f64) -> Recommendation {
    let (level, _, label, action) = LEVELS
        .iter()
        .copied()
        .find(|(_, min, _, _)| score >= *min)
        .unwrap_or(LEVELS[LEVELS.len() - 1]);
    Recommendation {
        level,
        label,
        action,
        score,
    }
}

pub fn pipeline() -> Pipeline {
    Pipeline::new(PipelineKind::Analysis, assemble)
        .with_step(BuildProfile)
        .with_step(EvaluateDimensions)
        .with_step(ScoreRecommendation)
        .with_step(GenerateReport)
}

fn assemble(outputs: &StepOutputs) -> Value {
    let scored = step_output(outputs, "ScoreRecommendation");
    json!({
        "final_score": scored["final_score"],
        "recommendation": scored["recommendation"],
        "dimension_scores": step_output(outputs, "EvaluateDimensions"),
        "report": step_output(outputs, "GenerateReport")["report"],
    })
}

pub struct BuildProfile;

#[async_trait]
impl PipelineStep for BuildProfile {
    fn name(&self) -> &'static str {
        "BuildProfile"
    }

    fn label(&self) -> &'static str {
        "Building candidate profile"
    }

    async fn execute(&self, ctx: StepContext<'_>) -> Result<Value, StepError> {
        let input = ctx.input;
        let resume = input
            .resume_text
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let sources = [
            resume.is_some(),
            input.screening_report.is_some(),
            input.video_report.is_some(),
            !input.interview_messages.is_empty(),
            input.interview_report.is_some(),
        ];
        if !sources.iter().any(|present| *present) {
            return Err(StepError::InvalidInput(
                "no résumé, reports or interview transcript to analyse".to_string(),
            ));
        }

        let title = if input.position.title.is_empty() {
            "Unspecified"
        } else {
            input.position.title.as_str()
        };
        let mut parts = vec![
            format!("# Candidate: {}", input.candidate_name),
            format!("## Position: {}", title),
            "\n## Résumé".to_string(),
            resume
                .map(|r| excerpt(r, RESUME_EXCERPT_CHARS))
                .unwrap_or_else(|| "No résumé".to_string()),
            "\n## Screening report".to_string(),
        ];

        match &input.screening_report {
            Some(report) => {
                parts.push(format!("Score: {}", display_or_na(&report["score"])));
                parts.push(format!("Summary: {}", string_field(report, "summary")));
            }
            None => parts.push("No screening report".to_string()),
        }

        parts.push("\n## Interview transcript".to_string());
        if input.interview_messages.is_empty() {
            parts.push("No interview transcript".to_string());
        } else {
            for message in &input.interview_messages {
                let speaker = if message.role == "interviewer" {
                    "Interviewer"
                } else {
                    "Candidate"
                };
                parts.push(format!("**{}**: {}", speaker, message.content));
            }
        }

        parts.push("\n## Interview report".to_string());
        match &input.interview_report {
            Some(report) => {
                let overall = &report["overall_assessment"];
                parts.push(format!("Score: {}", display_or_na(&overall["recommendation_score"])));
                parts.push(format!("Recommendation: {}", display_or_na(&overall["recommendation"])));
                parts.push(format!("Summary: {}", string_field(overall, "summary")));
                let highlights = string_list(report, "highlights");
                if !highlights.is_empty() {
                    parts.push(format!("Highlights: {}", highlights.join(", ")));
                }
                let red_flags = string_list(report, "red_flags");
                if !red_flags.is_empty() {
                    parts.push(format!("Red flags: {}", red_flags.join(", ")));
                }
            }
            None => parts.push("No interview report".to_string()),
        }

        if let Some(video) = &input.video_report {
            parts.push("\n## Video analysis".to_string());
            parts.push(video.to_string());
        }

        Ok(json!({ "profile": parts.join("\n") }))
    }
}

fn display_or_na(value: &Value) -> String {
    match value {
        Value::Null => "N/A".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct EvaluateDimensions;

#[async_trait]
impl PipelineStep for EvaluateDimensions {
    fn name(&self) -> &'static str {
        "EvaluateDimensions"
    }

    fn label(&self) -> &'static str {
        "Evaluating dimensions"
    }

    async fn execute(&self, ctx: StepContext<'_>) -> Result<Value, StepError> {
        let profile = ctx.output("BuildProfile")?["profile"]
            .as_str()
            .unwrap_or_default();

        let mut scores = Map::new();
        for dimension in DIMENSIONS {
            let evaluation = evaluate_dimension(ctx, &dimension, profile).await?;
            debug!(
                dimension = dimension.key,
                score = %evaluation["dimension_score"],
                "Dimension evaluated"
            );
            scores.insert(dimension.key.to_string(), evaluation);
        }

        Ok(Value::Object(scores))
    }
}

async fn evaluate_dimension(
    ctx: StepContext<'_>,
    dimension: &Dimension,
    profile: &str,
) -> Result<Value, StepError> {
    let system = "You are a senior talent assessor. Score exactly one dimension of the \
        candidate from 1 (below requirements) to 5 (far above requirements) using only the \
        evidence provided. Answer with JSON: {\"dimension_score\": 1-5, \"strengths\": \
        [\"...\"], \"weaknesses\": [\"...\"], \"analysis\": \"...\"}";
    let aspects: Vec<String> = dimension.aspects.iter().map(|a| format!("- {}", a)).collect();
    let user = format!(
        "Dimension: {}\nConsider:\n{}\n\n{}",
        dimension.name,
        aspects.join("\n"),
        profile
    );

    let answer = ctx.llm.complete_json(system, &user, Some(0.3)).await?;
    let score = number_field(&answer, "dimension_score", 1.0, 5.0)?.round();

    Ok(json!({
        "dimension_name": dimension.name,
        "weight": dimension.weight,
        "dimension_score": score,
        "strengths": string_list(&answer, "strengths"),
        "weaknesses": string_list(&answer, "weaknesses"),
        "analysis": string_field(&answer, "analysis"),
    }))
}

pub struct ScoreRecommendation;

#[async_trait]
impl PipelineStep for ScoreRecommendation {
    fn name(&self) -> &'static str {
        "ScoreRecommendation"
    }

    fn label(&self) -> &'static str {
        "Scoring"
    }

    async fn execute(&self, ctx: StepContext<'_>) -> Result<Value, StepError> {
        let evaluations = ctx.output("EvaluateDimensions")?;

        let mut pairs = Vec::with_capacity(DIMENSIONS.len());
        for dimension in DIMENSIONS {
            let score = evaluations
                .get(dimension.key)
                .and_then(|e| e["dimension_score"].as_f64())
                .ok_or_else(|| {
                    StepError::Internal(format!("dimension '{}' was not evaluated", dimension.key))
                })?;
            pairs.push((score, dimension.weight));
        }

        let score = final_score(&pairs);
        let recommendation = recommend(score);
        info!(
            final_score = score,
            level = recommendation.level,
            "Candidate scored"
        );

        Ok(json!({
            "final_score": score,
            "recommendation": recommendation,
        }))
    }
}

pub struct GenerateReport;

#[async_trait]
impl PipelineStep for GenerateReport {
    fn name(&self) -> &'static str {
        "GenerateReport"
    }

    fn label(&self) -> &'static str {
        "Writing report"
    }

    async fn execute(&self, ctx: StepContext<'_>) -> Result<Value, StepError> {
        let evaluations = ctx.output("EvaluateDimensions")?;
        let scored = ctx.output("ScoreRecommendation")?;

        let mut lines = Vec::new();
        for dimension in DIMENSIONS {
            let evaluation = &evaluations[dimension.key];
            lines.push(format!(
                "- {}: {}/5 - {}",
                dimension.name,
                display_or_na(&evaluation["dimension_score"]),
                string_field(evaluation, "analysis"),
            ));
        }

        let system = "You are a senior HR consultant. Write a concise hiring report in \
            Markdown with sections for overall assessment, strengths, risks and a \
            recommendation. Use only the scores and findings provided.";
        let user = format!(
            "Candidate: {}\nPosition: {}\nFinal score: {}\nRecommendation: {}\n\
             Suggested action: {}\n\nDimension findings:\n{}",
            ctx.input.candidate_name,
            ctx.input.position.title,
            display_or_na(&scored["final_score"]),
            string_field(&scored["recommendation"], "label"),
            string_field(&scored["recommendation"], "action"),
            lines.join("\n"),
        );

        let report = require_answer(ctx.llm.complete(system, &user).await?, "report")?;
        Ok(json!({ "report": report }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::PipelineInput;
    use crate::pipeline::testing::{client, ScriptedLlm};
    use crate::task::FailureKind;

    #[test]
    fn test_weights_sum_to_one() {
        let total: f64 = DIMENSIONS.iter().map(|d| d.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_final_score() {
        let all = |s: f64| DIMENSIONS.iter().map(|d| (s, d.weight)).collect::<Vec<_>>();
        assert_eq!(final_score(&all(5.0)), 100.0);
        assert_eq!(final_score(&all(4.0)), 75.0);
        assert_eq!(final_score(&all(1.0)), 0.0);

        let mut mixed = all(3.0);
        mixed[0].0 = 5.0;
        assert_eq!(final_score(&mixed), 65.0);

        assert_eq!(final_score(&[]), 0.0);
    }

    #[test]
    fn test_recommendation_levels() {
        assert_eq!(recommend(100.0).level, "strong_recommend");
        assert_eq!(recommend(85.0).level, "strong_recommend");
        assert_eq!(recommend(84.9).level, "recommend");
        assert_eq!(recommend(70.0).level, "recommend");
        assert_eq!(recommend(55.0).level, "cautious");
        assert_eq!(recommend(54.9).level, "not_recommend");
        assert_eq!(recommend(0.0).score, 0.0);
    }

    #[tokio::test]
    async fn test_profile_requires_evidence() {
        let llm = client(ScriptedLlm::new("{}"));
        let outputs = StepOutputs::new();

        let empty = PipelineInput::new("Ada");
        let err = BuildProfile
            .execute(StepContext { input: &empty, outputs: &outputs, llm: &llm })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::InvalidInput);

        let mut with_report = PipelineInput::new("Ada")
            .with_interview_message("interviewer", "Why Rust?")
            .with_interview_message("candidate", "Ownership.");
        with_report.screening_report = Some(json!({"score": 81.0, "summary": "Strong"}));
        let profile = BuildProfile
            .execute(StepContext { input: &with_report, outputs: &outputs, llm: &llm })
            .await
            .unwrap();
        let text = profile["profile"].as_str().unwrap();
        assert!(text.contains("Score: 81.0"));
        assert!(text.contains("**Candidate**: Ownership."));
        assert!(text.contains("No résumé"));
    }

    #[tokio::test]
    async fn test_evaluate_calls_once_per_dimension() {
        let transport = ScriptedLlm::new(
            r#"{"dimension_score": 4, "strengths": ["depth"], "weaknesses": [], "analysis": "ok"}"#,
        );
        transport.push(Ok(r#"{"dimension_score": 9, "analysis": "clamped"}"#.to_string()));
        let llm = client(transport.clone());
        let input = PipelineInput::new("Ada");
        let mut outputs = StepOutputs::new();
        outputs.insert("BuildProfile".into(), json!({"profile": "# Candidate: Ada"}));

        let evaluations = EvaluateDimensions
            .execute(StepContext { input: &input, outputs: &outputs, llm: &llm })
            .await
            .unwrap();

        assert_eq!(transport.prompts.lock().len(), DIMENSIONS.len());
        assert_eq!(evaluations["professional_competency"]["dimension_score"], json!(5.0));
        assert_eq!(evaluations["cultural_fit"]["dimension_score"], json!(4.0));
        assert_eq!(evaluations["cultural_fit"]["weight"], json!(0.15));
        outputs.insert("EvaluateDimensions".into(), evaluations);

        let scored = ScoreRecommendation
            .execute(StepContext { input: &input, outputs: &outputs, llm: &llm })
            .await
            .unwrap();
        // 100 * 0.30 + 75 * 0.70
        assert_eq!(scored["final_score"], json!(82.5));
        assert_eq!(scored["recommendation"]["level"], json!("recommend"));
    }
}
