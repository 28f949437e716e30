//! Entity data a pipeline runs against.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Job requirements the candidate is assessed against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionProfile {
    pub title: String,
    pub description: String,
    pub required_skills: Vec<String>,
    pub optional_skills: Vec<String>,
    pub min_experience_years: Option<u32>,
    pub education: Vec<String>,
}

/// One turn of a recorded interview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterviewMessage {
    /// "interviewer" or "candidate"
    pub role: String,
    pub content: String,
}

/// Everything a pipeline needs about one application.
///
/// Loaded by the [`crate::TaskInputLoader`] at submission. Fields a pipeline
/// does not use are left empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineInput {
    pub candidate_name: String,
    pub position: PositionProfile,
    pub resume_text: Option<String>,
    pub video_transcript: Option<String>,
    pub interview_messages: Vec<InterviewMessage>,
    /// Results of earlier pipelines, consumed by the comprehensive analysis
    pub screening_report: Option<Value>,
    pub video_report: Option<Value>,
    pub interview_report: Option<Value>,
    /// Submission parameters, merged in by the supervisor
    pub parameters: Map<String, Value>,
}

impl PipelineInput {
    pub fn new(candidate_name: impl Into<String>) -> Self {
        Self {
            candidate_name: candidate_name.into(),
            ..Default::default()
        }
    }

    pub fn with_position(mut self, position: PositionProfile) -> Self {
        self.position = position;
        self
    }

    pub fn with_resume(mut self, text: impl Into<String>) -> Self {
        self.resume_text = Some(text.into());
        self
    }

    pub fn with_transcript(mut self, text: impl Into<String>) -> Self {
        self.video_transcript = Some(text.into());
        self
    }

    pub fn with_interview_message(
        mut self,
        role: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        self.interview_messages.push(InterviewMessage {
            role: role.into(),
            content: content.into(),
        });
        self
    }

    /// Integer parameter, falling back to `default` when absent or not a number.
    pub fn param_u64(&self, key: &str, default: u64) -> u64 {
        self.parameters
            .get(key)
            .and_then(Value::as_u64)
            .unwrap_or(default)
    }

    /// Overlay submission parameters; objects replace, `null` is ignored.
    pub fn merge_parameters(&mut self, parameters: &Value) {
        if let Value::Object(map) = parameters {
            for (key, value) in map {
                if !value.is_null() {
                    self.parameters.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_parameters() {
        let mut input = PipelineInput::new("Ada");
        input.parameters.insert("count".into(), json!(3));

        input.merge_parameters(&json!({"count": 5, "interest_points": 1, "ignored": null}));

        assert_eq!(input.param_u64("count", 0), 5);
        assert_eq!(input.param_u64("interest_points", 0), 1);
        assert_eq!(input.param_u64("missing", 7), 7);
        assert!(!input.parameters.contains_key("ignored"));
    }

    #[test]
    fn test_partial_document_deserializes() {
        let input: PipelineInput = serde_json::from_value(json!({
            "candidate_name": "Ada",
            "resume_text": "Rust, Go",
            "position": {"title": "Backend Engineer", "required_skills": ["Rust"]}
        }))
        .unwrap();

        assert_eq!(input.position.required_skills, vec!["Rust".to_string()]);
        assert!(input.video_transcript.is_none());
        assert!(input.interview_messages.is_empty());
    }
}
