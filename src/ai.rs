use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::types::Question;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_QUESTIONS: usize = 20;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("question generation is not configured")]
    NotConfigured,
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("model request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("model returned status {0}")]
    UpstreamStatus(reqwest::StatusCode),
    #[error("model response had no usable question array")]
    Unparseable,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateParams {
    pub topic: String,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default = "default_difficulty")]
    pub difficulty: String,
}

fn default_count() -> usize {
    5
}

fn default_difficulty() -> String {
    "medium".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedQuiz {
    pub title: String,
    pub questions: Vec<Question>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Client for an OpenAI-compatible chat completions endpoint that turns a
/// topic into a ready-to-host question list.
pub struct QuestionGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl QuestionGenerator {
    pub fn new(base_url: String, api_key: String, model: String) -> Result<Self, AiError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
            model,
        })
    }

    pub async fn generate(&self, params: &GenerateParams) -> Result<GeneratedQuiz, AiError> {
        let topic = params.topic.trim();
        if topic.is_empty() || topic.chars().count() > 200 {
            return Err(AiError::BadRequest(
                "topic must be 1-200 characters".to_string(),
            ));
        }
        let count = params.count.clamp(1, MAX_QUESTIONS);

        let prompt = format!(
            "Write {count} multiple-choice trivia questions about \"{topic}\" at {difficulty} \
             difficulty. Respond with only a JSON array. Each element must have the keys \
             \"question\" (string), \"answers\" (array of 4 strings), \"correct\" (index into \
             answers) and \"time\" (seconds, 10-30). No commentary, no markdown fences.",
            difficulty = params.difficulty,
        );

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": "You write quiz questions as strict JSON."},
                    {"role": "user", "content": prompt},
                ],
                "temperature": 0.8,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AiError::UpstreamStatus(response.status()));
        }
        let body: ChatResponse = response.json().await?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default();

        let questions = extract_question_array(content).ok_or(AiError::Unparseable)?;
        let questions = sanitize_questions(questions, count);
        if questions.is_empty() {
            return Err(AiError::Unparseable);
        }

        Ok(GeneratedQuiz {
            title: topic.to_string(),
            questions,
        })
    }
}

/// Pull the first parseable JSON array of questions out of model output.
/// Models wrap arrays in prose or code fences often enough that plain
/// `from_str` on the whole body is not good enough.
pub fn extract_question_array(content: &str) -> Option<Vec<Question>> {
    let bytes = content.as_bytes();
    let mut start = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' => {
                if start.is_none() {
                    start = Some(i);
                }
                depth += 1;
            }
            b']' => {
                if let Some(s) = start {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        if let Ok(parsed) =
                            serde_json::from_str::<Vec<Question>>(&content[s..=i])
                        {
                            return Some(parsed);
                        }
                        // Not the array we wanted; scan on
                        start = None;
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Drop malformed entries and clamp fields to playable ranges.
fn sanitize_questions(questions: Vec<Question>, limit: usize) -> Vec<Question> {
    questions
        .into_iter()
        .filter(|q| {
            !q.question.trim().is_empty()
                && (2..=4).contains(&q.answers.len())
                && q.correct < q.answers.len()
                && q.answers.iter().all(|a| !a.trim().is_empty())
        })
        .map(|mut q| {
            q.time = q.time.clamp(5, 120);
            q
        })
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"[{"question":"2+2?","answers":["3","4"],"correct":1,"time":10}]"#;

    #[test]
    fn extracts_bare_array() {
        let questions = extract_question_array(VALID).unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].correct, 1);
    }

    #[test]
    fn extracts_array_from_prose_and_fences() {
        let wrapped = format!("Sure! Here are your questions:\n```json\n{VALID}\n```\nEnjoy!");
        assert!(extract_question_array(&wrapped).is_some());
    }

    #[test]
    fn brackets_inside_strings_do_not_confuse_the_scan() {
        let tricky = r#"[{"question":"What is [x] in \"math\"?","answers":["a","b"],"correct":0,"time":10}]"#;
        let questions = extract_question_array(tricky).unwrap();
        assert_eq!(questions[0].question, "What is [x] in \"math\"?");
    }

    #[test]
    fn skips_non_question_arrays() {
        let content = format!(r#"Topics: ["a","b"] then {VALID}"#);
        assert!(extract_question_array(&content).is_some());
    }

    #[test]
    fn no_array_yields_none() {
        assert!(extract_question_array("I cannot help with that.").is_none());
        assert!(extract_question_array("").is_none());
    }

    #[test]
    fn sanitize_drops_bad_entries_and_clamps_time() {
        let questions = vec![
            Question {
                question: "ok".into(),
                answers: vec!["a".into(), "b".into()],
                correct: 0,
                time: 1000,
                image: None,
                double_points: false,
            },
            Question {
                question: "bad correct".into(),
                answers: vec!["a".into(), "b".into()],
                correct: 5,
                time: 10,
                image: None,
                double_points: false,
            },
            Question {
                question: "too many".into(),
                answers: (0..6).map(|i| i.to_string()).collect(),
                correct: 0,
                time: 10,
                image: None,
                double_points: false,
            },
        ];
        let kept = sanitize_questions(questions, 10);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].time, 120);
    }
}
