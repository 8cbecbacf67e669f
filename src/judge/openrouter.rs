/// OpenRouter-compatible chat-completions judge.
///
/// Sends rubric prompts to a chat-completions endpoint over blocking HTTP and
/// parses the JSON verdict out of the reply. Calls are expected to run on the
/// blocking pool (see [`super::call_blocking`]).
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{Judge, JudgeError, JudgeVerdict, MergeRequest, ScoreRequest, SynthesisRequest};
use crate::config::JudgeConfig;
use crate::model::Scores;
use crate::rubric::Rubric;

const SYNTHESIS_MAX_TOKENS: u32 = 1500;

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: String,
}

/// Judge backed by an OpenRouter-style HTTP API.
pub struct OpenRouterJudge {
    api_url: String,
    model: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    request_timeout: Duration,
}

impl OpenRouterJudge {
    /// Build a judge from config, reading the API key from the configured
    /// environment variable.
    pub fn from_config(config: &JudgeConfig) -> Result<Self, JudgeError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                JudgeError::NotConfigured(format!("environment variable {} is not set", config.api_key_env))
            })?;

        Ok(Self {
            api_url: config.api_url.clone(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    fn chat(&self, prompt: &str, max_tokens: u32) -> Result<String, JudgeError> {
        // Built per call: a blocking client must not be dropped on an async worker
        let client = reqwest::blocking::Client::builder()
            .timeout(self.request_timeout)
            .user_agent(concat!("commit-judge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| JudgeError::Request(format!("HTTP client build failed: {e}")))?;

        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
            max_tokens,
        };

        debug!("Judge request: {} chars to {}", prompt.len(), self.model);

        let resp = client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| JudgeError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(JudgeError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let parsed: ChatResponse = resp
            .json()
            .map_err(|e| JudgeError::InvalidResponse(format!("malformed completion: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| JudgeError::InvalidResponse("empty completion".to_string()))
    }
}

impl Judge for OpenRouterJudge {
    fn score(&self, rubric: &dyn Rubric, request: &ScoreRequest) -> Result<JudgeVerdict, JudgeError> {
        let content = self.chat(&rubric.score_prompt(request), self.max_tokens)?;
        parse_verdict(&content, rubric)
    }

    fn merge(&self, rubric: &dyn Rubric, request: &MergeRequest) -> Result<JudgeVerdict, JudgeError> {
        let content = self.chat(&rubric.merge_prompt(request), self.max_tokens)?;
        parse_verdict(&content, rubric)
    }

    fn synthesize(&self, rubric: &dyn Rubric, request: &SynthesisRequest) -> Result<String, JudgeError> {
        let content = self.chat(&rubric.synthesis_prompt(request), SYNTHESIS_MAX_TOKENS)?;
        Ok(content.trim().to_string())
    }
}

/// Extract a verdict from a judge reply.
///
/// Takes the text between the first `{` and the last `}`, reads every rubric
/// dimension as a number (numeric strings are accepted) and rounds it. A
/// score outside `[0, 100]` makes the whole reply invalid.
pub fn parse_verdict(content: &str, rubric: &dyn Rubric) -> Result<JudgeVerdict, JudgeError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &content[s..=e],
        _ => return Err(JudgeError::InvalidResponse("no JSON object in reply".to_string())),
    };

    let data: Value = serde_json::from_str(json)
        .map_err(|e| JudgeError::InvalidResponse(format!("unparseable JSON: {e}")))?;

    let mut scores = Scores::new();
    for key in rubric.dimension_keys() {
        let value = match data.get(key) {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .ok_or_else(|| JudgeError::InvalidResponse(format!("missing or non-numeric {key}")))?;
        if !value.is_finite() || !(0.0..=100.0).contains(&value) {
            return Err(JudgeError::InvalidResponse(format!(
                "score {value} for {key} outside 0..=100"
            )));
        }
        scores.insert(key.to_string(), value.round());
    }

    let reasoning = data
        .get("reasoning")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(JudgeVerdict { scores, reasoning })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rubric::SimpleRubric;

    #[test]
    fn test_parse_verdict_with_surrounding_text() {
        let reply = r#"Here you go:
{"spec_quality": 71, "cloud_architecture": "64", "ai_engineering": 80.4, "mastery_professionalism": 100, "reasoning": "solid"}
Thanks."#;
        let verdict = parse_verdict(reply, &SimpleRubric).unwrap();
        assert_eq!(verdict.scores["spec_quality"], 71.0);
        assert_eq!(verdict.scores["cloud_architecture"], 64.0);
        assert_eq!(verdict.scores["ai_engineering"], 80.0);
        assert_eq!(verdict.scores["mastery_professionalism"], 100.0);
        assert_eq!(verdict.reasoning, "solid");
    }

    #[test]
    fn test_parse_verdict_rejects_out_of_range() {
        let reply = r#"{"spec_quality": 250, "cloud_architecture": -40, "ai_engineering": 50, "mastery_professionalism": 50}"#;
        assert!(matches!(
            parse_verdict(reply, &SimpleRubric),
            Err(JudgeError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_parse_verdict_missing_dimension() {
        let reply = r#"{"spec_quality": 71, "reasoning": "partial"}"#;
        assert!(matches!(
            parse_verdict(reply, &SimpleRubric),
            Err(JudgeError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_parse_verdict_no_json() {
        assert!(parse_verdict("I cannot evaluate this.", &SimpleRubric).is_err());
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = JudgeConfig {
            api_key_env: "COMMIT_JUDGE_TEST_MISSING_KEY".to_string(),
            ..JudgeConfig::default()
        };
        assert!(matches!(
            OpenRouterJudge::from_config(&config),
            Err(JudgeError::NotConfigured(_))
        ));
    }
}
