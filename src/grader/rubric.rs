//! Rubric grader backed by an LLM judge.
//!
//! The judge receives the rubric, selected project files and optionally the
//! conversation, and must answer with a JSON object carrying a `score`
//! (0 to 1, or 0 to 10) and `reasoning`.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{mismatch, Grader, GraderConfig, GraderError, GraderKind, GraderResult, GradingContext};
use crate::transcript::EntryKind;
use crate::utils::{extract_json_object, truncate};

const MAX_FILE_CHARS: usize = 20_000;
const MAX_TRANSCRIPT_CHARS: usize = 30_000;

const SYSTEM_PROMPT: &str = "You are a strict reviewer grading the work of a coding agent. \
Apply the rubric literally. Respond with a single JSON object: \
{\"score\": <number between 0 and 1>, \"reasoning\": \"<one paragraph>\"}.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricConfig {
    pub rubric: String,
    /// Project-relative files shown to the judge.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default = "default_true")]
    pub include_transcript: bool,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_true() -> bool {
    true
}

fn default_threshold() -> f64 {
    0.7
}

impl RubricConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.rubric.trim().is_empty() {
            return Err("rubric grader needs a rubric".to_string());
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err("rubric threshold must be within [0, 1]".to_string());
        }
        Ok(())
    }
}

/// A model that answers a system + user prompt pair.
#[async_trait]
pub trait RubricJudge: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, GraderError>;

    /// Model identifier, for the report.
    fn model(&self) -> &str;
}

/// Judge speaking the OpenAI-compatible chat completions protocol
/// (OpenRouter, LiteLLM proxies).
pub struct ChatJudge {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http_client: Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReplyMessage,
}

#[derive(Deserialize)]
struct ChatReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatJudge {
    pub const DEFAULT_MODEL: &'static str = "anthropic/claude-sonnet-4";

    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Result<Self, GraderError> {
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            http_client: Client::builder().timeout(Duration::from_secs(120)).build()?,
        })
    }

    /// Builds a judge from the environment.
    ///
    /// `OPENROUTER_API_KEY` selects OpenRouter; otherwise `LITELLM_API_BASE`
    /// (with optional `LITELLM_API_KEY`) selects a LiteLLM proxy. Returns
    /// `None` when neither is configured.
    pub fn from_env(model: Option<&str>) -> Option<Result<Self, GraderError>> {
        let model = model.unwrap_or(Self::DEFAULT_MODEL).to_string();
        if let Ok(key) = env::var("OPENROUTER_API_KEY") {
            return Some(Self::new("https://openrouter.ai/api/v1", Some(key), model));
        }
        if let Ok(base) = env::var("LITELLM_API_BASE") {
            return Some(Self::new(base, env::var("LITELLM_API_KEY").ok(), model));
        }
        None
    }
}

#[async_trait]
impl RubricJudge for ChatJudge {
    async fn complete(&self, system: &str, user: &str) -> Result<String, GraderError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.0,
        };

        let mut http_request = self
            .http_client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Content-Type", "application/json");
        if let Some(ref api_key) = self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = http_request.json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GraderError::Judge(format!(
                "judge returned {}: {}",
                status.as_u16(),
                truncate(&text, 500)
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GraderError::Judge(format!("unreadable judge response: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GraderError::Judge("judge returned no content".to_string()))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

pub struct RubricGrader {
    judge: Option<Arc<dyn RubricJudge>>,
}

impl RubricGrader {
    pub fn new(judge: Option<Arc<dyn RubricJudge>>) -> Self {
        Self { judge }
    }
}

#[async_trait]
impl Grader for RubricGrader {
    fn kind(&self) -> GraderKind {
        GraderKind::Rubric
    }

    async fn grade(
        &self,
        config: &GraderConfig,
        ctx: &GradingContext<'_>,
    ) -> Result<GraderResult, GraderError> {
        let GraderConfig::Rubric(cfg) = config else {
            return Err(mismatch(self.kind(), config));
        };
        cfg.validate().map_err(GraderError::InvalidConfig)?;

        let Some(judge) = &self.judge else {
            return Ok(GraderResult::fail(
                self.kind(),
                "no rubric judge configured (set OPENROUTER_API_KEY or LITELLM_API_BASE)",
            ));
        };

        let prompt = build_prompt(cfg, ctx).await;
        let reply = judge.complete(SYSTEM_PROMPT, &prompt).await?;
        debug!(model = judge.model(), chars = reply.len(), "Judge replied");

        let Some(verdict) = extract_json_object(&reply) else {
            return Ok(GraderResult::fail(self.kind(), "judge reply contained no JSON verdict")
                .with_detail("reply", truncate(&reply, 500)));
        };
        let Some(raw_score) = verdict.get("score").and_then(|s| s.as_f64()) else {
            return Ok(GraderResult::fail(self.kind(), "judge verdict has no numeric score")
                .with_detail("reply", truncate(&reply, 500)));
        };
        // Judges sometimes answer on a ten point scale.
        let score = if raw_score > 1.0 && raw_score <= 10.0 {
            raw_score / 10.0
        } else {
            raw_score
        };

        Ok(GraderResult::scored(self.kind(), score, score >= cfg.threshold)
            .with_detail("model", judge.model())
            .with_detail("threshold", cfg.threshold)
            .with_detail(
                "reasoning",
                verdict.get("reasoning").cloned().unwrap_or(serde_json::Value::Null),
            ))
    }
}

async fn build_prompt(cfg: &RubricConfig, ctx: &GradingContext<'_>) -> String {
    let mut prompt = format!("## Rubric\n\n{}\n", cfg.rubric.trim());

    for file in &cfg.files {
        let path = ctx.workspace.resolve(file);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => truncate(&content, MAX_FILE_CHARS),
            Err(_) => "(file not found)".to_string(),
        };
        prompt.push_str(&format!("\n## File: {}\n\n```\n{}\n```\n", file, content));
    }

    if cfg.include_transcript {
        let mut conversation = String::new();
        for entry in ctx.transcript {
            let role = match entry.kind {
                EntryKind::UserMessage => "user",
                EntryKind::AssistantMessage => "assistant",
                _ => continue,
            };
            if let Some(content) = entry.content() {
                conversation.push_str(&format!("[{}] {}\n\n", role, content));
            }
        }
        prompt.push_str(&format!(
            "\n## Conversation\n\n{}\n",
            truncate(&conversation, MAX_TRANSCRIPT_CHARS)
        ));
    }

    prompt
}
