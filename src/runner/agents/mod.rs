//! Clients for the agent under evaluation.
//!
//! An [`AgentClient`] receives one user turn plus the prior conversation and
//! returns the agent's reply as an ordered list of [`AgentEvent`]s. Two
//! transports are supplied:
//! 1. [`CommandAgent`]: a shell command fed the request on stdin
//! 2. [`HttpAgent`]: a JSON POST to an endpoint
//!
//! Both decode replies with [`stream::parse_reply`], which understands
//! NDJSON events and data-stream frames.

pub mod command;
pub mod http;
pub mod stream;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use command::CommandAgent;
pub use http::HttpAgent;

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One prior message of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Everything the agent needs for one turn.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Prior turns, oldest first.
    pub history: Vec<ConversationTurn>,
    /// The new user message.
    pub message: String,
    /// Project directory the agent works in.
    pub working_dir: PathBuf,
    /// Workspace environment (ports, detection dir).
    pub env: Vec<(String, String)>,
    /// Remaining time for this turn.
    pub timeout: Duration,
    pub model: Option<String>,
}

impl AgentRequest {
    pub fn new(message: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            history: Vec::new(),
            message: message.into(),
            working_dir: working_dir.into(),
            env: Vec::new(),
            timeout: Duration::from_secs(300),
            model: None,
        }
    }

    pub fn with_history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// JSON document sent to the agent.
    pub fn payload(&self) -> serde_json::Value {
        let env: BTreeMap<&str, &str> = self
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        serde_json::json!({
            "message": self.message,
            "history": self.history,
            "working_dir": self.working_dir.display().to_string(),
            "env": env,
            "timeout_ms": self.timeout.as_millis() as u64,
            "model": self.model,
        })
    }
}

/// One event of an agent reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    #[serde(alias = "step-start")]
    StepStart {
        #[serde(default)]
        step: Option<u32>,
    },
    #[serde(alias = "text-delta")]
    Text {
        #[serde(alias = "content", alias = "delta")]
        text: String,
    },
    #[serde(alias = "tool-call", alias = "tool_use")]
    ToolCall {
        #[serde(default, alias = "toolCallId", alias = "tool_call_id")]
        id: Option<String>,
        #[serde(alias = "toolName", alias = "tool_name")]
        name: String,
        #[serde(default, alias = "args", alias = "arguments")]
        input: serde_json::Value,
    },
    #[serde(alias = "tool-result")]
    ToolResult {
        #[serde(default, alias = "toolCallId", alias = "tool_call_id")]
        id: Option<String>,
        #[serde(default, alias = "toolName", alias = "tool_name")]
        name: Option<String>,
        #[serde(default, alias = "result")]
        output: serde_json::Value,
        #[serde(default, alias = "isError")]
        is_error: bool,
    },
    #[serde(alias = "step-finish")]
    StepFinish {
        #[serde(default, alias = "finishReason", alias = "finish_reason")]
        reason: Option<String>,
    },
    Error {
        #[serde(alias = "error")]
        message: String,
    },
}

/// A tool call paired with its result, when one arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: Option<String>,
    pub name: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub is_error: bool,
}

/// The agent's answer to one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub events: Vec<AgentEvent>,
    /// Process group the agent left running once the turn ended. The trial
    /// runner hands it to the workspace so cleanup can stop it.
    #[serde(skip)]
    pub process_group: Option<u32>,
}

impl AgentReply {
    pub fn new(events: Vec<AgentEvent>) -> Self {
        Self {
            events,
            process_group: None,
        }
    }

    pub fn with_process_group(mut self, pgid: Option<u32>) -> Self {
        self.process_group = pgid;
        self
    }

    /// Assistant text: every text event concatenated, outer whitespace trimmed.
    pub fn text(&self) -> String {
        let joined: String = self
            .events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        joined.trim().to_string()
    }

    /// Tool calls in order, each with the first result carrying its id.
    pub fn tool_invocations(&self) -> Vec<ToolInvocation> {
        let mut invocations: Vec<ToolInvocation> = Vec::new();
        for event in &self.events {
            match event {
                AgentEvent::ToolCall { id, name, input } => invocations.push(ToolInvocation {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                    output: None,
                    is_error: false,
                }),
                AgentEvent::ToolResult {
                    id,
                    name,
                    output,
                    is_error,
                } => {
                    let pending = invocations.iter_mut().find(|inv| {
                        inv.output.is_none()
                            && match (id, &inv.id) {
                                (Some(result_id), Some(call_id)) => result_id == call_id,
                                _ => name.as_ref().is_none_or(|n| *n == inv.name),
                            }
                    });
                    if let Some(inv) = pending {
                        inv.output = Some(output.clone());
                        inv.is_error = *is_error;
                    }
                }
                _ => {}
            }
        }
        invocations
    }

    /// Error events reported by the agent.
    pub fn errors(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Error { message } => Some(message.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Transport to the agent under evaluation.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Short description for logs and reports.
    fn describe(&self) -> String;

    /// Sends one turn and waits for the complete reply.
    async fn send(&self, request: &AgentRequest) -> Result<AgentReply, AgentError>;
}

/// Error type for agent operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("Agent HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
