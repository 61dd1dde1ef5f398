//! Scripted agents for runner tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::agents::{AgentClient, AgentError, AgentEvent, AgentReply, AgentRequest};

type Script = dyn Fn(&AgentRequest) -> Result<AgentReply, AgentError> + Send + Sync;

/// Agent that answers every request with `script`, after an optional delay.
pub struct ScriptedAgent {
    script: Box<Script>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&AgentRequest) -> Result<AgentReply, AgentError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Replies with `text` to every turn.
    pub fn replying(text: &'static str) -> Self {
        Self::new(move |_| Ok(text_reply(text)))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub fn text_reply(text: &str) -> AgentReply {
    AgentReply::new(vec![AgentEvent::Text {
        text: text.to_string(),
    }])
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn send(&self, request: &AgentRequest) -> Result<AgentReply, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.script)(request)
    }
}
