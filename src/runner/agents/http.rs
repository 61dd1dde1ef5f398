//! HTTP agent client: POSTs the request JSON and decodes the response body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::stream::parse_reply;
use super::{AgentClient, AgentError, AgentReply, AgentRequest};
use crate::utils::truncate;

pub struct HttpAgent {
    url: String,
    bearer_token: Option<String>,
    http_client: Client,
}

impl HttpAgent {
    pub fn new(url: impl Into<String>) -> Result<Self, AgentError> {
        let url = url.into();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AgentError::Config(format!(
                "agent URL must start with http:// or https://, got '{}'",
                url
            )));
        }
        Ok(Self {
            url,
            bearer_token: None,
            http_client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()?,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

#[async_trait]
impl AgentClient for HttpAgent {
    fn describe(&self) -> String {
        format!("http: {}", self.url)
    }

    async fn send(&self, request: &AgentRequest) -> Result<AgentReply, AgentError> {
        let mut http_request = self
            .http_client
            .post(&self.url)
            .timeout(request.timeout)
            .json(&request.payload());
        if let Some(ref token) = self.bearer_token {
            http_request = http_request.header("Authorization", format!("Bearer {}", token));
        }

        let response = http_request.send().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::Timeout(request.timeout)
            } else {
                AgentError::Http(e)
            }
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::Timeout(request.timeout)
            } else {
                AgentError::Http(e)
            }
        })?;
        debug!(url = %self.url, status = status.as_u16(), bytes = body.len(), "Agent responded");

        if !status.is_success() {
            return Err(AgentError::ExecutionFailed(format!(
                "agent endpoint returned {}: {}",
                status.as_u16(),
                truncate(&body, 500)
            )));
        }
        Ok(parse_reply(&body))
    }
}
