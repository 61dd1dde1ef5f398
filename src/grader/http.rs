//! HTTP plumbing shared by the server-facing strategies.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::workspace::process::port_accepts;
use crate::workspace::{ProcessSpec, Workspace};

use super::{GraderError, GradingContext};

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Which of the workspace's two ports a strategy talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortTarget {
    #[default]
    Service,
    Dev,
}

impl PortTarget {
    pub fn resolve(&self, workspace: &Workspace) -> u16 {
        match self {
            PortTarget::Service => workspace.ports.service,
            PortTarget::Dev => workspace.ports.dev,
        }
    }
}

/// Where a strategy finds the service under test and how to start it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTarget {
    #[serde(default)]
    pub port: PortTarget,
    /// Started through the workspace supervisor when nothing listens yet.
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
}

fn default_ready_timeout_secs() -> u64 {
    30
}

impl Default for ServiceTarget {
    fn default() -> Self {
        Self {
            port: PortTarget::Service,
            start_command: None,
            ready_timeout_secs: default_ready_timeout_secs(),
        }
    }
}

/// Makes sure something listens on the target port.
///
/// A port that already accepts connections is reused. Otherwise the
/// configured start command is launched as a supervised process of the
/// workspace and awaited.
pub async fn ensure_service(
    ctx: &GradingContext<'_>,
    target: &ServiceTarget,
) -> Result<u16, GraderError> {
    let port = target.port.resolve(ctx.workspace);
    if port_accepts(port, PROBE_TIMEOUT).await {
        return Ok(port);
    }

    let Some(command) = &target.start_command else {
        return Err(GraderError::ServiceUnavailable(format!(
            "nothing is listening on port {} and no start_command is configured",
            port
        )));
    };

    debug!(port, command = %command, "Starting service for grading");
    let spec = ProcessSpec::new("grader-service", ctx.workspace.substitute(command), &ctx.workspace.project_dir)
        .with_ready_port(port)
        .with_ready_timeout(Duration::from_secs(target.ready_timeout_secs));
    ctx.workspace.start_process(spec).await?;

    // The ready signal may come from output before the socket is bound.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(target.ready_timeout_secs);
    while tokio::time::Instant::now() < deadline {
        if port_accepts(port, PROBE_TIMEOUT).await {
            return Ok(port);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Err(GraderError::ServiceUnavailable(format!(
        "'{}' reported ready but port {} does not accept connections",
        command, port
    )))
}

/// Base URL for a loopback port.
pub fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{}", port)
}

/// Joins a base URL and a path that may lack its leading slash.
pub fn url_for(port: u16, path: &str) -> String {
    if path.starts_with('/') {
        format!("{}{}", base_url(port), path)
    } else {
        format!("{}/{}", base_url(port), path)
    }
}

/// Expected and actual status agree: equal, or both client errors.
///
/// Services disagree about 400 versus 422 for malformed input; either
/// rejection counts.
pub fn status_matches(expected: u16, actual: u16) -> bool {
    expected == actual || ((400..500).contains(&expected) && (400..500).contains(&actual))
}

/// Request body for [`send`].
#[derive(Debug, Clone, Copy)]
pub enum Body<'a> {
    None,
    Json(&'a serde_json::Value),
    Raw {
        content: &'a str,
        content_type: &'a str,
    },
}

/// Status and body text of a response.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// Sends one request and reads the whole response.
pub async fn send(
    client: &reqwest::Client,
    method: &str,
    url: &str,
    body: Body<'_>,
    headers: &BTreeMap<String, String>,
    timeout: Duration,
) -> Result<HttpReply, GraderError> {
    let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|_| GraderError::InvalidConfig(format!("invalid HTTP method '{}'", method)))?;

    let mut request = client.request(method, url).timeout(timeout);
    for (key, value) in headers {
        request = request.header(key.as_str(), value.as_str());
    }
    request = match body {
        Body::None => request,
        Body::Json(value) => request.json(value),
        Body::Raw {
            content,
            content_type,
        } => request
            .header("Content-Type", content_type)
            .body(content.to_string()),
    };

    let response = request.send().await?;
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Ok(HttpReply { status, body })
}

/// Length of the record collection in a JSON document or NDJSON text.
///
/// Arrays count their elements; objects count the longest array among
/// their values; anything else counts non-empty lines.
pub fn count_records(text: &str) -> usize {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => records_in(&value).map(|r| r.len()).unwrap_or(0),
        Err(_) => text.lines().filter(|l| !l.trim().is_empty()).count(),
    }
}

/// The record array inside a JSON document, if any.
pub fn records_in(value: &serde_json::Value) -> Option<&Vec<serde_json::Value>> {
    match value {
        serde_json::Value::Array(items) => Some(items),
        serde_json::Value::Object(map) => map
            .values()
            .filter_map(|v| v.as_array())
            .max_by_key(|a| a.len()),
        _ => None,
    }
}
