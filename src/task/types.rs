//! Task definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::grader::GraderConfig;
use crate::workspace::{CreateOptions, DetectionFixture, TemplateKind};

/// Default whole-trial time budget.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// One scripted evaluation task. Read-only once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique, stable sort key.
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub template: TemplateKind,
    /// User messages, sent in order.
    pub turns: Vec<String>,
    /// Applied in declaration order after the conversation.
    pub graders: Vec<GraderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_script: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub install_deps: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixtures: Vec<DetectionFixture>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Task {
    /// A minimal task; remaining fields take their defaults.
    pub fn new(id: impl Into<String>, turns: Vec<String>, graders: Vec<GraderConfig>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            description: String::new(),
            category: default_category(),
            template: TemplateKind::default(),
            turns,
            graders,
            setup_script: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            install_deps: false,
            fixtures: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_template(mut self, template: TemplateKind) -> Self {
        self.template = template;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_setup_script(mut self, script: impl Into<String>) -> Self {
        self.setup_script = Some(script.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_fixture(mut self, fixture: DetectionFixture) -> Self {
        self.fixtures.push(fixture);
        self
    }

    /// Name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Workspace options for this task.
    pub fn create_options(&self) -> CreateOptions {
        CreateOptions {
            template: self.template,
            setup_script: self.setup_script.clone(),
            install_deps: self.install_deps,
            fixtures: self.fixtures.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_yaml() {
        let yaml = r#"
id: health-route
turns:
  - "Add a GET /health route on port {{SERVICE_PORT}}"
graders:
  - type: server
    path: /health
"#;
        let task: Task = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(task.category, "general");
        assert_eq!(task.template, TemplateKind::Empty);
        assert_eq!(task.timeout(), Duration::from_secs(600));
        assert_eq!(task.display_name(), "health-route");
        assert!(!task.create_options().install_deps);
    }

    #[test]
    fn test_fixtures_parse() {
        let yaml = r#"
id: alert
template: server
turns: ["check the alerts"]
graders:
  - type: alert_signal
fixtures:
  - signal: error
    document: {errors: [{message: "500 on /checkout"}]}
"#;
        let task: Task = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(task.fixtures.len(), 1);
        assert_eq!(task.create_options().fixtures[0].document["errors"][0]["message"], "500 on /checkout");
    }

    #[test]
    fn test_tasks_with_fixtures_compare_by_value() {
        let yaml = r#"
id: alert
turns: ["check the alerts"]
graders:
  - type: alert_signal
fixtures:
  - signal: behavior
    document: {behaviors: []}
"#;
        let a: Task = serde_yaml::from_str(yaml).unwrap();
        let mut b = a.clone();
        assert_eq!(a, b);

        b.fixtures[0].document = serde_json::json!({"behaviors": [{"type": "rage_click"}]});
        assert_ne!(a, b);
    }
}
