//! Isolated per-trial workspaces.
//!
//! A workspace is the unit of isolation for one trial: a fresh project
//! directory rendered from a template, a detection directory for signal
//! documents, a reserved port pair, and the processes started on its behalf.
//! The [`WorkspaceManager`] creates and disposes of them; the trial runner
//! owns one for the duration of a trial.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use trialforge::workspace::{CreateOptions, PortAllocator, TemplateKind, WorkspaceConfig, WorkspaceManager};
//!
//! let ports = Arc::new(PortAllocator::new(4100, 16)?);
//! let manager = WorkspaceManager::new(WorkspaceConfig::new("./workspaces"), ports);
//!
//! let workspace = manager
//!     .create("todo-api", CreateOptions::new(TemplateKind::Server))
//!     .await?;
//! println!("service on {}", workspace.ports.service);
//!
//! manager.cleanup(&workspace.id, false).await?;
//! ```

pub mod manager;
pub mod ports;
pub mod process;
pub mod templates;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProcessError;

pub use manager::{CleanupReport, CreateOptions, WorkspaceConfig, WorkspaceManager};
pub use ports::{PortAllocator, PortPair};
pub use process::{ProcessHandle, ProcessRegistry, ProcessSpec, SupervisedProcess};
pub use templates::TemplateKind;

/// Directory inside the project that holds detection documents.
pub const DETECTION_DIR_NAME: &str = ".detections";

/// Kind of detection document a fixture seeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSignal {
    /// Behavior anomalies, `behaviors.json`.
    Behavior,
    /// Error alerts, `errors.json`.
    Error,
}

impl DetectionSignal {
    pub fn file_name(&self) -> &'static str {
        match self {
            DetectionSignal::Behavior => "behaviors.json",
            DetectionSignal::Error => "errors.json",
        }
    }
}

/// A detection document written into the workspace before the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionFixture {
    pub signal: DetectionSignal,
    pub document: serde_json::Value,
}

/// One trial's isolated project.
pub struct Workspace {
    /// Unique id (UUID v4).
    pub id: String,
    /// Task the workspace was created for.
    pub task_id: String,
    /// Absolute project directory.
    pub project_dir: PathBuf,
    /// Absolute detection directory, `<project>/.detections`.
    pub detection_dir: PathBuf,
    /// Reserved ports.
    pub ports: PortPair,
    /// Skeleton the project was rendered from.
    pub template: TemplateKind,
    pub created_at: DateTime<Utc>,
    setup_warnings: Vec<String>,
    cleaned: AtomicBool,
    processes: ProcessRegistry,
}

impl Workspace {
    /// Creates a workspace record for an existing directory.
    ///
    /// The manager uses this after materializing the directory; tests use it
    /// to point graders at a scratch directory.
    pub fn new(task_id: impl Into<String>, project_dir: impl Into<PathBuf>, ports: PortPair) -> Self {
        let project_dir = project_dir.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            detection_dir: project_dir.join(DETECTION_DIR_NAME),
            project_dir,
            ports,
            template: TemplateKind::Empty,
            created_at: Utc::now(),
            setup_warnings: Vec::new(),
            cleaned: AtomicBool::new(false),
            processes: ProcessRegistry::new(),
        }
    }

    /// Uses a specific id instead of a fresh one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_template(mut self, template: TemplateKind) -> Self {
        self.template = template;
        self
    }

    pub fn with_setup_warnings(mut self, warnings: Vec<String>) -> Self {
        self.setup_warnings = warnings;
        self
    }

    /// Setup steps that failed without failing the workspace.
    pub fn setup_warnings(&self) -> &[String] {
        &self.setup_warnings
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }

    /// Marks the workspace cleaned; returns true if it already was.
    pub(crate) fn mark_cleaned(&self) -> bool {
        self.cleaned.swap(true, Ordering::SeqCst)
    }

    /// Path of a detection document.
    pub fn detection_file(&self, signal: DetectionSignal) -> PathBuf {
        self.detection_dir.join(signal.file_name())
    }

    /// Resolves a project-relative path; absolute paths pass through.
    pub fn resolve(&self, relative: impl AsRef<Path>) -> PathBuf {
        let relative = relative.as_ref();
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.project_dir.join(relative)
        }
    }

    /// Environment exported to every process started for this workspace.
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            ("PORT".to_string(), self.ports.service.to_string()),
            ("SERVICE_PORT".to_string(), self.ports.service.to_string()),
            ("DEV_PORT".to_string(), self.ports.dev.to_string()),
            (
                "DETECTION_DIR".to_string(),
                self.detection_dir.display().to_string(),
            ),
        ]
    }

    /// Replaces `{{SERVICE_PORT}}`, `{{DEV_PORT}}`, `{{PROJECT_DIR}}` and
    /// `{{DETECTION_DIR}}` in `text`.
    pub fn substitute(&self, text: &str) -> String {
        text.replace("{{SERVICE_PORT}}", &self.ports.service.to_string())
            .replace("{{DEV_PORT}}", &self.ports.dev.to_string())
            .replace("{{PROJECT_DIR}}", &self.project_dir.display().to_string())
            .replace(
                "{{DETECTION_DIR}}",
                &self.detection_dir.display().to_string(),
            )
    }

    /// Starts a process in this workspace and registers it for cleanup.
    ///
    /// The workspace environment is added to the spec's own variables.
    pub async fn start_process(&self, spec: ProcessSpec) -> Result<ProcessHandle, ProcessError> {
        let spec = spec.with_env(self.env());
        let process = SupervisedProcess::start(&spec).await?;
        Ok(self.processes.register(process).await)
    }

    /// Processes started for this workspace.
    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("id", &self.id)
            .field("task_id", &self.task_id)
            .field("project_dir", &self.project_dir)
            .field("ports", &self.ports)
            .field("cleaned", &self.is_cleaned())
            .finish()
    }
}
