//! Workspace creation and disposal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::WorkspaceError;
use crate::utils::{sanitize_file_component, tail};

use super::process::{signal_process_group, Signal};
use super::templates::{render_template, TemplateKind};
use super::{DetectionFixture, PortAllocator, Workspace};

/// Tunables for workspace lifecycle operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Directory under which project directories are created.
    pub root: PathBuf,
    /// Bound on the dependency install step.
    pub install_timeout: Duration,
    /// Bound on the setup script.
    pub setup_timeout: Duration,
    /// Wait between SIGTERM and SIGKILL when stopping processes.
    pub kill_grace: Duration,
}

impl WorkspaceConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn with_install_timeout(mut self, timeout: Duration) -> Self {
        self.install_timeout = timeout;
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("trialforge-workspaces"),
            install_timeout: Duration::from_secs(300),
            setup_timeout: Duration::from_secs(120),
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// What to put into a new workspace.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub template: TemplateKind,
    /// Shell script run in the project dir after the template is rendered.
    pub setup_script: Option<String>,
    /// Run the template's install command.
    pub install_deps: bool,
    /// Detection documents to seed.
    pub fixtures: Vec<DetectionFixture>,
}

impl CreateOptions {
    pub fn new(template: TemplateKind) -> Self {
        Self {
            template,
            ..Default::default()
        }
    }

    pub fn with_setup_script(mut self, script: impl Into<String>) -> Self {
        self.setup_script = Some(script.into());
        self
    }

    pub fn with_install_deps(mut self, install: bool) -> Self {
        self.install_deps = install;
        self
    }

    pub fn with_fixture(mut self, fixture: DetectionFixture) -> Self {
        self.fixtures.push(fixture);
        self
    }
}

/// What a cleanup call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub workspace_id: String,
    /// True when the workspace was unknown or had already been cleaned.
    pub already_cleaned: bool,
    pub processes_stopped: usize,
    pub ports_released: bool,
    pub files_removed: bool,
    /// Directory left on disk when files were retained.
    pub retained_dir: Option<PathBuf>,
}

/// Creates, tracks and disposes of workspaces for one batch.
pub struct WorkspaceManager {
    config: WorkspaceConfig,
    ports: Arc<PortAllocator>,
    live: Mutex<HashMap<String, Arc<Workspace>>>,
}

impl WorkspaceManager {
    pub fn new(config: WorkspaceConfig, ports: Arc<PortAllocator>) -> Self {
        Self {
            config,
            ports,
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Materializes a workspace for `task_id`.
    ///
    /// Port allocation and directory creation are the only fatal steps.
    /// Template rendering, fixtures, dependency install and the setup script
    /// record a warning on failure and leave a degraded workspace.
    pub async fn create(
        &self,
        task_id: &str,
        options: CreateOptions,
    ) -> Result<Arc<Workspace>, WorkspaceError> {
        let id = uuid::Uuid::new_v4().to_string();
        // Keyed by workspace id so repeated trials of one task never share ports.
        let ports = self.ports.allocate(&id)?;

        let project_name = sanitize_file_component(task_id);
        let project_dir = self
            .config
            .root
            .join(format!("{}-{}", project_name, &id[..8]));
        if let Err(source) = std::fs::create_dir_all(&project_dir) {
            self.ports.release(&id);
            return Err(WorkspaceError::CreateDir {
                path: project_dir,
                source,
            });
        }
        let project_dir = std::fs::canonicalize(&project_dir).unwrap_or(project_dir);

        let skeleton = Workspace::new(task_id, project_dir.clone(), ports)
            .with_id(&id)
            .with_template(options.template);
        let mut warnings = Vec::new();

        if let Err(e) = render_template(options.template, &project_dir, &project_name, ports) {
            warn!(task_id = %task_id, error = %e, "Template rendering failed");
            warnings.push(format!("template '{}': {}", options.template, e));
        }

        if let Err(e) = seed_detection_dir(&skeleton, &options.fixtures) {
            warn!(task_id = %task_id, error = %e, "Seeding detection fixtures failed");
            warnings.push(format!("detection fixtures: {}", e));
        }

        if options.install_deps {
            if let Some(install) = options.template.install_command() {
                if let Err(e) = run_step(
                    install,
                    &project_dir,
                    &skeleton.env(),
                    self.config.install_timeout,
                )
                .await
                {
                    warn!(task_id = %task_id, error = %e, "Dependency install failed");
                    warnings.push(format!("install '{}': {}", install, e));
                }
            }
        }

        if let Some(script) = &options.setup_script {
            let script = skeleton.substitute(script);
            if let Err(e) = run_step(
                &script,
                &project_dir,
                &skeleton.env(),
                self.config.setup_timeout,
            )
            .await
            {
                warn!(task_id = %task_id, error = %e, "Setup script failed");
                warnings.push(format!("setup script: {}", e));
            }
        }

        let workspace = Arc::new(skeleton.with_setup_warnings(warnings));
        self.lock().insert(id.clone(), Arc::clone(&workspace));

        info!(
            task_id = %task_id,
            workspace_id = %id,
            ports = %ports,
            dir = %project_dir.display(),
            warnings = workspace.setup_warnings().len(),
            "Workspace created"
        );
        Ok(workspace)
    }

    /// Returns a live workspace by id.
    pub fn get(&self, id: &str) -> Option<Arc<Workspace>> {
        self.lock().get(id).cloned()
    }

    /// Number of workspaces not yet cleaned up.
    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    /// Disposes of a workspace: stops its processes, releases its ports and
    /// deletes its directory unless `keep_files` is set.
    ///
    /// Unknown or already-cleaned ids are a no-op reported as `already_cleaned`.
    pub async fn cleanup(&self, id: &str, keep_files: bool) -> Result<CleanupReport, WorkspaceError> {
        let workspace = self.lock().remove(id);
        let Some(workspace) = workspace else {
            return Ok(CleanupReport {
                workspace_id: id.to_string(),
                already_cleaned: true,
                ..Default::default()
            });
        };
        self.dispose(&workspace, keep_files).await
    }

    /// Disposes of `workspace` whether or not this manager created it.
    pub async fn dispose(
        &self,
        workspace: &Workspace,
        keep_files: bool,
    ) -> Result<CleanupReport, WorkspaceError> {
        self.lock().remove(&workspace.id);
        let mut report = CleanupReport {
            workspace_id: workspace.id.clone(),
            ..Default::default()
        };
        if workspace.mark_cleaned() {
            report.already_cleaned = true;
            return Ok(report);
        }

        report.processes_stopped = workspace
            .processes()
            .terminate_all(self.config.kill_grace)
            .await;

        self.ports.release(&workspace.id);
        report.ports_released = true;

        if keep_files {
            report.retained_dir = Some(workspace.project_dir.clone());
        } else if workspace.project_dir.exists() {
            tokio::fs::remove_dir_all(&workspace.project_dir)
                .await
                .map_err(|source| WorkspaceError::RemoveDir {
                    path: workspace.project_dir.clone(),
                    source,
                })?;
            report.files_removed = true;
        }

        debug!(
            workspace_id = %workspace.id,
            processes = report.processes_stopped,
            kept = keep_files,
            "Workspace cleaned"
        );
        Ok(report)
    }

    /// Disposes of every live workspace, deleting their files.
    pub async fn cleanup_all(&self) -> Vec<CleanupReport> {
        let ids: Vec<String> = self.lock().keys().cloned().collect();
        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            match self.cleanup(&id, false).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(workspace_id = %id, error = %e, "Cleanup failed"),
            }
        }
        reports
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Workspace>>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn seed_detection_dir(workspace: &Workspace, fixtures: &[DetectionFixture]) -> Result<(), WorkspaceError> {
    std::fs::create_dir_all(&workspace.detection_dir)?;
    for fixture in fixtures {
        let path = workspace.detection_file(fixture.signal);
        let body = serde_json::to_vec_pretty(&fixture.document).map_err(std::io::Error::other)?;
        std::fs::write(path, body)?;
    }
    Ok(())
}

/// Runs a shell step to completion under `timeout`.
///
/// Returns a description of the failure with the output tail.
async fn run_step(
    script: &str,
    cwd: &Path,
    env: &[(String, String)],
    timeout: Duration,
) -> Result<(), String> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(script)
        .current_dir(cwd)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn().map_err(|e| format!("failed to spawn: {}", e))?;
    let pid = child.id();

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => Ok(()),
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            Err(format!(
                "exited with code {:?}: {}",
                output.status.code(),
                tail(combined.trim(), 2000)
            ))
        }
        Ok(Err(e)) => Err(format!("process error: {}", e)),
        Err(_) => {
            if let Some(pid) = pid {
                signal_process_group(pid, Signal::Kill);
            }
            Err(format!("timed out after {:?}", timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::{DetectionSignal, ProcessSpec};
    use tempfile::TempDir;

    fn manager(root: &Path) -> WorkspaceManager {
        let ports = Arc::new(PortAllocator::new(42000, 8).unwrap().with_bind_check(false));
        WorkspaceManager::new(
            WorkspaceConfig::new(root)
                .with_setup_timeout(Duration::from_secs(10))
                .with_kill_grace(Duration::from_millis(500)),
            ports,
        )
    }

    #[tokio::test]
    async fn test_create_renders_and_seeds() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path());
        let options = CreateOptions::new(TemplateKind::Server).with_fixture(DetectionFixture {
            signal: DetectionSignal::Behavior,
            document: serde_json::json!({"anomalies": []}),
        });

        let ws = manager.create("svc/task", options).await.unwrap();
        assert!(ws.project_dir.join("server.js").exists());
        assert!(ws.detection_file(DetectionSignal::Behavior).exists());
        assert!(ws.setup_warnings().is_empty());
        assert_eq!(manager.live_count(), 1);
        assert!(ws
            .project_dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("svc_task-"));
    }

    #[tokio::test]
    async fn test_setup_failure_is_warning() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path());
        let options = CreateOptions::new(TemplateKind::Empty)
            .with_setup_script("echo port={{SERVICE_PORT}}; echo nope >&2; exit 7");

        let ws = manager.create("t", options).await.unwrap();
        assert_eq!(ws.setup_warnings().len(), 1);
        assert!(ws.setup_warnings()[0].contains("nope"));
        assert!(ws.setup_warnings()[0].contains(&format!("port={}", ws.ports.service)));
    }

    #[tokio::test]
    async fn test_setup_script_sees_environment() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path());
        let options = CreateOptions::new(TemplateKind::Empty)
            .with_setup_script("echo \"$SERVICE_PORT $DETECTION_DIR\" > env.txt");

        let ws = manager.create("t", options).await.unwrap();
        let written = std::fs::read_to_string(ws.project_dir.join("env.txt")).unwrap();
        assert!(written.starts_with(&ws.ports.service.to_string()));
        assert!(written.contains(".detections"));
    }

    #[tokio::test]
    async fn test_cleanup_is_complete_and_idempotent() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path());
        let ws = manager
            .create("t", CreateOptions::new(TemplateKind::Static))
            .await
            .unwrap();
        ws.start_process(ProcessSpec::new("sleeper", "sleep 30", &ws.project_dir))
            .await
            .unwrap();

        let report = manager.cleanup(&ws.id, false).await.unwrap();
        assert!(!report.already_cleaned);
        assert_eq!(report.processes_stopped, 1);
        assert!(report.ports_released);
        assert!(report.files_removed);
        assert!(!ws.project_dir.exists());
        assert!(manager.ports().in_use().is_empty());
        assert!(ws.processes().is_empty().await);

        let again = manager.cleanup(&ws.id, false).await.unwrap();
        assert!(again.already_cleaned);
    }

    #[tokio::test]
    async fn test_cleanup_keep_files_retains_dir() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path());
        let ws = manager
            .create("t", CreateOptions::default())
            .await
            .unwrap();

        let report = manager.cleanup(&ws.id, true).await.unwrap();
        assert_eq!(report.retained_dir.as_deref(), Some(ws.project_dir.as_path()));
        assert!(ws.project_dir.exists());
        assert!(manager.ports().get(&ws.id).is_none());
    }

    #[tokio::test]
    async fn test_cleanup_all() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path());
        for task in ["a", "b", "c"] {
            manager.create(task, CreateOptions::default()).await.unwrap();
        }
        let reports = manager.cleanup_all().await;
        assert_eq!(reports.len(), 3);
        assert_eq!(manager.live_count(), 0);
        assert!(manager.ports().in_use().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_ports_is_fatal() {
        let temp = TempDir::new().unwrap();
        let ports = Arc::new(PortAllocator::new(42100, 1).unwrap().with_bind_check(false));
        let manager = WorkspaceManager::new(WorkspaceConfig::new(temp.path()), ports);

        manager.create("a", CreateOptions::default()).await.unwrap();
        let err = manager.create("b", CreateOptions::default()).await.unwrap_err();
        assert!(matches!(err, WorkspaceError::Ports(_)));
    }
}
