//! Loading tasks from YAML files and directories.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::TaskError;

use super::validate::validate_tasks;
use super::Task;

/// Loads, validates and sorts tasks from a file or a directory tree.
///
/// A file holds one task or a `tasks:` list. Directories are scanned
/// recursively for `*.yaml` and `*.yml` files.
pub fn load_tasks(path: &Path) -> Result<Vec<Task>, TaskError> {
    if !path.exists() {
        return Err(TaskError::NotFound(path.to_path_buf()));
    }

    let files = if path.is_dir() {
        yaml_files(path)
    } else {
        vec![path.to_path_buf()]
    };

    let mut tasks = Vec::new();
    for file in &files {
        let loaded = load_file(file)?;
        debug!(path = %file.display(), count = loaded.len(), "Loaded task file");
        tasks.extend(loaded);
    }

    validate_tasks(&tasks)?;
    tasks.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(tasks)
}

/// Parses one YAML file without validating it.
pub fn load_file(path: &Path) -> Result<Vec<Task>, TaskError> {
    let content = fs::read_to_string(path).map_err(|source| TaskError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_tasks(&content).map_err(|message| TaskError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

/// Parses YAML text holding one task or a `tasks:` list.
pub fn parse_tasks(content: &str) -> Result<Vec<Task>, String> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(content).map_err(|e| e.to_string())?;
    match yaml.get("tasks") {
        Some(list) => serde_yaml::from_value(list.clone()).map_err(|e| e.to_string()),
        None => serde_yaml::from_value::<Task>(yaml)
            .map(|task| vec![task])
            .map_err(|e| e.to_string()),
    }
}

/// Keeps tasks whose id or name contains `filter` and whose category equals
/// `category` (case-insensitive).
pub fn filter_tasks(tasks: Vec<Task>, filter: Option<&str>, category: Option<&str>) -> Vec<Task> {
    tasks
        .into_iter()
        .filter(|t| {
            filter.is_none_or(|f| {
                let f = f.to_lowercase();
                t.id.to_lowercase().contains(&f) || t.name.to_lowercase().contains(&f)
            })
        })
        .filter(|t| category.is_none_or(|c| t.category.eq_ignore_ascii_case(c)))
        .collect()
}

fn yaml_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml")
        })
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SINGLE: &str = r#"
id: b-task
category: ingestion
turns: ["store events"]
graders:
  - type: file_storage
    path: data/events.json
"#;

    const LIST: &str = r#"
tasks:
  - id: a-task
    turns: ["hello"]
    graders:
      - type: context
        must_mention: ["hello"]
  - id: c-task
    name: Checkout alerts
    category: signals
    turns: ["check"]
    graders:
      - type: alert_signal
"#;

    #[test]
    fn test_directory_scan_sorted() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("nested")).unwrap();
        std::fs::write(temp.path().join("single.yaml"), SINGLE).unwrap();
        std::fs::write(temp.path().join("nested/list.yml"), LIST).unwrap();
        std::fs::write(temp.path().join("README.md"), "not a task").unwrap();

        let tasks = load_tasks(temp.path()).unwrap();
        let ids: Vec<_> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a-task", "b-task", "c-task"]);
    }

    #[test]
    fn test_unknown_grader_tag_is_parse_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.yaml");
        std::fs::write(
            &path,
            "id: x\nturns: [hi]\ngraders:\n  - type: telepathy\n",
        )
        .unwrap();
        assert!(matches!(load_tasks(&path), Err(TaskError::Parse { .. })));
    }

    #[test]
    fn test_zero_graders_fails_loading() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty.yaml");
        std::fs::write(&path, "id: x\nturns: [hi]\ngraders: []\n").unwrap();
        assert!(matches!(load_tasks(&path), Err(TaskError::NoGraders(_))));
    }

    #[test]
    fn test_missing_path() {
        let result = load_tasks(Path::new("/definitely/not/here"));
        assert!(matches!(result, Err(TaskError::NotFound(_))));
    }

    #[test]
    fn test_filter_tasks() {
        let tasks = parse_tasks(LIST).unwrap();
        let by_name = filter_tasks(tasks.clone(), Some("checkout"), None);
        assert_eq!(by_name.len(), 1);
        let by_category = filter_tasks(tasks, None, Some("SIGNALS"));
        assert_eq!(by_category[0].id, "c-task");
    }
}
