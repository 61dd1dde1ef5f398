//! Static-code-check grader: regex rules over project sources.

use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::{
    compile_patterns, mismatch, Grader, GraderConfig, GraderError, GraderKind, GraderResult,
    GradingContext,
};

/// Directories never scanned.
const SKIP_DIRS: &[&str] = &["node_modules", ".git", ".detections", "dist", "build", ".next"];

/// Files larger than this are skipped.
const MAX_FILE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticCheckConfig {
    /// Project-relative globs (`*`, `**`, `?`).
    #[serde(default = "default_include")]
    pub include: Vec<String>,
    pub rules: Vec<StaticRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticRule {
    /// Case-insensitive regex.
    pub pattern: String,
    /// True: some file must match. False: no file may match.
    #[serde(default = "default_true")]
    pub must_match: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_include() -> Vec<String> {
    vec!["**/*".to_string()]
}

fn default_true() -> bool {
    true
}

impl StaticCheckConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.rules.is_empty() {
            return Err("static_check grader needs at least one rule".to_string());
        }
        let patterns: Vec<String> = self.rules.iter().map(|r| r.pattern.clone()).collect();
        compile_patterns(&patterns)?;
        for glob in &self.include {
            glob_to_regex(glob)?;
        }
        Ok(())
    }
}

pub struct StaticCheckGrader;

#[async_trait]
impl Grader for StaticCheckGrader {
    fn kind(&self) -> GraderKind {
        GraderKind::StaticCheck
    }

    async fn grade(
        &self,
        config: &GraderConfig,
        ctx: &GradingContext<'_>,
    ) -> Result<GraderResult, GraderError> {
        let GraderConfig::StaticCheck(cfg) = config else {
            return Err(mismatch(self.kind(), config));
        };
        cfg.validate().map_err(GraderError::InvalidConfig)?;

        let globs = cfg
            .include
            .iter()
            .map(|g| glob_to_regex(g))
            .collect::<Result<Vec<_>, _>>()
            .map_err(GraderError::InvalidConfig)?;
        let patterns: Vec<String> = cfg.rules.iter().map(|r| r.pattern.clone()).collect();
        let rules = compile_patterns(&patterns).map_err(GraderError::InvalidConfig)?;

        let root = ctx.workspace.project_dir.clone();
        let files = tokio::task::spawn_blocking(move || collect_sources(&root, &globs))
            .await
            .map_err(|e| GraderError::Io(std::io::Error::other(e.to_string())))?;

        if files.is_empty() {
            return Ok(GraderResult::fail(self.kind(), "no files matched the include globs"));
        }

        let mut satisfied = 0usize;
        let mut outcomes = Vec::with_capacity(rules.len());
        for (rule, re) in cfg.rules.iter().zip(&rules) {
            let hits: Vec<&str> = files
                .iter()
                .filter(|(_, content)| re.is_match(content))
                .map(|(path, _)| path.as_str())
                .collect();
            let ok = if rule.must_match {
                !hits.is_empty()
            } else {
                hits.is_empty()
            };
            if ok {
                satisfied += 1;
            }
            outcomes.push(serde_json::json!({
                "pattern": rule.pattern,
                "description": rule.description,
                "must_match": rule.must_match,
                "satisfied": ok,
                "files": hits.iter().take(10).collect::<Vec<_>>(),
            }));
        }

        Ok(GraderResult::ratio(self.kind(), satisfied, rules.len())
            .with_detail("files_scanned", files.len())
            .with_detail("rules", outcomes))
    }
}

/// Reads every text file under `root` whose relative path matches a glob.
fn collect_sources(root: &Path, globs: &[Regex]) -> Vec<(String, String)> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
        !(e.file_type().is_dir() && SKIP_DIRS.iter().any(|s| e.file_name() == *s))
    });
    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");
        if !globs.iter().any(|g| g.is_match(&relative)) {
            continue;
        }
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        if let Ok(content) = std::fs::read_to_string(entry.path()) {
            files.push((relative, content));
        }
    }
    files.sort();
    files
}

/// Translates a path glob into an anchored regex.
///
/// `**/` matches zero or more directories, `**` anything, `*` anything but
/// `/`, `?` one character but `/`.
pub fn glob_to_regex(glob: &str) -> Result<Regex, String> {
    let mut out = String::from("^");
    let chars: Vec<char> = glob.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    Regex::new(&out).map_err(|e| format!("invalid glob '{}': {}", glob, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grader::testing;
    use crate::workspace::PortPair;
    use tempfile::TempDir;

    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("src/**/*.js").unwrap();
        assert!(re.is_match("src/a.js"));
        assert!(re.is_match("src/lib/deep/a.js"));
        assert!(!re.is_match("test/a.js"));
        assert!(!re.is_match("src/a.ts"));

        let re = glob_to_regex("*.json").unwrap();
        assert!(re.is_match("package.json"));
        assert!(!re.is_match("data/events.json"));
    }

    #[tokio::test]
    async fn test_rules_over_sources() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("src")).unwrap();
        std::fs::create_dir_all(temp.path().join("node_modules/x")).unwrap();
        std::fs::write(
            temp.path().join("src/server.js"),
            "app.post('/events', validate(schema), handler);",
        )
        .unwrap();
        std::fs::write(temp.path().join("node_modules/x/index.js"), "eval(input)").unwrap();
        std::fs::write(temp.path().join("src/util.js"), "console.log('debug')").unwrap();

        let ws = testing::workspace(temp.path(), PortPair { service: 1, dev: 2 });
        let config = GraderConfig::StaticCheck(StaticCheckConfig {
            include: vec!["src/**/*.js".into(), "node_modules/**".into()],
            rules: vec![
                StaticRule {
                    pattern: "validate\\(".into(),
                    must_match: true,
                    description: Some("input validation".into()),
                },
                StaticRule {
                    pattern: "eval\\(".into(),
                    must_match: false,
                    description: None,
                },
                StaticRule {
                    pattern: "console\\.log".into(),
                    must_match: false,
                    description: None,
                },
            ],
        });

        let result = testing::grade(&StaticCheckGrader, &config, &ws, &[])
            .await
            .unwrap();
        // node_modules is never scanned, so only console.log fails
        assert_eq!(result.details["files_scanned"], 2);
        assert!(!result.passed);
        assert!((result.score - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_files_matched() {
        let temp = TempDir::new().unwrap();
        let ws = testing::workspace(temp.path(), PortPair { service: 1, dev: 2 });
        let config = GraderConfig::StaticCheck(StaticCheckConfig {
            include: vec!["**/*.py".into()],
            rules: vec![StaticRule {
                pattern: "import".into(),
                must_match: true,
                description: None,
            }],
        });
        let result = testing::grade(&StaticCheckGrader, &config, &ws, &[])
            .await
            .unwrap();
        assert!(!result.passed);
        assert!(result.error.is_some());
    }
}
