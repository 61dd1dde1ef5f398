//! Dependency-presence grader.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{mismatch, Grader, GraderConfig, GraderError, GraderKind, GraderResult, GradingContext};

const MANIFEST_SECTIONS: &[&str] = &[
    "dependencies",
    "devDependencies",
    "peerDependencies",
    "optionalDependencies",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyConfig {
    pub packages: Vec<String>,
    /// Project-relative manifest; `package.json` or a line-based list such
    /// as `requirements.txt`.
    #[serde(default = "default_manifest")]
    pub manifest: String,
    /// Also require `node_modules/<package>` to exist.
    #[serde(default)]
    pub require_installed: bool,
}

fn default_manifest() -> String {
    "package.json".to_string()
}

impl DependencyConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.packages.is_empty() {
            return Err("dependency grader needs at least one package".to_string());
        }
        Ok(())
    }
}

pub struct DependencyGrader;

#[async_trait]
impl Grader for DependencyGrader {
    fn kind(&self) -> GraderKind {
        GraderKind::Dependency
    }

    async fn grade(
        &self,
        config: &GraderConfig,
        ctx: &GradingContext<'_>,
    ) -> Result<GraderResult, GraderError> {
        let GraderConfig::Dependency(cfg) = config else {
            return Err(mismatch(self.kind(), config));
        };
        cfg.validate().map_err(GraderError::InvalidConfig)?;

        let manifest_path = ctx.workspace.resolve(&cfg.manifest);
        let Ok(content) = tokio::fs::read_to_string(&manifest_path).await else {
            return Ok(GraderResult::fail(
                self.kind(),
                format!("manifest '{}' not found", cfg.manifest),
            ));
        };

        let declared = if cfg.manifest.ends_with(".json") {
            let manifest: serde_json::Value = match serde_json::from_str(&content) {
                Ok(v) => v,
                Err(e) => {
                    return Ok(GraderResult::fail(
                        self.kind(),
                        format!("manifest '{}' is not valid JSON: {}", cfg.manifest, e),
                    ))
                }
            };
            declared_in_json(&manifest)
        } else {
            declared_in_lines(&content)
        };

        let mut missing = Vec::new();
        let mut not_installed = Vec::new();
        for package in &cfg.packages {
            if !declared.iter().any(|d| d.eq_ignore_ascii_case(package)) {
                missing.push(package.clone());
                continue;
            }
            if cfg.require_installed
                && !ctx
                    .workspace
                    .project_dir
                    .join("node_modules")
                    .join(package)
                    .exists()
            {
                not_installed.push(package.clone());
            }
        }

        let found = cfg.packages.len() - missing.len() - not_installed.len();
        Ok(GraderResult::ratio(self.kind(), found, cfg.packages.len())
            .with_detail("found", found)
            .with_detail("missing", missing)
            .with_detail("not_installed", not_installed))
    }
}

fn declared_in_json(manifest: &serde_json::Value) -> Vec<String> {
    MANIFEST_SECTIONS
        .iter()
        .filter_map(|section| manifest.get(section).and_then(|s| s.as_object()))
        .flat_map(|deps| deps.keys().cloned())
        .collect()
}

// requirements.txt style: "name==1.0", "name>=2", "name[extra]"
fn declared_in_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            l.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '@' || c == '/'))
                .next()
                .map(str::to_string)
        })
        .filter(|name| !name.is_empty())
        .collect()
}
