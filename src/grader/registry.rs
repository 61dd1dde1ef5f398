//! Strategy registry and fault-isolating dispatch.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, warn};

use super::anomaly::AnomalyGrader;
use super::context::ContextGrader;
use super::dependency::DependencyGrader;
use super::error_injection::ErrorInjectionGrader;
use super::file_storage::FileStorageGrader;
use super::ingestion::IngestionGrader;
use super::rubric::{RubricGrader, RubricJudge};
use super::runtime::RuntimeGrader;
use super::server::ServerGrader;
use super::signal::SignalGrader;
use super::static_check::StaticCheckGrader;
use super::{Grader, GraderConfig, GraderKind, GraderResult, GradingContext};

/// Maps each [`GraderKind`] to the strategy that handles it.
#[derive(Default)]
pub struct GraderRegistry {
    graders: HashMap<GraderKind, Arc<dyn Grader>>,
}

impl GraderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in strategy. The rubric strategy fails
    /// its results when `judge` is `None`.
    pub fn with_defaults(judge: Option<Arc<dyn RubricJudge>>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DependencyGrader));
        registry.register(Arc::new(ServerGrader));
        registry.register(Arc::new(IngestionGrader));
        registry.register(Arc::new(FileStorageGrader));
        registry.register(Arc::new(ContextGrader));
        registry.register(Arc::new(AnomalyGrader));
        registry.register(Arc::new(ErrorInjectionGrader));
        registry.register(Arc::new(StaticCheckGrader));
        registry.register(Arc::new(RubricGrader::new(judge)));
        registry.register(Arc::new(RuntimeGrader));
        registry.register(Arc::new(SignalGrader::behavior()));
        registry.register(Arc::new(SignalGrader::alert()));
        registry
    }

    /// Registers `grader` for its kind, replacing any previous one.
    pub fn register(&mut self, grader: Arc<dyn Grader>) {
        self.graders.insert(grader.kind(), grader);
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<GraderKind> {
        let mut kinds: Vec<_> = self.graders.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Runs the strategy for `config` and always returns a normalized result.
    ///
    /// Missing registrations, strategy errors, panics and timeouts all become
    /// failed results with score 0.
    pub async fn run(&self, config: &GraderConfig, ctx: &GradingContext<'_>) -> GraderResult {
        let kind = config.kind();
        let Some(grader) = self.graders.get(&kind) else {
            return GraderResult::fail(kind, format!("no grader registered for '{}'", kind));
        };

        let task_id = &ctx.workspace.task_id;
        let outcome = tokio::time::timeout(
            ctx.timeout,
            AssertUnwindSafe(grader.grade(config, ctx)).catch_unwind(),
        )
        .await;

        let result = match outcome {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => {
                warn!(task_id = %task_id, grader = %kind, error = %e, "Grader failed");
                GraderResult::fail(kind, e.to_string())
            }
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                warn!(task_id = %task_id, grader = %kind, panic = %message, "Grader panicked");
                GraderResult::fail(kind, format!("grader panicked: {}", message))
            }
            Err(_) => {
                warn!(task_id = %task_id, grader = %kind, timeout = ?ctx.timeout, "Grader timed out");
                GraderResult::fail(kind, format!("grader timed out after {:?}", ctx.timeout))
            }
        };

        let result = result.normalize();
        debug!(
            task_id = %task_id,
            grader = %kind,
            passed = result.passed,
            score = result.score,
            "Grader finished"
        );
        result
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
