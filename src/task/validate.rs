//! Task validation. A task that fails here never reaches the scheduler.

use std::collections::HashSet;

use crate::error::TaskError;

use super::Task;

/// Upper bound on a single trial's time budget.
const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Validates one task.
pub fn validate_task(task: &Task) -> Result<(), TaskError> {
    if task.id.is_empty()
        || !task
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(TaskError::InvalidId(task.id.clone()));
    }
    if task.turns.is_empty() {
        return Err(TaskError::NoTurns(task.id.clone()));
    }
    if task.graders.is_empty() {
        return Err(TaskError::NoGraders(task.id.clone()));
    }
    if task.timeout_secs == 0 || task.timeout_secs > MAX_TIMEOUT_SECS {
        return Err(TaskError::InvalidTimeout {
            task: task.id.clone(),
            reason: format!(
                "{}s is outside 1..={}s",
                task.timeout_secs, MAX_TIMEOUT_SECS
            ),
        });
    }
    for (index, grader) in task.graders.iter().enumerate() {
        grader.validate().map_err(|reason| TaskError::InvalidGrader {
            task: task.id.clone(),
            index,
            reason,
        })?;
    }
    Ok(())
}

/// Validates every task and rejects duplicate ids.
pub fn validate_tasks(tasks: &[Task]) -> Result<(), TaskError> {
    let mut seen = HashSet::new();
    for task in tasks {
        validate_task(task)?;
        if !seen.insert(task.id.as_str()) {
            return Err(TaskError::DuplicateId(task.id.clone()));
        }
    }
    Ok(())
}
