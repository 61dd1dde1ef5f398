//! Task definitions, loading and validation.

pub mod loader;
pub mod types;
pub mod validate;

pub use loader::{filter_tasks, load_file, load_tasks, parse_tasks};
pub use types::{Task, DEFAULT_TIMEOUT_SECS};
pub use validate::{validate_task, validate_tasks};
