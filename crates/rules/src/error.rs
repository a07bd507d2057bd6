//! Registry and loader error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("rule validation failed: {0}")]
    Validation(String),

    #[error("mandatory rule '{rule_id}' failed to compile: {detail}")]
    MandatoryCompile { rule_id: String, detail: String },

    #[error("filesystem watcher error: {0}")]
    Watcher(#[from] notify::Error),
}
