use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmboxError {
    #[error("invalid profile name: {0}")]
    InvalidName(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("invalid volume spec: {0}")]
    InvalidSpec(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("malformed file: {0}")]
    Malformed(String),
    #[error("ambiguous command '{token}': could be {}", candidates.join(", "))]
    Ambiguous {
        token: String,
        candidates: Vec<String>,
    },
    #[error("process error: {0}")]
    ExternalFailure(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
