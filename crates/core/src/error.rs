use thiserror::Error;

/// Configuration problems detected before anything touches the cluster.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("{kind} requires environment variable {var}")]
    MissingVariable { kind: &'static str, var: &'static str },
    #[error("invalid quantity '{value}' for {field}")]
    Quantity { field: &'static str, value: String },
}
