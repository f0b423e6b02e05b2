use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(String),

    #[error("{var} is invalid: {reason}")]
    Invalid { var: String, reason: String },

    #[error("Invalid dependent kind `{entry}`: {reason}")]
    InvalidKind { entry: String, reason: String },
}
