//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed KDL: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("'{0}' is required")]
    MissingField(String),

    #[error("bad value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("{0} is defined more than once")]
    Duplicate(String),

    /// A name that points at nothing, such as a deploy action for an undeclared service.
    #[error("unresolved reference: {0}")]
    InvalidReference(String),

    /// The configuration parsed but describes an invalid pipeline.
    #[error("pipeline rejected: {0}")]
    Pipeline(#[from] conveyor_core::Error),

    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
