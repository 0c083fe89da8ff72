//! Error types for procshift.

use thiserror::Error;

/// Hard failures that abort the conversion of a single unit.
///
/// Rules that cannot rewrite a construct never produce one of these; they
/// are recorded in the rewrite log and show up in the automation score.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// A declared parameter without a default was not supplied.
    #[error("Unresolved required parameter '@{parameter}' in unit '{unit}'")]
    UnresolvedRequiredParameter { unit: String, parameter: String },

    /// The requested platform key is not in the profile registry.
    #[error("Unknown platform: '{0}'. Expected: glue, athena, or redshift")]
    UnknownPlatform(String),

    /// A supplied option value is unusable.
    #[error("Invalid option '{name}': {message}")]
    InvalidOption { name: String, message: String },

    /// A procedure header was found but could not be parsed.
    #[error("Parse error at position {position}: {message}")]
    Parse { position: usize, message: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Project file rendering failed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConvertError {
    /// Create a parse error at the given position.
    pub fn parse(position: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            position,
            message: message.into(),
        }
    }

    /// Create an unresolved-parameter error.
    pub fn unresolved(unit: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self::UnresolvedRequiredParameter {
            unit: unit.into(),
            parameter: parameter.into(),
        }
    }

    /// Create an invalid-option error.
    pub fn invalid_option(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOption {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for procshift operations.
pub type ConvertResult<T> = Result<T, ConvertError>;
