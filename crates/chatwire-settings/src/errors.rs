//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Why settings could not be produced.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not JSON, or does not fit the settings shape.
    #[error("malformed settings: {0}")]
    Json(#[from] serde_json::Error),

    /// Values parse but cannot run together.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// camelCase name of the offending setting.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl SettingsError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_error_names_the_file() {
        let err = SettingsError::Read {
            path: PathBuf::from("/etc/chatwire.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(err.to_string(), "cannot read /etc/chatwire.json: denied");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn invalid_names_the_field() {
        let err = SettingsError::invalid("outboundQueueCapacity", "must be positive");
        assert_eq!(err.to_string(), "invalid outboundQueueCapacity: must be positive");
    }
}
