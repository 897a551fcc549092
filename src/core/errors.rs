use thiserror::Error;

/// Unified error type for the genboard pipeline
#[derive(Debug, Error)]
pub enum GenError {
    /// A pipeline operation was called in the wrong run phase
    #[error("Lifecycle error in {operation}: {message}")]
    Lifecycle {
        operation: String,
        message: String,
    },

    /// A required artifact is absent from the blackboard
    #[error("Artifact '{key}' is not present on the blackboard")]
    MissingArtifact { key: String },

    /// An artifact exists but holds a different type than requested
    #[error("Artifact '{key}' is not of type {expected}")]
    ArtifactType {
        key: String,
        expected: &'static str,
    },

    /// A unit failed while generating
    #[error("Unit {unit} failed: {message}")]
    UnitFailed {
        unit: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Timeout errors
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout {
        operation: String,
        timeout_ms: u64,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl GenError {
    /// Create a lifecycle error for an operation called out of phase
    pub fn lifecycle<S: Into<String>, M: Into<String>>(operation: S, message: M) -> Self {
        Self::Lifecycle {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn missing_artifact<S: Into<String>>(key: S) -> Self {
        Self::MissingArtifact { key: key.into() }
    }

    pub fn artifact_type<S: Into<String>>(key: S, expected: &'static str) -> Self {
        Self::ArtifactType {
            key: key.into(),
            expected,
        }
    }

    /// Create a unit failure from a message
    pub fn unit_failed<S: Into<String>, M: Into<String>>(unit: S, message: M) -> Self {
        Self::UnitFailed {
            unit: unit.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error with field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Io { .. } => true,
            // The driver can fix the phase and retry
            Self::Lifecycle { .. } => true,
            Self::MissingArtifact { .. } | Self::ArtifactType { .. } => false,
            Self::UnitFailed { .. } | Self::Configuration { .. } => false,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Lifecycle { .. } => "lifecycle",
            Self::MissingArtifact { .. } | Self::ArtifactType { .. } => "artifact",
            Self::UnitFailed { .. } => "unit",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Timeout { .. } => "timeout",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, GenError>;

impl From<std::io::Error> for GenError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for GenError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for GenError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}
