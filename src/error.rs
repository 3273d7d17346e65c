//! Error types for hostdev.

use thiserror::Error;

/// Result type alias using hostdev's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in device lifecycle operations.
#[derive(Error, Debug)]
pub enum Error {
    // Definition errors
    /// Device kind is not valid for this instance kind.
    ///
    /// Devices inherited from profiles may carry this and be skipped.
    #[error("unsupported device type")]
    UnsupportedDevType,

    /// A configuration field failed validation.
    #[error("invalid value for device option {field:?}: {reason}")]
    Validation {
        /// Offending field.
        field: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A field is not known to the driver.
    #[error("invalid device option {0:?}")]
    UnknownOption(String),

    /// Generic configuration error (missing or conflicting fields).
    #[error("configuration error: {0}")]
    Config(String),

    // Host errors
    /// A host precondition is not met.
    #[error("environment error: {0}")]
    Environment(String),

    /// A host object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A host-side mutation failed.
    #[error("failed to {op}: {reason}")]
    HostMutation {
        /// Operation that failed.
        op: String,
        /// Underlying failure.
        reason: String,
    },

    /// External command failed.
    #[error("command failed: {command}: {message}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
    },

    // Resource exhaustion
    /// No free resource of the requested kind.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An instance address is already answered on the parent network.
    #[error("IP address {address:?} in use on parent network {parent:?}")]
    AddressInUse {
        /// Probed address.
        address: String,
        /// Parent interface the probe ran on.
        parent: String,
    },

    // Persistence and configuration loading
    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// Failed to load configuration.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// Failed to save configuration.
    #[error("failed to save config: {0}")]
    ConfigSave(String),

    /// Errors accumulated during teardown.
    #[error("{}", join_errors(.0))]
    Cleanup(Vec<Error>),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_errors(errs: &[Error]) -> String {
    let parts: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
    format!("cleanup failed: [{}]", parts.join("; "))
}

impl Error {
    /// Create a validation error for a field.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error with a message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an environment error with a message.
    pub fn environment(msg: impl Into<String>) -> Self {
        Self::Environment(msg.into())
    }

    /// Create a not found error with a message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a host mutation error.
    pub fn host(op: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::HostMutation {
            op: op.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a resource exhaustion error.
    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Collapse accumulated teardown errors into one result.
    pub fn from_cleanup(mut errs: Vec<Error>) -> Result<()> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(Self::Cleanup(errs)),
        }
    }

    /// Whether the device kind simply does not apply to the instance kind.
    pub fn is_unsupported_dev_type(&self) -> bool {
        matches!(self, Self::UnsupportedDevType)
    }

    /// Whether a caller may retry the attach elsewhere.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_) | Self::AddressInUse { .. })
    }

    /// Whether this reports a missing host object.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
