//! Error types for berth-control.

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Model id is not present in the catalog.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Deployment record does not exist.
    #[error("model {0} not found in active deployments")]
    DeploymentNotFound(String),

    /// No free port in the configured range.
    #[error("no available ports in range {min}-{max}; stop some deployments first")]
    PortExhausted {
        /// Lower bound of the range.
        min: u16,
        /// Upper bound of the range.
        max: u16,
    },

    /// Malformed request field.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Worker process could not be spawned.
    #[error("launch error: {0}")]
    Launch(String),

    /// Model catalog could not be loaded or parsed.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a launch error.
    #[must_use]
    pub fn launch(msg: impl Into<String>) -> Self {
        Self::Launch(msg.into())
    }

    /// Create a catalog error.
    #[must_use]
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
