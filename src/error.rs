use thiserror::Error;

/// Main error type for the Warden supervisor
#[derive(Debug, Error)]
pub enum WardenError {
    // Service-related errors
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Failed to spawn service {0}: {1}")]
    SpawnError(String, String),

    #[error("Missing required files for service {0}: {1}")]
    MissingRequiredFiles(String, String),

    #[error("Health check failed for service {0}")]
    HealthCheckFailed(String),

    #[error("Restart limit reached for service {0}")]
    RestartLimitExceeded(String),

    #[error("Failed to signal service {0}: {1}")]
    SignalError(String, String),

    // Group errors
    #[error("Reload rejected: {0}")]
    ReloadBlocked(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Warden operations
pub type Result<T> = std::result::Result<T, WardenError>;
