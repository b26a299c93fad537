use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for shmcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for shmcache operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration or command-line argument
    #[error("invalid argument: {message}")]
    Argument { message: String },

    /// Malformed configuration source (config file, cache manifest)
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Shared memory or synchronization primitive failure
    #[error("{operation} failed for '{resource}': {source}")]
    Resource {
        resource: String,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Requested path is not in the cache index
    #[error("'{path}' is not cached")]
    NotFound { path: String },

    /// A transfer failed part way through
    #[error("transfer of '{path}' failed: {message}")]
    Transfer {
        path: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// A bounded wait expired
    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Non-blocking enqueue found every slot occupied
    #[error("request queue is full ({capacity} slots in use)")]
    QueueFull { capacity: usize },

    /// The daemon is shutting down
    #[error("daemon is shutting down")]
    Shutdown,

    /// Shared state did not match what this side expected
    #[error("protocol violation: {message}")]
    Protocol { message: String },

    /// File system operations
    #[error("file system {operation} operation failed for '{path}': {source}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON deserialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Json {
            message: error.to_string(),
            source: error,
        }
    }
}

impl Error {
    /// Create an argument error
    #[must_use]
    pub fn argument(message: impl Into<String>) -> Self {
        Error::Argument {
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    /// Create a resource error from an OS error
    #[must_use]
    pub fn resource(
        resource: impl Into<String>,
        operation: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Error::Resource {
            resource: resource.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Create a not-found error
    #[must_use]
    pub fn not_found(path: impl Into<String>) -> Self {
        Error::NotFound { path: path.into() }
    }

    /// Create a transfer error
    #[must_use]
    pub fn transfer(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Transfer {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a transfer error caused by an I/O failure
    #[must_use]
    pub fn transfer_io(path: impl Into<String>, source: std::io::Error) -> Self {
        Error::Transfer {
            path: path.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a protocol error
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Create a file system error with context
    #[must_use]
    pub fn file_system(
        path: impl Into<PathBuf>,
        operation: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Error::FileSystem {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Errors that must stop the daemon rather than a single request
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Argument { .. }
                | Error::Configuration { .. }
                | Error::Resource { .. }
                | Error::FileSystem { .. }
                | Error::Json { .. }
        )
    }

    /// Process exit status for a fatal error
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Error::Argument { .. } | Error::Configuration { .. } | Error::Json { .. } => 2,
            _ => 1,
        }
    }
}
