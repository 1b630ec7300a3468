use std::{sync::Arc, time::Duration};

/// Result type used across the SDK core.
///
/// Evaluation entry points never return this type; they fall back to default values instead. It
/// is used by lifecycle operations (`flush`, `shutdown`) and by the building blocks underneath
/// (fetching, parsing, adapters).
pub type Result<T> = std::result::Result<T, StatsigError>;

/// Errors that can occur inside the SDK core.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum StatsigError {
    /// Request failed with a non-2xx status or a transport error.
    #[error("network request failed (status {status:?}): {message}")]
    NetworkError {
        /// HTTP status, if the server responded at all.
        status: Option<u16>,
        /// Transport error message or a description of the failure.
        message: String,
    },

    /// Network access is disabled by `StatsigOptions::disable_network`.
    #[error("network is disabled")]
    NetworkDisabled,

    /// Configured URL cannot be parsed.
    #[error("invalid url configuration")]
    InvalidUrl(#[source] url::ParseError),

    /// Payload is not valid JSON or does not match the expected shape.
    #[error("failed to parse {0}")]
    JsonParse(&'static str, #[source] Arc<serde_json::Error>),

    /// Failed to compress a request body.
    #[error("failed to gzip request body")]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Gzip(#[source] Arc<std::io::Error>),

    /// Data store adapter reported an error.
    #[error("data store error: {0}")]
    DataStore(String),

    /// Persistent storage adapter reported an error.
    #[error("persistent storage error: {0}")]
    PersistentStorage(String),

    /// Initialization did not complete within the configured timeout.
    #[error("initialization timed out after {0:?}")]
    InitTimeout(Duration),

    /// Shutdown did not complete within the given timeout.
    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// No tokio runtime is available to run background tasks on.
    #[error("no tokio runtime available, call initialize() from within a runtime")]
    RuntimeUnavailable,

    /// A shared instance is already registered.
    #[error("a shared instance is already registered")]
    SharedInstanceExists,

    /// No shared instance is registered.
    #[error("no shared instance is registered")]
    NoSharedInstance,

    /// A background task panicked. This should normally never happen.
    #[error("background task panicked")]
    TaskPanicked,
}

impl StatsigError {
    /// Build a network error from a failed response.
    pub(crate) fn network(status: Option<u16>, message: impl Into<String>) -> StatsigError {
        StatsigError::NetworkError {
            status,
            message: message.into(),
        }
    }

    /// Short stable name used as a tag for observability and output logging.
    pub fn name(&self) -> &'static str {
        match self {
            StatsigError::NetworkError { .. } => "NetworkError",
            StatsigError::NetworkDisabled => "NetworkDisabled",
            StatsigError::InvalidUrl(_) => "InvalidUrl",
            StatsigError::JsonParse(..) => "JsonParseError",
            StatsigError::Gzip(_) => "GzipError",
            StatsigError::DataStore(_) => "DataStoreError",
            StatsigError::PersistentStorage(_) => "PersistentStorageError",
            StatsigError::InitTimeout(_) => "InitTimeout",
            StatsigError::ShutdownTimeout(_) => "ShutdownTimeout",
            StatsigError::RuntimeUnavailable => "RuntimeUnavailable",
            StatsigError::SharedInstanceExists => "SharedInstanceExists",
            StatsigError::NoSharedInstance => "NoSharedInstance",
            StatsigError::TaskPanicked => "TaskPanicked",
        }
    }
}

impl From<std::io::Error> for StatsigError {
    fn from(value: std::io::Error) -> Self {
        StatsigError::Gzip(Arc::new(value))
    }
}

impl From<url::ParseError> for StatsigError {
    fn from(value: url::ParseError) -> Self {
        StatsigError::InvalidUrl(value)
    }
}

impl From<reqwest::Error> for StatsigError {
    fn from(value: reqwest::Error) -> Self {
        let status = value.status().map(|s| s.as_u16());
        StatsigError::network(status, value.without_url().to_string())
    }
}
