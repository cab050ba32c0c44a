use std::sync::Arc;

use reqwest::StatusCode;

/// Represents a result type for operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while synchronizing configuration or
/// evaluating settings.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Error evaluating a setting.
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    /// The request failed for a reason other than a transport error (e.g., the transport was
    /// unable to produce a response in time).
    #[error("failed to fetch configuration: {0}")]
    FetchFailed(String),

    /// The server responded with a status that is neither 200 nor 304.
    #[error("unexpected HTTP status while fetching configuration: {0}")]
    UnexpectedStatus(StatusCode),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Reading from the configuration cache failed or the cache entry is malformed.
    #[error("failed to read configuration cache: {0}")]
    CacheReadFailed(String),

    /// Writing to the configuration cache failed.
    #[error("failed to write configuration cache: {0}")]
    CacheWriteFailed(String),

    /// Redirect preferences kept sending us to another base URL.
    #[error("redirection loop detected while fetching configuration")]
    RedirectLoopDetected,

    /// Configuration body could not be decoded.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(Arc<str>),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// Refresh was requested in offline mode while no cache is configured.
    #[error("client is in offline mode and no cache is configured")]
    OfflineWithoutCache,

    /// Caller stopped waiting for a refresh. The refresh itself keeps running.
    #[error("timed out waiting for configuration refresh")]
    RefreshTimeout,

    /// The client has been closed and no longer refreshes configuration.
    #[error("client is closed")]
    Closed,

    /// A background worker panicked. This should normally never happen.
    #[error("background worker panicked")]
    WorkerPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            return Error::FetchFailed("request timed out".to_owned());
        }
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::InvalidConfiguration(value.to_string().into())
    }
}

/// Errors produced while evaluating a single setting for an evaluation context.
///
/// Most of them are "ordinary" data problems: they are reported for diagnostics but evaluation
/// still returns a value. [`EvaluationError::CircularDependency`] is the only one that aborts the
/// whole setting.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EvaluationError {
    /// The evaluation context does not carry the attribute a condition refers to.
    #[error("attribute {attribute:?} is missing")]
    AttributeMissing {
        /// Attribute name.
        attribute: String,
    },

    /// The attribute exists but cannot be coerced to the type the comparator needs.
    #[error("attribute {attribute:?} is invalid: {reason}")]
    AttributeInvalid {
        /// Attribute name.
        attribute: String,
        /// What went wrong during coercion.
        reason: String,
    },

    /// A comparison operand stored in the configuration is malformed.
    #[error("comparison value is invalid: {0}")]
    ComparisonValueInvalid(String),

    /// A user condition or percentage option needs an evaluation context but none was given.
    #[error("User Object missing")]
    NoEvaluationContext,

    /// A prerequisite flag condition refers to a key that is absent from the configuration.
    #[error("prerequisite flag {key:?} is missing")]
    PrerequisiteNotFound {
        /// Prerequisite flag key.
        key: String,
    },

    /// A prerequisite flag condition compares against a value of the wrong type.
    #[error("type mismatch between comparison value and prerequisite flag {key:?}")]
    PrerequisiteTypeMismatch {
        /// Prerequisite flag key.
        key: String,
    },

    /// The setting takes part in a prerequisite dependency cycle.
    #[error("circular dependency detected: {path}")]
    CircularDependency {
        /// Keys forming the cycle, joined with ` -> `.
        path: String,
    },

    /// The requested setting key does not exist.
    #[error("setting {key:?} not found")]
    KeyNotFound {
        /// Requested key.
        key: String,
    },

    /// No configuration has been fetched or loaded yet.
    #[error("configuration missing")]
    ConfigurationMissing,
}

impl EvaluationError {
    /// Return `true` if this error must abort evaluation of the enclosing setting rather than
    /// skip the current rule.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(self, EvaluationError::CircularDependency { .. })
    }
}
