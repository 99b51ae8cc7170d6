use thiserror::Error;

/// Result type for inferbench operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for inferbench operations
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(#[source] anyhow::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Engine setup failed before any timing began
    #[error("Setup of '{engine}' failed: {message}")]
    Setup {
        engine: String,
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// A single timed execution failed, aborting the run
    #[error("Execution of '{engine}' failed: {message}")]
    Execution {
        engine: String,
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Releasing engine resources failed
    #[error("Finalize of '{engine}' failed: {message}")]
    Finalize { engine: String, message: String },

    /// Iteration count below what the statistics can summarize
    #[error("Invalid iteration count {requested}: at least {minimum} iterations are required")]
    InvalidIterations { requested: usize, minimum: usize },

    /// Not enough samples left after discarding the warm-up sample
    #[error("Cannot summarize '{name}': no samples remain after discarding the warm-up sample")]
    InsufficientSamples { name: String },

    /// A variant with the same name is already registered
    #[error("Variant '{0}' is already registered")]
    DuplicateVariant(String),

    /// A placeholder could not be resolved to a concrete number
    #[error("Unresolved placeholder: {0}")]
    UnresolvedPlaceholder(String),

    /// A placeholder expression could not be parsed or evaluated
    #[error("Invalid placeholder expression '{expression}': {message}")]
    InvalidExpression { expression: String, message: String },

    /// Layout description is inconsistent
    #[error("Invalid memory layout: {0}")]
    InvalidLayout(String),

    /// Weight payload does not match the layout it is decoded against
    #[error("Weight size mismatch: expected {expected} bytes but got {actual}")]
    WeightSizeMismatch { expected: usize, actual: usize },

    /// Weight payload is malformed
    #[error("Corrupt weight data: {0}")]
    CorruptWeights(String),

    /// Unknown weight encoding name
    #[error("Unsupported weight encoding: {0}")]
    UnsupportedEncoding(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Create a setup error
    pub fn setup<S, M>(engine: S, message: M) -> Self
    where
        S: Into<String>,
        M: Into<String>,
    {
        Self::Setup {
            engine: engine.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a setup error with a source
    pub fn setup_with_source<S, M, E>(engine: S, message: M, source: E) -> Self
    where
        S: Into<String>,
        M: Into<String>,
        E: Into<anyhow::Error>,
    {
        Self::Setup {
            engine: engine.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create an execution error
    pub fn execution<S, M>(engine: S, message: M) -> Self
    where
        S: Into<String>,
        M: Into<String>,
    {
        Self::Execution {
            engine: engine.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a failure to release engine resources
    pub fn finalize<S>(engine: S, cause: Error) -> Self
    where
        S: Into<String>,
    {
        match cause {
            Self::Finalize { .. } => cause,
            other => Self::Finalize {
                engine: engine.into(),
                message: other.to_string(),
            },
        }
    }

    /// Create a not found error
    pub fn not_found<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::NotFound(message.into())
    }

    /// Create a validation error
    pub fn validation<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::ValidationError(message.into())
    }

    /// Create an invalid layout error
    pub fn layout<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::InvalidLayout(message.into())
    }
}
