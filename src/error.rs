use thiserror::Error;

/// I/O errors that can occur when reading from a source or a cache backend.
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Error from S3 or S3-compatible storage
    #[error("S3 error: {0}")]
    S3(String),

    /// Network or connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Local filesystem error
    #[error("Filesystem error: {0}")]
    Filesystem(String),

    /// Object not found
    #[error("Object not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for IoError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            IoError::NotFound(err.to_string())
        } else {
            IoError::Filesystem(err.to_string())
        }
    }
}

/// Errors raised by decoders and encoders.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// No decoder is registered for the detected source format (HTTP 415)
    #[error("Unsupported source format: {0}")]
    UnsupportedSourceFormat(String),

    /// No encoder is registered for the requested output format
    #[error("Unsupported output format: {0}")]
    UnsupportedOutputFormat(String),

    /// The source bytes could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// The processed raster could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),
}

/// Failures of an info or variant cache backend.
///
/// These are never fatal to a request: the orchestrator logs them and falls
/// back to reading from the source.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Backend storage failed
    #[error("Cache I/O error: {0}")]
    Io(String),

    /// A stored entry could not be (de)serialized
    #[error("Cache serialization error: {0}")]
    Serialization(String),

    /// The writer was already committed or the backend is shut down
    #[error("Cache closed: {0}")]
    Closed(String),
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

/// Request-level errors produced by the image pipeline.
///
/// Each variant maps to one client-facing status code in the HTTP layer.
#[derive(Debug, Clone, Error)]
pub enum ImageError {
    /// The source image does not exist (HTTP 404)
    #[error("Image not found: {identifier}")]
    NotFound { identifier: String },

    /// Denied by authorization or by a processing limit (HTTP 403)
    #[error("Forbidden: {reason}")]
    Forbidden { reason: String },

    /// Denied pending authentication (HTTP 401 with a challenge)
    #[error("Unauthorized")]
    Unauthorized { challenge: String },

    /// Authorization requested a redirect (HTTP 3xx)
    #[error("Redirect to {location}")]
    Redirect { location: String, status: u16 },

    /// The request could not be parsed or is not satisfiable (HTTP 400)
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The source was reached but its format has no decoder (HTTP 415)
    #[error("Unsupported source format: {format}")]
    UnsupportedSourceFormat { format: String },

    /// Source I/O failure
    #[error("I/O error: {0}")]
    Io(IoError),

    /// Decode or encode failure
    #[error("Codec error: {0}")]
    Codec(CodecError),

    /// A cache backend failed and no fallback was possible
    #[error("Cache backend failure: {0}")]
    CacheBackend(#[from] CacheError),

    /// The pipeline was driven through an illegal transition
    #[error("Illegal state: {0}")]
    IllegalState(String),
}

impl From<IoError> for ImageError {
    fn from(err: IoError) -> Self {
        match err {
            IoError::NotFound(identifier) => ImageError::NotFound { identifier },
            other => ImageError::Io(other),
        }
    }
}

impl From<CodecError> for ImageError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::UnsupportedSourceFormat(format) => {
                ImageError::UnsupportedSourceFormat { format }
            }
            other => ImageError::Codec(other),
        }
    }
}

impl ImageError {
    /// Shorthand for an invalid-request error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        ImageError::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Shorthand for a forbidden error.
    pub fn forbidden(reason: impl Into<String>) -> Self {
        ImageError::Forbidden {
            reason: reason.into(),
        }
    }
}

/// Fatal configuration problems detected at startup.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// A required option is missing
    #[error("Missing configuration: {0}")]
    Missing(String),

    /// An option has an out-of-range or inconsistent value
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
