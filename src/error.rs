use serde::Serialize;
use thiserror::Error;

/// Crate-wide error type
///
/// Every variant maps to one rejection reason surfaced to the embedding
/// application. Teardown paths never produce these for already-gone resources.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("PeerConnection not started")]
    NotStarted,

    #[error("PeerConnection already started; call stop() first")]
    AlreadyStarted,

    #[error("Unknown {kind}: {id}")]
    UnknownResource { kind: &'static str, id: String },

    #[error("Track not attached to peer connection: {0}")]
    TrackNotAttached(String),

    #[error("Missing {0}")]
    MissingArgument(&'static str),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Negotiation rejected: {0}")]
    NegotiationRejected(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    pub fn unknown_track(id: impl Into<String>) -> Self {
        Self::UnknownResource {
            kind: "trackId",
            id: id.into(),
        }
    }

    pub fn unknown_channel(id: impl Into<String>) -> Self {
        Self::UnknownResource {
            kind: "channelId",
            id: id.into(),
        }
    }

    pub fn unknown_view(id: impl Into<String>) -> Self {
        Self::UnknownResource {
            kind: "viewId",
            id: id.into(),
        }
    }

    /// Stable machine-readable code for the rejection
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotStarted => "NOT_STARTED",
            AppError::AlreadyStarted => "ALREADY_STARTED",
            AppError::UnknownResource { .. } | AppError::TrackNotAttached(_) => {
                "UNKNOWN_RESOURCE"
            }
            AppError::MissingArgument(_) => "MISSING_ARGUMENT",
            AppError::InvalidArgument(_) => "INVALID_ARGUMENT",
            AppError::NegotiationRejected(_) => "NEGOTIATION_REJECTED",
            AppError::EncodingError(_) => "ENCODING_ERROR",
            AppError::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
            AppError::Engine(_) => "ENGINE_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Rejection body handed back to the embedding application
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub code: &'static str,
    pub message: String,
}

impl From<&AppError> for ErrorResponse {
    fn from(err: &AppError) -> Self {
        tracing::debug!(code = err.code(), error_message = %err, "Operation rejected");

        Self {
            success: false,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, AppError>;
