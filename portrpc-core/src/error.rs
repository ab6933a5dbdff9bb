// Error types of the serialization engine.

use crate::path::Path;
use thiserror::Error;

/// Failure while splitting a call's values into the JSON skeleton and its
/// non-JSON records.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SerializationError {
    #[error("Cannot serialize {kind} at {path}")]
    Unsupported { path: Path, kind: String },

    #[error("Dictionary keys must be strings, found {key} at {path}")]
    NonStringKey { path: Path, key: String },

    #[error("{type_name} is not a registered portable type (at {path})")]
    UnregisteredType { path: Path, type_name: String },

    #[error("Value nested too deeply at {path}")]
    TooDeep { path: Path },

    #[error("Serialization hook for {type_name} failed: {message}")]
    Hook { type_name: String, message: String },

    #[error("Cannot read media at {path}: {source}")]
    Media { path: Path, source: MediaError },

    #[error(transparent)]
    Scratch(#[from] ScratchError),
}

impl SerializationError {
    pub fn unsupported(path: Path, kind: impl Into<String>) -> Self {
        SerializationError::Unsupported {
            path,
            kind: kind.into(),
        }
    }

    pub fn hook(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        SerializationError::Hook {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// TypeError-class failures are caused by the shape of the caller's data
    /// rather than by an unsupported value.
    pub fn is_type_error(&self) -> bool {
        matches!(self, SerializationError::NonStringKey { .. })
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            SerializationError::Unsupported { path, .. }
            | SerializationError::NonStringKey { path, .. }
            | SerializationError::UnregisteredType { path, .. }
            | SerializationError::TooDeep { path }
            | SerializationError::Media { path, .. } => Some(path),
            SerializationError::Hook { .. } | SerializationError::Scratch(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScratchError {
    #[error("Transmitted scratch data is not available while serializing the global region")]
    TransmissionDisabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("Failed to read media content: {0}")]
    Read(String),
}

/// Failure while rebuilding values from a response envelope.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconstructError {
    #[error("Cannot return object of type {0}")]
    UnknownType(String),

    #[error("Malformed envelope: {0}")]
    Malformed(String),

    #[error("{tag} record is missing field '{field}'")]
    MissingField { tag: String, field: String },

    #[error("Invalid {tag} value: {message}")]
    InvalidValue { tag: String, message: String },

    #[error("No portable type registered as {0}")]
    UnknownPortableType(String),

    #[error("No position {0} in the envelope")]
    PathNotFound(Path),

    #[error("Media {0} was never received")]
    MissingMedia(String),

    #[error("Deserialization hook for {type_name} failed: {message}")]
    Hook { type_name: String, message: String },

    #[error(transparent)]
    Scratch(#[from] ScratchError),
}

impl ReconstructError {
    pub fn missing(tag: &str, field: &str) -> Self {
        ReconstructError::MissingField {
            tag: tag.to_string(),
            field: field.to_string(),
        }
    }

    pub fn invalid(tag: &str, message: impl Into<String>) -> Self {
        ReconstructError::InvalidValue {
            tag: tag.to_string(),
            message: message.into(),
        }
    }
}

/// Failure while classifying an inbound message.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WireError {
    #[error("JSON error: {0}")]
    Json(String),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for WireError {
    fn from(err: serde_json::Error) -> Self {
        WireError::Json(err.to_string())
    }
}
