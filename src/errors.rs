use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::session::SessionId;

/// Structured error types for the segmentation front-end.
///
/// Each variant carries the context of the action that failed so the
/// boundary closest to the user (CLI or HTTP handler) can render a distinct
/// message without parsing error strings.
#[derive(Error, Debug)]
pub enum VistaSegError {
    #[error("Uploaded payload is not a decodable raster image")]
    Decode {
        #[source]
        source: image::ImageError,
    },

    #[error("Inference tool `{program}` could not be launched")]
    ToolNotFound {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Inference tool exited with {status}")]
    InferenceFailure { status: String, log: String },

    #[error("Inference did not finish within {timeout:?}")]
    InferenceTimeout { timeout: Duration },

    #[error("Inference was cancelled")]
    InferenceCancelled,

    #[error("Inference is already running for session {session}")]
    InferenceInProgress { session: SessionId },

    #[error("Expected output is missing: {path:?}")]
    MissingOutput { path: PathBuf },

    #[error("Unknown session {session}")]
    SessionNotFound { session: SessionId },

    #[error("Visualization downloads are disabled")]
    VisualizationDisabled,

    #[error("Label mask {path:?} is not usable: {reason}")]
    LabelMaskFormat { path: PathBuf, reason: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },

    #[error("Background task failed: {operation}")]
    Task {
        operation: String,
        #[source]
        source: tokio::task::JoinError,
    },
}

pub type Result<T> = std::result::Result<T, VistaSegError>;

impl VistaSegError {
    pub(crate) fn file_system(
        path: impl Into<PathBuf>,
        operation: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::FileSystem {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Stable machine-readable name of the variant.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Decode { .. } => "decode",
            Self::ToolNotFound { .. } => "tool_not_found",
            Self::InferenceFailure { .. } => "inference_failure",
            Self::InferenceTimeout { .. } => "inference_timeout",
            Self::InferenceCancelled => "inference_cancelled",
            Self::InferenceInProgress { .. } => "inference_in_progress",
            Self::MissingOutput { .. } => "missing_output",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::VisualizationDisabled => "visualization_disabled",
            Self::LabelMaskFormat { .. } => "label_mask_format",
            Self::FileSystem { .. } => "file_system",
            Self::ImageProcessing { .. } => "image_processing",
            Self::Validation { .. } => "validation",
            Self::Task { .. } => "task",
        }
    }

    /// Diagnostic text of a failed tool run, if any.
    pub fn inference_log(&self) -> Option<&str> {
        match self {
            Self::InferenceFailure { log, .. } => Some(log),
            _ => None,
        }
    }
}

/// Code that knows the path and operation should build `FileSystem` directly.
impl From<std::io::Error> for VistaSegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for VistaSegError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<tiff::TiffError> for VistaSegError {
    fn from(err: tiff::TiffError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "tiff processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<serde_json::Error> for VistaSegError {
    fn from(err: serde_json::Error) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "json serialization".to_string(),
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inference_log_only_on_failure() {
        let failure = VistaSegError::InferenceFailure {
            status: "exit status: 1".to_string(),
            log: "--- STDOUT ---\n\n\n--- STDERR ---\nboom".to_string(),
        };
        assert!(failure.inference_log().unwrap().ends_with("boom"));
        assert!(VistaSegError::InferenceCancelled.inference_log().is_none());
    }

    #[test]
    fn test_io_error_conversion_keeps_source() {
        let err: VistaSegError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        match err {
            VistaSegError::FileSystem { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
