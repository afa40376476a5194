//! Kiln Core - compiled engine and shape profile cache
//!
//! This crate decides, for every inference call against a compiled subgraph,
//! whether the currently published engine can serve the call's input shapes
//! or whether the engine has to be rebuilt for a wider shape envelope. Engines
//! and their shape profiles are persisted to a cache directory at the flush
//! point so later processes can reuse them.

// Module declarations
pub mod artifact;
pub mod builder;
pub mod config;
pub mod coordinator;
pub mod graph;
pub mod profile_format;
pub mod session;
pub mod shape_range;
pub mod store;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Observed shape has a different rank than the one recorded for the binding
    #[error("Shape rank mismatch [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    ShapeRankMismatch {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        binding: String,
        expected: usize,
        actual: usize,
    },

    /// A static engine was asked to run a shape it was not built for
    #[error("Static shape mismatch [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    ShapeMismatchStatic {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        binding: String,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },

    /// Persisted profile bytes could not be decoded
    #[error("Corrupt profile [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    CorruptProfile {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        path: Option<PathBuf>,
    },

    /// Persisted engine bytes were rejected
    #[error("Corrupt artifact [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    CorruptArtifact {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        path: Option<PathBuf>,
    },

    /// The engine builder failed
    #[error("Build error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    Build {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        graph: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Input validation and parameter errors
    #[error("Invalid input [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    InvalidInput {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        parameter_name: Option<String>,
        value: Option<String>,
    },

    /// Configuration parsing and validation errors
    #[error("Configuration error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    Configuration {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        config_path: Option<PathBuf>,
        field_name: Option<String>,
    },

    /// File system and I/O errors
    #[error("IO error [{code}]: {message}\nPath: {path:?}\nSuggestion: {suggestion}")]
    Io {
        code: &'static str,
        message: String,
        path: Option<PathBuf>,
        suggestion: String,
        #[source]
        source: std::io::Error,
    },

    /// Other unexpected errors
    #[error("Internal error [{code}]: {message}\nContext: {context}")]
    Internal {
        code: &'static str,
        message: String,
        context: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create a rank mismatch error for a binding
    pub fn shape_rank_mismatch<S: Into<String>>(binding: S, expected: usize, actual: usize) -> Self {
        let binding = binding.into();
        Self::ShapeRankMismatch {
            code: "SHAPE_RANK_MISMATCH",
            message: format!(
                "Input '{}' has rank {} but rank {} was recorded earlier",
                binding, actual, expected
            ),
            context: "Observing input shapes for the shape range profile".to_string(),
            suggestion: "Feed tensors with the same number of dimensions on every call".to_string(),
            binding,
            expected,
            actual,
        }
    }

    /// Create a static engine shape mismatch error
    pub fn static_shape_mismatch<S: Into<String>>(
        binding: S,
        expected: Vec<i64>,
        actual: Vec<i64>,
    ) -> Self {
        let binding = binding.into();
        Self::ShapeMismatchStatic {
            code: "STATIC_SHAPE_MISMATCH",
            message: format!(
                "Input '{}' has shape {:?} but the engine was built for {:?}",
                binding, actual, expected
            ),
            context: "Running a static-shape engine".to_string(),
            suggestion: "Declare the varying dimensions as dynamic so the engine can be rebuilt"
                .to_string(),
            binding,
            expected,
            actual,
        }
    }

    /// Create a corrupt profile error
    pub fn corrupt_profile<S1, S2>(message: S1, context: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::CorruptProfile {
            code: "PROFILE_CORRUPT",
            message: message.into(),
            context: context.into(),
            suggestion: "Delete the .profile file; it is rebuilt on the next flush".to_string(),
            path: None,
        }
    }

    /// Create a corrupt artifact error
    pub fn corrupt_artifact<S1, S2>(message: S1, context: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::CorruptArtifact {
            code: "ARTIFACT_CORRUPT",
            message: message.into(),
            context: context.into(),
            suggestion: "Delete the .engine file; it is rebuilt on the next flush".to_string(),
            path: None,
        }
    }

    /// Create a build error wrapping the builder's failure
    pub fn build<S: Into<String>>(graph: S, source: anyhow::Error) -> Self {
        let graph = graph.into();
        Self::Build {
            code: "ENGINE_BUILD_FAILED",
            message: format!("Engine build for graph '{}' failed: {}", graph, source),
            context: "Building an engine for a widened shape profile".to_string(),
            suggestion: "The previous engine stays in service; retry the call or check the builder"
                .to_string(),
            graph,
            source: Some(source),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input<S1, S2, S3>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::InvalidInput {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            parameter_name: None,
            value: None,
        }
    }

    /// Create an invalid input error naming the offending parameter
    pub fn invalid_parameter<S1, S2, S3, S4>(
        code: &'static str,
        message: S1,
        context: S2,
        parameter_name: S3,
        value: S4,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
        S4: Into<String>,
    {
        Self::InvalidInput {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: "Check the value passed for this parameter".to_string(),
            parameter_name: Some(parameter_name.into()),
            value: Some(value.into()),
        }
    }

    /// Create a configuration error
    pub fn configuration<S1, S2, S3>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::Configuration {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            config_path: None,
            field_name: None,
        }
    }

    /// Attach a file path to errors that carry one
    pub fn with_path<P: Into<PathBuf>>(mut self, new_path: P) -> Self {
        match &mut self {
            Self::CorruptProfile { path, .. }
            | Self::CorruptArtifact { path, .. }
            | Self::Io { path, .. } => *path = Some(new_path.into()),
            Self::Configuration { config_path, .. } => *config_path = Some(new_path.into()),
            _ => {}
        }
        self
    }

    /// Whether the error describes an unreadable cache entry that should be
    /// treated as a miss
    pub fn is_cache_corruption(&self) -> bool {
        matches!(self, Self::CorruptProfile { .. } | Self::CorruptArtifact { .. })
    }

    /// Get the error code for programmatic handling
    pub fn code(&self) -> &'static str {
        match self {
            Self::ShapeRankMismatch { code, .. } => code,
            Self::ShapeMismatchStatic { code, .. } => code,
            Self::CorruptProfile { code, .. } => code,
            Self::CorruptArtifact { code, .. } => code,
            Self::Build { code, .. } => code,
            Self::InvalidInput { code, .. } => code,
            Self::Configuration { code, .. } => code,
            Self::Io { code, .. } => code,
            Self::Internal { code, .. } => code,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        let (code, suggestion) = match err.kind() {
            std::io::ErrorKind::NotFound => (
                "IO_FILE_NOT_FOUND",
                "Check that the cache directory exists"
            ),
            std::io::ErrorKind::PermissionDenied => (
                "IO_PERMISSION_DENIED",
                "Check permissions on the cache directory"
            ),
            std::io::ErrorKind::InvalidData => (
                "IO_INVALID_DATA",
                "The cache file may be corrupted; delete it to force a rebuild"
            ),
            _ => (
                "IO_UNKNOWN",
                "Check the file system and try the operation again"
            ),
        };

        Self::Io {
            code,
            message: err.to_string(),
            path: None,
            suggestion: suggestion.to_string(),
            source: err,
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            code: "INTERNAL_UNKNOWN",
            message: err.to_string(),
            context: "An unexpected error occurred".to_string(),
            source: Some(err),
        }
    }
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        artifact::{ArtifactKey, CompiledArtifact},
        builder::EngineBuilder,
        config::{CacheConfig, LogLevel, LoggingConfig},
        coordinator::{CacheCoordinator, CacheStats, FlushReport, RunKind, RunOutcome},
        graph::{Dim, GraphIdentity, GraphSpec, InputBinding},
        session::EngineSession,
        shape_range::{DimRange, Profile, RangeUpdate, ShapeRange, ShapeRangeTracker},
        store::{CacheKind, EngineCacheStore},
        CoreError, Result,
    };
}

// Re-export key types at the crate root
pub use config::CacheConfig;
pub use coordinator::CacheCoordinator;
pub use session::EngineSession;

pub mod error {
    pub use super::{CoreError, Result};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = CoreError::shape_rank_mismatch("X", 3, 2);
        assert_eq!(err.code(), "SHAPE_RANK_MISMATCH");

        let err = CoreError::static_shape_mismatch("X", vec![1, 3, 2], vec![1, 1, 6]);
        assert_eq!(err.code(), "STATIC_SHAPE_MISMATCH");
        assert!(err.to_string().contains("[1, 1, 6]"));

        let err = CoreError::build("g", anyhow::anyhow!("out of workspace"));
        assert_eq!(err.code(), "ENGINE_BUILD_FAILED");
        assert!(err.to_string().contains("out of workspace"));
    }

    #[test]
    fn test_corruption_classification() {
        assert!(CoreError::corrupt_profile("bad", "ctx").is_cache_corruption());
        assert!(CoreError::corrupt_artifact("bad", "ctx").is_cache_corruption());
        assert!(!CoreError::shape_rank_mismatch("X", 1, 2).is_cache_corruption());
    }

    #[test]
    fn test_with_path() {
        let err = CoreError::corrupt_profile("bad", "ctx").with_path("/tmp/g.profile");
        match err {
            CoreError::CorruptProfile { path, .. } => {
                assert_eq!(path, Some(PathBuf::from("/tmp/g.profile")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_io_conversion() {
        let err: CoreError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.code(), "IO_FILE_NOT_FOUND");
    }
}
