//! Crate-wide error type.
//!
//! Every variant that touches the filesystem carries the path (and, where one
//! exists, the example identifier) so a failed run names the offending file.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SegError>;

#[derive(Debug, Error)]
pub enum SegError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read feature matrix {path}: {source}")]
    Npy {
        path: PathBuf,
        #[source]
        source: ndarray_npy::ReadNpyError,
    },

    #[error("example `{id}`: unknown class name `{name}`")]
    UnknownClass { id: String, name: String },

    #[error("class index {0} has no name in the class dictionary")]
    UnknownIndex(usize),

    #[error("bad class mapping {path}: {reason}")]
    Mapping { path: PathBuf, reason: String },

    #[error("example `{id}`: feature matrix has {dim} channels, model expects {expected}")]
    FeatureDim { id: String, dim: usize, expected: usize },

    #[error("checkpoint {path}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unsupported device `{0}` (only `cpu` is available)")]
    UnsupportedDevice(String),

    #[error("example `{id}` has no frames ({feature_frames} feature columns, {label_frames} labels)")]
    EmptyExample { id: String, feature_frames: usize, label_frames: usize },

    #[error("no examples left to batch")]
    EmptyBatch,

    #[error("{split} split has no valid frames; accuracy is undefined")]
    EmptySplit { split: &'static str },
}

impl SegError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SegError::Io { path: path.into(), source }
    }
}
