//! Errors surfaced by the shared-tree index.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("a refresh is already in progress")]
    RefreshInProgress,

    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("virtual path not found: {0}")]
    PathNotFound(String),

    #[error("invalid bloom request: {0}")]
    Bloom(#[from] crate::bloom::BloomParamError),

    #[error("xml generation failed: {0}")]
    Xml(#[from] quick_xml::Error),
}
