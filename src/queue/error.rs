//! Errors surfaced by the download queue.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such queue item: {0}")]
    NotFound(PathBuf),

    #[error("{user} is already a source for {target}")]
    AlreadySource { target: PathBuf, user: crate::Cid },

    #[error("io error persisting queue: {0}")]
    Io(#[from] std::io::Error),

    #[error("xml error persisting queue: {0}")]
    Xml(#[from] quick_xml::Error),
}
