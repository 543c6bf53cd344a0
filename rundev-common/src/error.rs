//! Error types for the shared filesystem and codec operations.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the walk, diff, archive, and ignore subsystems.
///
/// The HTTP layers map these onto status codes and media types; nothing in
/// this crate talks HTTP directly.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation was pointed at something that is not a directory.
    #[error("path {0} is not a directory")]
    NotADirectory(PathBuf),

    /// Filesystem-level failure while walking, archiving, or applying.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Input the codec refuses by design (symlinks, negation rules).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A patch archive that violates the wire conventions.
    #[error("invalid patch archive: {0}")]
    InvalidArchive(String),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
