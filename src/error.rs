//! Error types shared across the lifecycle operations.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The project directory does not exist.
    #[error("project does not exist")]
    ProjectNotFound,
    /// The directory exists but holds no project state file.
    #[error("project file does not exist")]
    StateFileNotFound,
    /// The downloaded archive is empty or has an unexpected shape.
    #[error("{0}")]
    InvalidArchive(String),
    /// The archive carries no recognized module descriptor.
    #[error("project <{name}> version <{version}> is not a go module, please try other version")]
    UnsupportedProject { name: String, version: String },
    /// An external tool exited non-zero. The message is the tool's
    /// combined output, verbatim.
    #[error("{0}")]
    ToolFailure(String),
    /// A path would resolve outside the project destination.
    #[error("illegal path: {}", .0.display())]
    PathSafety(PathBuf),
    #[error("watcher: {0}")]
    Watcher(#[from] notify::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("download: {0}")]
    Http(#[from] reqwest::Error),
    #[error("project file: {0}")]
    StateDecode(#[from] toml::de::Error),
    #[error("project file: {0}")]
    StateEncode(#[from] toml::ser::Error),
    #[error("command: {0}")]
    CommandParse(#[from] shell_words::ParseError),
}

impl Error {
    /// True for the errors a caller can recover from by installing first.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ProjectNotFound | Error::StateFileNotFound)
    }
}
