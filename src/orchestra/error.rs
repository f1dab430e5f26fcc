use std::{error::Error, fmt, io};

/// Every failure the training orchestration can surface.
#[derive(Debug)]
pub enum OrchestraError {
    /// Invalid topology or run configuration, caught before any collective starts.
    InvalidConfig(String),
    /// The process group could not rendezvous with its peers.
    Rendezvous(String),
    /// `initialize` was called on a slot that was already used by this process.
    AlreadyInitialized,
    /// A resume was requested but the checkpoint cannot be loaded.
    Resume(String),
    /// A checkpoint could not be written. The run keeps going.
    Checkpoint { iteration: u64, source: io::Error },
    /// A collective operation failed, timed out or saw a peer out of step.
    Collective(String),
    /// The external trainer reported an error from one of its capabilities.
    Trainer {
        op: &'static str,
        source: Box<dyn Error + Send + Sync>,
    },
    /// The data producers cannot feed the loop.
    Data(String),
    /// An underlying I/O error not covered by the above variants.
    Io(io::Error),
}

/// The orchestra module's result type.
pub type Result<T> = std::result::Result<T, OrchestraError>;

impl OrchestraError {
    /// Wraps an error raised by a trainer capability.
    pub fn trainer<E>(op: &'static str, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self::Trainer {
            op,
            source: source.into(),
        }
    }

    /// Whether the owning process must abort on this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Checkpoint { .. })
    }
}

impl fmt::Display for OrchestraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::Rendezvous(msg) => write!(f, "rendezvous failed: {msg}"),
            Self::AlreadyInitialized => {
                write!(f, "process group was already initialized in this process")
            }
            Self::Resume(msg) => write!(f, "cannot resume: {msg}"),
            Self::Checkpoint { iteration, source } => {
                write!(f, "checkpoint at iteration {iteration} failed: {source}")
            }
            Self::Collective(msg) => write!(f, "collective error: {msg}"),
            Self::Trainer { op, source } => write!(f, "trainer {op} failed: {source}"),
            Self::Data(msg) => write!(f, "data error: {msg}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for OrchestraError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Checkpoint { source, .. } => Some(source),
            Self::Trainer { source, .. } => Some(source.as_ref()),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OrchestraError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<OrchestraError> for io::Error {
    fn from(value: OrchestraError) -> Self {
        match value {
            OrchestraError::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}
