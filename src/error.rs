use std::fmt::{Debug, Display};
use std::io;

use thiserror::Error as ThisError;

use crate::message::Tag;

pub type Result<T> = std::result::Result<T, Error>;

pub struct Error {
    kind: ErrorKind,
}

#[derive(ThisError)]
pub enum ErrorKind {
    #[error("shared heap exhausted: requested {requested} bytes, {available} bytes free")]
    AllocationFailure { requested: usize, available: usize },

    #[error("payload construction failed: {0}")]
    ConstructionFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("unknown message {0}")]
    UnknownMessage(Tag),

    #[error("envelope {index} cannot be resolved (table length {len})")]
    StaleEnvelope { index: u64, len: usize },

    #[error("alignment of object must be at most 16, got {0}")]
    Alignment(usize),

    #[error("offset {0} does not point into the segment")]
    InvalidOffset(usize),

    #[error("block at offset {0} is not allocated")]
    DoubleFree(usize),

    #[error("object names must be between 1 and {0} bytes long")]
    NameTooLong(usize),

    #[error("named object registry is full")]
    RegistryFull,

    #[error("named object {name} was registered with a different layout")]
    LayoutMismatch { name: String },

    #[error("queue datum size mismatch: expected {expected} bytes, found {found}")]
    QueueMismatch { expected: usize, found: usize },

    #[error("segment of {len} bytes is too small, at least {required} bytes are needed")]
    TooSmall { len: usize, required: usize },

    #[error("segment {0} was never initialized")]
    NotInitialized(String),

    #[error("io error: {0}")]
    Io(#[source] io::Error),
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    /// The tag carried by an `UnknownMessage` error.
    pub fn unknown_tag(&self) -> Option<Tag> {
        match self.kind {
            ErrorKind::UnknownMessage(tag) => Some(tag),
            _ => None,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.kind)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.kind, f)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl Debug for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::new(ErrorKind::Io(value))
    }
}

impl From<nix::Error> for Error {
    fn from(value: nix::Error) -> Self {
        Error::new(ErrorKind::Io(value.into()))
    }
}
