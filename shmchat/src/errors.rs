use std::{fmt, io};

#[derive(Debug)]
pub enum ChatError {
    /// The shared segment or the gate could not be created or attached.
    ResourceUnavailable {
        resource: &'static str,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    /// A semaphore operation failed for a reason other than blocking.
    GateOperationFailed(io::Error),
    Layout(String),
    InvalidIdentity(String),
    InvalidConfig(String),
    SignalHook(io::Error),
    ReaderFailed(String),
    Logic(String),
    Io(io::Error),
}

impl ChatError {
    pub(crate) fn unavailable<E>(resource: &'static str, source: E) -> ChatError
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        ChatError::ResourceUnavailable {
            resource,
            source: source.into(),
        }
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::ResourceUnavailable { resource, source } => {
                write!(f, "{} unavailable: {}", resource, source)
            }
            ChatError::GateOperationFailed(e) => write!(f, "Gate operation failed: {}", e),
            ChatError::Layout(s) => write!(f, "Shared segment layout error: {}", s),
            ChatError::InvalidIdentity(s) => write!(f, "Invalid identity: {}", s),
            ChatError::InvalidConfig(s) => write!(f, "Invalid configuration: {}", s),
            ChatError::SignalHook(e) => write!(f, "Signal handling error: {}", e),
            ChatError::ReaderFailed(s) => write!(f, "Reader task failed: {}", s),
            ChatError::Logic(s) => write!(f, "Logic error: {}", s),
            ChatError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for ChatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChatError::ResourceUnavailable { source, .. } => Some(source.as_ref()),
            ChatError::GateOperationFailed(e) => Some(e),
            ChatError::SignalHook(e) => Some(e),
            ChatError::Io(e) => Some(e),
            ChatError::Layout(_)
            | ChatError::InvalidIdentity(_)
            | ChatError::InvalidConfig(_)
            | ChatError::ReaderFailed(_)
            | ChatError::Logic(_) => None,
        }
    }
}

impl From<shared_memory::ShmemError> for ChatError {
    fn from(err: shared_memory::ShmemError) -> Self {
        ChatError::unavailable("shared segment", err)
    }
}

impl From<io::Error> for ChatError {
    fn from(err: io::Error) -> Self {
        ChatError::Io(err)
    }
}
