//! Error taxonomy and the per-device error sink.

use std::sync::Arc;

/// An error reported through error scopes or the uncaptured-error callback.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Out of memory: {0}")]
    OutOfMemory(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn error_type(&self) -> ErrorType {
        match *self {
            Self::Validation(_) => ErrorType::Validation,
            Self::OutOfMemory(_) => ErrorType::OutOfMemory,
            Self::Internal(_) => ErrorType::Internal,
        }
    }

    pub fn message(&self) -> &str {
        match *self {
            Self::Validation(ref msg) | Self::OutOfMemory(ref msg) | Self::Internal(ref msg) => msg,
        }
    }

    fn matches(&self, filter: ErrorFilter) -> bool {
        matches!(
            (self, filter),
            (Self::Validation(_), ErrorFilter::Validation)
                | (Self::OutOfMemory(_), ErrorFilter::OutOfMemory)
                | (Self::Internal(_), ErrorFilter::Internal)
        )
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ErrorFilter {
    Validation,
    OutOfMemory,
    Internal,
}

/// Kinds accepted by [`crate::Device::inject_error`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ErrorType {
    Validation,
    OutOfMemory,
    Internal,
    Unknown,
    DeviceLost,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum DeviceLostReason {
    Undefined,
    Destroyed,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoggingType {
    Verbose,
    Info,
    Warning,
    Error,
}

impl LoggingType {
    pub(crate) fn level(self) -> log::Level {
        match self {
            Self::Verbose => log::Level::Trace,
            Self::Info => log::Level::Debug,
            Self::Warning => log::Level::Warn,
            Self::Error => log::Level::Error,
        }
    }
}

/// Failure of a synchronous query on a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    #[error("object was already released")]
    Released,
    #[error("object is invalid")]
    Invalid,
    #[error("object was destroyed")]
    Destroyed,
    #[error("device is lost")]
    DeviceLost,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("buffer is not mapped")]
    NotMapped,
    #[error("range is outside of the mapped region")]
    OutOfRange,
    #[error("buffer is mapped for reading")]
    ReadOnly,
    #[error(transparent)]
    Handle(#[from] HandleError),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RequestAdapterError {
    #[error("no adapter matches the request")]
    Unavailable,
    #[error("instance was dropped before the request completed")]
    InstanceDropped,
    #[error("{0}")]
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RequestDeviceError {
    #[error("{0}")]
    Error(String),
    #[error("instance was dropped before the request completed")]
    InstanceDropped,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CreatePipelineError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("device is lost")]
    DeviceLost,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BufferMapError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("a mapping is already pending on this buffer")]
    AlreadyPending,
    #[error("device is lost")]
    DeviceLost,
    #[error("buffer was destroyed before the mapping completed")]
    DestroyedBeforeCallback,
    #[error("buffer was unmapped before the mapping completed")]
    UnmappedBeforeCallback,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueueWorkDoneError {
    #[error("device is lost")]
    DeviceLost,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PopErrorScopeError {
    #[error("no error scope to pop")]
    EmptyStack,
    #[error("device is lost")]
    DeviceLost,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CompilationInfoError {
    #[error("device is lost")]
    DeviceLost,
}

//=============================================================================
// Error Sink
//=============================================================================

pub(crate) type UncapturedHandler = Arc<dyn Fn(&Error) + Send + Sync>;

struct ErrorScope {
    filter: ErrorFilter,
    error: Option<Error>,
}

/// Stack of open error scopes plus the fallback handler.
#[derive(Default)]
pub(crate) struct ErrorSink {
    scopes: Vec<ErrorScope>,
    uncaptured: Option<UncapturedHandler>,
}

/// Where a reported error ended up.
pub(crate) enum Routed {
    Captured,
    Uncaptured(Error, Option<UncapturedHandler>),
}

impl ErrorSink {
    pub fn push_scope(&mut self, filter: ErrorFilter) {
        self.scopes.push(ErrorScope {
            filter,
            error: None,
        });
    }

    /// Pops the innermost scope, returning the first error it captured.
    pub fn pop_scope(&mut self) -> Result<Option<Error>, PopErrorScopeError> {
        self.scopes
            .pop()
            .map(|scope| scope.error)
            .ok_or(PopErrorScopeError::EmptyStack)
    }

    pub fn set_uncaptured_handler(&mut self, handler: Option<UncapturedHandler>) {
        self.uncaptured = handler;
    }

    /// Hands the error to the innermost scope with a matching filter.
    ///
    /// Only the first error of a scope is kept; later ones are swallowed.
    pub fn route(&mut self, error: Error) -> Routed {
        match self
            .scopes
            .iter_mut()
            .rev()
            .find(|scope| error.matches(scope.filter))
        {
            Some(scope) => {
                if scope.error.is_none() {
                    scope.error = Some(error);
                }
                Routed::Captured
            }
            None => Routed::Uncaptured(error, self.uncaptured.clone()),
        }
    }

    pub fn clear(&mut self) {
        self.scopes.clear();
        self.uncaptured = None;
    }

    #[cfg(test)]
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }
}
