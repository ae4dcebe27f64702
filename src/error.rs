//! Error types for taskscope.
//!
//! Every failure is synchronous and surfaced at the call site. Nothing in
//! this crate retries: operations are local and either succeed or fail
//! deterministically.
//!
//! # Error Kinds
//!
//! - **NoActiveContext**: a scope operation ran with an empty stack
//! - **InvalidState**: a context handle was closed out of LIFO order
//! - **MetadataResolution**: the interceptor could not tell which parameters
//!   open a context
//! - **DestructionCallback**: a destruction callback failed during `remove`
//! - **TypeMismatch**: a typed accessor found a value of another type
//! - **CircularResolution**: a factory asked for the object it is building

use core::fmt;
use std::sync::Arc;

/// Boxed error accepted from user callbacks and metadata sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No task context is open on the calling thread.
    NoActiveContext,
    /// A context was closed while it was not the innermost open context.
    InvalidState,
    /// Context-parameter metadata for a call could not be resolved.
    MetadataResolution,
    /// A destruction callback returned an error.
    DestructionCallback,
    /// A stored value did not have the requested type.
    TypeMismatch,
    /// An object factory re-entered resolution of its own name.
    CircularResolution,
}

impl ErrorKind {
    /// Returns true for errors caused by using the stack outside an open scope.
    #[must_use]
    pub const fn is_scope_violation(&self) -> bool {
        matches!(self, Self::NoActiveContext | Self::InvalidState)
    }
}

/// The main error type for taskscope operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds an already boxed source error to the chain.
    #[must_use]
    pub fn with_boxed_source(mut self, source: BoxError) -> Self {
        self.source = Some(Arc::from(source));
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns true if no context was open.
    #[must_use]
    pub const fn is_no_active_context(&self) -> bool {
        matches!(self.kind, ErrorKind::NoActiveContext)
    }

    /// Returns true if a context was closed out of order.
    #[must_use]
    pub const fn is_invalid_state(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidState)
    }

    /// Creates the error reported when the calling thread has no open context.
    #[must_use]
    pub fn no_active_context() -> Self {
        Self::new(ErrorKind::NoActiveContext).with_message("No task context available")
    }

    /// Creates an invalid state error.
    #[must_use]
    pub fn invalid_state(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState).with_message(detail)
    }

    /// Creates a metadata resolution error for the given call.
    #[must_use]
    pub fn metadata_resolution(call: impl fmt::Display, source: BoxError) -> Self {
        Self::new(ErrorKind::MetadataResolution)
            .with_message(format!("cannot resolve context parameters of {call}"))
            .with_boxed_source(source)
    }

    /// Creates a destruction callback failure for `name`.
    #[must_use]
    pub fn destruction_callback(name: &str, source: BoxError) -> Self {
        Self::new(ErrorKind::DestructionCallback)
            .with_message(format!("destruction callback for '{name}' failed"))
            .with_boxed_source(source)
    }

    /// Creates a type mismatch error.
    #[must_use]
    pub fn type_mismatch(what: impl fmt::Display, expected: &'static str) -> Self {
        Self::new(ErrorKind::TypeMismatch).with_message(format!("{what} is not a {expected}"))
    }

    /// Creates a circular resolution error for `name`.
    #[must_use]
    pub fn circular_resolution(name: &str) -> Self {
        Self::new(ErrorKind::CircularResolution)
            .with_message(format!("object '{name}' is already being created in this context"))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// A specialized Result type for taskscope operations.
pub type Result<T> = core::result::Result<T, Error>;
