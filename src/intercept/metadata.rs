//! Which parameters of a call open a task context.
//!
//! The interceptor asks a [`ContextMetadata`] source for one flag per
//! parameter. [`ContextParamRegistry`] is the standard source: flags are
//! registered up front for every call site, so lookups never depend on
//! runtime reflection.

use crate::error::BoxError;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

/// Identifies an intercepted call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallDescriptor {
    target: Cow<'static, str>,
    method: Cow<'static, str>,
    arity: usize,
}

impl CallDescriptor {
    /// Describes `method` on `target` taking `arity` parameters.
    #[must_use]
    pub fn new(
        target: impl Into<Cow<'static, str>>,
        method: impl Into<Cow<'static, str>>,
        arity: usize,
    ) -> Self {
        Self {
            target: target.into(),
            method: method.into(),
            arity,
        }
    }

    /// Returns the target (type or module) name.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns the method name.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns the number of parameters.
    #[must_use]
    pub const fn arity(&self) -> usize {
        self.arity
    }
}

impl fmt::Display for CallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}/{}", self.target, self.method, self.arity)
    }
}

/// Source of per-parameter context flags.
pub trait ContextMetadata: Send + Sync {
    /// Returns, for each parameter of `call` in order, whether its argument
    /// opens a task context.
    fn context_flags(&self, call: &CallDescriptor) -> Result<Vec<bool>, BoxError>;
}

impl<F> ContextMetadata for F
where
    F: Fn(&CallDescriptor) -> Result<Vec<bool>, BoxError> + Send + Sync,
{
    fn context_flags(&self, call: &CallDescriptor) -> Result<Vec<bool>, BoxError> {
        self(call)
    }
}

/// Errors raised while registering context parameters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// A flagged position is not a parameter of the call.
    #[error("position {position} is out of range for {call}")]
    PositionOutOfRange {
        /// The call being registered.
        call: CallDescriptor,
        /// The offending position.
        position: usize,
    },
    /// The flag list does not have one entry per parameter.
    #[error("{call} takes {} parameters but {len} flags were given", .call.arity())]
    FlagCountMismatch {
        /// The call being registered.
        call: CallDescriptor,
        /// Number of flags supplied.
        len: usize,
    },
    /// The call was registered before.
    #[error("{0} is already registered")]
    Duplicate(CallDescriptor),
}

/// Errors raised when looking up a call that has no metadata.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// No flags were registered for the call.
    #[error("no context parameters registered for {0}")]
    Unregistered(CallDescriptor),
}

/// Statically registered context parameters.
///
/// ```
/// use taskscope::intercept::{CallDescriptor, ContextMetadata, ContextParamRegistry};
///
/// let call = CallDescriptor::new("Service", "handle", 3);
/// let mut registry = ContextParamRegistry::new();
/// registry.register(call.clone(), [0, 2])?;
///
/// assert_eq!(registry.context_flags(&call).unwrap(), vec![true, false, true]);
/// # Ok::<(), taskscope::intercept::RegistrationError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct ContextParamRegistry {
    calls: HashMap<CallDescriptor, Vec<bool>>,
}

impl ContextParamRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags the parameters at `positions` of `call`.
    ///
    /// Positions may repeat; every other parameter is left unflagged.
    pub fn register(
        &mut self,
        call: CallDescriptor,
        positions: impl IntoIterator<Item = usize>,
    ) -> Result<&mut Self, RegistrationError> {
        let mut flags = vec![false; call.arity()];
        for position in positions {
            match flags.get_mut(position) {
                Some(flag) => *flag = true,
                None => {
                    return Err(RegistrationError::PositionOutOfRange { call, position });
                }
            }
        }
        self.insert(call, flags)
    }

    /// Registers one flag per parameter of `call`.
    pub fn register_flags(
        &mut self,
        call: CallDescriptor,
        flags: Vec<bool>,
    ) -> Result<&mut Self, RegistrationError> {
        if flags.len() != call.arity() {
            let len = flags.len();
            return Err(RegistrationError::FlagCountMismatch { call, len });
        }
        self.insert(call, flags)
    }

    fn insert(
        &mut self,
        call: CallDescriptor,
        flags: Vec<bool>,
    ) -> Result<&mut Self, RegistrationError> {
        if self.calls.contains_key(&call) {
            return Err(RegistrationError::Duplicate(call));
        }
        self.calls.insert(call, flags);
        Ok(self)
    }

    /// Returns true if `call` has registered flags.
    #[must_use]
    pub fn contains(&self, call: &CallDescriptor) -> bool {
        self.calls.contains_key(call)
    }

    /// Returns the number of registered calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

impl ContextMetadata for ContextParamRegistry {
    fn context_flags(&self, call: &CallDescriptor) -> Result<Vec<bool>, BoxError> {
        self.calls
            .get(call)
            .cloned()
            .ok_or_else(|| LookupError::Unregistered(call.clone()).into())
    }
}
