//! Opening task contexts around intercepted calls.

use super::metadata::{CallDescriptor, ContextMetadata, ContextParamRegistry};
use crate::context::ScopedObject;
use crate::error::{Error, Result};
use crate::scope::TaskScope;
use crate::tracing_compat::{debug, trace};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

type Chain<'a, R> = Box<dyn FnOnce() -> R + 'a>;

/// Wraps an argument for [`BoundCall::invoke`].
#[must_use]
pub fn argument<T: Any + Send + Sync>(value: T) -> ScopedObject {
    Arc::new(value)
}

/// Opens a task context for every flagged argument of an intercepted call.
///
/// ```
/// use taskscope::intercept::{argument, CallDescriptor, CallInterceptor, ContextParamRegistry};
/// use taskscope::TaskScope;
///
/// let call = CallDescriptor::new("Service", "handle", 2);
/// let mut registry = ContextParamRegistry::new();
/// registry.register(call.clone(), [1])?;
/// let interceptor = CallInterceptor::new(registry);
///
/// let seen = interceptor.invoke(&call, &[argument(1_u32), argument("tenant-a")], |_| {
///     *TaskScope::current_context_object::<&str>().unwrap()
/// })?;
/// assert_eq!(seen, "tenant-a");
/// assert!(!TaskScope::is_active());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct CallInterceptor<M = ContextParamRegistry> {
    metadata: M,
}

impl<M: ContextMetadata> CallInterceptor<M> {
    /// Creates an interceptor reading flags from `metadata`.
    #[must_use]
    pub fn new(metadata: M) -> Self {
        Self { metadata }
    }

    /// Returns the metadata source.
    #[must_use]
    pub fn metadata(&self) -> &M {
        &self.metadata
    }

    /// Resolves the context flags of `call` once, for repeated invocation.
    ///
    /// Fails with [`ErrorKind::MetadataResolution`](crate::ErrorKind::MetadataResolution)
    /// if the metadata source cannot describe the call or returns a flag list
    /// that does not match its arity.
    pub fn bind(&self, call: CallDescriptor) -> Result<BoundCall> {
        let flags = self
            .metadata
            .context_flags(&call)
            .map_err(|source| Error::metadata_resolution(&call, source))?;
        if flags.len() != call.arity() {
            let source = format!(
                "metadata returned {} flags for {} parameters",
                flags.len(),
                call.arity()
            );
            return Err(Error::metadata_resolution(&call, source.into()));
        }
        debug!(
            call = %call,
            flagged = flags.iter().filter(|flag| **flag).count(),
            "bound task scope interception"
        );
        Ok(BoundCall {
            call,
            flags: flags.into(),
        })
    }

    /// Binds `call` and invokes `target` with task contexts opened for its
    /// flagged arguments.
    pub fn invoke<R>(
        &self,
        call: &CallDescriptor,
        args: &[ScopedObject],
        target: impl FnOnce(&[ScopedObject]) -> R,
    ) -> Result<R> {
        self.bind(call.clone())?.invoke(args, target)
    }
}

impl<M> fmt::Debug for CallInterceptor<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallInterceptor").finish_non_exhaustive()
    }
}

/// A call site whose context flags have been resolved.
#[derive(Debug, Clone)]
pub struct BoundCall {
    call: CallDescriptor,
    flags: Arc<[bool]>,
}

impl BoundCall {
    /// Returns the call this binding describes.
    #[must_use]
    pub fn call(&self) -> &CallDescriptor {
        &self.call
    }

    /// Returns the per-parameter context flags.
    #[must_use]
    pub fn flags(&self) -> &[bool] {
        &self.flags
    }

    /// Returns the indices of flagged parameters, in ascending order.
    pub fn flagged_positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.flags
            .iter()
            .enumerate()
            .filter_map(|(index, flagged)| flagged.then_some(index))
    }

    /// Invokes `target` inside one task context per flagged argument.
    ///
    /// The first flagged argument opens the outermost context and the last
    /// flagged argument the innermost, which is the current context while
    /// `target` runs. Every context is closed when `target` returns or
    /// unwinds, innermost first.
    ///
    /// Fails with [`ErrorKind::MetadataResolution`](crate::ErrorKind::MetadataResolution)
    /// without calling `target` if `args` does not match the call's arity.
    pub fn invoke<R>(
        &self,
        args: &[ScopedObject],
        target: impl FnOnce(&[ScopedObject]) -> R,
    ) -> Result<R> {
        if args.len() != self.flags.len() {
            let source = format!(
                "called with {} arguments, expected {}",
                args.len(),
                self.flags.len()
            );
            return Err(Error::metadata_resolution(&self.call, source.into()));
        }
        debug!(call = %self.call, "applying task scope");
        Ok(self.chain(args, target)())
    }

    fn chain<'a, R: 'a>(
        &self,
        args: &'a [ScopedObject],
        target: impl FnOnce(&[ScopedObject]) -> R + 'a,
    ) -> Chain<'a, R> {
        let mut chain: Chain<'a, R> = Box::new(move || target(args));
        for (position, arg) in args.iter().enumerate().rev() {
            if !self.flags[position] {
                continue;
            }
            trace!(call = %self.call, position, "applying task scope to argument");
            let context_object = Arc::clone(arg);
            let inner = chain;
            chain = Box::new(move || {
                let _context = TaskScope::create_erased(context_object);
                inner()
            });
        }
        chain
    }
}
