//! The task scope: opening contexts and resolving context-scoped objects.
//!
//! [`TaskScope`] is both the entry point for opening contexts on the calling
//! thread and the [`ScopeProvider`] implementation a container uses to cache
//! and destroy named objects in the current context.
//!
//! ```
//! use std::sync::Arc;
//! use taskscope::{ScopeProvider, TaskScope};
//!
//! let scope = TaskScope::new();
//! let context = TaskScope::create(String::from("request-7"));
//!
//! let first = scope.get_or_create("service", || vec![1, 2, 3])?;
//! let second = scope.get_or_create("service", || vec![9])?;
//! assert!(Arc::ptr_eq(&first, &second));
//!
//! drop(context);
//! assert!(scope.get_or_create("service", || vec![0]).is_err());
//! # Ok::<(), taskscope::Error>(())
//! ```

use crate::context::{Context, ContextRef, DestructionCallback, ScopedObject};
use crate::error::{Error, Result};
use crate::stack::ScopeStack;
use crate::tracing_compat::trace;
use std::any::{type_name, Any};
use std::sync::Arc;

/// Lazily invoked constructor for a scoped object.
pub type ObjectFactory<'a> = Box<dyn FnOnce() -> ScopedObject + 'a>;

/// Resolution surface a container uses to manage context-scoped objects.
///
/// Every operation works on the calling thread's current context and fails
/// with [`ErrorKind::NoActiveContext`](crate::ErrorKind::NoActiveContext)
/// when none is open.
pub trait ScopeProvider: Send + Sync {
    /// Returns the object cached under `name`, creating it with `factory` on
    /// first access.
    fn get(&self, name: &str, factory: ObjectFactory<'_>) -> Result<ScopedObject>;

    /// Runs the destruction callback registered for `name`, if any, then
    /// removes and returns the cached object.
    ///
    /// A failing callback is reported as
    /// [`ErrorKind::DestructionCallback`](crate::ErrorKind::DestructionCallback)
    /// and leaves the object cached.
    fn remove(&self, name: &str) -> Result<Option<ScopedObject>>;

    /// Registers `callback` to run when `name` is removed, replacing any
    /// previous callback.
    fn register_destruction_callback(&self, name: &str, callback: DestructionCallback)
        -> Result<()>;

    /// Resolves a contextual object by key.
    ///
    /// Only [`TaskScope::CONTEXT_KEY`] is known; other keys resolve to `None`.
    fn resolve_contextual_object(&self, key: &str) -> Result<Option<ScopedObject>>;

    /// Returns the conversation id of the current scope, if the scope groups
    /// requests into conversations.
    fn conversation_id(&self) -> Option<String>;
}

/// Thread-bound task scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskScope;

impl TaskScope {
    /// Name under which containers register this scope.
    pub const NAME: &'static str = "task";

    /// Key resolving to the current context object.
    pub const CONTEXT_KEY: &'static str = "context";

    /// Creates a scope provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Opens a new context with `context_object` on the calling thread.
    ///
    /// The context is current until another context is opened or the returned
    /// handle is closed.
    #[must_use]
    pub fn create<T: Any + Send + Sync>(context_object: T) -> Context<T> {
        Self::create_shared(Arc::new(context_object))
    }

    /// Opens a new context for an already shared context object.
    #[must_use]
    pub fn create_shared<T: Any + Send + Sync>(context_object: Arc<T>) -> Context<T> {
        let erased: ScopedObject = Arc::clone(&context_object) as ScopedObject;
        Context::open(context_object, erased, Some(type_name::<T>()))
    }

    /// Opens a new context for a type-erased context object.
    ///
    /// The payload type is not known here, so
    /// [`ContextRef::object_type`](crate::ContextRef::object_type) reports `None`.
    #[must_use]
    pub fn create_erased(context_object: ScopedObject) -> Context<dyn Any + Send + Sync> {
        Context::open(Arc::clone(&context_object), context_object, None)
    }

    /// Runs `f` inside a fresh context for `context_object`.
    ///
    /// The context is closed when `f` returns or unwinds.
    pub fn scoped<T, R>(context_object: T, f: impl FnOnce(&Context<T>) -> R) -> R
    where
        T: Any + Send + Sync,
    {
        let context = Self::create(context_object);
        f(&context)
    }

    /// Returns the current context of the calling thread.
    pub fn current() -> Result<ContextRef> {
        ScopeStack::peek().map(ContextRef::from_inner)
    }

    /// Returns the current context object as `T`.
    pub fn current_context_object<T: Any + Send + Sync>() -> Result<Arc<T>> {
        Self::current()?.context_object_as::<T>()
    }

    /// Returns true if a context is open on the calling thread.
    #[must_use]
    pub fn is_active() -> bool {
        ScopeStack::is_active()
    }

    /// Typed form of [`ScopeProvider::get`].
    pub fn get_or_create<T, F>(&self, name: &str, factory: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let object = self.get(name, Box::new(|| Arc::new(factory()) as ScopedObject))?;
        object
            .downcast::<T>()
            .map_err(|_| Error::type_mismatch(format!("object '{name}'"), type_name::<T>()))
    }
}

impl ScopeProvider for TaskScope {
    fn get(&self, name: &str, factory: ObjectFactory<'_>) -> Result<ScopedObject> {
        ScopeStack::peek()?.get_or_create(name, factory)
    }

    fn remove(&self, name: &str) -> Result<Option<ScopedObject>> {
        let context = ScopeStack::peek()?;
        trace!(context_id = %context.id(), name, "removing task scoped object");
        context.remove(name)
    }

    fn register_destruction_callback(
        &self,
        name: &str,
        callback: DestructionCallback,
    ) -> Result<()> {
        ScopeStack::peek()?.register_callback(name, callback);
        Ok(())
    }

    fn resolve_contextual_object(&self, key: &str) -> Result<Option<ScopedObject>> {
        let context = ScopeStack::peek()?;
        if key == Self::CONTEXT_KEY {
            return Ok(Some(Arc::clone(context.object())));
        }
        Ok(None)
    }

    fn conversation_id(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use crate::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn operations_require_an_open_context() {
        init_test_logging();
        let scope = TaskScope::new();
        let factory_calls = AtomicUsize::new(0);

        let err = scope
            .get(
                "x",
                Box::new(|| {
                    factory_calls.fetch_add(1, Ordering::SeqCst);
                    Arc::new(()) as ScopedObject
                }),
            )
            .unwrap_err();
        assert!(err.is_no_active_context());
        assert_eq!(factory_calls.load(Ordering::SeqCst), 0);

        assert!(scope.remove("x").unwrap_err().is_no_active_context());
        assert!(scope
            .register_destruction_callback("x", Box::new(|| Ok(())))
            .unwrap_err()
            .is_no_active_context());
        assert!(scope
            .resolve_contextual_object(TaskScope::CONTEXT_KEY)
            .unwrap_err()
            .is_no_active_context());
        assert!(scope
            .resolve_contextual_object("other")
            .unwrap_err()
            .is_no_active_context());
        assert!(TaskScope::current().unwrap_err().is_no_active_context());
    }

    #[test]
    fn contextual_object_only_for_context_key() {
        let scope = TaskScope::new();
        let context = TaskScope::create(String::from("payload"));

        let object = scope
            .resolve_contextual_object(TaskScope::CONTEXT_KEY)
            .unwrap()
            .expect("context object");
        assert_eq!(*object.downcast::<String>().unwrap(), "payload");
        assert!(scope.resolve_contextual_object("request").unwrap().is_none());
        drop(context);
    }

    #[test]
    fn conversation_id_is_absent() {
        let _context = TaskScope::create(());
        assert_eq!(TaskScope::new().conversation_id(), None);
    }

    #[test]
    fn typed_get_reports_type_mismatch() {
        let scope = TaskScope::new();
        let _context = TaskScope::create(());
        scope.get_or_create("n", || 5_i64).unwrap();
        let err = scope.get_or_create("n", String::new).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[test]
    fn scoped_closes_on_return() {
        let id = TaskScope::scoped("job", |context| {
            assert_eq!(*context.context_object(), "job");
            assert_eq!(TaskScope::current().unwrap().id(), context.id());
            context.id()
        });
        assert!(!TaskScope::is_active());
        assert!(id.as_u64() < u64::MAX);
    }

    #[test]
    fn erased_contexts_have_no_type_name() {
        let _typed = TaskScope::create(3_i16);
        assert_eq!(TaskScope::current().unwrap().object_type(), Some("i16"));
        let _erased = TaskScope::create_erased(Arc::new(3_i16));
        let current = TaskScope::current().unwrap();
        assert_eq!(current.object_type(), None);
        assert_eq!(*current.context_object_as::<i16>().unwrap(), 3);
    }

    #[test]
    fn current_context_object_downcasts() {
        let _context = TaskScope::create(17_u16);
        assert_eq!(*TaskScope::current_context_object::<u16>().unwrap(), 17);
        assert_eq!(
            TaskScope::current_context_object::<u32>().unwrap_err().kind(),
            ErrorKind::TypeMismatch
        );
    }
}
