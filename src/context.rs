//! Task contexts and their handles.
//!
//! A context carries a caller-supplied payload, a private object cache and a
//! registry of destruction callbacks. It is identified by a [`ContextId`]
//! drawn from a process-wide counter, so two contexts opened with equal
//! payloads are still distinct and never share cached objects.
//!
//! # Handles
//!
//! - [`Context<T>`]: returned when a context is opened. Owns one entry on the
//!   calling thread's [`ScopeStack`](crate::ScopeStack) and closes it on drop.
//!   It is `!Send` because the entry belongs to that thread.
//! - [`ContextRef`]: a `Send + Sync` reference to a context. It can read the
//!   payload anywhere and [`enter`](ContextRef::enter) the same context on
//!   another thread, which shares the cache with every other entry. Once the
//!   handle returned by opening the context has closed, the context is over
//!   and can no longer be entered.
//!
//! # Destruction callbacks
//!
//! Closing a context does **not** run its destruction callbacks. Callbacks
//! fire only from an explicit [`remove`](crate::ScopeProvider::remove); the
//! container driving the scope is expected to call it during its own teardown.
//! When [`ScopeConfig::report_unfired_callbacks`] is on, the last close of a
//! context that still holds callbacks logs a warning naming them.

use crate::config::{MisorderedDrop, ScopeConfig};
use crate::error::{BoxError, Error, Result};
use crate::stack::{EntryId, ScopeStack};
use crate::tracing_compat::{debug, error, trace, warn};
use parking_lot::Mutex;
use std::any::{type_name, Any};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// A type-erased object stored in, or supplied to, a task context.
pub type ScopedObject = Arc<dyn Any + Send + Sync>;

/// Cleanup procedure registered for a cached name.
pub type DestructionCallback = Box<dyn FnOnce() -> core::result::Result<(), BoxError> + Send>;

type Slot = Arc<OnceLock<ScopedObject>>;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// (context, name) pairs whose factory is running on this thread.
    static RESOLVING: RefCell<Vec<(ContextId, String)>> = const { RefCell::new(Vec::new()) };
}

/// Unique, monotonically increasing identifier of a task context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw counter value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Shared state of one task context.
pub(crate) struct ContextInner {
    id: ContextId,
    object: ScopedObject,
    /// Payload type name; unknown for type-erased payloads.
    object_type: Option<&'static str>,
    objects: Mutex<HashMap<String, Slot>>,
    callbacks: Mutex<HashMap<String, DestructionCallback>>,
    /// Stack entries, on any thread, currently holding this context.
    entries: AtomicUsize,
    /// Set once the opening handle has closed.
    closed: AtomicBool,
}

impl ContextInner {
    fn new(object: ScopedObject, object_type: Option<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            id: ContextId::next(),
            object,
            object_type,
            objects: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            entries: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> ContextId {
        self.id
    }

    pub(crate) fn object(&self) -> &ScopedObject {
        &self.object
    }

    /// Returns the cached object for `name`, building it with `factory` on
    /// first access.
    ///
    /// Construction is exactly-once per name: concurrent callers block on the
    /// slot until the winner's factory returns. The map lock is not held while
    /// the factory runs, so a factory may resolve other names.
    pub(crate) fn get_or_create(
        &self,
        name: &str,
        factory: impl FnOnce() -> ScopedObject,
    ) -> Result<ScopedObject> {
        let slot = self.slot(name);
        if let Some(object) = slot.get() {
            trace!(context_id = %self.id, name, "task scoped object cache hit");
            return Ok(Arc::clone(object));
        }

        let _resolving = ResolvingGuard::enter(self.id, name)?;
        let object = slot.get_or_init(|| {
            trace!(context_id = %self.id, name, "creating task scoped object");
            factory()
        });
        Ok(Arc::clone(object))
    }

    fn slot(&self, name: &str) -> Slot {
        let mut objects = self.objects.lock();
        if let Some(slot) = objects.get(name) {
            return Arc::clone(slot);
        }
        let slot = Slot::default();
        objects.insert(name.to_owned(), Arc::clone(&slot));
        slot
    }

    /// Runs the destruction callback for `name` (if any), then evicts the
    /// cached object.
    ///
    /// The callback is taken out of the registry before it runs. If it fails,
    /// the object stays cached and the error is returned.
    pub(crate) fn remove(&self, name: &str) -> Result<Option<ScopedObject>> {
        let callback = self.callbacks.lock().remove(name);
        if let Some(callback) = callback {
            trace!(context_id = %self.id, name, "running destruction callback");
            callback().map_err(|source| Error::destruction_callback(name, source))?;
        }
        let slot = self.objects.lock().remove(name);
        Ok(slot.and_then(|slot| slot.get().cloned()))
    }

    pub(crate) fn register_callback(&self, name: &str, callback: DestructionCallback) {
        let previous = self.callbacks.lock().insert(name.to_owned(), callback);
        if previous.is_some() {
            trace!(context_id = %self.id, name, "replaced destruction callback");
        }
    }

    fn cached(&self, name: &str) -> Option<ScopedObject> {
        self.objects
            .lock()
            .get(name)
            .and_then(|slot| slot.get().cloned())
    }

    fn cached_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .objects
            .lock()
            .iter()
            .filter(|(_, slot)| slot.get().is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort_unstable();
        names
    }

    fn pending_callbacks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.callbacks.lock().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn attach(&self) {
        self.entries.fetch_add(1, Ordering::AcqRel);
    }

    fn detach(&self) {
        if self.entries.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if !ScopeConfig::current().report_unfired_callbacks() {
            return;
        }
        let pending = self.pending_callbacks();
        if !pending.is_empty() {
            warn!(
                context_id = %self.id,
                callbacks = ?pending,
                "task scope closed with destruction callbacks that never ran; \
                 they only run when the object is removed"
            );
        }
    }
}

impl fmt::Debug for ContextInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextInner")
            .field("id", &self.id)
            .field("object_type", &self.object_type)
            .field("cached", &self.cached_names())
            .field("callbacks", &self.pending_callbacks())
            .finish()
    }
}

/// Marks a (context, name) pair as under construction on this thread.
struct ResolvingGuard;

impl ResolvingGuard {
    fn enter(id: ContextId, name: &str) -> Result<Self> {
        RESOLVING.with(|resolving| {
            let mut resolving = resolving.borrow_mut();
            if resolving.iter().any(|(ctx, n)| *ctx == id && n == name) {
                return Err(Error::circular_resolution(name));
            }
            resolving.push((id, name.to_owned()));
            Ok(Self)
        })
    }
}

impl Drop for ResolvingGuard {
    fn drop(&mut self) {
        let _ = RESOLVING.try_with(|resolving| resolving.borrow_mut().pop());
    }
}

/// Handle to a task context opened on the current thread.
///
/// The context stays current until a context opened after it becomes current,
/// and is closed by [`close`](Self::close) or by dropping the handle. Closing
/// is strictly LIFO: only the innermost open context of the thread may close.
///
/// ```
/// use taskscope::TaskScope;
///
/// let outer = TaskScope::create("outer");
/// {
///     let inner = TaskScope::create("inner");
///     assert_eq!(*TaskScope::current_context_object::<&str>()?, "inner");
///     assert_ne!(outer, inner);
/// }
/// assert_eq!(*TaskScope::current_context_object::<&str>()?, "outer");
/// # drop(outer);
/// # Ok::<(), taskscope::Error>(())
/// ```
pub struct Context<T: ?Sized + Send + Sync + 'static> {
    inner: Arc<ContextInner>,
    object: Arc<T>,
    entry: EntryId,
    /// True for the handle returned by opening the context, false for
    /// [`ContextRef::enter`] handles.
    owner: bool,
    closed: bool,
    _thread_bound: PhantomData<Rc<()>>,
}

impl<T: ?Sized + Send + Sync + 'static> Context<T> {
    /// Creates a context for `object` and pushes it on this thread's stack.
    ///
    /// `object_type` is `None` when the payload arrives type-erased.
    pub(crate) fn open(
        object: Arc<T>,
        erased: ScopedObject,
        object_type: Option<&'static str>,
    ) -> Self {
        let inner = ContextInner::new(erased, object_type);
        debug!(context_id = %inner.id, object_type = ?inner.object_type, "creating task scope");
        Self::push(inner, object, true)
    }

    fn push(inner: Arc<ContextInner>, object: Arc<T>, owner: bool) -> Self {
        inner.attach();
        let entry = ScopeStack::push(Arc::clone(&inner));
        Self {
            inner,
            object,
            entry,
            owner,
            closed: false,
            _thread_bound: PhantomData,
        }
    }

    /// Returns the context object supplied when the context was opened.
    #[must_use]
    pub fn context_object(&self) -> &T {
        &self.object
    }

    /// Returns the unique context ID.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Returns true once this handle has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns a thread-safe reference to this context.
    #[must_use]
    pub fn share(&self) -> ContextRef {
        ContextRef {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Closes this context, making the previously opened one current again.
    ///
    /// Fails with [`ErrorKind::InvalidState`](crate::ErrorKind::InvalidState)
    /// if another context was opened after this one and is still open, or if
    /// this handle is already closed. The stack is left untouched on failure.
    /// Cached objects and destruction callbacks are not touched.
    ///
    /// Closing the handle that opened the context ends the context: from then
    /// on [`ContextRef::enter`] fails, while entries made earlier stay usable
    /// until they close.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::invalid_state(format!(
                "task scope {} is already closed",
                self.inner.id
            )));
        }
        debug!(context_id = %self.inner.id, "attempting to close task scope");
        ScopeStack::pop(self.entry)?;
        self.closed = true;
        if self.owner {
            self.inner.closed.store(true, Ordering::Release);
        }
        self.inner.detach();
        debug!(context_id = %self.inner.id, "task scope closed");
        Ok(())
    }
}

impl<T: ?Sized + Send + Sync + 'static> Drop for Context<T> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.close() {
            match ScopeConfig::current().misordered_drop() {
                MisorderedDrop::Panic if !std::thread::panicking() => {
                    panic!("task scope {} dropped out of order: {err}", self.inner.id);
                }
                _ => {
                    error!(
                        context_id = %self.inner.id,
                        error = %err,
                        "task scope dropped while not the current context; it stays on the stack"
                    );
                }
            }
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> PartialEq for Context<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<T: ?Sized + Send + Sync + 'static> Eq for Context<T> {}

impl<T: ?Sized + Send + Sync + 'static> Hash for Context<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl<T: ?Sized + Send + Sync + 'static> fmt::Debug for Context<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("object_type", &self.inner.object_type)
            .field("owner", &self.owner)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Thread-safe reference to a task context.
///
/// Obtained from [`Context::share`] or [`TaskScope::current`](crate::TaskScope::current).
/// Equality is context identity.
#[derive(Clone)]
pub struct ContextRef {
    inner: Arc<ContextInner>,
}

impl ContextRef {
    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    /// Returns the unique context ID.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Returns the type-erased context object.
    #[must_use]
    pub fn context_object(&self) -> ScopedObject {
        Arc::clone(&self.inner.object)
    }

    /// Returns the context object as `T`.
    pub fn context_object_as<T: Any + Send + Sync>(&self) -> Result<Arc<T>> {
        Arc::clone(&self.inner.object).downcast::<T>().map_err(|_| {
            Error::type_mismatch(
                format!("context object of {}", self.inner.id),
                type_name::<T>(),
            )
        })
    }

    /// Returns the name of the payload type given when the context was opened.
    ///
    /// `None` for contexts opened with a type-erased payload, such as those
    /// opened by the call interceptor.
    #[must_use]
    pub fn object_type(&self) -> Option<&'static str> {
        self.inner.object_type
    }

    /// Returns true once the handle that opened this context has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Returns the cached object for `name` without creating it.
    #[must_use]
    pub fn cached(&self, name: &str) -> Option<ScopedObject> {
        self.inner.cached(name)
    }

    /// Returns the names of all constructed objects, sorted.
    #[must_use]
    pub fn cached_names(&self) -> Vec<String> {
        self.inner.cached_names()
    }

    /// Returns the names with a registered destruction callback, sorted.
    #[must_use]
    pub fn pending_callbacks(&self) -> Vec<String> {
        self.inner.pending_callbacks()
    }

    /// Makes this context current on the calling thread.
    ///
    /// The returned handle is a new stack entry for the same context: objects
    /// resolved through it come from, and land in, the shared cache.
    ///
    /// Fails with [`ErrorKind::InvalidState`](crate::ErrorKind::InvalidState)
    /// once the handle that opened the context has closed.
    pub fn enter(&self) -> Result<Context<dyn Any + Send + Sync>> {
        if self.inner.is_closed() {
            return Err(Error::invalid_state(format!(
                "task scope {} is closed and cannot be entered",
                self.inner.id
            )));
        }
        trace!(context_id = %self.inner.id, "entering shared task scope");
        Ok(Context::push(
            Arc::clone(&self.inner),
            Arc::clone(&self.inner.object),
            false,
        ))
    }
}

impl PartialEq for ContextRef {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ContextRef {}

impl Hash for ContextRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContextRef").field(&self.inner).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::AtomicUsize;

    fn erased<T: Any + Send + Sync>(value: T) -> ScopedObject {
        Arc::new(value)
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let a = ContextId::next();
        let b = ContextId::next();
        assert!(b > a);
        assert_eq!(a.to_string(), format!("ctx-{}", a.as_u64()));
    }

    #[test]
    fn get_or_create_caches_per_name() {
        init_test_logging();
        let inner = ContextInner::new(erased("payload"), Some("&str"));
        let calls = AtomicUsize::new(0);
        let make = || {
            calls.fetch_add(1, Ordering::SeqCst);
            erased(7_u32)
        };

        let first = inner.get_or_create("x", make).unwrap();
        let second = inner.get_or_create("x", make).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        inner.get_or_create("y", make).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(inner.cached_names(), vec!["x".to_owned(), "y".to_owned()]);
    }

    #[test]
    fn self_referential_factory_is_rejected() {
        let inner = ContextInner::new(erased(()), Some("()"));
        let value = inner
            .get_or_create("loop", || {
                let nested = inner.get_or_create("loop", || erased(1_u8));
                assert_eq!(
                    nested.unwrap_err().kind(),
                    crate::ErrorKind::CircularResolution
                );
                erased(2_u8)
            })
            .map(|object| *object.downcast::<u8>().unwrap());
        assert_eq!(value.unwrap(), 2);
    }

    #[test]
    fn factory_may_resolve_other_names() {
        let inner = ContextInner::new(erased(()), Some("()"));
        let outer = inner
            .get_or_create("outer", || {
                let dep = inner.get_or_create("dep", || erased(5_i32)).unwrap();
                erased(*dep.downcast::<i32>().unwrap() * 2)
            })
            .unwrap();
        assert_eq!(*outer.downcast::<i32>().unwrap(), 10);
        assert!(inner.cached("dep").is_some());
    }

    #[test]
    fn remove_runs_callback_then_evicts() {
        let inner = ContextInner::new(erased(()), Some("()"));
        let ran = Arc::new(AtomicUsize::new(0));
        inner.get_or_create("svc", || erased("svc")).unwrap();
        let counter = Arc::clone(&ran);
        inner.register_callback(
            "svc",
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let removed = inner.remove("svc").unwrap();
        assert!(removed.is_some());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(inner.cached("svc").is_none());
        assert!(inner.pending_callbacks().is_empty());

        assert!(inner.remove("svc").unwrap().is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_callback_keeps_object_cached() {
        let inner = ContextInner::new(erased(()), Some("()"));
        inner.get_or_create("svc", || erased(1_u8)).unwrap();
        inner.register_callback("svc", Box::new(|| Err("boom".into())));

        let err = inner.remove("svc").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::DestructionCallback);
        assert!(inner.cached("svc").is_some());
        assert!(inner.pending_callbacks().is_empty());
        assert!(inner.remove("svc").unwrap().is_some());
    }

    #[test]
    fn register_overwrites_previous_callback() {
        let inner = ContextInner::new(erased(()), Some("()"));
        let hits = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let hits = Arc::clone(&hits);
            inner.register_callback(
                "svc",
                Box::new(move || {
                    hits.lock().push(tag);
                    Ok(())
                }),
            );
        }
        inner.remove("svc").unwrap();
        assert_eq!(*hits.lock(), vec!["second"]);
    }

    #[test]
    fn context_ref_downcasts_payload() {
        let context = Context::open(Arc::new(42_u64), erased(42_u64), Some("u64"));
        let shared = context.share();
        assert_eq!(*shared.context_object_as::<u64>().unwrap(), 42);
        let err = shared.context_object_as::<String>().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::TypeMismatch);
        assert_eq!(shared.object_type(), Some("u64"));
        assert_eq!(shared.id(), context.id());
    }

    #[test]
    fn double_close_is_invalid() {
        let mut context = Context::open(Arc::new(1_u8), erased(1_u8), Some("u8"));
        context.close().unwrap();
        assert!(context.is_closed());
        assert!(context.close().unwrap_err().is_invalid_state());
    }

    #[test]
    fn closed_context_cannot_be_entered() {
        init_test_logging();
        let mut context = Context::open(Arc::new("req"), erased("req"), Some("&str"));
        context.inner.get_or_create("x", || erased(1_u8)).unwrap();
        let shared = context.share();
        context.close().unwrap();

        assert!(shared.is_closed());
        let err = shared.enter().unwrap_err();
        assert!(err.is_invalid_state());
        assert!(ScopeStack::peek().unwrap_err().is_no_active_context());
    }

    #[test]
    fn entered_handle_does_not_end_the_context() {
        let context = Context::open(Arc::new(3_u8), erased(3_u8), Some("u8"));
        let shared = context.share();
        {
            let mut entered = shared.enter().unwrap();
            entered.close().unwrap();
        }
        assert!(!shared.is_closed());
        let again = shared.enter().unwrap();
        assert_eq!(again.id(), context.id());
        drop(again);
        drop(context);
        assert!(shared.is_closed());
    }
}
