//! Per-thread stack of open task contexts.
//!
//! Each thread owns an independent LIFO stack; the top entry is the thread's
//! current context. Storage is allocated by the first push and released again
//! when the last entry pops, so a thread with no open context carries no
//! stack at all.

use crate::context::{ContextId, ContextInner, ContextRef};
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const NOT_CURRENT: &str = "Only currently active context may be closed";

static NEXT_ENTRY: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static STACK: RefCell<Option<Vec<StackEntry>>> = const { RefCell::new(None) };
}

/// Identifies one push onto a stack.
///
/// A shared context entered twice on the same thread has two entries with the
/// same [`ContextId`]; the entry id keeps their closes ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryId(u64);

impl EntryId {
    fn next() -> Self {
        Self(NEXT_ENTRY.fetch_add(1, Ordering::Relaxed))
    }
}

struct StackEntry {
    entry: EntryId,
    context: Arc<ContextInner>,
}

/// The calling thread's context stack.
///
/// Contexts are pushed by opening them (see [`TaskScope::create`](crate::TaskScope::create))
/// and popped by closing their handle; this type exposes the read side.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeStack;

impl ScopeStack {
    pub(crate) fn push(context: Arc<ContextInner>) -> EntryId {
        let entry = EntryId::next();
        STACK.with(|slot| {
            slot.borrow_mut()
                .get_or_insert_with(Vec::new)
                .push(StackEntry { entry, context });
        });
        entry
    }

    /// Pops `entry` if it is the top of this thread's stack.
    pub(crate) fn pop(entry: EntryId) -> Result<Arc<ContextInner>> {
        STACK
            .try_with(|slot| {
                let mut slot = slot.borrow_mut();
                let Some(stack) = slot.as_mut() else {
                    return Err(Error::invalid_state(NOT_CURRENT));
                };
                if stack.last().map(|top| top.entry) != Some(entry) {
                    return Err(Error::invalid_state(NOT_CURRENT));
                }
                let popped = stack.pop();
                if stack.is_empty() {
                    *slot = None;
                }
                popped
                    .map(|top| top.context)
                    .ok_or_else(|| Error::invalid_state(NOT_CURRENT))
            })
            .unwrap_or_else(|_| {
                Err(Error::invalid_state(
                    "task scope storage of this thread is already destroyed",
                ))
            })
    }

    /// Returns the current context of this thread.
    pub(crate) fn peek() -> Result<Arc<ContextInner>> {
        STACK
            .with(|slot| {
                slot.borrow()
                    .as_ref()
                    .and_then(|stack| stack.last())
                    .map(|top| Arc::clone(&top.context))
            })
            .ok_or_else(Error::no_active_context)
    }

    /// Returns the number of open entries on this thread.
    #[must_use]
    pub fn depth() -> usize {
        STACK.with(|slot| slot.borrow().as_ref().map_or(0, Vec::len))
    }

    /// Returns true if at least one context is open on this thread.
    #[must_use]
    pub fn is_active() -> bool {
        Self::depth() > 0
    }

    /// Returns true if this thread currently holds stack storage.
    ///
    /// Always equal to [`is_active`](Self::is_active): storage exists exactly
    /// while a context is open.
    #[must_use]
    pub fn is_allocated() -> bool {
        STACK.with(|slot| slot.borrow().is_some())
    }

    /// Returns references to this thread's open contexts, outermost first.
    #[must_use]
    pub fn snapshot() -> Vec<ContextRef> {
        STACK.with(|slot| {
            slot.borrow().as_ref().map_or_else(Vec::new, |stack| {
                stack
                    .iter()
                    .map(|entry| ContextRef::from_inner(Arc::clone(&entry.context)))
                    .collect()
            })
        })
    }

    /// Returns the ids of this thread's open contexts, outermost first.
    #[must_use]
    pub fn context_ids() -> Vec<ContextId> {
        STACK.with(|slot| {
            slot.borrow().as_ref().map_or_else(Vec::new, |stack| {
                stack.iter().map(|entry| entry.context.id()).collect()
            })
        })
    }
}
