//! taskscope: nested, thread-bound task contexts with per-context object caches.
//!
//! # Overview
//!
//! A program opens a task context around an operation. While the context is
//! open it is *current* on the calling thread, and code running inside it can
//! resolve named objects that are built lazily, exactly once per context, and
//! cached until explicitly removed. Contexts nest: opening another context
//! makes it current, and closing it restores the previous one.
//!
//! # Core Guarantees
//!
//! - **Strict nesting**: only the innermost open context of a thread may close
//! - **Identity over equality**: every context has a unique [`ContextId`];
//!   equal payloads never share a cache
//! - **Exactly-once construction**: concurrent first access to a name in one
//!   context runs its factory once
//! - **No footprint**: a thread with no open context holds no stack storage
//! - **Explicit cleanup**: destruction callbacks run on
//!   [`ScopeProvider::remove`], never on close
//!
//! # Module Structure
//!
//! - [`context`]: context handles, ids and shared references
//! - [`stack`]: the per-thread context stack
//! - [`scope`]: [`TaskScope`] and the [`ScopeProvider`] resolution interface
//! - [`intercept`]: opening contexts from flagged call arguments
//! - [`config`]: process-wide reporting configuration
//! - [`error`]: error types
//!
//! # Example
//!
//! ```
//! use taskscope::TaskScope;
//!
//! let scope = TaskScope::new();
//! {
//!     let _request = TaskScope::create(String::from("request-1"));
//!     let conn = scope.get_or_create("connection", || 42_u32)?;
//!     assert_eq!(*conn, 42);
//!     assert_eq!(*TaskScope::current_context_object::<String>()?, "request-1");
//! }
//! assert!(!TaskScope::is_active());
//! # Ok::<(), taskscope::Error>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod config;
pub mod context;
pub mod error;
pub mod intercept;
pub mod scope;
pub mod stack;
pub mod tracing_compat;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{ConfigError, MisorderedDrop, ScopeConfig};
pub use context::{Context, ContextId, ContextRef, DestructionCallback, ScopedObject};
pub use error::{BoxError, Error, ErrorKind, Result};
pub use intercept::{BoundCall, CallDescriptor, CallInterceptor, ContextParamRegistry};
pub use scope::{ObjectFactory, ScopeProvider, TaskScope};
pub use stack::ScopeStack;

#[cfg(feature = "macros")]
pub use taskscope_macros::task_scoped;
