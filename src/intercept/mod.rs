//! Call interception: opening task contexts from flagged call arguments.
//!
//! A call site is described by a [`CallDescriptor`]. A [`ContextMetadata`]
//! source says which of its parameters carry a context object, and
//! [`CallInterceptor`] opens one context per flagged argument around the
//! call:
//!
//! ```text
//! call(p0*, p1, p2*)          * = flagged
//!
//! open(p0)                    outermost
//!   open(p2)                  current while the body runs
//!     body(p0, p1, p2)
//!   close(p2)
//! close(p0)
//! ```
//!
//! For functions written in Rust, the `#[task_scoped]` attribute (feature
//! `macros`) produces the same nesting at compile time.

mod interceptor;
mod metadata;

pub use interceptor::{argument, BoundCall, CallInterceptor};
pub use metadata::{
    CallDescriptor, ContextMetadata, ContextParamRegistry, LookupError, RegistrationError,
};
