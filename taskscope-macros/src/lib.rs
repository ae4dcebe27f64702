//! Proc macros for the taskscope crate.
//!
//! # Available Macros
//!
//! - [`macro@task_scoped`] - Open task contexts from flagged function parameters
//!
//! # Example
//!
//! ```ignore
//! use taskscope::{task_scoped, TaskScope};
//!
//! #[task_scoped]
//! fn handle(#[task_context] tenant: String, payload: Vec<u8>) -> usize {
//!     // `tenant` is the current context object here
//!     payload.len()
//! }
//! ```

mod task_scoped;
mod util;

use proc_macro::TokenStream;

/// Opens a task context for every parameter marked `#[task_context]`.
///
/// Contexts are opened in parameter order before the body runs and closed
/// in reverse order on every exit path, so the last marked parameter is the
/// current context inside the body and the first one is the outermost.
///
/// # Requirements
///
/// - The function must not be `async`: task contexts belong to the thread
///   that opened them.
/// - Marked parameters must bind a plain identifier and have a
///   `Clone + Send + Sync + 'static` type. The context receives a clone.
/// - `self` cannot be marked.
///
/// # Example
///
/// ```ignore
/// #[task_scoped]
/// fn nested(#[task_context] a: &'static str, #[task_context] b: &'static str) -> &'static str {
///     *TaskScope::current_context_object::<&str>().unwrap() // == b
/// }
/// ```
#[proc_macro_attribute]
pub fn task_scoped(attr: TokenStream, item: TokenStream) -> TokenStream {
    task_scoped::task_scoped_impl(attr, item)
}
