//! Shared helpers for taskscope proc macros.

use proc_macro2::Span;
use syn::{Attribute, Ident};

/// Name of the parameter marker attribute.
pub const CONTEXT_MARKER: &str = "task_context";

/// Returns true if `attr` is the `#[task_context]` marker.
pub fn is_context_marker(attr: &Attribute) -> bool {
    attr.path().is_ident(CONTEXT_MARKER)
}

/// Generates the guard binding for the context opened at `index`.
pub fn guard_ident(index: usize) -> Ident {
    Ident::new(&format!("__taskscope_context_{index}"), Span::call_site())
}
