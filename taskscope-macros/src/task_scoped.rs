//! Implementation of the `#[task_scoped]` attribute.
//!
//! # Expansion
//!
//! ```ignore
//! #[task_scoped]
//! fn handle(#[task_context] a: A, b: B, #[task_context] c: C) -> R { body }
//!
//! // becomes
//!
//! fn handle(a: A, b: B, c: C) -> R {
//!     let __taskscope_context_0 = ::taskscope::TaskScope::create(Clone::clone(&a));
//!     let __taskscope_context_1 = ::taskscope::TaskScope::create(Clone::clone(&c));
//!     { body }
//! }
//! ```
//!
//! Locals drop in reverse declaration order, so `c`'s context closes before
//! `a`'s on return, early return and unwind alike.

use crate::util::{guard_ident, is_context_marker};
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, spanned::Spanned, Error, FnArg, Ident, ItemFn, Pat, Signature};

pub fn task_scoped_impl(attr: TokenStream, item: TokenStream) -> TokenStream {
    let function = parse_macro_input!(item as ItemFn);
    match expand(attr.into(), function) {
        Ok(expanded) => expanded.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(attr: TokenStream2, mut function: ItemFn) -> syn::Result<TokenStream2> {
    if !attr.is_empty() {
        return Err(Error::new(attr.span(), "#[task_scoped] takes no arguments"));
    }
    if let Some(asyncness) = &function.sig.asyncness {
        return Err(Error::new(
            asyncness.span(),
            "#[task_scoped] cannot be used on async functions: task contexts belong to the thread that opened them",
        ));
    }

    let params = take_context_params(&mut function.sig)?;
    let guards = params.iter().enumerate().map(|(index, param)| {
        let guard = guard_ident(index);
        quote! {
            let #guard = ::taskscope::TaskScope::create(::core::clone::Clone::clone(&#param));
        }
    });

    let body = &function.block;
    let scoped_body: syn::Block = syn::parse2(quote! {
        {
            #(#guards)*
            #body
        }
    })?;
    function.block = Box::new(scoped_body);

    Ok(quote! { #function })
}

/// Strips `#[task_context]` markers and returns the marked parameters in
/// declaration order.
fn take_context_params(sig: &mut Signature) -> syn::Result<Vec<Ident>> {
    let mut params = Vec::new();
    for input in &mut sig.inputs {
        match input {
            FnArg::Receiver(receiver) => {
                if let Some(marker) = receiver.attrs.iter().find(|attr| is_context_marker(attr)) {
                    return Err(Error::new(marker.span(), "#[task_context] cannot mark `self`"));
                }
            }
            FnArg::Typed(pat_type) => {
                let before = pat_type.attrs.len();
                pat_type.attrs.retain(|attr| !is_context_marker(attr));
                if pat_type.attrs.len() == before {
                    continue;
                }
                match &*pat_type.pat {
                    Pat::Ident(pat_ident) if pat_ident.subpat.is_none() => {
                        params.push(pat_ident.ident.clone());
                    }
                    other => {
                        return Err(Error::new(
                            other.span(),
                            "#[task_context] parameters must bind a plain identifier",
                        ));
                    }
                }
            }
        }
    }
    Ok(params)
}
