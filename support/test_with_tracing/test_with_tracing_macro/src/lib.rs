// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Attribute macro behind `test_with_tracing::test`.

use proc_macro2::TokenStream;
use quote::quote;
use syn::spanned::Spanned;
use syn::Error;
use syn::ItemFn;

/// Marks a test whose `tracing` output should be captured.
///
/// Behaves like `#[test]`, but installs the subscriber before the body runs.
/// Any other attributes (`#[should_panic]`, `#[ignore]`) are kept.
#[proc_macro_attribute]
pub fn test(
    attr: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    expand(attr.into(), item.into())
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

fn expand(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    if !attr.is_empty() {
        return Err(Error::new(attr.span(), "no arguments expected"));
    }
    let item: ItemFn = syn::parse2(item)?;
    let sig = &item.sig;
    if let Some(asyncness) = sig.asyncness {
        return Err(Error::new(asyncness.span(), "async tests are not supported"));
    }
    if !sig.inputs.is_empty() {
        return Err(Error::new(sig.inputs.span(), "tests take no arguments"));
    }

    let name = &sig.ident;
    let output = &sig.output;
    let attrs = &item.attrs;

    // The outer function carries the attributes; the nested one is the
    // unchanged body.
    let mut inner = item.clone();
    inner.attrs.clear();

    Ok(quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        fn #name() #output {
            #inner
            ::test_with_tracing::init();
            #name()
        }
    })
}
