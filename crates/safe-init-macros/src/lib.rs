// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Proc macros for safe-init.
//!
//! Provides the `#[traced]` attribute macro, the function entry/exit hook used
//! by the call tracer.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{ItemFn, LitStr, ReturnType, Type, parse_macro_input};

/// Records the timing of every call to the annotated function in the active
/// tracing session.
///
/// For a plain `fn` the macro inserts a frame guard as the first statement of
/// the body. For an `async fn` the body becomes a future run through
/// `tracer::instrument`, which gives it its own parent scope so concurrently
/// polled calls nest correctly.
/// - The frame opens when the body starts running (first poll for async fns)
/// - The frame closes when the call finishes, which covers normal returns,
///   early returns through `?`, panics unwinding through the function and
///   futures dropped before completion
///
/// Arguments, return values and errors are not touched. Outside an active
/// tracing session the guard is inert.
///
/// # Arguments
///
/// - `name = "..."`: override the recorded function name (defaults to
///   `module_path!()::fn_name`)
///
/// # Example
///
/// ```ignore
/// use safe_init::traced;
///
/// #[traced]
/// async fn load_order(order_id: &str) -> Result<Order, OrderError> {
///     db.fetch_order(order_id).await
/// }
///
/// #[traced(name = "pricing::apply_discounts")]
/// fn apply_discounts(order: &mut Order) {
///     // ...
/// }
/// ```
#[proc_macro_attribute]
pub fn traced(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut name_override: Option<LitStr> = None;
    let attr_parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("name") {
            name_override = Some(meta.value()?.parse()?);
            Ok(())
        } else {
            Err(meta.error("unsupported #[traced] argument, expected `name = \"...\"`"))
        }
    });
    parse_macro_input!(attr with attr_parser);

    let input = parse_macro_input!(item as ItemFn);

    match generate_traced_wrapper(input, name_override) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn generate_traced_wrapper(input: ItemFn, name_override: Option<LitStr>) -> syn::Result<TokenStream2> {
    let fn_name_str = input.sig.ident.to_string();
    let vis = &input.vis;
    let attrs = &input.attrs;
    let sig = &input.sig;
    let stmts = &input.block.stmts;

    if sig.constness.is_some() {
        return Err(syn::Error::new(
            sig.constness.as_ref().map(|c| c.span).unwrap_or_else(proc_macro2::Span::call_site),
            "#[traced] cannot be applied to const functions",
        ));
    }

    let frame_name = match name_override {
        Some(lit) => quote! { #lit },
        None => quote! { ::core::concat!(::core::module_path!(), "::", #fn_name_str) },
    };

    if sig.asyncness.is_some() {
        // pins the block's output type so `?` and `return` resolve as in the original body
        let fake_return = match &sig.output {
            ReturnType::Type(_, ty) if matches!(**ty, Type::ImplTrait(_)) => quote! {},
            ReturnType::Type(_, ty) => quote! {
                #[allow(unreachable_code, clippy::diverging_sub_expression)]
                if false {
                    let __safe_init_return: #ty = loop {};
                    return __safe_init_return;
                }
            },
            ReturnType::Default => quote! {},
        };
        return Ok(quote! {
            #(#attrs)*
            #vis #sig {
                ::safe_init::tracer::instrument(
                    #frame_name,
                    ::core::file!(),
                    ::core::line!(),
                    async move {
                        #fake_return
                        #(#stmts)*
                    },
                )
                .await
            }
        });
    }

    Ok(quote! {
        #(#attrs)*
        #vis #sig {
            let __safe_init_frame = ::safe_init::tracer::enter(
                #frame_name,
                ::core::file!(),
                ::core::line!(),
            );
            #(#stmts)*
        }
    })
}
