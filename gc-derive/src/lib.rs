//! Derive macro for GcTraceable trait.
//!
//! Provides `#[derive(GcTraceable)]` for the `GcTraceable` trait of
//! `openworkers-jsg`. Every wrapped resource implements that trait, so this is
//! the usual way to declare which fields count as external memory.
//!
//! # Usage
//!
//! ```ignore
//! use openworkers_jsg::{GcTraceable, Resource};
//!
//! #[derive(GcTraceable)]
//! struct TextDecoder {
//!     #[gc(track)]
//!     pending: Vec<u8>,
//!     #[gc(track)]
//!     encoding: String,
//!     // Fields without #[gc(track)] are not counted
//!     fatal: bool,
//! }
//! ```
//!
//! # Inside the crate
//!
//! When using inside `openworkers-jsg` itself, use `#[gc(crate_path = "crate")]`:
//!
//! ```ignore
//! #[derive(GcTraceable)]
//! #[gc(crate_path = "crate")]
//! struct InternalBuffer {
//!     #[gc(track)]
//!     data: Vec<u8>,
//! }
//! ```

use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, parse_macro_input};

/// Derive macro for implementing `GcTraceable`.
///
/// Use `#[gc(track)]` on fields that should be included in memory tracking.
/// Fields without this attribute are ignored.
///
/// # Attributes
///
/// - `#[gc(track)]` - Mark a field to be tracked
/// - `#[gc(crate_path = "path")]` - Override the crate path (default: `openworkers_jsg`)
///
/// # Example
///
/// ```ignore
/// #[derive(GcTraceable)]
/// struct Blob {
///     #[gc(track)]
///     parts: Vec<Bytes>,     // tracked
///     #[gc(track)]
///     mime_type: String,     // tracked
///     size: u64,             // NOT tracked
/// }
/// ```
#[proc_macro_derive(GcTraceable, attributes(gc))]
pub fn derive_gc_traceable(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let generics = &input.generics;
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    // Check for #[gc(crate_path = "...")] on the struct
    let crate_path = get_crate_path(&input);

    let body = match &input.data {
        Data::Struct(data) => generate_struct_body(&data.fields, &crate_path),
        Data::Enum(data) => generate_enum_body(data, &crate_path),
        Data::Union(_) => {
            return syn::Error::new_spanned(&input, "GcTraceable cannot be derived for unions")
                .to_compile_error()
                .into();
        }
    };

    let expanded = quote! {
        impl #impl_generics #crate_path::gc::GcTraceable for #name #ty_generics #where_clause {
            fn external_memory_size(&self) -> usize {
                #body
            }
        }
    };

    TokenStream::from(expanded)
}

fn get_crate_path(input: &DeriveInput) -> proc_macro2::TokenStream {
    for attr in &input.attrs {
        if !attr.path().is_ident("gc") {
            continue;
        }

        let mut crate_path = None;

        let _ = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate_path") {
                let value: syn::LitStr = meta.value()?.parse()?;
                let path: syn::Path = value.parse()?;
                crate_path = Some(quote! { #path });
            }
            Ok(())
        });

        if let Some(path) = crate_path {
            return path;
        }
    }

    quote! { openworkers_jsg }
}

fn size_of_field(
    crate_path: &proc_macro2::TokenStream,
    access: proc_macro2::TokenStream,
) -> proc_macro2::TokenStream {
    quote! { #crate_path::gc::GcTraceable::external_memory_size(#access) }
}

fn sum(terms: Vec<proc_macro2::TokenStream>) -> proc_macro2::TokenStream {
    if terms.is_empty() {
        quote! { 0 }
    } else {
        quote! { 0 #(+ #terms)* }
    }
}

fn generate_struct_body(
    fields: &Fields,
    crate_path: &proc_macro2::TokenStream,
) -> proc_macro2::TokenStream {
    let tracked: Vec<_> = match fields {
        Fields::Named(named) => named
            .named
            .iter()
            .filter(|f| has_gc_track_attr(f))
            .map(|f| {
                let name = &f.ident;
                size_of_field(crate_path, quote! { &self.#name })
            })
            .collect(),
        Fields::Unnamed(unnamed) => unnamed
            .unnamed
            .iter()
            .enumerate()
            .filter(|(_, f)| has_gc_track_attr(f))
            .map(|(i, _)| {
                let index = syn::Index::from(i);
                size_of_field(crate_path, quote! { &self.#index })
            })
            .collect(),
        Fields::Unit => vec![],
    };

    sum(tracked)
}

/// One match arm per variant, binding only the tracked fields.
fn generate_enum_body(
    data: &syn::DataEnum,
    crate_path: &proc_macro2::TokenStream,
) -> proc_macro2::TokenStream {
    let arms = data.variants.iter().map(|variant| {
        let ident = &variant.ident;

        match &variant.fields {
            Fields::Named(named) => {
                let bound: Vec<_> = named
                    .named
                    .iter()
                    .filter(|f| has_gc_track_attr(f))
                    .map(|f| f.ident.clone())
                    .collect();
                let terms = bound
                    .iter()
                    .map(|name| size_of_field(crate_path, quote! { #name }))
                    .collect();
                let body = sum(terms);
                quote! { Self::#ident { #(#bound,)* .. } => #body }
            }
            Fields::Unnamed(unnamed) => {
                let mut patterns = Vec::new();
                let mut terms = Vec::new();

                for (i, field) in unnamed.unnamed.iter().enumerate() {
                    if has_gc_track_attr(field) {
                        let binding = quote::format_ident!("__field{}", i);
                        terms.push(size_of_field(crate_path, quote! { #binding }));
                        patterns.push(quote! { #binding });
                    } else {
                        patterns.push(quote! { _ });
                    }
                }

                let body = sum(terms);
                quote! { Self::#ident( #(#patterns),* ) => #body }
            }
            Fields::Unit => quote! { Self::#ident => 0 },
        }
    });

    quote! {
        match self {
            #(#arms,)*
        }
    }
}

fn has_gc_track_attr(field: &syn::Field) -> bool {
    field.attrs.iter().any(|attr| {
        if !attr.path().is_ident("gc") {
            return false;
        }

        // Parse #[gc(track)]
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("track") {
                Ok(())
            } else {
                Err(meta.error("expected `track`"))
            }
        })
        .is_ok()
    })
}
