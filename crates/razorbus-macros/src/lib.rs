//! Procedural macros for the razorbus message bus.
//!
//! # Operation Derive Macro
//!
//! Implements `razorbus::Operation` for an enum whose variants are the
//! operations a data type accepts. Positional fields are the operation's
//! arguments, so every operation has a fixed arity.
//!
//! ## Usage
//!
//! ```ignore
//! #[derive(Operation)]
//! enum RepoOperation {
//!     MakeTheRepoAccessible(String),   // "make_the_repo_accessible", arity 1
//!     #[operation(rename = "unpack")]  // override the wire name
//!     UnpackImage(String, u32),
//!     Refresh,                         // arity 0
//! }
//! ```

use std::collections::HashSet;

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{
    Attribute, Data, DeriveInput, Fields, LitStr, Variant, parse_macro_input, spanned::Spanned,
};

/// Derives `Operation` for an enum.
///
/// Variant names are converted to snake_case. Use
/// `#[operation(rename = "name")]` on a variant to choose another name.
#[proc_macro_derive(Operation, attributes(operation))]
pub fn derive_operation(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match derive_operation_impl(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

struct OperationVariant<'a> {
    variant: &'a Variant,
    name: String,
    arity: usize,
}

fn derive_operation_impl(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let enum_name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let data = match &input.data {
        Data::Enum(data) => data,
        _ => {
            return Err(syn::Error::new(
                input.span(),
                "Operation can only be derived for enums",
            ));
        }
    };

    if data.variants.is_empty() {
        return Err(syn::Error::new(
            input.span(),
            "Operation enums need at least one variant",
        ));
    }

    let mut seen = HashSet::new();
    let mut operations = Vec::new();
    for variant in &data.variants {
        let arity = match &variant.fields {
            Fields::Unit => 0,
            Fields::Unnamed(fields) => fields.unnamed.len(),
            Fields::Named(_) => {
                return Err(syn::Error::new(
                    variant.span(),
                    format!(
                        "Variant `{}` uses named fields. Operation arguments are positional; \
                         use a tuple variant instead.",
                        variant.ident
                    ),
                ));
            }
        };

        let name = match get_rename_attr(&variant.attrs)? {
            Some(name) => name,
            None => to_snake_case(&variant.ident.to_string()),
        };

        if !seen.insert(name.clone()) {
            return Err(syn::Error::new(
                variant.span(),
                format!("Operation name `{name}` is used by more than one variant"),
            ));
        }

        operations.push(OperationVariant {
            variant,
            name,
            arity,
        });
    }

    let signatures = operations.iter().map(|op| {
        let name = &op.name;
        let arity = op.arity;
        quote! { ::razorbus::Signature::new(#name, #arity) }
    });

    let name_arms = operations.iter().map(|op| {
        let ident = &op.variant.ident;
        let name = &op.name;
        match &op.variant.fields {
            Fields::Unit => quote! { Self::#ident => #name, },
            _ => quote! { Self::#ident(..) => #name, },
        }
    });

    let encode_arms = operations.iter().map(|op| {
        let ident = &op.variant.ident;
        let name = &op.name;
        if op.arity == 0 {
            let pattern = match &op.variant.fields {
                Fields::Unit => quote! { Self::#ident },
                _ => quote! { Self::#ident() },
            };
            return quote! {
                #pattern => ::core::result::Result::Ok(::std::vec::Vec::new()),
            };
        }

        let bindings: Vec<_> = (0..op.arity).map(|i| format_ident!("__arg{}", i)).collect();
        let indices = 0..op.arity;
        quote! {
            Self::#ident(#(#bindings),*) => ::core::result::Result::Ok(::std::vec![
                #(::razorbus::__private::encode_argument(#name, #indices, #bindings)?),*
            ]),
        }
    });

    let decode_arms = operations.iter().map(|op| {
        let ident = &op.variant.ident;
        let name = &op.name;
        let arity = op.arity;
        match &op.variant.fields {
            Fields::Unit => quote! {
                #name => {
                    ::razorbus::__private::ArgumentReader::new(#name, arguments, #arity)?;
                    ::core::result::Result::Ok(Self::#ident)
                }
            },
            _ => {
                let reads = (0..arity).map(|_| quote! { __reader.next()? });
                quote! {
                    #name => {
                        #[allow(unused_mut)]
                        let mut __reader =
                            ::razorbus::__private::ArgumentReader::new(#name, arguments, #arity)?;
                        ::core::result::Result::Ok(Self::#ident(#(#reads),*))
                    }
                }
            }
        }
    });

    Ok(quote! {
        impl #impl_generics ::razorbus::Operation for #enum_name #ty_generics #where_clause {
            const SIGNATURES: &'static [::razorbus::Signature] = &[
                #(#signatures),*
            ];

            fn name(&self) -> &'static str {
                match self {
                    #(#name_arms)*
                }
            }

            fn to_arguments(
                &self,
            ) -> ::core::result::Result<
                ::std::vec::Vec<::razorbus::__private::Value>,
                ::razorbus::OperationError,
            > {
                match self {
                    #(#encode_arms)*
                }
            }

            fn from_arguments(
                name: &str,
                arguments: ::std::vec::Vec<::razorbus::__private::Value>,
            ) -> ::core::result::Result<Self, ::razorbus::OperationError> {
                match name {
                    #(#decode_arms)*
                    other => ::core::result::Result::Err(
                        ::razorbus::OperationError::Unknown(::std::string::ToString::to_string(other)),
                    ),
                }
            }
        }
    })
}

/// Extract the name from `#[operation(rename = "name")]`.
fn get_rename_attr(attrs: &[Attribute]) -> syn::Result<Option<String>> {
    let mut rename = None;
    for attr in attrs {
        if !attr.path().is_ident("operation") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename") {
                let value: LitStr = meta.value()?.parse()?;
                if value.value().is_empty() {
                    return Err(meta.error("operation name cannot be empty"));
                }
                rename = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unsupported operation attribute; expected `rename = \"...\"`"))
            }
        })?;
    }
    Ok(rename)
}

/// `MakeTheRepoAccessible` -> `make_the_repo_accessible`, `HTTPBoot` -> `http_boot`.
fn to_snake_case(ident: &str) -> String {
    let chars: Vec<char> = ident.chars().collect();
    let mut out = String::with_capacity(ident.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                None | Some('_') => false,
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) => p.is_uppercase() && next.is_some_and(char::is_lowercase),
            };
            if boundary {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
