use proc_macro2::{Span, TokenStream};
use quote::quote;
use syn::{parenthesized, parse_macro_input, Attribute, Data, DeriveInput, Error, LitInt, LitStr, Result};

/// Implements `shmbus::Message` for a `#[repr(C)]` type.
///
/// The bus name defaults to the type's identifier and can be overridden with
/// `#[message(name = "...")]`.
#[proc_macro_derive(Message, attributes(message))]
pub fn derive_message(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match message_impl(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.into_compile_error().into(),
    }
}

fn message_impl(input: &DeriveInput) -> Result<TokenStream> {
    let name = &input.ident;

    if !input.generics.params.is_empty() {
        return Err(Error::new(
            name.span(),
            "Message: generic types must implement Message by hand so every instantiation gets its own name",
        ));
    }
    if let Data::Union(_) = input.data {
        return Err(Error::new(name.span(), "Message: unions are not supported"));
    }
    check_repr_c(&input.attrs, &name.span(), "Message")?;

    let bus_name = match message_name(&input.attrs)? {
        Some(lit) => lit,
        None => LitStr::new(&name.to_string(), name.span()),
    };

    Ok(quote! {
        unsafe impl ::shmbus::Message for #name {
            const NAME: &'static str = #bus_name;
        }
    })
}

fn message_name(attrs: &[Attribute]) -> Result<Option<LitStr>> {
    let mut found = None;
    for attr in attrs {
        if !attr.path().is_ident("message") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let lit: LitStr = meta.value()?.parse()?;
                if lit.value().is_empty() {
                    return Err(meta.error("Message: name cannot be empty"));
                }
                found = Some(lit);
                Ok(())
            } else {
                Err(meta.error("Message: unsupported attribute, expected `name = \"...\"`"))
            }
        })?;
    }
    Ok(found)
}

fn check_repr_c(attrs: &[Attribute], span: &Span, trait_name: &str) -> Result<()> {
    let mut has_c = false;
    let err_msg = &format!("{}: type must be repr(C)", trait_name);
    for attr in attrs {
        if attr.path().is_ident("repr") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("C") {
                    has_c = true;
                    Ok(())
                } else if meta.path.is_ident("align") {
                    let content;
                    parenthesized!(content in meta.input);
                    let align: LitInt = content.parse()?;
                    if align.base10_parse::<usize>()? > 16 {
                        return Err(meta.error(format!(
                            "{}: alignment above 16 is not supported by the shared heap",
                            trait_name
                        )));
                    }
                    Ok(())
                } else {
                    Err(meta.error(err_msg))
                }
            })?;
        }
    }
    if has_c {
        Ok(())
    } else {
        Err(Error::new(*span, err_msg))
    }
}
