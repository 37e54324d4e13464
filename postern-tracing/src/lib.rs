//! `#[traced]`: `OnEnter`/`OnExit` trace events around a function, optionally
//! timed and wrapped in a `tracing` span.

use proc_macro2::{Span, TokenStream};
use quote::quote;
use syn::{
    ItemFn, LitStr, Meta, Stmt, Token, parse_macro_input, parse_quote, punctuated::Punctuated,
    spanned::Spanned,
};

/// Resolution of the elapsed time reported on exit
#[derive(Clone, Copy, Default)]
enum Unit {
    #[default]
    Nanos,
    Micros,
    Millis,
    Seconds,
}

impl Unit {
    fn parse(lit: &LitStr) -> syn::Result<Self> {
        Ok(match lit.value().as_str() {
            "ns" | "nanos" | "nanoseconds" => Self::Nanos,
            "us" | "micros" | "microseconds" => Self::Micros,
            "ms" | "millis" | "milliseconds" => Self::Millis,
            "s" | "secs" | "seconds" => Self::Seconds,
            other => {
                return Err(syn::Error::new(
                    lit.span(),
                    format!("unknown precision `{other}`, expected ns, us, ms or s"),
                ));
            }
        })
    }

    /// The `Duration` accessor and the suffix its value is reported with
    fn accessor(self) -> (syn::Ident, &'static str) {
        let (method, suffix) = match self {
            Self::Nanos => ("as_nanos", "ns"),
            Self::Micros => ("as_micros", "us"),
            Self::Millis => ("as_millis", "ms"),
            Self::Seconds => ("as_secs", "s"),
        };

        (syn::Ident::new(method, Span::call_site()), suffix)
    }
}

#[derive(Default)]
struct Options {
    /// Arguments forwarded to `#[tracing::instrument]`
    instrument: Option<TokenStream>,
    timing: Option<Unit>,
}

impl Options {
    fn from_metas(metas: Punctuated<Meta, Token![,]>) -> syn::Result<Self> {
        let mut options = Self::default();

        for meta in metas {
            let span = meta.span();

            if meta.path().is_ident("instrument") {
                if options.instrument.is_some() {
                    return Err(syn::Error::new(span, "`instrument` given more than once"));
                }

                options.instrument = Some(match meta {
                    Meta::Path(_) => TokenStream::new(),
                    Meta::List(list) => list.tokens,
                    Meta::NameValue(_) => {
                        return Err(syn::Error::new(span, "expected `instrument(...)`"));
                    }
                });
            } else if meta.path().is_ident("timing") {
                if options.timing.is_some() {
                    return Err(syn::Error::new(span, "`timing` given more than once"));
                }

                let mut unit = Unit::default();
                match &meta {
                    Meta::Path(_) => {}
                    Meta::List(list) => list.parse_nested_meta(|nested| {
                        if nested.path.is_ident("precision") {
                            unit = Unit::parse(&nested.value()?.parse()?)?;
                            Ok(())
                        } else {
                            Err(nested.error("expected `precision = \"...\"`"))
                        }
                    })?,
                    Meta::NameValue(_) => {
                        return Err(syn::Error::new(span, "expected `timing(precision = \"...\")`"));
                    }
                }
                options.timing = Some(unit);
            } else {
                return Err(syn::Error::new(span, "expected `instrument` or `timing`"));
            }
        }

        Ok(options)
    }
}

fn expand(metas: Punctuated<Meta, Token![,]>, function: &mut ItemFn) -> syn::Result<()> {
    let options = Options::from_metas(metas)?;
    let name = function.sig.ident.to_string();

    function
        .attrs
        .push(parse_quote! { #[allow(clippy::items_after_statements)] });

    if let Some(arguments) = options.instrument {
        function
            .attrs
            .push(parse_quote! { #[tracing::instrument(#arguments)] });
    }

    let exit = match options.timing {
        None => quote! { tracing::trace!("OnExit: {}", self.0) },
        Some(unit) => {
            let (method, suffix) = unit.accessor();
            quote! {
                tracing::trace!("OnExit: {} ({} {} elapsed)", self.0, self.1.elapsed().#method(), #suffix)
            }
        }
    };

    let guard: Vec<Stmt> = parse_quote! {
        struct __Traced(&'static str, std::time::Instant);

        impl std::ops::Drop for __Traced {
            fn drop(&mut self) {
                #exit;
            }
        }

        tracing::trace!("OnEnter: {}", #name);
        let __traced = __Traced(#name, std::time::Instant::now());
    };

    function.block.stmts.splice(0..0, guard);
    Ok(())
}

/// Emits a trace event when the attributed function is entered and another
/// when it returns, including after an early return or `?`.
///
/// `timing(precision = "ms")` adds the elapsed time to the exit event; the
/// precision is one of `ns` (the default), `us`, `ms` or `s`.
/// `instrument(...)` forwards its arguments to `#[tracing::instrument]`.
///
/// ```ignore
/// #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "ms"))]
/// async fn deliver(&self) -> Result<(), DeliveryError> {
///     // ...
/// }
/// ```
#[proc_macro_attribute]
pub fn traced(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let metas = parse_macro_input!(args with Punctuated::<Meta, Token![,]>::parse_terminated);
    let mut function = parse_macro_input!(item as ItemFn);

    match expand(metas, &mut function) {
        Ok(()) => quote! { #function }.into(),
        Err(err) => err.to_compile_error().into(),
    }
}
