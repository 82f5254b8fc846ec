use proc_macro::TokenStream;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Expr, ExprLit, ItemFn, Lit, MetaNameValue, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Copy)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct Settings {
    timeout_secs: u64,
    flavor: Flavor,
}

/// Runs an async test on a dedicated Tokio runtime and fails it if it does not
/// finish within the deadline.
///
/// Accepts either a bare number of seconds (`#[tokio_timeout_test(5)]`) or
/// `secs = N` / `flavor = "multi_thread"` pairs.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let settings = match parse_settings(attr) {
        Ok(settings) => settings,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = settings.timeout_secs;
    let builder = match settings.flavor {
        Flavor::CurrentThread => quote! { tokio::runtime::Builder::new_current_thread() },
        Flavor::MultiThread => quote! {
            {
                let mut builder = tokio::runtime::Builder::new_multi_thread();
                builder.worker_threads(2);
                builder
            }
        },
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder
                        .enable_all()
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration + std::time::Duration::from_secs(1)) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn parse_settings(attr: TokenStream) -> syn::Result<Settings> {
    let mut settings = Settings {
        timeout_secs: DEFAULT_TIMEOUT_SECS,
        flavor: Flavor::CurrentThread,
    };
    if attr.is_empty() {
        return Ok(settings);
    }

    // Bare literal form: #[tokio_timeout_test(10)]
    if let Ok(lit) = syn::parse::<syn::LitInt>(attr.clone()) {
        settings.timeout_secs = positive_secs(&lit)?;
        return Ok(settings);
    }

    let pairs = Punctuated::<MetaNameValue, Token![,]>::parse_terminated.parse(attr)?;
    for pair in pairs {
        let Expr::Lit(ExprLit { lit, .. }) = &pair.value else {
            return Err(syn::Error::new_spanned(&pair.value, "expected a literal"));
        };
        if pair.path.is_ident("secs") {
            let Lit::Int(lit) = lit else {
                return Err(syn::Error::new_spanned(lit, "secs expects an integer"));
            };
            settings.timeout_secs = positive_secs(lit)?;
        } else if pair.path.is_ident("flavor") {
            let Lit::Str(lit) = lit else {
                return Err(syn::Error::new_spanned(lit, "flavor expects a string"));
            };
            settings.flavor = match lit.value().as_str() {
                "current_thread" => Flavor::CurrentThread,
                "multi_thread" => Flavor::MultiThread,
                other => {
                    return Err(syn::Error::new_spanned(
                        lit,
                        format!("unknown runtime flavor `{other}`"),
                    ))
                }
            };
        } else {
            return Err(syn::Error::new_spanned(&pair.path, "unknown setting"));
        }
    }
    Ok(settings)
}

fn positive_secs(lit: &syn::LitInt) -> syn::Result<u64> {
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(
            lit,
            "timeout must be greater than zero",
        ));
    }
    Ok(secs)
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
