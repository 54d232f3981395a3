//! Watchdog attributes for tests. A hung test fails with a panic instead of
//! stalling the whole suite.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt, Signature, Visibility};

const DEFAULT_SECS: u64 = 30;

/// Wrap a synchronous test in a watchdog thread. Optional argument is the
/// limit in seconds: `#[test_guard::timeout(5)]`.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_secs(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout expects a synchronous test; use tokio_timeout for async tests",
        )
        .to_compile_error()
        .into();
    }

    let run = quote! { (move || #block)() };
    expand(attrs, vis, sig, secs, run)
}

/// Same watchdog for async tests: strips `async`, drives the body on a
/// current-thread tokio runtime inside the guarded thread.
#[proc_macro_attribute]
pub fn tokio_timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = match parse_secs(attr) {
        Ok(secs) => secs,
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
            "tokio_timeout expects an async test; use timeout for synchronous tests",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let run = quote! {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build tokio runtime")
            .block_on(async move #block)
    };
    expand(attrs, vis, sig, secs, run)
}

fn expand(
    attrs: Vec<Attribute>,
    vis: Visibility,
    sig: Signature,
    secs: u64,
    run: TokenStream2,
) -> TokenStream {
    let kept: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    TokenStream::from(quote! {
        #[test]
        #(#kept)*
        #vis #sig {
            let limit = std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = std::sync::mpsc::sync_channel(1);
            let worker = std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #run;
                }));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(limit) {
                Ok(Ok(())) => {
                    let _ = worker.join();
                }
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s watchdog", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test worker exited without reporting an outcome")
                }
            }
        }
    })
}

fn parse_secs(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs = lit.base10_parse::<u64>()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "watchdog limit must be nonzero"));
    }
    Ok(secs)
}

fn is_test_attribute(attr: &Attribute) -> bool {
    if attr.path().is_ident("test") {
        return true;
    }
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments == ["tokio", "test"]
}
