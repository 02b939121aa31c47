//! Declarative reactive DOM engine. `@name` attribute expressions bind to
//! `<state>`/`<src>` definitions through a dependency-graph scheduler;
//! `<insert>` materializes scalar and keyed-list content from the same
//! reference graph. See the module docs for the layering: `expr`/`list`/
//! `on_parser`/`util`/`registry`/`reactive` are plain Rust and run on any
//! target; `dom`/`scope`/`state_def`/`source_def`/`bindings`/`insert` touch
//! `web_sys` directly and are gated to `wasm32`.

mod bindings;
mod config;
mod dom;
mod error;
mod expr;
mod insert;
mod list;
mod on_parser;
mod reactive;
mod refs;
mod registry;
mod scope;
mod source_def;
mod state_def;
mod util;

pub use config::EngineConfig;

#[cfg(target_arch = "wasm32")]
mod wasm_api {
    use serde::Deserialize;
    use wasm_bindgen::prelude::*;
    use wasm_bindgen::JsCast;
    use web_sys::{Element, Node};

    /// The JSON-able subset of `EngineConfig` `init`'s second argument
    /// carries. `html_sanitizer` isn't here — it's a closure, installed
    /// separately through `setHtmlSanitizer`, not through this blob.
    #[derive(Deserialize, Default)]
    #[serde(rename_all = "camelCase")]
    struct InitOptions {
        fetch_idle_timeout_ms: Option<u32>,
    }

    /// Installs the panic hook and a `tracing` subscriber that forwards to
    /// the browser console. Runs once, automatically, before any exported
    /// function can be called (`wasm_bindgen(start)`).
    #[wasm_bindgen(start)]
    pub fn start() {
        console_error_panic_hook::set_once();
        tracing_wasm::set_as_global_default();
    }

    fn default_root() -> Option<Node> {
        web_sys::window()?
            .document()?
            .document_element()
            .map(|el| el.unchecked_into::<Node>())
    }

    /// Compile a subtree: discover and initialize `<state>`/`<src>`
    /// definitions, then wire every attribute binding and `<insert>`
    /// element underneath. Call with no argument once on page load to
    /// compile the whole document; call again with a freshly inserted
    /// fragment's root to bring content added outside the reactive engine
    /// (e.g. by a plain `innerHTML` write) under its control.
    #[wasm_bindgen]
    pub fn init(root: Option<Element>, options: JsValue) {
        if !options.is_undefined() && !options.is_null() {
            match serde_wasm_bindgen::from_value::<InitOptions>(options) {
                Ok(opts) => {
                    if let Some(ms) = opts.fetch_idle_timeout_ms {
                        crate::config::set_fetch_idle_timeout_ms(ms);
                    }
                }
                Err(err) => tracing::warn!(error = %err, "ignoring malformed init() options"),
            }
        }
        let node: Node = match root {
            Some(el) => el.unchecked_into(),
            None => match default_root() {
                Some(n) => n,
                None => {
                    tracing::error!("init() called with no root and no document element");
                    return;
                }
            },
        };
        crate::dom::compile_subtree(&node);
    }

    /// Force an immediate refresh of the named `<src>`, bypassing its
    /// configured trigger mode. A no-op (logged, not panicking) if no
    /// source with that name is registered globally.
    #[wasm_bindgen]
    pub fn refresh(name: &str) {
        let def = crate::registry::with_engine(|e| e.lookup_global_source(name));
        match def {
            Some(def) => crate::source_def::refresh(def),
            None => tracing::warn!(name, "refresh() called on unknown source"),
        }
    }

    /// Install a host-page HTML sanitizer invoked for every `html` binding
    /// and every `<insert html="...">`/list-item `html` attribute. Identity
    /// (no sanitization) until this is called — the host page is expected
    /// to install one before rendering any untrusted HTML.
    #[wasm_bindgen(js_name = setHtmlSanitizer)]
    pub fn set_html_sanitizer(sanitizer: js_sys::Function) {
        crate::config::set_html_sanitizer(move |raw: &str| {
            sanitizer
                .call1(&JsValue::NULL, &JsValue::from_str(raw))
                .ok()
                .and_then(|v| v.as_string())
                .unwrap_or_else(|| raw.to_string())
        });
    }
}

#[cfg(target_arch = "wasm32")]
pub use wasm_api::{init, refresh, set_html_sanitizer};
