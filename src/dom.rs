//! The only module that touches `web_sys` directly. Everything above this
//! layer (registry, reactive, expr, list, on_parser, util) is plain Rust
//! and runs on the host test target; this module exists purely for
//! `wasm32` and is exercised by `wasm-bindgen-test` integration tests
//! under `tests/`.
//!
//! Internal markers: each element the engine visits gets a small integer
//! "engine id" stashed as a non-attribute JS property via
//! `js_sys::Reflect::set` (never a DOM attribute, so it never leaks into
//! `outerHTML` and survives attribute-binding churn). That id indexes into
//! thread-local side tables for the scope map (name -> definition declared
//! directly on this element) and the "processed" flag that suppresses
//! re-binding an already-compiled element.

#![cfg(target_arch = "wasm32")]

use std::cell::RefCell;
use std::collections::HashMap;

use js_sys::Reflect;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{CustomEvent, CustomEventInit, Element, Node};

use crate::registry::DefId;

const ENGINE_ID_PROP: &str = "__jtx_id";
const PROCESSED_PROP: &str = "__jtx_processed";
/// The list engine's per-rendered-node key marker. Unlike the engine id,
/// this one *is* a real attribute: callers (author CSS, devtools) may
/// reasonably want to see which key a rendered item carries.
pub const ITEM_KEY_ATTR: &str = "data-jtx-key";

thread_local! {
    static NEXT_ELEM_ID: RefCell<u32> = RefCell::new(1);
    static SCOPE_MAP: RefCell<HashMap<u32, HashMap<String, DefId>>> = RefCell::new(HashMap::new());
    static DEF_ELEMENTS: RefCell<HashMap<DefId, Element>> = RefCell::new(HashMap::new());
    static ELEMENT_DEF: RefCell<HashMap<u32, DefId>> = RefCell::new(HashMap::new());
    static CLEANUPS: RefCell<HashMap<u32, Vec<Box<dyn FnOnce()>>>> = RefCell::new(HashMap::new());
}

/// Look up (or assign) the stashed engine id for `el`.
pub fn engine_id(el: &Element) -> u32 {
    let existing = Reflect::get(el, &JsValue::from_str(ENGINE_ID_PROP))
        .ok()
        .and_then(|v| v.as_f64());
    if let Some(id) = existing {
        return id as u32;
    }
    let id = NEXT_ELEM_ID.with(|c| {
        let mut c = c.borrow_mut();
        let id = *c;
        *c += 1;
        id
    });
    let _ = Reflect::set(el, &JsValue::from_str(ENGINE_ID_PROP), &JsValue::from_f64(id as f64));
    id
}

pub fn mark_processed(el: &Element) {
    let _ = Reflect::set(el, &JsValue::from_str(PROCESSED_PROP), &JsValue::TRUE);
}

pub fn is_processed(el: &Element) -> bool {
    Reflect::get(el, &JsValue::from_str(PROCESSED_PROP))
        .map(|v| v.is_truthy())
        .unwrap_or(false)
}

/// Record that `name` resolves to `def` for descendants of `el` (the
/// defining element of a `<state>`/`<src>`), and remember which element
/// owns `def` for the global-fallback containment check.
pub fn register_scope(el: &Element, name: &str, def: DefId) {
    let id = engine_id(el);
    SCOPE_MAP.with(|m| {
        m.borrow_mut().entry(id).or_default().insert(name.to_string(), def);
    });
    DEF_ELEMENTS.with(|m| {
        m.borrow_mut().insert(def, el.clone());
    });
    ELEMENT_DEF.with(|m| {
        m.borrow_mut().insert(id, def);
    });
}

pub fn unregister_def_element(def: DefId) {
    DEF_ELEMENTS.with(|m| {
        m.borrow_mut().remove(&def);
    });
}

/// The element that owns `def`, if it's still registered.
pub fn element_for(def: DefId) -> Option<Element> {
    DEF_ELEMENTS.with(|m| m.borrow().get(&def).cloned())
}

/// The definition (`<state>`/`<src>`) declared directly on `el` itself, if any.
pub fn def_for_element(el: &Element) -> Option<DefId> {
    let id = engine_id(el);
    ELEMENT_DEF.with(|m| m.borrow().get(&id).copied())
}

/// Walk strictly-ancestor elements of `el` (not `el` itself) looking for the
/// nearest one that defines a `<src>`, for the scalar `<insert>`'s rule
/// about toggling "the enclosing source's status slots when embedded inside
/// one" (spec.md §4.H).
pub fn nearest_source_element(el: &Element) -> Option<(Element, DefId)> {
    let mut cur = parent_or_host(el);
    while let Some(node) = cur {
        if let Some(def @ DefId::Source(_)) = def_for_element(&node) {
            return Some((node, def));
        }
        cur = parent_or_host(&node);
    }
    None
}

/// Reveal or hide one of a source/list's status-slot children
/// (`<loading>`/`<error>`/`<empty>`). The sole mutator of slot visibility,
/// so a status machine and the scalar `<insert>` rule can never disagree.
pub fn set_status_slot(el: &Element, tag: &str, visible: bool) {
    if let Ok(Some(slot)) = el.query_selector(tag) {
        if visible {
            let _ = slot.remove_attribute("hidden");
        } else {
            let _ = slot.set_attribute("hidden", "");
        }
    }
}

/// Escape out of a shadow root to its host, so the ancestor walk crosses
/// shadow boundaries the way the scope resolver design calls for.
fn parent_or_host(el: &Element) -> Option<Element> {
    if let Some(parent) = el.parent_element() {
        return Some(parent);
    }
    let root = el.get_root_node();
    if let Ok(shadow_root) = root.dyn_into::<web_sys::ShadowRoot>() {
        return shadow_root.host().dyn_into::<Element>().ok();
    }
    None
}

/// Walk ancestors of `el` looking for a scope map entry named `name`.
pub fn resolve_scoped(el: &Element, name: &str) -> Option<DefId> {
    let mut cur = Some(el.clone());
    while let Some(node) = cur {
        let id = engine_id(&node);
        let found = SCOPE_MAP.with(|m| m.borrow().get(&id).and_then(|map| map.get(name).copied()));
        if found.is_some() {
            return found;
        }
        cur = parent_or_host(&node);
    }
    None
}

/// Containment gate for a global-registry hit: `el` must be a descendant
/// of (or equal to) the definition's own element.
pub fn is_contained_in_def_element(el: &Element, def: DefId) -> bool {
    DEF_ELEMENTS.with(|m| {
        m.borrow()
            .get(&def)
            .map(|owner| owner.contains(Some(el)))
            .unwrap_or(false)
    })
}

/// Register a cleanup thunk (clear an interval, close a connection,
/// disconnect an observer, delete a registry entry) to run when `el`'s
/// subtree is removed, per the mutation-observer-driven destructor.
pub fn on_removed(el: &Element, cleanup: impl FnOnce() + 'static) {
    let id = engine_id(el);
    CLEANUPS.with(|c| c.borrow_mut().entry(id).or_default().push(Box::new(cleanup)));
}

fn run_cleanups_for(id: u32) {
    let thunks = CLEANUPS.with(|c| c.borrow_mut().remove(&id));
    if let Some(thunks) = thunks {
        for t in thunks {
            t();
        }
    }
    SCOPE_MAP.with(|m| {
        m.borrow_mut().remove(&id);
    });
}

/// Install a subtree-wide `MutationObserver` that fires cleanup callbacks
/// for every element removed anywhere under `root`. One observer per
/// `init(root)` call; it is never disconnected (it must outlive the
/// subtree it watches).
pub fn install_cleanup_observer(root: &Node) {
    let closure = Closure::<dyn FnMut(js_sys::Array)>::new(move |records: js_sys::Array| {
        for record in records.iter() {
            let Ok(record) = record.dyn_into::<web_sys::MutationRecord>() else { continue };
            let removed = record.removed_nodes();
            for i in 0..removed.length() {
                if let Some(node) = removed.item(i) {
                    walk_removed_subtree(&node);
                }
            }
        }
    });
    let observer = web_sys::MutationObserver::new(closure.as_ref().unchecked_ref())
        .expect("MutationObserver construction should not fail");
    closure.forget();
    let mut init = web_sys::MutationObserverInit::new();
    init.child_list(true);
    init.subtree(true);
    let _ = observer.observe_with_options(root, &init);
}

fn walk_removed_subtree(node: &Node) {
    if let Some(el) = node.dyn_ref::<Element>() {
        let id = engine_id(el);
        run_cleanups_for(id);
    }
    let children = node.child_nodes();
    for i in 0..children.length() {
        if let Some(child) = children.item(i) {
            walk_removed_subtree(&child);
        }
    }
}

/// Dispatch a bubbling `CustomEvent` named `name` on `el` carrying `detail`
/// (serialized via `serde-wasm-bindgen`) — the mechanism behind every event
/// in the external-interfaces event table.
pub fn dispatch_event(el: &Element, name: &str, detail: &serde_json::Value) {
    let js_detail = serde_wasm_bindgen::to_value(detail).unwrap_or(JsValue::NULL);
    let mut init = CustomEventInit::new();
    init.detail(&js_detail);
    init.bubbles(true);
    match CustomEvent::new_with_event_init_dict(name, &init) {
        Ok(ev) => {
            let _ = el.dispatch_event(&ev);
        }
        Err(err) => {
            tracing::warn!(?err, event = name, "failed to construct CustomEvent");
        }
    }
}

/// Queue `f` to run on the microtask checkpoint. `spawn_local` on an
/// already-ready future resolves on the next microtask, which is the
/// batching unit the scheduler relies on.
pub fn queue_microtask(f: impl FnOnce() + 'static) {
    wasm_bindgen_futures::spawn_local(async move {
        f();
    });
}

pub fn local_storage() -> Option<web_sys::Storage> {
    web_sys::window()?.local_storage().ok().flatten()
}

pub fn storage_get(key: &str) -> Option<String> {
    local_storage()?.get_item(key).ok().flatten()
}

pub fn storage_set(key: &str, value: &str) {
    if let Some(store) = local_storage() {
        let _ = store.set_item(key, value);
    }
}

/// Rewrite the page's query string to include/omit `key` without
/// navigating, via `history.replaceState`.
pub fn url_set_param(key: &str, value: Option<&str>) {
    let Some(window) = web_sys::window() else { return };
    let Ok(location) = window.location().href() else { return };
    let Ok(url) = web_sys::Url::new(&location) else { return };
    let params = url.search_params();
    match value {
        Some(v) => params.set(key, v),
        None => params.delete(key),
    }
    url.set_search(&params.to_string().as_string().unwrap_or_default());
    let _ = window
        .history()
        .and_then(|h| h.replace_state_with_url(&JsValue::NULL, "", Some(&url.href())));
}

pub fn url_get_param(key: &str) -> Option<String> {
    let window = web_sys::window()?;
    let location = window.location().href().ok()?;
    let url = web_sys::Url::new(&location).ok()?;
    url.search_params().get(key)
}

/// Compile a subtree rooted at `root` — the whole document on the
/// page-ready call, or any freshly inserted fragment on a later manual
/// call. Two passes, definitions then bindings (spec.md §1/§6 "`init(root?)`
/// compiles a subtree"):
///
/// 1. discover and initialize every `<state>`/`<src>` so a binding compiled
///    in pass 2 can resolve a reference regardless of document order;
/// 2. walk the same subtree again wiring attribute bindings, handing each
///    `<insert>` element to [`crate::insert::compile_insert`] instead of
///    recursing into it generically (its own children belong to its
///    `<template>` blueprint, not the static document).
///
/// Both passes skip already-`is_processed` elements, so calling this twice
/// over overlapping subtrees (a second manual `init(root)`) is a no-op over
/// the overlap rather than a duplicate-registration error.
pub fn compile_subtree(root: &Node) {
    install_cleanup_observer(root);
    walk_definitions(root);
    walk_bindings(root);
}

fn walk_definitions(node: &Node) {
    if let Some(el) = node.dyn_ref::<Element>() {
        if is_processed(el) {
            return;
        }
        match el.tag_name().to_ascii_lowercase().as_str() {
            "state" => {
                if let Some(name) = el.get_attribute("name") {
                    crate::state_def::init_state(el, &name, false, None);
                }
                return;
            }
            "src" => {
                if let Some(name) = el.get_attribute("name") {
                    let url = el.get_attribute("url").unwrap_or_default();
                    crate::source_def::init_source(el, &name, &url, false);
                }
                return;
            }
            // An `<insert>`'s own `<state>`/`<src>` descendants (inside its
            // `<template>` blueprint) are scoped per rendered item, not
            // global — they are never seen by this document-wide pass.
            "insert" | "template" => return,
            _ => {}
        }
    }
    let children = node.child_nodes();
    for i in 0..children.length() {
        if let Some(child) = children.item(i) {
            walk_definitions(&child);
        }
    }
}

fn walk_bindings(node: &Node) {
    if let Some(el) = node.dyn_ref::<Element>() {
        if is_processed(el) {
            return;
        }
        match el.tag_name().to_ascii_lowercase().as_str() {
            "state" | "src" => {
                mark_processed(el);
                crate::bindings::compile_bindings(el, &None);
                return;
            }
            "insert" => {
                mark_processed(el);
                crate::insert::compile_insert(el);
                return;
            }
            "template" => return,
            _ => {
                mark_processed(el);
                crate::bindings::compile_bindings(el, &None);
            }
        }
    }
    let children = node.child_nodes();
    for i in 0..children.length() {
        if let Some(child) = children.item(i) {
            walk_bindings(&child);
        }
    }
}
