//! Attribute bindings: `if`, `show`, `text`, `html`, `attr-*`, `model`, and
//! `on`. Each binding kind compiles its attribute value once, registers an
//! update closure under a fresh [`reactive::BindingId`], runs it immediately
//! to establish both the initial render and the dependency edges, and tears
//! itself down (closure + dependency edges) when its element leaves the
//! tree via `dom::on_removed`.
//!
//! `reactive::flush_now` drives every subsequent rerun through
//! [`run_binding`], which is why that module forward-references
//! `crate::bindings::run_binding` — this is the module it's calling into.

#![cfg(target_arch = "wasm32")]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use serde_json::Value as Json;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{Element, HtmlInputElement, HtmlOptionElement, HtmlSelectElement, HtmlTextAreaElement};

use crate::error::EvalError;
use crate::expr::{self, CompileMode, EvalCtx, RefResolver};
use crate::on_parser;
use crate::reactive::{self, BindingId};
use crate::refs::Value;
use crate::registry::DefId;
use crate::scope::{ElementScope, ItemScope};
use crate::util;

thread_local! {
    static BINDINGS: RefCell<HashMap<u64, Rc<dyn Fn()>>> = RefCell::new(HashMap::new());
}

/// Shared with `insert::compile_list_insert` — the list engine's own
/// per-instance binding (recomputing the reconciliation patch) is
/// registered the same way every attribute binding is.
pub(crate) fn register_binding(id: BindingId, update: Rc<dyn Fn()>) {
    BINDINGS.with(|b| b.borrow_mut().insert(id.0, update));
}

pub(crate) fn unregister_binding(id: BindingId) {
    BINDINGS.with(|b| b.borrow_mut().remove(&id.0));
    crate::registry::with_engine(|e| e.remove_binding(id));
}

/// Rerun one binding's update closure, recording whatever it reads this
/// time as its fresh dependency set. Called by `reactive::flush_now` for
/// every binding attached to a definition that changed this flush.
pub fn run_binding(id: BindingId) {
    let update = BINDINGS.with(|b| b.borrow().get(&id.0).cloned());
    if let Some(update) = update {
        reactive::with_binding_scope(id, || update());
    }
}

/// The per-item context a list-rendered clone's bindings close over: the
/// scoped `<state>`/`<src>` definitions declared inside the item template
/// (resolved through `ItemScope`) plus the plain-value locals (`item`, an
/// optional key-variable alias, `$index`, `$key`, `$root`) the list engine
/// computes once per item and hands to every binding underneath it.
#[derive(Clone, Default)]
pub struct ItemContext {
    pub defs: Rc<HashMap<String, DefId>>,
    pub locals: Rc<HashMap<String, Value>>,
}

struct NoopHelpers;
impl expr::HelperHost for NoopHelpers {
    fn call(&mut self, name: &str, _args: Vec<Value>) -> Result<Value, EvalError> {
        Err(EvalError::UnknownHelper(name.to_string()))
    }
}

fn make_resolver<'a>(el: &Element, item: &'a Option<ItemContext>) -> Box<dyn RefResolver + 'a> {
    match item {
        Some(ctx) => Box::new(ItemScope {
            locals: ctx.defs.as_ref(),
            outer: ElementScope::new(el.clone()),
        }),
        None => Box::new(ElementScope::new(el.clone())),
    }
}

fn eval_binding(compiled: &expr::Compiled, el: &Element, item: &Option<ItemContext>) -> Value {
    let mut resolver = make_resolver(el, item);
    let mut helpers = NoopHelpers;
    let mut ctx = EvalCtx::new(resolver.as_mut(), &mut helpers);
    if let Some(item) = item {
        ctx.locals = (*item.locals).clone();
    }
    compiled.eval_or_null(&mut ctx)
}

/// Evaluate `compiled` against one list item's locals/scoped defs — the
/// same resolver wiring every attribute binding under that item uses,
/// exposed for the immediate-eval-and-strip step in `insert`'s per-item
/// compiler and its key-expression evaluation.
pub(crate) fn eval_with_item(compiled: &expr::Compiled, el: &Element, item: &ItemContext) -> Value {
    eval_binding(compiled, el, &Some(item.clone()))
}

pub(crate) fn json_to_text(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

/// Walk one element's attributes and wire up every binding it declares.
/// Called once per static element during `compile_subtree`'s bindings pass,
/// and once per freshly-cloned list item by the `<insert>` engine — `item`
/// is `None` for the former, `Some` for the latter.
pub fn compile_bindings(el: &Element, item: &Option<ItemContext>) {
    let attrs: Vec<(String, String)> = {
        let list = el.attributes();
        (0..list.length())
            .filter_map(|i| list.item(i))
            .map(|a| (a.name(), a.value()))
            .collect()
    };
    for (name, value) in attrs {
        match name.as_str() {
            "if" => bind_if(el, &value, item),
            "show" => bind_show(el, &value, item),
            "text" => bind_text(el, &value, item, false),
            "html" => bind_text(el, &value, item, true),
            "model" => bind_model(el, &value, item),
            "on" => bind_on(el, &value, item),
            _ => {
                if let Some(attr_name) = name.strip_prefix("attr-") {
                    bind_attr(el, attr_name, &value, item);
                }
            }
        }
    }
}

fn compile_fail(attr: &str, err: impl std::fmt::Display) {
    tracing::warn!(attr, error = %err, "failed to compile binding expression");
}

/// `if`: swaps the element for a `Comment` placeholder at the same
/// position in the tree when falsy, and back when truthy, so a hidden
/// branch is fully detached (its own bindings stop rerunning, its
/// `<state>`/`<src>` children stay alive and reactive the whole time since
/// they aren't torn down by a mere reparent).
fn bind_if(el: &Element, src: &str, item: &Option<ItemContext>) {
    let compiled = match expr::compile(src, CompileMode::Expression) {
        Ok(c) => Rc::new(c),
        Err(err) => return compile_fail("if", err),
    };
    let Ok(placeholder) = web_sys::Comment::new() else { return };
    placeholder.set_data("jtx-if");

    let id = reactive::new_binding_id();
    let item = item.clone();
    let el_for_update = el.clone();
    let mounted = Rc::new(Cell::new(true));
    let update: Rc<dyn Fn()> = Rc::new(move || {
        let show = eval_binding(&compiled, &el_for_update, &item).is_truthy();
        let now_mounted = mounted.get();
        if show && !now_mounted {
            if let Some(parent) = placeholder.parent_node() {
                let _ = parent.replace_child(&el_for_update, &placeholder);
            }
            mounted.set(true);
        } else if !show && now_mounted {
            if let Some(parent) = el_for_update.parent_node() {
                let _ = parent.replace_child(&placeholder, &el_for_update);
            }
            mounted.set(false);
        }
    });
    register_binding(id, update);
    run_binding(id);
    crate::dom::on_removed(el, move || unregister_binding(id));
}

/// `show`: toggles the `hidden` attribute rather than detaching the node,
/// so layout-affecting CSS (`display: none` via the UA stylesheet) is the
/// only visible effect and the element's own bindings keep rerunning.
fn bind_show(el: &Element, src: &str, item: &Option<ItemContext>) {
    let compiled = match expr::compile(src, CompileMode::Expression) {
        Ok(c) => Rc::new(c),
        Err(err) => return compile_fail("show", err),
    };
    let id = reactive::new_binding_id();
    let item = item.clone();
    let el2 = el.clone();
    let update: Rc<dyn Fn()> = Rc::new(move || {
        let visible = eval_binding(&compiled, &el2, &item).is_truthy();
        if visible {
            let _ = el2.remove_attribute("hidden");
        } else {
            let _ = el2.set_attribute("hidden", "");
        }
    });
    register_binding(id, update);
    run_binding(id);
    crate::dom::on_removed(el, move || unregister_binding(id));
}

/// `text`/`html`: a `null`/`undefined` result restores the element's
/// original static markup rather than blanking it, so an author's
/// placeholder content (a skeleton, a dash) survives an unresolved
/// reference instead of disappearing.
fn bind_text(el: &Element, src: &str, item: &Option<ItemContext>, as_html: bool) {
    let attr = if as_html { "html" } else { "text" };
    let compiled = match expr::compile(src, CompileMode::Expression) {
        Ok(c) => Rc::new(c),
        Err(err) => return compile_fail(attr, err),
    };
    let initial = if as_html {
        el.inner_html()
    } else {
        el.text_content().unwrap_or_default()
    };
    let id = reactive::new_binding_id();
    let item = item.clone();
    let el2 = el.clone();
    let update: Rc<dyn Fn()> = Rc::new(move || {
        let value = eval_binding(&compiled, &el2, &item).to_json();
        match value {
            Json::Null => {
                if as_html {
                    el2.set_inner_html(&initial);
                } else {
                    el2.set_text_content(Some(&initial));
                }
            }
            other => {
                let rendered = json_to_text(&other);
                if as_html {
                    el2.set_inner_html(&crate::config::sanitize_html(&rendered));
                } else {
                    el2.set_text_content(Some(&rendered));
                }
            }
        }
    });
    register_binding(id, update);
    run_binding(id);
    crate::dom::on_removed(el, move || unregister_binding(id));
}

/// `attr-<name>`: `false`/`null`/`undefined` removes the attribute, `true`
/// sets it as a bare boolean attribute, anything else is stringified.
fn bind_attr(el: &Element, attr_name: &str, src: &str, item: &Option<ItemContext>) {
    let compiled = match expr::compile(src, CompileMode::Expression) {
        Ok(c) => Rc::new(c),
        Err(err) => return compile_fail(attr_name, err),
    };
    let id = reactive::new_binding_id();
    let item = item.clone();
    let el2 = el.clone();
    let name = attr_name.to_string();
    let update: Rc<dyn Fn()> = Rc::new(move || {
        let value = eval_binding(&compiled, &el2, &item).to_json();
        match value {
            Json::Null | Json::Bool(false) => {
                let _ = el2.remove_attribute(&name);
            }
            Json::Bool(true) => {
                let _ = el2.set_attribute(&name, "");
            }
            other => {
                let _ = el2.set_attribute(&name, &json_to_text(&other));
            }
        }
    });
    register_binding(id, update);
    run_binding(id);
    crate::dom::on_removed(el, move || unregister_binding(id));
}

fn read_control_value(el: &Element) -> Json {
    if let Some(input) = el.dyn_ref::<HtmlInputElement>() {
        return match input.type_().as_str() {
            "checkbox" => Json::Bool(input.checked()),
            "number" | "range" => {
                let raw = input.value();
                if raw.trim().is_empty() {
                    Json::Null
                } else {
                    raw.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Json::Number)
                        .unwrap_or(Json::Null)
                }
            }
            _ => Json::String(input.value()),
        };
    }
    if let Some(select) = el.dyn_ref::<HtmlSelectElement>() {
        if select.multiple() {
            let options = select.selected_options();
            let mut out = Vec::new();
            for i in 0..options.length() {
                if let Some(opt) = options.item(i).and_then(|n| n.dyn_into::<HtmlOptionElement>().ok()) {
                    out.push(Json::String(opt.value()));
                }
            }
            return Json::Array(out);
        }
        return Json::String(select.value());
    }
    if let Some(area) = el.dyn_ref::<HtmlTextAreaElement>() {
        return Json::String(area.value());
    }
    Json::Null
}

fn set_control_value(el: &Element, value: &Json) {
    if let Some(input) = el.dyn_ref::<HtmlInputElement>() {
        match input.type_().as_str() {
            "checkbox" => input.set_checked(matches!(value, Json::Bool(true))),
            "number" | "range" => match value {
                Json::Null => input.set_value(""),
                other => input.set_value(&json_to_text(other)),
            },
            _ => input.set_value(&json_to_text(value)),
        }
        return;
    }
    if let Some(select) = el.dyn_ref::<HtmlSelectElement>() {
        if select.multiple() {
            let wanted: HashSet<String> = match value {
                Json::Array(items) => items.iter().map(json_to_text).collect(),
                _ => HashSet::new(),
            };
            let options = select.options();
            for i in 0..options.length() {
                if let Some(opt) = options.item(i).and_then(|n| n.dyn_into::<HtmlOptionElement>().ok()) {
                    opt.set_selected(wanted.contains(&opt.value()));
                }
            }
        } else {
            select.set_value(&json_to_text(value));
        }
        return;
    }
    if let Some(area) = el.dyn_ref::<HtmlTextAreaElement>() {
        area.set_value(&json_to_text(value));
    }
}

/// `model`: two bindings in one attribute — a normal reactive binding that
/// writes the current state value into the control, and an `input`/`change`
/// listener that reads the control back (type-aware: checkbox -> bool,
/// number/range -> number or null on an empty field, multi-select -> an
/// array, everything else -> string) and writes it through the `@state.path`
/// target.
fn bind_model(el: &Element, src: &str, item: &Option<ItemContext>) {
    let compiled = match expr::compile(src, CompileMode::Expression) {
        Ok(c) => Rc::new(c),
        Err(err) => return compile_fail("model", err),
    };

    let id = reactive::new_binding_id();
    let item_read = item.clone();
    let el_read = el.clone();
    let compiled_read = compiled.clone();
    let update: Rc<dyn Fn()> = Rc::new(move || {
        let value = eval_binding(&compiled_read, &el_read, &item_read).to_json();
        set_control_value(&el_read, &value);
    });
    register_binding(id, update);
    run_binding(id);

    let item_write = item.clone();
    let el_write = el.clone();
    let compiled_write = compiled;
    let handler = Closure::<dyn FnMut(web_sys::Event)>::new(move |_ev: web_sys::Event| {
        let value = Value::from_json(read_control_value(&el_write));
        let mut resolver = make_resolver(&el_write, &item_write);
        let mut helpers = NoopHelpers;
        let mut ctx = EvalCtx::new(resolver.as_mut(), &mut helpers);
        if let Some(item) = &item_write {
            ctx.locals = (*item.locals).clone();
        }
        if let Err(err) = expr::assign(compiled_write.ast(), value, &mut ctx) {
            tracing::warn!(error = %err, "model write-back failed");
        }
    });
    let _ = el.add_event_listener_with_callback("input", handler.as_ref().unchecked_ref());
    let _ = el.add_event_listener_with_callback("change", handler.as_ref().unchecked_ref());
    handler.forget();

    crate::dom::on_removed(el, move || unregister_binding(id));
}

/// A handler's call context: `emit`/`refresh` reach into the DOM/registry
/// directly; the HTTP verbs fire the request detached (`spawn_local`) and
/// report the outcome as an `http`/`error` DOM event rather than as a
/// returned value, since the interpreter's `call()` is synchronous — this
/// keeps one reactive pipeline (events + `<src>`) for every network result
/// instead of a second promise-shaped one bolted onto handler code. An
/// author who needs the response inline should drive a `manual` `<src>` and
/// call `refresh()` from the handler instead.
struct HandlerHelpers {
    el: Element,
}

impl expr::HelperHost for HandlerHelpers {
    fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        match name {
            "emit" => {
                let event_name = args.first().map(|v| v.as_string()).unwrap_or_default();
                let detail = args.get(1).map(|v| v.to_json()).unwrap_or(Json::Null);
                crate::dom::dispatch_event(&self.el, &event_name, &detail);
                Ok(Value::null())
            }
            "refresh" => {
                if let Some(Value::Source(h)) = args.first() {
                    h.refresh();
                    return Ok(Value::null());
                }
                let target = args.first().map(|v| v.as_string()).unwrap_or_default();
                let def = crate::dom::resolve_scoped(&self.el, &target)
                    .or_else(|| crate::registry::with_engine(|e| e.lookup_global_source(&target)));
                match def {
                    Some(def) => crate::source_def::refresh(def),
                    None => tracing::warn!(name = target, "refresh() target not found"),
                }
                Ok(Value::null())
            }
            "get" | "post" | "put" | "patch" | "del" => {
                let method = match name {
                    "get" => "GET",
                    "post" => "POST",
                    "put" => "PUT",
                    "patch" => "PATCH",
                    "del" => "DELETE",
                    _ => unreachable!(),
                };
                let url = args.first().map(|v| v.as_string()).unwrap_or_default();
                let body = args.get(1).map(|v| v.to_json());
                let headers = args.get(2).map(|v| v.to_json());
                let el = self.el.clone();
                wasm_bindgen_futures::spawn_local(async move {
                    match crate::source_def::do_http(method, &url, body.as_ref(), headers.as_ref()).await {
                        Ok(json) => crate::dom::dispatch_event(
                            &el,
                            "http",
                            &serde_json::json!({"method": method, "url": url, "body": json}),
                        ),
                        Err(err) => {
                            tracing::warn!(error = %err.message, method, url, "handler HTTP call failed");
                            crate::dom::dispatch_event(
                                &el,
                                "error",
                                &serde_json::json!({"type": "network", "method": method, "url": url, "message": err.message}),
                            );
                        }
                    }
                });
                Ok(Value::null())
            }
            other => Err(EvalError::UnknownHelper(other.to_string())),
        }
    }
}

fn event_to_json(ev: &web_sys::Event) -> Json {
    let mut map = serde_json::Map::new();
    map.insert("type".to_string(), Json::String(ev.type_()));
    if let Some(custom) = ev.dyn_ref::<web_sys::CustomEvent>() {
        if let Ok(detail) = serde_wasm_bindgen::from_value::<Json>(custom.detail()) {
            map.insert("detail".to_string(), detail);
        }
    }
    if let Some(target) = ev.target() {
        if let Ok(el) = target.dyn_into::<Element>() {
            let value = read_control_value(&el);
            if !matches!(value, Json::Null) {
                map.insert("value".to_string(), value);
            }
        }
    }
    Json::Object(map)
}

fn run_handler(el: &Element, compiled: &expr::Compiled, item: &Option<ItemContext>, event_json: Json) {
    let mut resolver = make_resolver(el, item);
    let mut helpers = HandlerHelpers { el: el.clone() };
    let mut ctx = EvalCtx::new(resolver.as_mut(), &mut helpers);
    if let Some(item) = item {
        ctx.locals = (*item.locals).clone();
    }
    ctx.locals.insert("$event".to_string(), Value::from_json(event_json));
    if let Err(err) = compiled.eval(&mut ctx) {
        tracing::warn!(error = %err, "handler execution failed");
        crate::dom::dispatch_event(el, "error", &serde_json::json!({"error": err.to_string()}));
    }
}

/// `on`: parses `event:code;event:code` (spec.md §4.I's continuation rules
/// via `on_parser`), wires a DOM listener per non-`every` entry and a
/// `setInterval` per `every <duration>` entry, each executing its compiled
/// statement body through [`run_handler`].
fn bind_on(el: &Element, src: &str, item: &Option<ItemContext>) {
    let entries = match on_parser::parse_on_attribute(src) {
        Ok(e) => e,
        Err(err) => {
            tracing::warn!(error = %err, "failed to parse `on` attribute");
            crate::dom::dispatch_event(el, "error", &serde_json::json!({"error": err.to_string()}));
            return;
        }
    };
    for entry in entries {
        if let Some(duration) = on_parser::is_every_entry(&entry.event) {
            bind_every(el, duration, &entry.code, item);
        } else {
            bind_event(el, &entry.event, &entry.code, item);
        }
    }
}

fn bind_event(el: &Element, event_name: &str, code: &str, item: &Option<ItemContext>) {
    let compiled = match expr::compile(code, CompileMode::Statement) {
        Ok(c) => Rc::new(c),
        Err(err) => return compile_fail(event_name, err),
    };
    let item = item.clone();
    let el2 = el.clone();
    let handler = Closure::<dyn FnMut(web_sys::Event)>::new(move |ev: web_sys::Event| {
        run_handler(&el2, &compiled, &item, event_to_json(&ev));
    });
    let _ = el.add_event_listener_with_callback(event_name, handler.as_ref().unchecked_ref());
    handler.forget();
}

fn bind_every(el: &Element, duration: &str, code: &str, item: &Option<ItemContext>) {
    let Some(d) = util::parse_duration(duration) else {
        tracing::warn!(duration, "unparseable `every` duration on `on` attribute");
        return;
    };
    let compiled = match expr::compile(code, CompileMode::Statement) {
        Ok(c) => Rc::new(c),
        Err(err) => return compile_fail("every", err),
    };
    let Some(window) = web_sys::window() else { return };
    let item = item.clone();
    let el2 = el.clone();
    let closure = Closure::<dyn FnMut()>::new(move || {
        run_handler(&el2, &compiled, &item, Json::Null);
    });
    if let Ok(handle) =
        window.set_interval_with_callback_and_timeout_and_arguments_0(closure.as_ref().unchecked_ref(), d.millis as i32)
    {
        let window = window.clone();
        crate::dom::on_removed(el, move || window.clear_interval_with_handle(handle));
    }
    closure.forget();
}
