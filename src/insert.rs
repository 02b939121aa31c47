//! The `<insert>` element's DOM-facing half (spec.md §4.H). `list.rs` owns
//! the pure key/strategy/window algebra; everything here is the orchestration
//! it deliberately leaves out: cloning the `<template>` blueprint, computing
//! per-item locals, deciding which item-template attributes collapse to a
//! one-shot value versus a normal reactive binding, and driving the actual
//! DOM insert/move/remove plus the event sequence the reconciliation result
//! implies.
//!
//! Two shapes share this module, both entered through [`compile_insert`]:
//! a scalar insert (`text`/`html` in place of `for`) is a `bindings::bind_text`
//! look-alike with one extra duty — toggling the nearest enclosing `<src>`'s
//! `empty` slot — and a list insert, which is the bulk of this file.

#![cfg(target_arch = "wasm32")]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde_json::Value as Json;
use wasm_bindgen::JsCast;
use web_sys::{Comment, Element, HtmlTemplateElement, Node};

use crate::bindings::{self, ItemContext};
use crate::error::{EvalError, ListError};
use crate::expr::{self, CompileMode, Expr, MemberKey};
use crate::list::{self, ForLhs, ListEvent, ListItem, Strategy};
use crate::reactive;
use crate::refs::Value;
use crate::registry::DefId;
use crate::scope::ElementScope;

struct NoopHelpers;
impl expr::HelperHost for NoopHelpers {
    fn call(&mut self, name: &str, _args: Vec<Value>) -> Result<Value, EvalError> {
        Err(EvalError::UnknownHelper(name.to_string()))
    }
}

/// Entry point called once per `<insert>` element by `dom::compile_subtree`
/// (and, for a nested list, recursively by this module's own item-bindings
/// walk) — never recursed into generically, since its children belong to a
/// `<template>` blueprint or a scalar binding, not the static document.
pub fn compile_insert(el: &Element) {
    if let Some(for_attr) = el.get_attribute("for") {
        compile_list_insert(el, &for_attr);
    } else if let Some(src) = el.get_attribute("text") {
        compile_scalar_insert(el, &src, false);
    } else if let Some(src) = el.get_attribute("html") {
        compile_scalar_insert(el, &src, true);
    } else {
        tracing::warn!("<insert> has neither `for` nor `text`/`html`");
    }
}

fn is_empty_json(v: &Json) -> bool {
    matches!(v, Json::Null) || matches!(v, Json::Array(a) if a.is_empty())
}

// ---------------------------------------------------------------------
// Scalar insert
// ---------------------------------------------------------------------

/// `text`/`html` on `<insert>`: identical restoration rule to
/// `bindings::bind_text`, plus the list engine's extra duty of toggling the
/// nearest enclosing `<src>`'s `empty` slot off this element's own result
/// rather than the source's raw value (spec.md §4.H scalar insert).
fn compile_scalar_insert(el: &Element, src: &str, as_html: bool) {
    let compiled = match expr::compile(src, CompileMode::Expression) {
        Ok(c) => Rc::new(c),
        Err(err) => {
            tracing::warn!(error = %err, "failed to compile scalar insert expression");
            return;
        }
    };
    let initial = if as_html {
        el.inner_html()
    } else {
        el.text_content().unwrap_or_default()
    };
    let enclosing_source = crate::dom::nearest_source_element(el);

    let id = reactive::new_binding_id();
    let el2 = el.clone();
    let update: Rc<dyn Fn()> = Rc::new(move || {
        let mut resolver = ElementScope::new(el2.clone());
        let mut helpers = NoopHelpers;
        let mut ctx = expr::EvalCtx::new(&mut resolver, &mut helpers);
        let value = compiled.eval_or_null(&mut ctx).to_json();
        let empty = is_empty_json(&value);
        match &value {
            Json::Null => {
                if as_html {
                    el2.set_inner_html(&initial);
                } else {
                    el2.set_text_content(Some(&initial));
                }
            }
            other => {
                let rendered = bindings::json_to_text(other);
                if as_html {
                    el2.set_inner_html(&crate::config::sanitize_html(&rendered));
                } else {
                    el2.set_text_content(Some(&rendered));
                }
            }
        }
        if let Some((src_el, _)) = &enclosing_source {
            crate::dom::set_status_slot(src_el, "empty", empty);
        }
    });
    bindings::register_binding(id, update);
    bindings::run_binding(id);
    crate::dom::on_removed(el, move || bindings::unregister_binding(id));
}

// ---------------------------------------------------------------------
// List insert
// ---------------------------------------------------------------------

/// Everything a rendered list item owns: its root node and the scoped
/// `<state>`/`<src>` definitions plus locals its bindings resolve against.
/// Kept alive in `ListRuntime::items` for as long as the key is rendered, so
/// a later merge update can snapshot its scoped state before rebuilding it.
struct ItemRecord {
    node: Element,
    ctx: ItemContext,
}

struct ListRuntime {
    strategy: Strategy,
    window: Option<usize>,
    lhs: ForLhs,
    rhs: expr::Compiled,
    key_expr: Option<expr::Compiled>,
    template_root: Element,
    anchor: Comment,
    order: Vec<String>,
    items: HashMap<String, ItemRecord>,
    /// Set once the list has rendered at least one item; gates the one-time
    /// `init` event (spec.md §4.H: "`init` when the first non-empty render
    /// happens").
    initialized: bool,
}

fn compile_list_insert(el: &Element, for_attr: &str) {
    let Some((lhs, rhs_src)) = list::parse_for_attribute(for_attr) else {
        tracing::warn!(for_attr, "malformed `for` attribute on <insert>");
        return;
    };
    let rhs = match expr::compile(&rhs_src, CompileMode::Expression) {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(error = %err, "failed to compile `for` right-hand side");
            return;
        }
    };
    let key_expr = match el.get_attribute("key") {
        Some(src) => match expr::compile(&src, CompileMode::Expression) {
            Ok(c) => Some(c),
            Err(err) => {
                tracing::warn!(error = %err, "failed to compile `key` expression");
                None
            }
        },
        None => None,
    };
    let strategy = el
        .get_attribute("strategy")
        .and_then(|s| list::parse_strategy(&s))
        .unwrap_or(Strategy::Replace);
    let window = el.get_attribute("window").and_then(|w| w.trim().parse::<usize>().ok());
    if strategy.requires_window() && window.is_none() {
        tracing::warn!(?strategy, "strategy requires a `window` attribute");
    }

    let Ok(Some(template_node)) = el.query_selector(":scope > template") else {
        tracing::warn!("<insert> with `for` has no direct <template> child");
        return;
    };
    let Some(template_el) = template_node.dyn_ref::<HtmlTemplateElement>().cloned() else {
        tracing::warn!("<insert>'s <template> child is not an HTMLTemplateElement");
        return;
    };
    let Some(template_root) = template_el.content().first_element_child() else {
        tracing::warn!("<template> blueprint must have exactly one root element");
        return;
    };
    template_el.remove();

    for tag in ["loading", "error", "empty"] {
        if let Ok(Some(slot)) = el.query_selector(tag) {
            let _ = slot.set_attribute("hidden", "");
        }
    }

    let anchor = Comment::new().expect("Comment construction should not fail");
    anchor.set_data("jtx-insert");
    let _ = el.append_child(&anchor);

    let state = Rc::new(RefCell::new(ListRuntime {
        strategy,
        window,
        lhs,
        rhs,
        key_expr,
        template_root,
        anchor: anchor.clone(),
        order: Vec::new(),
        items: HashMap::new(),
        initialized: false,
    }));

    let id = reactive::new_binding_id();
    let el2 = el.clone();
    let state2 = state.clone();
    let update: Rc<dyn Fn()> = Rc::new(move || run_list_update(&el2, &state2));
    bindings::register_binding(id, update);
    bindings::run_binding(id);

    let el_for_clear = el.clone();
    crate::dom::on_removed(el, move || {
        bindings::unregister_binding(id);
        crate::dom::dispatch_event(&el_for_clear, "clear", &serde_json::json!({}));
    });
}

/// One locals-computation + key-derivation pass over the evaluated
/// right-hand side, then a call into `list::reconcile`, then the DOM
/// mutation/snapshot/restore/event sequence spec.md §4.H describes.
fn run_list_update(insert_el: &Element, state: &Rc<RefCell<ListRuntime>>) {
    let (strategy, window, lhs, rhs, key_expr, template_root, current_order, was_initialized) = {
        let st = state.borrow();
        (
            st.strategy,
            st.window,
            st.lhs.clone(),
            st.rhs.clone(),
            st.key_expr.clone(),
            st.template_root.clone(),
            st.order.clone(),
            st.initialized,
        )
    };

    let rhs_value = {
        let mut resolver = ElementScope::new(insert_el.clone());
        let mut helpers = NoopHelpers;
        let mut ctx = expr::EvalCtx::new(&mut resolver, &mut helpers);
        rhs.eval_or_null(&mut ctx).to_json()
    };

    let key_var_declared = lhs.key_var.is_some();
    let raw_items = match list::items_from_value(&rhs_value, key_var_declared, key_expr.as_ref().map(|_| "k")) {
        Ok(items) => items,
        Err(err) => return report_list_error(insert_el, err),
    };

    let mut incoming: Vec<ListItem> = Vec::with_capacity(raw_items.len());
    let mut locals_by_key: HashMap<String, HashMap<String, Value>> = HashMap::new();
    for (index, (default_key, item_value)) in raw_items.into_iter().enumerate() {
        let mut locals = build_locals(&lhs, &rhs_value, &item_value, default_key.as_deref(), index);
        let key = match &key_expr {
            Some(compiled) => {
                let probe = ItemContext {
                    defs: Rc::new(HashMap::new()),
                    locals: Rc::new(locals.clone()),
                };
                let v = bindings::eval_with_item(compiled, insert_el, &probe).to_json();
                let s = bindings::json_to_text(&v);
                if s.is_empty() { None } else { Some(s) }
            }
            None => default_key,
        };
        if let Some(k) = &key {
            locals.insert("$key".to_string(), Value::string(k.clone()));
            locals_by_key.insert(k.clone(), locals);
        }
        incoming.push(ListItem { key, value: item_value });
    }

    let patch = match list::reconcile(strategy, window, &current_order, &incoming) {
        Ok(p) => p,
        Err(err) => return report_list_error(insert_el, err),
    };

    // Snapshot prior scoped-state values for every key that is about to be
    // torn down and possibly rebuilt under the same key (replace rebuilds
    // every key; merge rebuilds only its `updated` keys in place).
    let mut snapshots: HashMap<String, HashMap<String, Json>> = HashMap::new();
    {
        let st = state.borrow();
        let keys_to_snapshot: Vec<&String> = match strategy {
            Strategy::Replace => st.order.iter().collect(),
            Strategy::MergeAppend | Strategy::MergePrepend => patch.updated.iter().map(|(k, _)| k).collect(),
            Strategy::Append | Strategy::Prepend => Vec::new(),
        };
        for key in keys_to_snapshot {
            if let Some(rec) = st.items.get(key) {
                snapshots.insert(key.clone(), snapshot_item_state(&rec.ctx));
            }
        }
    }

    {
        let mut st = state.borrow_mut();
        for key in patch.removed.iter().chain(patch.updated.iter().map(|(k, _)| k)) {
            if let Some(rec) = st.items.remove(key) {
                rec.node.remove();
            }
        }
    }

    {
        let mut st = state.borrow_mut();
        let anchor = st.anchor.clone();
        let mut to_build: Vec<&str> = patch.added.iter().map(|(k, _)| k.as_str()).collect();
        to_build.extend(patch.updated.iter().map(|(k, _)| k.as_str()));
        for key in to_build {
            let locals = locals_by_key.get(key).cloned().unwrap_or_default();
            let restore = snapshots.get(key);
            let rec = mount_item(insert_el, &anchor, &template_root, &locals, key, restore);
            st.items.insert(key.to_string(), rec);
        }
        for key in &patch.order {
            if let Some(rec) = st.items.get(key) {
                // A live/immediate `if` on the item template's own root may
                // have swapped it out for a placeholder comment already; in
                // that case leave the placeholder where it sits rather than
                // resurrecting the hidden root next to it.
                if rec.node.is_connected() {
                    let _ = insert_el.insert_before(&rec.node, Some(&anchor));
                }
            }
        }
        st.order = patch.order.clone();
        if !was_initialized && !patch.order.is_empty() {
            st.initialized = true;
        }
    }

    let first_nonempty = !was_initialized && !patch.order.is_empty();
    let events = list::events_for_patch(&patch, current_order.is_empty(), first_nonempty);
    dispatch_list_events(insert_el, events, patch.order.is_empty());
}

fn report_list_error(el: &Element, err: ListError) {
    tracing::warn!(error = %err, "list reconciliation rejected the incoming batch");
    crate::dom::dispatch_event(el, "error", &serde_json::json!({"error": err.to_string()}));
}

/// Remove events precede slot reconciliation, which precedes
/// init/add/update/empty (spec.md §4.H "Ordering within a flush").
fn dispatch_list_events(el: &Element, events: Vec<ListEvent>, is_empty_now: bool) {
    let (removals, rest): (Vec<_>, Vec<_>) = events.into_iter().partition(|e| matches!(e, ListEvent::Remove { .. }));
    for ev in &removals {
        emit_list_event(el, ev);
    }
    crate::dom::set_status_slot(el, "empty", is_empty_now);
    for ev in &rest {
        emit_list_event(el, ev);
    }
}

fn emit_list_event(el: &Element, ev: &ListEvent) {
    match ev {
        ListEvent::Init { count } => crate::dom::dispatch_event(el, "init", &serde_json::json!({"count": count})),
        ListEvent::Add { items } => crate::dom::dispatch_event(el, "add", &serde_json::json!({"items": items})),
        ListEvent::Update { items } => crate::dom::dispatch_event(el, "update", &serde_json::json!({"items": items})),
        ListEvent::Remove { keys } => crate::dom::dispatch_event(el, "remove", &serde_json::json!({"keys": keys})),
        ListEvent::Empty => crate::dom::dispatch_event(el, "empty", &serde_json::json!({})),
        ListEvent::Clear => crate::dom::dispatch_event(el, "clear", &serde_json::json!({})),
        ListEvent::Error(err) => crate::dom::dispatch_event(el, "error", &serde_json::json!({"error": err.to_string()})),
    }
}

/// The locals every binding under one rendered item resolves bare
/// identifiers against: the item alias, the terse `$` synonym, `$index`
/// (position in the incoming batch), `$key` (pre-key-expression default;
/// overwritten by the caller once the real key is known), `$root` (the
/// whole evaluated right-hand side), and the optional key-variable alias
/// (spec.md §4.H "computes a locals mapping").
fn build_locals(lhs: &ForLhs, root: &Json, item_value: &Json, key: Option<&str>, index: usize) -> HashMap<String, Value> {
    let mut locals = HashMap::new();
    let item_val = Value::from_json(item_value.clone());
    locals.insert(lhs.item_var.clone(), item_val.clone());
    locals.insert("$".to_string(), item_val);
    locals.insert("$index".to_string(), Value::number(index as f64));
    locals.insert("$key".to_string(), Value::string(key.unwrap_or_default()));
    locals.insert("$root".to_string(), Value::from_json(root.clone()));
    if let Some(key_var) = &lhs.key_var {
        locals.insert(key_var.clone(), Value::string(key.unwrap_or_default()));
    }
    locals
}

fn snapshot_item_state(ctx: &ItemContext) -> HashMap<String, Json> {
    let mut map = HashMap::new();
    for (name, def) in ctx.defs.iter() {
        if let DefId::State(id) = def {
            let value = crate::registry::with_engine(|e| e.state_by_id(*id).value.clone());
            map.insert(name.clone(), value);
        }
    }
    map
}

fn mount_item(
    insert_el: &Element,
    anchor: &Comment,
    template_root: &Element,
    locals: &HashMap<String, Value>,
    key: &str,
    restore: Option<&HashMap<String, Json>>,
) -> ItemRecord {
    let clone: Element = template_root
        .clone_node_with_deep(true)
        .expect("clone_node should not fail")
        .dyn_into()
        .expect("template blueprint root must clone to an Element");
    let _ = clone.set_attribute(crate::dom::ITEM_KEY_ATTR, key);
    let _ = insert_el.insert_before(&clone, Some(anchor));

    let mut defs = HashMap::new();
    walk_item_definitions(&clone, &mut defs, restore);
    let ctx = ItemContext {
        defs: Rc::new(defs),
        locals: Rc::new(locals.clone()),
    };
    walk_item_bindings(&clone, &ctx);

    ItemRecord { node: clone, ctx }
}

/// The item-clone counterpart of `dom::compile_subtree`'s definitions pass:
/// scoped `<state>`/`<src>` children are initialized against this item's own
/// restore snapshot rather than the durable store, and never recursed into
/// past that point.
fn walk_item_definitions(node: &Node, defs: &mut HashMap<String, DefId>, restore: Option<&HashMap<String, Json>>) {
    if let Some(el) = node.dyn_ref::<Element>() {
        match el.tag_name().to_ascii_lowercase().as_str() {
            "state" => {
                if let Some(name) = el.get_attribute("name") {
                    let snap = restore.and_then(|r| r.get(&name)).cloned();
                    if let Some(def) = crate::state_def::init_state(el, &name, true, snap) {
                        defs.insert(name, def);
                    }
                }
                return;
            }
            "src" => {
                if let Some(name) = el.get_attribute("name") {
                    let url = el.get_attribute("url").unwrap_or_default();
                    if let Some(def) = crate::source_def::init_source(el, &name, &url, true) {
                        defs.insert(name, def);
                    }
                }
                return;
            }
            "insert" | "template" => return,
            _ => {}
        }
    }
    let children = node.child_nodes();
    for i in 0..children.length() {
        if let Some(child) = children.item(i) {
            walk_item_definitions(&child, defs, restore);
        }
    }
}

/// The item-clone counterpart of `dom::compile_subtree`'s bindings pass,
/// with one addition: a bindable attribute whose expression reads any of
/// this item's locals is evaluated once and stripped rather than turned
/// into a live binding (spec.md §4.H "Per-item compilation"), since a local
/// never changes without the item itself being rebuilt.
fn walk_item_bindings(node: &Node, ctx: &ItemContext) {
    let Some(el) = node.dyn_ref::<Element>() else { return };
    match el.tag_name().to_ascii_lowercase().as_str() {
        "state" | "src" => return,
        "insert" => {
            crate::dom::mark_processed(el);
            compile_insert(el);
            return;
        }
        "template" => return,
        _ => {}
    }
    crate::dom::mark_processed(el);
    compile_item_element_bindings(el, ctx);
    let children = node.child_nodes();
    for i in 0..children.length() {
        if let Some(child) = children.item(i) {
            walk_item_bindings(&child, ctx);
        }
    }
}

const LOCAL_CHECKED_ATTRS: [&str; 4] = ["if", "show", "text", "html"];

fn compile_item_element_bindings(el: &Element, ctx: &ItemContext) {
    let local_names: std::collections::HashSet<String> = ctx.locals.keys().cloned().collect();
    let attrs: Vec<(String, String)> = {
        let list = el.attributes();
        (0..list.length())
            .filter_map(|i| list.item(i))
            .map(|a| (a.name(), a.value()))
            .collect()
    };
    for (name, value) in attrs {
        let is_candidate = LOCAL_CHECKED_ATTRS.contains(&name.as_str()) || name.starts_with("attr-");
        if !is_candidate {
            continue;
        }
        let Ok(compiled) = expr::compile(&value, CompileMode::Expression) else { continue };
        if !references_any_local(compiled.ast(), &local_names) {
            continue;
        }
        apply_immediate_binding(el, &name, &compiled, ctx);
        let _ = el.remove_attribute(&name);
    }
    bindings::compile_bindings(el, &Some(ctx.clone()));
}

fn apply_immediate_binding(el: &Element, attr: &str, compiled: &expr::Compiled, ctx: &ItemContext) {
    let value = bindings::eval_with_item(compiled, el, ctx).to_json();
    match attr {
        "if" => {
            if !Value::from_json(value).is_truthy() {
                if let Some(parent) = el.parent_node() {
                    if let Ok(placeholder) = web_sys::Comment::new() {
                        placeholder.set_data("jtx-if");
                        let _ = parent.replace_child(&placeholder, el);
                    }
                }
            }
        }
        "show" => {
            if Value::from_json(value).is_truthy() {
                let _ = el.remove_attribute("hidden");
            } else {
                let _ = el.set_attribute("hidden", "");
            }
        }
        "text" => el.set_text_content(Some(&bindings::json_to_text(&value))),
        "html" => el.set_inner_html(&crate::config::sanitize_html(&bindings::json_to_text(&value))),
        other => {
            if let Some(attr_name) = other.strip_prefix("attr-") {
                match value {
                    Json::Null | Json::Bool(false) => {
                        let _ = el.remove_attribute(attr_name);
                    }
                    Json::Bool(true) => {
                        let _ = el.set_attribute(attr_name, "");
                    }
                    other => {
                        let _ = el.set_attribute(attr_name, &bindings::json_to_text(&other));
                    }
                }
            }
        }
    }
}

fn references_any_local(e: &Expr, locals: &std::collections::HashSet<String>) -> bool {
    match e {
        Expr::Ident(name) => locals.contains(name),
        Expr::Ref(_) | Expr::Null | Expr::Bool(_) | Expr::Num(_) | Expr::Str(_) => false,
        Expr::Member(base, key) => {
            references_any_local(base, locals)
                || matches!(key, MemberKey::Computed(inner) if references_any_local(inner, locals))
        }
        Expr::Call(callee, args) => {
            references_any_local(callee, locals) || args.iter().any(|a| references_any_local(a, locals))
        }
        Expr::Array(items) => items.iter().any(|i| references_any_local(i, locals)),
        Expr::Object(fields) => fields.iter().any(|(_, v)| references_any_local(v, locals)),
        Expr::Neg(inner) | Expr::Not(inner) | Expr::Await(inner) => references_any_local(inner, locals),
        Expr::Binary(_, a, b) | Expr::And(a, b) | Expr::Or(a, b) => {
            references_any_local(a, locals) || references_any_local(b, locals)
        }
        Expr::Ternary(a, b, c) => {
            references_any_local(a, locals) || references_any_local(b, locals) || references_any_local(c, locals)
        }
        Expr::Assign(target, _, value) => references_any_local(target, locals) || references_any_local(value, locals),
        Expr::PreIncDec(inner, _) | Expr::PostIncDec(inner, _) => references_any_local(inner, locals),
        Expr::Sequence(items) => items.iter().any(|i| references_any_local(i, locals)),
    }
}
