//! State definition lifecycle: seeding keys from attribute expressions,
//! restoring persisted/URL-synced keys, and the flush step that persists,
//! URL-syncs, and fires `update` on every state with pending writes.

#![cfg(target_arch = "wasm32")]

use std::collections::HashMap;

use serde_json::Value as Json;
use web_sys::Element;

use crate::error::EvalError;
use crate::expr::{self, CompileMode};
use crate::registry::{with_engine, DefId};
use crate::util;

const RESERVED_ATTRS: [&str; 3] = ["name", "persist", "persist-url"];

fn is_reserved(attr_name: &str) -> bool {
    RESERVED_ATTRS.contains(&attr_name) || attr_name.starts_with("jtx-")
}

struct NoopHelpers;
impl expr::HelperHost for NoopHelpers {
    fn call(&mut self, name: &str, _args: Vec<crate::refs::Value>) -> Result<crate::refs::Value, EvalError> {
        Err(EvalError::UnknownHelper(name.to_string()))
    }
}

/// Initialize a `<state name="...">` element: seed keys, restore
/// persistence, attach the scope marker, and fire `init`. `restore` is a
/// caller-supplied snapshot (list-item re-renders under the merge
/// strategy) applied after the normal persist/URL restoration, so the
/// freshest known value always wins.
pub fn init_state(el: &Element, name: &str, scoped: bool, restore: Option<Json>) -> Option<DefId> {
    let def = with_engine(|e| e.create_state(name, scoped))?;
    debug_assert!(matches!(def, DefId::State(_)));

    let mut map = serde_json::Map::new();
    let attrs = el.attributes();
    for i in 0..attrs.length() {
        if let Some(attr) = attrs.item(i) {
            let attr_name = attr.name();
            if is_reserved(&attr_name) {
                continue;
            }
            let expr_src = attr.value();
            match expr::compile(&expr_src, CompileMode::Expression) {
                Ok(compiled) => {
                    let mut resolver = crate::scope::ElementScope::new(el.clone());
                    let mut helpers = NoopHelpers;
                    let mut ctx = expr::EvalCtx::new(&mut resolver, &mut helpers);
                    match compiled.eval(&mut ctx) {
                        Ok(v) => {
                            map.insert(attr_name, v.to_json());
                        }
                        Err(err) => {
                            tracing::warn!(key = %attr_name, error = %err, "state key init expression failed");
                            crate::dom::dispatch_event(
                                el,
                                "error",
                                &serde_json::json!({"name": name, "error": err.to_string()}),
                            );
                            map.insert(attr_name, Json::Null);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(key = %attr_name, error = %err, "state key init expression failed to parse");
                    crate::dom::dispatch_event(
                        el,
                        "error",
                        &serde_json::json!({"name": name, "error": err.to_string()}),
                    );
                    map.insert(attr_name, Json::Null);
                }
            }
        }
    }

    with_engine(|e| {
        let rec = e.state_by_id_mut(def.id());
        rec.value = Json::Object(map);
    });

    let persist_keys = el
        .get_attribute("persist")
        .map(|v| util::split_csv(&v))
        .unwrap_or_default();
    let url_keys = el
        .get_attribute("persist-url")
        .map(|v| util::split_csv(&v))
        .unwrap_or_default();

    for key in &persist_keys {
        let storage_key = format!("{}:{name}:{key}", crate::config::STORAGE_PREFIX);
        if let Some(raw) = crate::dom::storage_get(&storage_key) {
            match serde_json::from_str::<Json>(&raw) {
                Ok(v) => set_key_silently(def.id(), key, v),
                Err(err) => {
                    tracing::warn!(key, error = %err, "persisted value was not valid JSON");
                    crate::dom::dispatch_event(el, "error", &serde_json::json!({"name": name, "error": err.to_string()}));
                }
            }
        }
    }
    for key in &url_keys {
        if let Some(raw) = crate::dom::url_get_param(key) {
            let v = serde_json::from_str::<Json>(&raw).unwrap_or(Json::String(raw));
            set_key_silently(def.id(), key, v);
        }
    }

    if let Some(snapshot) = restore {
        if let Json::Object(snap_map) = snapshot {
            for (k, v) in snap_map {
                set_key_silently(def.id(), &k, v);
            }
        }
    }

    with_engine(|e| {
        let rec = e.state_by_id_mut(def.id());
        rec.persisted_keys = persist_keys.into_iter().collect();
        rec.url_keys = url_keys.into_iter().collect();
    });

    crate::dom::register_scope(el, name, def);
    let id = def.id();
    let el_for_cleanup = el.clone();
    crate::dom::on_removed(el, move || {
        with_engine(|e| e.destroy_state(id));
        crate::dom::unregister_def_element(DefId::State(id));
        let _ = &el_for_cleanup;
    });

    let snapshot = with_engine(|e| e.state_by_id(id).value.clone());
    crate::dom::dispatch_event(el, "init", &serde_json::json!({"name": name, "value": snapshot}));

    Some(def)
}

fn set_key_silently(id: u64, key: &str, value: Json) {
    with_engine(|e| {
        let rec = e.state_by_id_mut(id);
        let path = util::parse_path(key);
        util::deep_set(&mut rec.value, &path, value);
    });
}

/// The flush-cycle persist/URL-sync/`update` step for one state, run once
/// per state with non-empty `pending_keys` on every microtask.
pub fn flush_pending(state_id: u64) {
    let (name, keys, value, persisted, url_keyed): (String, Vec<String>, Json, HashMap<String, bool>, HashMap<String, bool>) =
        with_engine(|e| {
            let rec = e.state_by_id_mut(state_id);
            let keys: Vec<String> = rec.pending_keys.drain().collect();
            let persisted = keys
                .iter()
                .map(|k| (k.clone(), rec.persisted_keys.contains(k)))
                .collect();
            let url_keyed = keys
                .iter()
                .map(|k| (k.clone(), rec.url_keys.contains(k)))
                .collect();
            (rec.name.clone(), keys, rec.value.clone(), persisted, url_keyed)
        });

    if keys.is_empty() {
        return;
    }

    for key in &keys {
        if *persisted.get(key).unwrap_or(&false) {
            let storage_key = format!("{}:{name}:{key}", crate::config::STORAGE_PREFIX);
            let v = util::deep_get(&value, &util::parse_path(key));
            crate::dom::storage_set(&storage_key, &v.to_string());
        }
        if *url_keyed.get(key).unwrap_or(&false) {
            let v = util::deep_get(&value, &util::parse_path(key));
            match v {
                Json::Null => crate::dom::url_set_param(key, None),
                other => crate::dom::url_set_param(key, Some(&other.to_string())),
            }
        }
    }

    if let Some(el) = crate::dom::element_for(DefId::State(state_id)) {
        crate::dom::dispatch_event(
            &el,
            "update",
            &serde_json::json!({"name": name, "keys": keys, "value": value}),
        );
    }
}
