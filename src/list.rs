//! The `<insert>` list engine's pure reconciliation core: parsing the
//! `for="item,key in @expr"` grammar and the strategies (`replace`,
//! `append`, `prepend`, and either composed with `merge`) that turn a
//! current rendered key order plus an incoming batch into a patch of
//! removals/additions/updates.
//!
//! DOM application (cloning the `<template>` blueprint, creating/moving/
//! removing nodes, wiring per-item scoped state) lives in `dom.rs` behind
//! the `wasm32` gate; everything here operates purely on keys and JSON
//! values so it can be unit tested on the host target.

use std::collections::{HashMap, HashSet};

use serde_json::Value as Json;

use crate::error::ListError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Replace,
    Append,
    Prepend,
    MergeAppend,
    MergePrepend,
}

impl Strategy {
    /// `window=` is required for every strategy except pure `replace`.
    pub fn requires_window(&self) -> bool {
        !matches!(self, Strategy::Replace)
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, Strategy::MergeAppend | Strategy::MergePrepend)
    }
}

/// Parse the `strategy` attribute value: `replace` (default), `append`,
/// `prepend`, or either of the latter two composed with `merge` in either
/// token order (`merge append`, `append merge`).
pub fn parse_strategy(input: &str) -> Option<Strategy> {
    let tokens: HashSet<String> = input
        .split_whitespace()
        .map(|s| s.to_ascii_lowercase())
        .collect();
    if tokens.is_empty() || tokens.contains("replace") {
        return Some(Strategy::Replace);
    }
    let merge = tokens.contains("merge");
    let append = tokens.contains("append");
    let prepend = tokens.contains("prepend");
    match (merge, append, prepend) {
        (true, true, false) => Some(Strategy::MergeAppend),
        (true, false, true) => Some(Strategy::MergePrepend),
        (false, true, false) => Some(Strategy::Append),
        (false, false, true) => Some(Strategy::Prepend),
        _ => None,
    }
}

/// The parsed left-hand side of `for="item in rhs"` or `for="item,key in rhs"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForLhs {
    pub item_var: String,
    pub key_var: Option<String>,
}

/// Parse the `for` attribute's `<lhs> in <rhs>` shape. Returns the lhs and
/// the unparsed rhs expression source (compiled separately by the
/// expression layer).
pub fn parse_for_attribute(input: &str) -> Option<(ForLhs, String)> {
    let idx = input.find(" in ")?;
    let (lhs, rhs) = input.split_at(idx);
    let rhs = rhs[4..].trim().to_string();
    let lhs = lhs.trim();
    let (item_var, key_var) = match lhs.split_once(',') {
        Some((item, key)) => (item.trim().to_string(), Some(key.trim().to_string())),
        None => (lhs.to_string(), None),
    };
    if item_var.is_empty() {
        return None;
    }
    Some((ForLhs { item_var, key_var }, rhs))
}

/// One item about to be reconciled into the rendered set: its derived key
/// (`None` stands for a null/undefined/empty key — spec's "Key validation"
/// rejects the whole batch if any item has one) and its value.
#[derive(Debug, Clone)]
pub struct ListItem {
    pub key: Option<String>,
    pub value: Json,
}

/// The result of one reconciliation: what to remove, what to add (in
/// render order), what to update in place (merge only), and the resulting
/// full key order so the caller can assert/maintain DOM node order.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub removed: Vec<String>,
    pub added: Vec<(String, Json)>,
    pub updated: Vec<(String, Json)>,
    pub order: Vec<String>,
}

/// Validate and, for merge strategies, de-duplicate an incoming batch.
/// Non-merge strategies reject a batch containing a duplicate key
/// outright (validated collectively, per spec); merge strategies instead
/// keep the last occurrence of each key ("last one wins").
fn validate_keys(items: &[ListItem], dedup: bool) -> Result<Vec<(String, Json)>, ListError> {
    let mut out: Vec<(String, Json)> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (index, item) in items.iter().enumerate() {
        let key = match &item.key {
            Some(k) if !k.is_empty() => k.clone(),
            _ => return Err(ListError::EmptyKey { index }),
        };
        if let Some(&pos) = seen.get(&key) {
            if dedup {
                out[pos] = (key, item.value.clone());
                continue;
            }
            return Err(ListError::DuplicateKey { key });
        }
        seen.insert(key.clone(), out.len());
        out.push((key, item.value.clone()));
    }
    Ok(out)
}

/// Trim `order` down to `window` entries, removing from the head for an
/// append-direction arrival and from the tail for a prepend-direction
/// arrival ("trimming happens from the opposite end"). Returns the keys
/// that were trimmed.
fn trim_window(order: &mut Vec<String>, window: Option<usize>, trim_from_head: bool) -> Vec<String> {
    let Some(w) = window else { return Vec::new() };
    if order.len() <= w {
        return Vec::new();
    }
    let excess = order.len() - w;
    if trim_from_head {
        order.drain(0..excess).collect()
    } else {
        order.split_off(order.len() - excess)
    }
}

/// Reconcile `current_order` (the previously rendered key sequence) against
/// `incoming` under `strategy`, producing a [`Patch`]. `window` is ignored
/// for [`Strategy::Replace`] (spec: window is only meaningful — and
/// required — for the other three).
pub fn reconcile(
    strategy: Strategy,
    window: Option<usize>,
    current_order: &[String],
    incoming: &[ListItem],
) -> Result<Patch, ListError> {
    match strategy {
        Strategy::Replace => {
            let items = validate_keys(incoming, false)?;
            let order: Vec<String> = items.iter().map(|(k, _)| k.clone()).collect();
            Ok(Patch {
                removed: current_order.to_vec(),
                added: items,
                updated: Vec::new(),
                order,
            })
        }
        Strategy::Append | Strategy::Prepend => {
            let items = validate_keys(incoming, false)?;
            let mut order = current_order.to_vec();
            if strategy == Strategy::Append {
                order.extend(items.iter().map(|(k, _)| k.clone()));
            } else {
                let mut new_order: Vec<String> = items.iter().map(|(k, _)| k.clone()).collect();
                new_order.extend(order);
                order = new_order;
            }
            let trim_from_head = strategy == Strategy::Append;
            let removed = trim_window(&mut order, window, trim_from_head);
            Ok(Patch {
                removed,
                added: items,
                updated: Vec::new(),
                order,
            })
        }
        Strategy::MergeAppend | Strategy::MergePrepend => {
            let items = validate_keys(incoming, true)?;
            let existing: HashSet<&str> = current_order.iter().map(|s| s.as_str()).collect();
            let mut added = Vec::new();
            let mut updated = Vec::new();
            for (key, value) in &items {
                if existing.contains(key.as_str()) {
                    updated.push((key.clone(), value.clone()));
                } else {
                    added.push((key.clone(), value.clone()));
                }
            }
            let mut order = current_order.to_vec();
            if strategy == Strategy::MergeAppend {
                order.extend(added.iter().map(|(k, _)| k.clone()));
            } else {
                let mut new_order: Vec<String> = added.iter().map(|(k, _)| k.clone()).collect();
                new_order.extend(order);
                order = new_order;
            }
            let trim_from_head = strategy == Strategy::MergeAppend;
            let removed = trim_window(&mut order, window, trim_from_head);
            Ok(Patch {
                removed,
                added,
                updated,
                order,
            })
        }
    }
}

/// Whether an incoming right-hand-side value iterates as a batch of
/// multiple items, a single synthetic item, or (object without a key
/// variable) is rejected outright.
pub fn items_from_value(value: &Json, key_var_declared: bool, key_expr: Option<&str>) -> Result<Vec<(Option<String>, Json)>, ListError> {
    match value {
        Json::Array(arr) => Ok(arr
            .iter()
            .enumerate()
            .map(|(i, v)| (key_expr.is_none().then(|| i.to_string()), v.clone()))
            .collect()),
        Json::Object(map) => {
            if !key_var_declared {
                return Err(ListError::ObjectRequiresKeyVariable);
            }
            Ok(map
                .iter()
                .map(|(k, v)| (Some(k.clone()), v.clone()))
                .collect())
        }
        Json::Null => Ok(vec![(None, Json::Null)]),
        other => Ok(vec![(key_expr.is_none().then(|| "0".to_string()), other.clone())]),
    }
}

/// DOM-observable events an `<insert>` element fires, in the ordering rule
/// the list engine guarantees within one flush: `remove` before
/// `add`/`update`/`empty`.
#[derive(Debug, Clone, PartialEq)]
pub enum ListEvent {
    Init { count: usize },
    Add { items: Vec<Json> },
    Update { items: Vec<Json> },
    Remove { keys: Vec<String> },
    Empty,
    Error(ListError),
    Clear,
}

/// Order the emitted events for one flush per the documented rule:
/// removals first, then slot reconciliation (handled by the caller between
/// these two groups), then init/add/update/empty.
pub fn events_for_patch(patch: &Patch, was_empty_before: bool, first_nonempty_render: bool) -> Vec<ListEvent> {
    let mut events = Vec::new();
    if !patch.removed.is_empty() {
        events.push(ListEvent::Remove { keys: patch.removed.clone() });
    }
    if first_nonempty_render && !patch.order.is_empty() {
        events.push(ListEvent::Init { count: patch.order.len() });
    }
    if !patch.added.is_empty() {
        events.push(ListEvent::Add {
            items: patch.added.iter().map(|(_, v)| v.clone()).collect(),
        });
    }
    if !patch.updated.is_empty() {
        events.push(ListEvent::Update {
            items: patch.updated.iter().map(|(_, v)| v.clone()).collect(),
        });
    }
    if patch.order.is_empty() && !was_empty_before {
        events.push(ListEvent::Empty);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn items(pairs: &[(&str, i64)]) -> Vec<ListItem> {
        pairs
            .iter()
            .map(|(k, v)| ListItem {
                key: Some(k.to_string()),
                value: serde_json::json!({"id": k, "v": v}),
            })
            .collect()
    }

    #[test]
    fn parses_strategy_tokens() {
        assert_eq!(parse_strategy(""), Some(Strategy::Replace));
        assert_eq!(parse_strategy("append"), Some(Strategy::Append));
        assert_eq!(parse_strategy("merge append"), Some(Strategy::MergeAppend));
        assert_eq!(parse_strategy("prepend merge"), Some(Strategy::MergePrepend));
        assert_eq!(parse_strategy("bogus"), None);
    }

    #[test]
    fn parses_for_attribute_with_and_without_key_var() {
        let (lhs, rhs) = parse_for_attribute("item in @src.items").unwrap();
        assert_eq!(lhs, ForLhs { item_var: "item".into(), key_var: None });
        assert_eq!(rhs, "@src.items");

        let (lhs, _) = parse_for_attribute("row, id in @src.rows").unwrap();
        assert_eq!(lhs, ForLhs { item_var: "row".into(), key_var: Some("id".into()) });
    }

    /// Seed scenario 3: replace list.
    #[test]
    fn replace_emits_remove_then_add_for_disjoint_sets() {
        let current = vec!["1".to_string(), "2".to_string()];
        let incoming = items(&[("2", 0), ("3", 0)]);
        let patch = reconcile(Strategy::Replace, None, &current, &incoming).unwrap();
        assert_eq!(patch.removed, vec!["1", "2"]);
        assert_eq!(patch.order, vec!["2", "3"]);
        let events = events_for_patch(&patch, false, false);
        assert_eq!(
            events,
            vec![
                ListEvent::Remove { keys: vec!["1".into(), "2".into()] },
                ListEvent::Add {
                    items: patch.added.iter().map(|(_, v)| v.clone()).collect()
                },
            ]
        );
    }

    /// Seed scenario 4: append+merge with window=2.
    #[test]
    fn merge_append_with_window_trims_head_and_updates_in_place() {
        let mut order: Vec<String> = Vec::new();

        let p1 = reconcile(Strategy::MergeAppend, Some(2), &order, &items(&[("1", 0)])).unwrap();
        order = p1.order.clone();
        assert_eq!(order, vec!["1"]);

        let p2 = reconcile(Strategy::MergeAppend, Some(2), &order, &items(&[("2", 0)])).unwrap();
        order = p2.order.clone();
        assert_eq!(order, vec!["1", "2"]);

        let p3 = reconcile(Strategy::MergeAppend, Some(2), &order, &items(&[("1", 1)])).unwrap();
        order = p3.order.clone();
        assert_eq!(order, vec!["1", "2"]);
        assert_eq!(p3.updated.len(), 1);
        assert!(p3.added.is_empty());

        let p4 = reconcile(Strategy::MergeAppend, Some(2), &order, &items(&[("3", 0)])).unwrap();
        order = p4.order.clone();
        assert_eq!(order, vec!["2", "3"]);
        assert_eq!(p4.removed, vec!["1"]);
    }

    #[test]
    fn non_merge_strategies_reject_duplicate_keys_in_batch() {
        let err = reconcile(Strategy::Append, None, &[], &items(&[("1", 0), ("1", 1)])).unwrap_err();
        assert!(matches!(err, ListError::DuplicateKey { .. }));
    }

    #[test]
    fn merge_strategy_dedupes_last_one_wins_within_batch() {
        let batch = vec![
            ListItem { key: Some("1".into()), value: serde_json::json!(1) },
            ListItem { key: Some("1".into()), value: serde_json::json!(2) },
        ];
        let patch = reconcile(Strategy::MergeAppend, Some(5), &[], &batch).unwrap();
        assert_eq!(patch.added.len(), 1);
        assert_eq!(patch.added[0].1, serde_json::json!(2));
    }

    #[test]
    fn empty_key_is_rejected() {
        let batch = vec![ListItem { key: None, value: Json::Null }];
        let err = reconcile(Strategy::Replace, None, &[], &batch).unwrap_err();
        assert!(matches!(err, ListError::EmptyKey { index: 0 }));
    }

    #[test]
    fn prepend_trims_from_tail() {
        let current = vec!["a".to_string(), "b".to_string()];
        let incoming = items(&[("c", 0)]);
        let patch = reconcile(Strategy::Prepend, Some(2), &current, &incoming).unwrap();
        assert_eq!(patch.order, vec!["c", "a"]);
        assert_eq!(patch.removed, vec!["b"]);
    }

    #[test]
    fn object_rhs_without_key_variable_is_rejected() {
        let value = serde_json::json!({"a": 1});
        let err = items_from_value(&value, false, None).unwrap_err();
        assert!(matches!(err, ListError::ObjectRequiresKeyVariable));
    }

    #[test]
    fn null_rhs_becomes_single_item_iteration() {
        let items = items_from_value(&Json::Null, false, None).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].1, Json::Null);
    }

    #[test]
    fn array_rhs_without_key_expr_keys_by_index() {
        let value = serde_json::json!(["x", "y"]);
        let items = items_from_value(&value, false, None).unwrap();
        assert_eq!(items[0].0, Some("0".to_string()));
        assert_eq!(items[1].0, Some("1".to_string()));
    }
}
