//! Reference proxies (spec.md §4.B) and the dynamically-typed `Value` the
//! bounded expression interpreter computes with.
//!
//! JS gives the original engine transparent property-read/write proxies for
//! free. Rust has no such thing, so per the Design Notes in spec.md §9 this
//! implementation "exposes explicit value accessors (`state.get(path)`,
//! `state.set(path, v)`)" and the expression compiler's rewrite targets
//! those accessor calls instead of a proxy object. `@name` still reads as a
//! plain reference to authors; only the compiled call shape differs from a
//! proxy-based target.

use serde_json::Value as Json;

use crate::error::{EvalError, SourceErrorKindTag};
use crate::registry::{with_engine, DefId};
use crate::util::{self, PathSegment};

/// The interpreter's runtime value. Plain JSON data plus the two proxy
/// kinds; a proxy collapses to `Json` as soon as one property access steps
/// past the definition's own top-level keys (spec.md §4.B: "Nested paths …
/// resolve through normal property access on the proxied value").
#[derive(Debug, Clone)]
pub enum Value {
    Json(Json),
    State(StateHandle),
    Source(SourceHandle),
}

impl Value {
    pub fn null() -> Self {
        Value::Json(Json::Null)
    }

    pub fn from_json(v: Json) -> Self {
        Value::Json(v)
    }

    pub fn bool(b: bool) -> Self {
        Value::Json(Json::Bool(b))
    }

    pub fn number(n: f64) -> Self {
        Value::Json(serde_json::Number::from_f64(n).map(Json::Number).unwrap_or(Json::Null))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::Json(Json::String(s.into()))
    }

    /// Coerce a proxy to a single scalar JSON value for string-context
    /// interpolation (spec.md §4.B canonical-key rule), or pass plain JSON
    /// values through unchanged.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Json(v) => v.clone(),
            Value::State(h) => h.coerce_scalar(),
            Value::Source(h) => h.value(),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self.to_json() {
            Json::Null => false,
            Json::Bool(b) => b,
            Json::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Json::String(s) => !s.is_empty(),
            Json::Array(_) | Json::Object(_) => true,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self.to_json() {
            Json::Number(n) => n.as_f64().unwrap_or(f64::NAN),
            Json::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            Json::String(s) => s.trim().parse().unwrap_or(f64::NAN),
            Json::Null => 0.0,
            _ => f64::NAN,
        }
    }

    pub fn as_string(&self) -> String {
        match self.to_json() {
            Json::String(s) => s,
            Json::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// Property/member read: `.prop` or `[computed]`. On a proxy this reads
    /// through to the live value (spec.md §4.B); on plain JSON it's a
    /// structural lookup via `util::deep_get`.
    pub fn get_prop(&self, prop: &str) -> Result<Value, EvalError> {
        match self {
            Value::State(h) => Ok(Value::Json(h.get(&util::parse_path(prop)))),
            Value::Source(h) => match prop {
                "$status" => Ok(Value::string(h.status_str())),
                "$error" => Ok(Value::Json(h.error_json())),
                _ => Ok(Value::Json(util::deep_get(&h.value(), &util::parse_path(prop)))),
            },
            Value::Json(v) => Ok(Value::Json(util::deep_get(v, &util::parse_path(prop)))),
        }
    }
}

/// A handle into the global/scoped state registry (spec.md §3 "State").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHandle(pub DefId);

impl StateHandle {
    pub fn get(&self, path: &[PathSegment]) -> Json {
        with_engine(|e| {
            let rec = e.state(self.0);
            util::deep_get(&rec.value, path)
        })
    }

    /// Property write: mutates the value, records the top-level key as
    /// pending, marks the definition changed, and schedules a render
    /// (spec.md §4.B).
    pub fn set(&self, path: &[PathSegment], value: Json) {
        with_engine(|e| {
            let top = {
                let rec = e.state_mut(self.0);
                util::deep_set(&mut rec.value, path, value)
            };
            if let Some(key) = top {
                e.state_mut(self.0).pending_keys.insert(key);
            }
            e.mark_changed(DefId::State(self.0.id()));
        });
        crate::reactive::schedule_render();
    }

    pub fn coerce_scalar(&self) -> Json {
        with_engine(|e| {
            let rec = e.state(self.0);
            match rec.value.as_object() {
                Some(map) => util::canonical_scalar(map).unwrap_or(Json::Object(map.clone())),
                None => rec.value.clone(),
            }
        })
    }

    pub fn name(&self) -> String {
        with_engine(|e| e.state(self.0).name.clone())
    }
}

/// A handle into the source registry (spec.md §3 "Source"). Read-only: no
/// `set`, matching spec.md §4.B ("Writing through a source reference is not
/// supported").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceHandle(pub DefId);

impl SourceHandle {
    pub fn value(&self) -> Json {
        with_engine(|e| e.source(self.0).value.clone())
    }

    pub fn status_str(&self) -> &'static str {
        with_engine(|e| match e.source(self.0).status {
            crate::registry::SourceStatus::Idle => "idle",
            crate::registry::SourceStatus::Loading => "loading",
            crate::registry::SourceStatus::Ready => "ready",
            crate::registry::SourceStatus::Error => "error",
        })
    }

    pub fn error_json(&self) -> Json {
        with_engine(|e| match &e.source(self.0).error {
            Some(err) => serde_json::to_value(err).unwrap_or(Json::Null),
            None => Json::Null,
        })
    }

    pub fn error_kind(&self) -> Option<SourceErrorKindTag> {
        with_engine(|e| e.source(self.0).error.as_ref().map(|e| e.kind))
    }

    pub fn name(&self) -> String {
        with_engine(|e| e.source(self.0).name.clone())
    }

    /// `refresh()` — re-trigger the fetch or tear-down-and-reopen the
    /// stream (spec.md §4.B, §5).
    pub fn refresh(&self) {
        crate::source_def::refresh(self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_truthiness_matches_js_semantics() {
        assert!(!Value::null().is_truthy());
        assert!(!Value::number(0.0).is_truthy());
        assert!(Value::number(1.0).is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(Value::string("x").is_truthy());
        assert!(Value::from_json(serde_json::json!([])).is_truthy());
    }

    #[test]
    fn value_as_f64_coerces_strings_and_bools() {
        assert_eq!(Value::string("3.5").as_f64(), 3.5);
        assert_eq!(Value::bool(true).as_f64(), 1.0);
        assert_eq!(Value::bool(false).as_f64(), 0.0);
        assert!(Value::string("nope").as_f64().is_nan());
    }

    #[test]
    fn value_get_prop_on_plain_json() {
        let v = Value::from_json(serde_json::json!({"a": {"b": 5}}));
        let inner = v.get_prop("a").unwrap();
        let leaf = inner.get_prop("b").unwrap();
        assert_eq!(leaf.to_json(), serde_json::json!(5));
    }
}
