//! Path parsing, duration parsing, deep get/set, and structural clone over
//! `serde_json::Value` — the leaf utilities every other module builds on.

use serde_json::Value;

/// One segment of a dotted/bracketed path: `user.email`, `items[0]`, `a["b"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parse `a.b[0]["c"]` into its segments. Never fails — an unparseable
/// trailing fragment is dropped rather than erroring, mirroring the host
/// engine's tolerance for malformed reference tails (spec.md §7: reference
/// errors degrade gracefully rather than throwing).
pub fn parse_path(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    let bytes = path.as_bytes();
    let mut i = 0;
    let mut current = String::new();

    fn flush(current: &mut String, segments: &mut Vec<PathSegment>) {
        if !current.is_empty() {
            segments.push(PathSegment::Key(std::mem::take(current)));
        }
    }

    while i < bytes.len() {
        match bytes[i] {
            b'.' => {
                flush(&mut current, &mut segments);
                i += 1;
            }
            b'[' => {
                flush(&mut current, &mut segments);
                i += 1;
                let start = i;
                while i < bytes.len() && bytes[i] != b']' {
                    i += 1;
                }
                let inner = &path[start..i.min(path.len())];
                let inner = inner.trim();
                let inner = inner
                    .strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .or_else(|| inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
                    .unwrap_or(inner);
                if let Ok(idx) = inner.parse::<usize>() {
                    segments.push(PathSegment::Index(idx));
                } else if !inner.is_empty() {
                    segments.push(PathSegment::Key(inner.to_string()));
                }
                i += 1; // skip ']'
            }
            b => {
                current.push(b as char);
                i += 1;
            }
        }
    }
    flush(&mut current, &mut segments);
    segments
}

/// Case-insensitive key lookup inside a JSON object: states alias reads and
/// writes of a different case back to the originally-seeded key
/// (spec.md §4.E step 2).
fn find_object_key<'a>(map: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    if map.contains_key(key) {
        return Some(key);
    }
    map.keys()
        .find(|k| k.eq_ignore_ascii_case(key))
        .map(|s| s.as_str())
}

/// Read a value at `path` from `root`. Missing intermediate keys/indices
/// yield `Value::Null` rather than an error.
pub fn deep_get(root: &Value, path: &[PathSegment]) -> Value {
    let mut cur = root;
    for seg in path {
        cur = match (cur, seg) {
            (Value::Object(map), PathSegment::Key(k)) => match find_object_key(map, k) {
                Some(real_key) => &map[real_key],
                None => return Value::Null,
            },
            (Value::Array(arr), PathSegment::Index(i)) => match arr.get(*i) {
                Some(v) => v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    cur.clone()
}

/// Write `value` at `path` inside `root`, creating intermediate objects as
/// needed (spec.md §4.G `model`: "writes to the state at the path, creating
/// intermediate objects if missing"). Returns the top-level key that was
/// touched, if any, so callers can mark it pending.
pub fn deep_set(root: &mut Value, path: &[PathSegment], value: Value) -> Option<String> {
    if path.is_empty() {
        return None;
    }
    let top_level = match &path[0] {
        PathSegment::Key(k) => Some(k.clone()),
        PathSegment::Index(_) => None,
    };

    let mut cur = root;
    for (i, seg) in path.iter().enumerate() {
        let last = i == path.len() - 1;
        match seg {
            PathSegment::Key(k) => {
                if !cur.is_object() {
                    *cur = Value::Object(serde_json::Map::new());
                }
                let map = cur.as_object_mut().unwrap();
                let real_key = find_object_key(map, k).map(|s| s.to_string());
                let real_key = real_key.unwrap_or_else(|| k.clone());
                if last {
                    map.insert(real_key, value);
                    return top_level;
                }
                cur = map.entry(real_key).or_insert(Value::Null);
            }
            PathSegment::Index(idx) => {
                if !cur.is_array() {
                    *cur = Value::Array(Vec::new());
                }
                let arr = cur.as_array_mut().unwrap();
                while arr.len() <= *idx {
                    arr.push(Value::Null);
                }
                if last {
                    arr[*idx] = value;
                    return top_level;
                }
                cur = &mut arr[*idx];
            }
        }
    }
    top_level
}

/// A parsed `every <duration>` entry: `500ms`, `30s`, `5m`, `1h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Duration {
    pub millis: u64,
}

/// Parse `<number><unit>` with units `ms|s|m|h`, case-insensitive, optional
/// whitespace between the number and the unit. Grammar is pinned by
/// SPEC_FULL.md §11 (spec.md left the exact grammar unspecified).
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    let split_at = input.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (num_part, unit_part) = input.split_at(split_at);
    let num: f64 = num_part.trim().parse().ok()?;
    let unit = unit_part.trim().to_ascii_lowercase();
    let millis = match unit.as_str() {
        "ms" => num,
        "s" => num * 1_000.0,
        "m" => num * 60_000.0,
        "h" => num * 3_600_000.0,
        _ => return None,
    };
    if millis < 0.0 || !millis.is_finite() {
        return None;
    }
    Some(Duration {
        millis: millis.round() as u64,
    })
}

/// Split a comma-separated attribute value (`persist`, `persist-url`,
/// `fetch`) into trimmed, non-empty entries.
pub fn split_csv(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// A value "coerces to a primitive" for string-context interpolation when it
/// contains one of the canonical single-value keys, or exactly one key
/// (spec.md §4.B).
const CANONICAL_KEYS: [&str; 4] = ["title", "text", "name", "value"];

pub fn canonical_scalar(map: &serde_json::Map<String, Value>) -> Option<Value> {
    for key in CANONICAL_KEYS {
        if let Some(v) = map.get(key) {
            return Some(v.clone());
        }
    }
    if map.len() == 1 {
        return map.values().next().cloned();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_plain_dotted_path() {
        assert_eq!(
            parse_path("user.email"),
            vec![
                PathSegment::Key("user".into()),
                PathSegment::Key("email".into())
            ]
        );
    }

    #[test]
    fn parses_bracket_index_and_quoted_key() {
        assert_eq!(
            parse_path(r#"items[0]["title"]"#),
            vec![
                PathSegment::Key("items".into()),
                PathSegment::Index(0),
                PathSegment::Key("title".into()),
            ]
        );
    }

    #[test]
    fn deep_get_missing_path_is_null() {
        let root = serde_json::json!({"a": {"b": 1}});
        assert_eq!(deep_get(&root, &parse_path("a.c")), Value::Null);
        assert_eq!(deep_get(&root, &parse_path("z.q")), Value::Null);
    }

    #[test]
    fn deep_get_is_case_insensitive_on_the_seeded_key() {
        let root = serde_json::json!({"Counter": 3});
        assert_eq!(deep_get(&root, &parse_path("counter")), serde_json::json!(3));
    }

    #[test]
    fn deep_set_creates_intermediate_objects() {
        let mut root = Value::Null;
        let top = deep_set(&mut root, &parse_path("user.email"), serde_json::json!("a@b.com"));
        assert_eq!(top, Some("user".to_string()));
        assert_eq!(root, serde_json::json!({"user": {"email": "a@b.com"}}));
    }

    #[test]
    fn deep_set_creates_intermediate_arrays() {
        let mut root = Value::Null;
        deep_set(&mut root, &parse_path("items[2]"), serde_json::json!("x"));
        assert_eq!(root, serde_json::json!({"items": [null, null, "x"]}));
    }

    #[test]
    fn deep_set_preserves_existing_case_alias() {
        let mut root = serde_json::json!({"Counter": 1});
        deep_set(&mut root, &parse_path("counter"), serde_json::json!(2));
        assert_eq!(root, serde_json::json!({"Counter": 2}));
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("500ms").unwrap().millis, 500);
        assert_eq!(parse_duration("30s").unwrap().millis, 30_000);
        assert_eq!(parse_duration("5m").unwrap().millis, 300_000);
        assert_eq!(parse_duration("1h").unwrap().millis, 3_600_000);
        assert_eq!(parse_duration("2.5s").unwrap().millis, 2_500);
        assert_eq!(parse_duration(" 10 s ").unwrap().millis, 10_000);
        assert!(parse_duration("abc").is_none());
        assert!(parse_duration("10").is_none());
    }

    #[test]
    fn splits_csv_lists() {
        assert_eq!(split_csv("a, b ,c"), vec!["a", "b", "c"]);
        assert_eq!(split_csv(""), Vec::<String>::new());
    }

    #[test]
    fn canonical_scalar_prefers_named_keys() {
        let map = serde_json::json!({"title": "Hi", "other": 1});
        let map = map.as_object().unwrap();
        assert_eq!(canonical_scalar(map), Some(serde_json::json!("Hi")));
    }

    #[test]
    fn canonical_scalar_falls_back_to_sole_key() {
        let map = serde_json::json!({"count": 5});
        let map = map.as_object().unwrap();
        assert_eq!(canonical_scalar(map), Some(serde_json::json!(5)));
    }

    #[test]
    fn canonical_scalar_none_when_ambiguous() {
        let map = serde_json::json!({"a": 1, "b": 2});
        let map = map.as_object().unwrap();
        assert_eq!(canonical_scalar(map), None);
    }
}
