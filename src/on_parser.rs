//! Parses the raw `on` attribute string into `(event, code)` pairs.
//!
//! Character-by-character scan tracking quote state (single, double, and
//! back-tick with `${…}` interpolation depth) and bracket/brace/paren
//! depth, so a semicolon or colon inside a string literal, a ternary, or an
//! object literal in handler code never gets mistaken for a clause
//! separator.

#[derive(Debug, Clone, PartialEq)]
pub struct OnEntry {
    pub event: String,
    pub code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
    Backtick,
}

/// Parse `click: @ui.counter++; mouseenter: @ui.hover = true` into entries.
/// A continuation segment with no top-level colon is appended (with a `;`
/// separator) to the previous entry's code, so a handler may span multiple
/// semicolon-delimited clauses without repeating its event name. Entries
/// whose code is empty after trimming are dropped.
pub fn parse_on_attribute(input: &str) -> Result<Vec<OnEntry>, crate::error::OnParseError> {
    use crate::error::OnParseError as E;

    let chars: Vec<char> = input.chars().collect();
    let mut entries: Vec<OnEntry> = Vec::new();
    let mut quote = Quote::None;
    let mut backtick_depth = 0i32; // depth of `${` inside a backtick string
    let mut bracket_depth = 0i32;
    let mut current_event: Option<String> = None;
    let mut buf = String::new();

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match quote {
            Quote::None => match c {
                '\'' => {
                    quote = Quote::Single;
                    buf.push(c);
                }
                '"' => {
                    quote = Quote::Double;
                    buf.push(c);
                }
                '`' => {
                    quote = Quote::Backtick;
                    buf.push(c);
                }
                '(' | '[' | '{' => {
                    bracket_depth += 1;
                    buf.push(c);
                }
                ')' | ']' | '}' => {
                    bracket_depth -= 1;
                    buf.push(c);
                }
                ':' if bracket_depth == 0 && current_event.is_none() => {
                    current_event = Some(buf.trim().to_string());
                    buf.clear();
                }
                ';' if bracket_depth == 0 => {
                    flush_entry(&mut entries, &mut current_event, &mut buf);
                }
                _ => buf.push(c),
            },
            Quote::Single => {
                buf.push(c);
                if c == '\\' && i + 1 < chars.len() {
                    i += 1;
                    buf.push(chars[i]);
                } else if c == '\'' {
                    quote = Quote::None;
                }
            }
            Quote::Double => {
                buf.push(c);
                if c == '\\' && i + 1 < chars.len() {
                    i += 1;
                    buf.push(chars[i]);
                } else if c == '"' {
                    quote = Quote::None;
                }
            }
            Quote::Backtick => {
                buf.push(c);
                if c == '\\' && i + 1 < chars.len() {
                    i += 1;
                    buf.push(chars[i]);
                } else if c == '`' && backtick_depth == 0 {
                    quote = Quote::None;
                } else if c == '$' && chars.get(i + 1) == Some(&'{') {
                    backtick_depth += 1;
                    buf.push('{');
                    i += 1;
                } else if c == '}' && backtick_depth > 0 {
                    backtick_depth -= 1;
                }
            }
        }
        i += 1;
    }

    if quote != Quote::None {
        return Err(E::UnterminatedString);
    }
    if bracket_depth != 0 {
        return Err(E::UnbalancedDelimiter);
    }

    flush_entry(&mut entries, &mut current_event, &mut buf);

    Ok(entries)
}

/// Flush whatever has accumulated since the last semicolon. A segment that
/// never saw a top-level colon (`current_event` still `None`) is a bare
/// continuation: its code is appended to the previous entry rather than
/// starting a new one, so a handler can span multiple semicolon-delimited
/// clauses without repeating its event name.
fn flush_entry(entries: &mut Vec<OnEntry>, current_event: &mut Option<String>, buf: &mut String) {
    let code = buf.trim().to_string();
    buf.clear();
    if code.is_empty() {
        *current_event = None;
        return;
    }
    match current_event.take() {
        Some(event) => entries.push(OnEntry { event, code }),
        None => {
            if let Some(last) = entries.last_mut() {
                last.code.push(';');
                last.code.push_str(&code);
            }
        }
    }
}

/// Whether an entry's event name is actually a periodic `every <duration>`
/// trigger rather than a DOM event name.
pub fn is_every_entry(event: &str) -> Option<&str> {
    event.strip_prefix("every").map(|rest| rest.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_entries() {
        let entries = parse_on_attribute("click: @ui.n++; mouseenter: @ui.hover = true").unwrap();
        assert_eq!(
            entries,
            vec![
                OnEntry { event: "click".into(), code: "@ui.n++".into() },
                OnEntry { event: "mouseenter".into(), code: "@ui.hover = true".into() },
            ]
        );
    }

    #[test]
    fn colon_inside_ternary_is_not_a_separator() {
        let entries = parse_on_attribute("click: @ui.x = @ui.y ? 1 : 2").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].code, "@ui.x = @ui.y ? 1 : 2");
    }

    #[test]
    fn semicolon_inside_string_is_not_a_separator() {
        let entries = parse_on_attribute(r#"click: emit('go', "a;b")"#).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].code, r#"emit('go', "a;b")"#);
    }

    #[test]
    fn continuation_without_colon_joins_previous_entry() {
        let entries = parse_on_attribute("click: @ui.a++; @ui.b++").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "click");
        assert_eq!(entries[0].code, "@ui.a++;@ui.b++");
    }

    #[test]
    fn empty_code_entries_are_dropped() {
        let entries = parse_on_attribute("click: ; mouseenter: @ui.hover = true").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "mouseenter");
    }

    #[test]
    fn detects_every_duration_entries() {
        assert_eq!(is_every_entry("every 30s"), Some("30s"));
        assert_eq!(is_every_entry("click"), None);
    }

    #[test]
    fn unbalanced_bracket_is_an_error() {
        assert!(matches!(
            parse_on_attribute("click: foo(1, 2"),
            Err(crate::error::OnParseError::UnbalancedDelimiter)
        ));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(matches!(
            parse_on_attribute("click: 'abc"),
            Err(crate::error::OnParseError::UnterminatedString)
        ));
    }
}
