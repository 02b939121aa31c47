//! Process-wide, call-site-configurable knobs. There is no config file and
//! no build step; a host page passes an `EngineConfig` to `init` and the
//! engine stashes it in a thread-local for the rest of the session.

use std::cell::RefCell;
use std::rc::Rc;

/// The durable-storage key prefix (`"<prefix>:<name>:<key>"`). Pinned by
/// the external-interfaces table rather than user-configurable, but kept
/// as a named constant so tests and `state_def` can reference it by name
/// instead of an inline literal.
pub const STORAGE_PREFIX: &str = "jtx";

const DEFAULT_FETCH_IDLE_TIMEOUT_MS: u32 = 200;

#[derive(Clone, Default)]
pub struct EngineConfig {
    /// Installed via `set_html_sanitizer`; identity when absent. An `Rc<dyn
    /// Fn>` rather than a bare fn pointer so the `setHtmlSanitizer` entry
    /// point can wrap an arbitrary host-page JS callback, not just a
    /// statically known Rust function.
    pub html_sanitizer: Option<Rc<dyn Fn(&str) -> String>>,
    /// Fallback delay for the `idle` fetch mode on engines without
    /// `requestIdleCallback`. `None` takes the 200ms default.
    pub fetch_idle_timeout_ms: Option<u32>,
}

thread_local! {
    static ACTIVE: RefCell<EngineConfig> = RefCell::new(EngineConfig::default());
}

pub fn install(config: EngineConfig) {
    ACTIVE.with(|c| *c.borrow_mut() = config);
}

pub fn set_html_sanitizer(sanitizer: impl Fn(&str) -> String + 'static) {
    ACTIVE.with(|c| c.borrow_mut().html_sanitizer = Some(Rc::new(sanitizer)));
}

/// Set only the idle-fetch-timeout knob, leaving any already-installed
/// sanitizer untouched — unlike `install`, which replaces the whole
/// config wholesale and is meant for test setup/reset, not the `init(root,
/// options?)` entry point (`setHtmlSanitizer` and the `options` argument
/// to `init` can be called in either order without one clobbering the
/// other).
pub fn set_fetch_idle_timeout_ms(ms: u32) {
    ACTIVE.with(|c| c.borrow_mut().fetch_idle_timeout_ms = Some(ms));
}

pub fn sanitize_html(raw: &str) -> String {
    ACTIVE.with(|c| match &c.borrow().html_sanitizer {
        Some(f) => f(raw),
        None => raw.to_string(),
    })
}

pub fn fetch_idle_timeout_ms() -> u32 {
    ACTIVE.with(|c| c.borrow().fetch_idle_timeout_ms.unwrap_or(DEFAULT_FETCH_IDLE_TIMEOUT_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_idle_timeout_is_200ms() {
        install(EngineConfig::default());
        assert_eq!(fetch_idle_timeout_ms(), 200);
    }

    #[test]
    fn custom_idle_timeout_overrides_default() {
        install(EngineConfig {
            html_sanitizer: None,
            fetch_idle_timeout_ms: Some(50),
        });
        assert_eq!(fetch_idle_timeout_ms(), 50);
        install(EngineConfig::default());
    }

    #[test]
    fn sanitizer_defaults_to_identity() {
        install(EngineConfig::default());
        assert_eq!(sanitize_html("<b>x</b>"), "<b>x</b>");
    }
}
