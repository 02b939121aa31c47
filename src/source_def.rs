//! Source definition lifecycle: transport selection, the fetch/stream
//! paths, the status machine, and status-slot visibility.

#![cfg(target_arch = "wasm32")]

use std::cell::RefCell;
use std::collections::HashMap;

use serde_json::Value as Json;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;
use web_sys::{Element, EventSource, Headers, Request, RequestInit, RequestMode, Response, WebSocket};

use crate::error::SourceError;
use crate::expr::{self, CompileMode};
use crate::registry::{with_engine, DefId, SourceKind, SourceStatus};
use crate::util;

/// Which automatic-fetch triggers (`fetch=` attribute) apply to an HTTP
/// source; streaming sources ignore this entirely (they open once).
#[derive(Debug, Clone, Default)]
pub struct FetchModes {
    pub onload: bool,
    pub idle: bool,
    pub visible: bool,
    pub manual: bool,
    pub every_ms: Option<u64>,
}

pub fn parse_fetch_modes(input: &str) -> FetchModes {
    let mut modes = FetchModes::default();
    let entries = util::split_csv(input);
    if entries.is_empty() {
        modes.onload = true;
        return modes;
    }
    for entry in &entries {
        if let Some(rest) = entry.strip_prefix("every") {
            if let Some(d) = util::parse_duration(rest.trim()) {
                modes.every_ms = Some(d.millis);
            }
            continue;
        }
        match entry.as_str() {
            "onload" => modes.onload = true,
            "idle" => modes.idle = true,
            "visible" => modes.visible = true,
            "manual" => modes.manual = true,
            other => tracing::warn!(mode = other, "unrecognized fetch mode"),
        }
    }
    modes
}

fn classify_url(url: &str) -> (SourceKind, String) {
    if let Some(rest) = url.strip_prefix("sse:") {
        (SourceKind::Sse, rest.to_string())
    } else if url.starts_with("ws:") || url.starts_with("wss:") {
        (SourceKind::Ws, normalize_ws_url(url))
    } else {
        (SourceKind::Http, url.to_string())
    }
}

fn normalize_ws_url(url: &str) -> String {
    if url.starts_with("ws:") || url.starts_with("wss:") {
        return url.to_string();
    }
    let window = web_sys::window();
    let origin = window
        .and_then(|w| w.location().origin().ok())
        .unwrap_or_default();
    let is_https = origin.starts_with("https:");
    let scheme = if is_https { "wss" } else { "ws" };
    let host = origin.splitn(2, "://").nth(1).unwrap_or_default();
    format!("{scheme}://{host}{url}")
}

struct Runtime {
    interval_handle: Option<i32>,
    idle_timeout_handle: Option<i32>,
    intersection_observer: Option<web_sys::IntersectionObserver>,
    event_source: Option<EventSource>,
    socket: Option<WebSocket>,
    headers_expr: Option<String>,
    select: Option<String>,
    sse_event: Option<String>,
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime {
            interval_handle: None,
            idle_timeout_handle: None,
            intersection_observer: None,
            event_source: None,
            socket: None,
            headers_expr: None,
            select: None,
            sse_event: None,
        }
    }
}

thread_local! {
    static RUNTIMES: RefCell<HashMap<u64, Runtime>> = RefCell::new(HashMap::new());
}

const SLOT_TAGS: [&str; 3] = ["loading", "error", "empty"];

/// Initialize a `<src name="..." url="...">` element.
pub fn init_source(el: &Element, name: &str, url: &str, scoped: bool) -> Option<DefId> {
    let (kind, effective_url) = classify_url(url);
    let def = with_engine(|e| e.create_source(name, &effective_url, kind, scoped))?;
    let id = def.id();

    let select = el.get_attribute("select");
    let sse_event = el.get_attribute("sse-event");
    let headers_expr = el.get_attribute("headers");

    with_engine(|e| {
        let rec = e.source_by_id_mut(id);
        rec.select = select.clone();
        rec.sse_event = sse_event.clone();
    });

    RUNTIMES.with(|r| {
        r.borrow_mut().insert(
            id,
            Runtime {
                select,
                sse_event,
                headers_expr,
                ..Default::default()
            },
        )
    });

    for tag in SLOT_TAGS {
        if let Ok(Some(slot)) = el.query_selector(tag) {
            let _ = slot.set_attribute("hidden", "");
        }
    }

    crate::dom::register_scope(el, name, def);
    let el_for_cleanup = el.clone();
    crate::dom::on_removed(el, move || {
        teardown_runtime(id);
        with_engine(|e| e.destroy_source(id));
        crate::dom::unregister_def_element(DefId::Source(id));
        let _ = &el_for_cleanup;
    });

    crate::dom::dispatch_event(el, "init", &serde_json::json!({"name": name}));

    match kind {
        SourceKind::Http => {
            let modes = el
                .get_attribute("fetch")
                .map(|v| parse_fetch_modes(&v))
                .unwrap_or_else(|| parse_fetch_modes(""));
            arm_http_modes(el, id, &modes);
        }
        SourceKind::Sse => open_sse(el, id, &effective_url),
        SourceKind::Ws => open_ws(el, id, &effective_url),
    }

    Some(def)
}

fn arm_http_modes(el: &Element, id: u64, modes: &FetchModes) {
    if modes.onload {
        let el = el.clone();
        crate::dom::queue_microtask(move || fetch_now(&el, id));
    }
    if modes.idle {
        let el = el.clone();
        schedule_idle_fetch(el, id);
    }
    if modes.visible {
        arm_visible_fetch(el, id);
    }
    if let Some(ms) = modes.every_ms {
        arm_interval_fetch(el, id, ms);
    }
}

fn schedule_idle_fetch(el: Element, id: u64) {
    let window = web_sys::window().expect("window must exist");
    let closure = Closure::once(move || fetch_now(&el, id));
    let _ = window.set_timeout_with_callback_and_timeout_and_arguments_0(
        closure.as_ref().unchecked_ref(),
        crate::config::fetch_idle_timeout_ms() as i32,
    );
    closure.forget();
}

fn arm_visible_fetch(el: &Element, id: u64) {
    let el_for_fetch = el.clone();
    let fired = std::rc::Rc::new(std::cell::Cell::new(false));
    let fired_inner = fired.clone();
    let closure = Closure::<dyn FnMut(js_sys::Array, web_sys::IntersectionObserver)>::new(
        move |entries: js_sys::Array, observer: web_sys::IntersectionObserver| {
            if fired_inner.get() {
                return;
            }
            for entry in entries.iter() {
                if let Ok(entry) = entry.dyn_into::<web_sys::IntersectionObserverEntry>() {
                    if entry.is_intersecting() {
                        fired_inner.set(true);
                        fetch_now(&el_for_fetch, id);
                        observer.disconnect();
                    }
                }
            }
        },
    );
    if let Ok(observer) = web_sys::IntersectionObserver::new(closure.as_ref().unchecked_ref()) {
        observer.observe(el);
        RUNTIMES.with(|r| {
            if let Some(rt) = r.borrow_mut().get_mut(&id) {
                rt.intersection_observer = Some(observer);
            }
        });
    }
    closure.forget();
}

fn arm_interval_fetch(el: &Element, id: u64, every_ms: u64) {
    let window = web_sys::window().expect("window must exist");
    let el = el.clone();
    let closure = Closure::<dyn FnMut()>::new(move || fetch_now(&el, id));
    if let Ok(handle) =
        window.set_interval_with_callback_and_timeout_and_arguments_0(closure.as_ref().unchecked_ref(), every_ms as i32)
    {
        RUNTIMES.with(|r| {
            if let Some(rt) = r.borrow_mut().get_mut(&id) {
                rt.interval_handle = Some(handle);
            }
        });
    }
    closure.forget();
}

fn teardown_runtime(id: u64) {
    let rt = RUNTIMES.with(|r| r.borrow_mut().remove(&id));
    let Some(rt) = rt else { return };
    if let Some(handle) = rt.interval_handle {
        if let Some(window) = web_sys::window() {
            window.clear_interval_with_handle(handle);
        }
    }
    if let Some(handle) = rt.idle_timeout_handle {
        if let Some(window) = web_sys::window() {
            window.clear_timeout_with_handle(handle);
        }
    }
    if let Some(observer) = rt.intersection_observer {
        observer.disconnect();
    }
    if let Some(es) = rt.event_source {
        es.close();
    }
    if let Some(ws) = rt.socket {
        let _ = ws.close();
    }
}

/// Drive the status machine and reconcile slot visibility in one step, so
/// the two can never be observed out of sync.
fn update_status(el: &Element, id: u64, status: SourceStatus, error: Option<SourceError>) {
    with_engine(|e| {
        let rec = e.source_by_id_mut(id);
        rec.status = status;
        rec.error = error.clone();
        e.mark_changed(DefId::Source(id));
    });
    crate::reactive::schedule_render();

    let value_empty = with_engine(|e| {
        let rec = e.source_by_id(id);
        matches!(&rec.value, Json::Null) || matches!(&rec.value, Json::Array(a) if a.is_empty())
    });

    crate::dom::set_status_slot(el, "loading", status == SourceStatus::Loading);
    crate::dom::set_status_slot(el, "error", error.is_some());
    crate::dom::set_status_slot(el, "empty", status == SourceStatus::Ready && value_empty);
}

fn apply_select(value: Json, select: Option<&str>) -> Json {
    match select {
        Some(path) => util::deep_get(&value, &util::parse_path(path)),
        None => value,
    }
}

struct NoopHelpers;
impl expr::HelperHost for NoopHelpers {
    fn call(&mut self, name: &str, _args: Vec<crate::refs::Value>) -> Result<crate::refs::Value, crate::error::EvalError> {
        Err(crate::error::EvalError::UnknownHelper(name.to_string()))
    }
}

fn eval_headers(el: &Element, headers_expr: Option<&str>) -> Option<Json> {
    let src = headers_expr?;
    let compiled = expr::compile(src, CompileMode::Expression).ok()?;
    let mut resolver = crate::scope::ElementScope::new(el.clone());
    let mut helpers = NoopHelpers;
    let mut ctx = expr::EvalCtx::new(&mut resolver, &mut helpers);
    compiled.eval(&mut ctx).ok().map(|v| v.to_json())
}

fn fetch_now(el: &Element, id: u64) {
    let url = with_engine(|e| e.source_by_id(id).url.clone());
    let headers_expr = RUNTIMES.with(|r| r.borrow().get(&id).and_then(|rt| rt.headers_expr.clone()));
    let headers_json = eval_headers(el, headers_expr.as_deref());

    update_status(el, id, SourceStatus::Loading, None);
    crate::dom::dispatch_event(
        el,
        "fetch",
        &serde_json::json!({"url": url, "headers": headers_json.clone().unwrap_or(Json::Null)}),
    );

    let el = el.clone();
    wasm_bindgen_futures::spawn_local(async move {
        let result = do_fetch(&url, headers_json.as_ref()).await;
        match result {
            Ok(body) => {
                let select = with_engine(|e| e.source_by_id(id).select.clone());
                let projected = apply_select(body, select.as_deref());
                with_engine(|e| {
                    let rec = e.source_by_id_mut(id);
                    rec.value = projected.clone();
                    e.mark_changed(DefId::Source(id));
                });
                crate::reactive::schedule_render();
                crate::dom::dispatch_event(&el, "update", &serde_json::json!({"name": source_name(id), "value": projected}));
                update_status(&el, id, SourceStatus::Ready, None);
            }
            Err(err) => {
                crate::dom::dispatch_event(
                    &el,
                    "error",
                    &serde_json::json!({"name": source_name(id), "type": err_kind(&err), "status": err.status, "message": err.message}),
                );
                update_status(&el, id, SourceStatus::Error, Some(err));
            }
        }
    });
}

fn source_name(id: u64) -> String {
    with_engine(|e| e.source_by_id(id).name.clone())
}

fn err_kind(err: &SourceError) -> &'static str {
    match err.kind {
        crate::error::SourceErrorKindTag::Network => "network",
        crate::error::SourceErrorKindTag::Format => "format",
        crate::error::SourceErrorKindTag::Connection => "connection",
    }
}

async fn do_fetch(url: &str, headers: Option<&Json>) -> Result<Json, SourceError> {
    do_http("GET", url, None, headers).await
}

/// The general-purpose request used by both `<src>`'s own fetch path and
/// the `on` handler HTTP helpers (`get`/`post`/`put`/`patch`/`del`).
pub async fn do_http(method: &str, url: &str, body: Option<&Json>, headers: Option<&Json>) -> Result<Json, SourceError> {
    let window = web_sys::window().ok_or_else(|| SourceError::network(None, "no window"))?;

    let mut init = RequestInit::new();
    init.method(method);
    init.mode(RequestMode::Cors);
    if let Some(Json::Object(map)) = headers {
        let hdrs = Headers::new().map_err(|_| SourceError::network(None, "could not build headers"))?;
        for (k, v) in map {
            let _ = hdrs.set(k, &v.as_str().map(|s| s.to_string()).unwrap_or_else(|| v.to_string()));
        }
        init.headers(&hdrs);
    }
    if let Some(body) = body {
        init.body(Some(&JsValue::from_str(&body.to_string())));
    }

    let request = Request::new_with_str_and_init(url, &init).map_err(|_| SourceError::network(None, "could not build request"))?;

    let resp_value = JsFuture::from(window.fetch_with_request(&request))
        .await
        .map_err(|e| SourceError::network(None, js_error_message(&e)))?;
    let response: Response = resp_value.dyn_into().map_err(|_| SourceError::network(None, "not a Response"))?;

    let status = response.status();
    if !response.ok() {
        return Err(SourceError::network(Some(status), format!("HTTP {status}")));
    }

    let text_value = JsFuture::from(
        response
            .text()
            .map_err(|e| SourceError::network(Some(status), js_error_message(&e)))?,
    )
    .await
    .map_err(|e| SourceError::network(Some(status), js_error_message(&e)))?;
    let text = text_value.as_string().unwrap_or_default();

    if status == 204 || text.trim().is_empty() {
        return Ok(Json::Null);
    }
    serde_json::from_str::<Json>(&text).map_err(|e| SourceError::format(e.to_string(), Some(text)))
}

fn js_error_message(v: &JsValue) -> String {
    v.as_string().unwrap_or_else(|| "fetch failed".to_string())
}

fn open_sse(el: &Element, id: u64, url: &str) {
    let es = match EventSource::new(url) {
        Ok(es) => es,
        Err(_) => {
            update_status(el, id, SourceStatus::Error, Some(SourceError::connection("could not open EventSource")));
            return;
        }
    };
    update_status(el, id, SourceStatus::Loading, None);

    let sse_event = RUNTIMES.with(|r| r.borrow().get(&id).and_then(|rt| rt.sse_event.clone()));
    let event_name = sse_event.clone().unwrap_or_else(|| "message".to_string());

    {
        let el = el.clone();
        let onopen = Closure::<dyn FnMut(web_sys::Event)>::new(move |_| {
            update_status(&el, id, SourceStatus::Ready, None);
            crate::dom::dispatch_event(&el, "open", &serde_json::json!({"name": source_name(id), "type": "sse"}));
        });
        es.set_onopen(Some(onopen.as_ref().unchecked_ref()));
        onopen.forget();
    }
    {
        let el = el.clone();
        let handler = Closure::<dyn FnMut(web_sys::MessageEvent)>::new(move |ev: web_sys::MessageEvent| {
            handle_message(&el, id, message_event_data(&ev), Some(ev.last_event_id()));
        });
        let _ = es.add_event_listener_with_callback(&event_name, handler.as_ref().unchecked_ref());
        handler.forget();
    }
    {
        let el = el.clone();
        let onerror = Closure::<dyn FnMut(web_sys::Event)>::new(move |_| {
            update_status(&el, id, SourceStatus::Error, Some(SourceError::connection("SSE transport error")));
            crate::dom::dispatch_event(&el, "error", &serde_json::json!({"name": source_name(id), "type": "connection", "message": "SSE transport error"}));
        });
        es.set_onerror(Some(onerror.as_ref().unchecked_ref()));
        onerror.forget();
    }

    for extra_event in additional_sse_events(el, &event_name) {
        let el = el.clone();
        let name = extra_event.clone();
        let listener = Closure::<dyn FnMut(web_sys::MessageEvent)>::new(move |ev: web_sys::MessageEvent| {
            crate::dom::dispatch_event(
                &el,
                &name,
                &serde_json::json!({"name": source_name(id), "type": name, "data": message_event_data(&ev), "lastEventId": ev.last_event_id()}),
            );
        });
        let _ = es.add_event_listener_with_callback(&extra_event, listener.as_ref().unchecked_ref());
        listener.forget();
    }

    RUNTIMES.with(|r| {
        if let Some(rt) = r.borrow_mut().get_mut(&id) {
            rt.event_source = Some(es);
        }
    });
}

/// Event names named in the `<src>`'s own `on` attribute beyond the configured
/// data event: subscribed as a listener-only fan-out, never touching `value`
/// or firing `update` (spec.md §4.F "Any additional event names found in the
/// source's own `on` attribute").
fn additional_sse_events(el: &Element, data_event: &str) -> Vec<String> {
    let Some(on_attr) = el.get_attribute("on") else { return Vec::new() };
    let Ok(entries) = crate::on_parser::parse_on_attribute(&on_attr) else { return Vec::new() };
    let mut names = Vec::new();
    for entry in entries {
        if crate::on_parser::is_every_entry(&entry.event).is_some() {
            continue;
        }
        if entry.event == data_event || names.contains(&entry.event) {
            continue;
        }
        names.push(entry.event);
    }
    names
}

fn message_event_data(ev: &web_sys::MessageEvent) -> String {
    ev.data().as_string().unwrap_or_default()
}

fn handle_message(el: &Element, id: u64, raw: String, last_event_id: Option<String>) {
    crate::dom::dispatch_event(
        el,
        "message",
        &serde_json::json!({"name": source_name(id), "type": "message", "data": raw, "lastEventId": last_event_id}),
    );

    let parsed = if raw.trim().is_empty() {
        Ok(Json::Null)
    } else {
        serde_json::from_str::<Json>(&raw)
    };

    match parsed {
        Ok(body) => {
            let select = with_engine(|e| e.source_by_id(id).select.clone());
            let projected = apply_select(body, select.as_deref());
            with_engine(|e| {
                let rec = e.source_by_id_mut(id);
                rec.value = projected.clone();
                e.mark_changed(DefId::Source(id));
            });
            crate::reactive::schedule_render();
            crate::dom::dispatch_event(el, "update", &serde_json::json!({"name": source_name(id), "value": projected}));
        }
        Err(err) => {
            let source_error = SourceError::format(err.to_string(), Some(raw));
            update_status(el, id, SourceStatus::Error, Some(source_error.clone()));
            crate::dom::dispatch_event(
                el,
                "error",
                &serde_json::json!({"name": source_name(id), "type": "format", "message": source_error.message}),
            );
        }
    }
}

fn open_ws(el: &Element, id: u64, url: &str) {
    let ws = match WebSocket::new(url) {
        Ok(ws) => ws,
        Err(_) => {
            update_status(el, id, SourceStatus::Error, Some(SourceError::connection("could not open WebSocket")));
            return;
        }
    };
    update_status(el, id, SourceStatus::Loading, None);

    {
        let el = el.clone();
        let onopen = Closure::<dyn FnMut(web_sys::Event)>::new(move |_| {
            update_status(&el, id, SourceStatus::Ready, None);
            crate::dom::dispatch_event(&el, "open", &serde_json::json!({"name": source_name(id), "type": "ws"}));
        });
        ws.set_onopen(Some(onopen.as_ref().unchecked_ref()));
        onopen.forget();
    }
    {
        let el = el.clone();
        let onmessage = Closure::<dyn FnMut(web_sys::MessageEvent)>::new(move |ev: web_sys::MessageEvent| {
            handle_message(&el, id, message_event_data(&ev), None);
        });
        ws.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));
        onmessage.forget();
    }
    {
        let el = el.clone();
        let onerror = Closure::<dyn FnMut(web_sys::Event)>::new(move |_| {
            update_status(&el, id, SourceStatus::Error, Some(SourceError::connection("WebSocket transport error")));
            crate::dom::dispatch_event(&el, "error", &serde_json::json!({"name": source_name(id), "type": "connection", "message": "WebSocket transport error"}));
        });
        ws.set_onerror(Some(onerror.as_ref().unchecked_ref()));
        onerror.forget();
    }
    {
        let el = el.clone();
        let onclose = Closure::<dyn FnMut(web_sys::CloseEvent)>::new(move |ev: web_sys::CloseEvent| {
            crate::dom::dispatch_event(&el, "close", &serde_json::json!({"name": source_name(id), "code": ev.code(), "reason": ev.reason()}));
        });
        ws.set_onclose(Some(onclose.as_ref().unchecked_ref()));
        onclose.forget();
    }

    RUNTIMES.with(|r| {
        if let Some(rt) = r.borrow_mut().get_mut(&id) {
            rt.socket = Some(ws);
        }
    });
}

/// `refresh()` — HTTP sources re-fetch; streaming sources tear down and
/// reopen (closing with code 1000 so the resulting `close` event is
/// distinguishable from a transport-error close).
pub fn refresh(def: DefId) {
    let DefId::Source(id) = def else { return };
    let Some(el) = crate::dom::element_for(def) else { return };
    let kind = with_engine(|e| e.source_by_id(id).kind);
    match kind {
        SourceKind::Http => fetch_now(&el, id),
        SourceKind::Sse => {
            let rt = RUNTIMES.with(|r| r.borrow_mut().get_mut(&id).map(|rt| rt.event_source.take()));
            if let Some(Some(es)) = rt {
                es.close();
            }
            let url = with_engine(|e| e.source_by_id(id).url.clone());
            crate::dom::dispatch_event(&el, "close", &serde_json::json!({"name": source_name(id), "code": 1000}));
            open_sse(&el, id, &url);
        }
        SourceKind::Ws => {
            let rt = RUNTIMES.with(|r| r.borrow_mut().get_mut(&id).map(|rt| rt.socket.take()));
            if let Some(Some(ws)) = rt {
                let _ = ws.close_with_code(1000);
            }
            let url = with_engine(|e| e.source_by_id(id).url.clone());
            open_ws(&el, id, &url);
        }
    }
}
