//! Process-wide registries: named definitions (state/source), the
//! binding-to-dependency graph, and the scheduler's pending-change set.
//!
//! The host page is single-threaded (the DOM event loop is the only
//! worker), so the engine lives behind one `thread_local` `RefCell` rather
//! than a `Mutex` — there is no concurrent access to race against, only
//! re-entrancy to guard against, which `with_engine` does by panicking on
//! nested borrow rather than deadlocking silently.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use serde_json::Value as Json;

use crate::error::SourceError;
use crate::reactive::{BindingId, DepGraph};

/// Identifies a single named (or scoped) definition. `id` is a monotonic
/// counter assigned at creation; `State`/`Source` distinguish the two
/// registry partitions named in the data model (a state and a source may
/// legally share a human-readable name since they're looked up through
/// different attribute namespaces, but never share a `DefId`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefId {
    State(u64),
    Source(u64),
}

impl DefId {
    pub fn id(&self) -> u64 {
        match self {
            DefId::State(id) | DefId::Source(id) => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Idle,
    Loading,
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Http,
    Sse,
    Ws,
}

/// A mutable key/value mapping bound to `@name` (data model §"State").
#[derive(Debug, Clone)]
pub struct StateRecord {
    pub id: u64,
    pub name: String,
    pub value: Json,
    pub persisted_keys: HashSet<String>,
    pub url_keys: HashSet<String>,
    pub pending_keys: HashSet<String>,
    /// `None` for globally registered states; scoped states (list item
    /// instances) never occupy a slot in `Engine::state_names`.
    pub scoped: bool,
}

impl StateRecord {
    fn new(id: u64, name: String) -> Self {
        StateRecord {
            id,
            name,
            value: Json::Object(serde_json::Map::new()),
            persisted_keys: HashSet::new(),
            url_keys: HashSet::new(),
            pending_keys: HashSet::new(),
            scoped: false,
        }
    }
}

/// A read-only value fed by an HTTP/SSE/WS transport (data model §"Source").
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub id: u64,
    pub name: String,
    pub url: String,
    pub kind: SourceKind,
    pub value: Json,
    pub status: SourceStatus,
    pub error: Option<SourceError>,
    pub select: Option<String>,
    pub sse_event: Option<String>,
    pub scoped: bool,
}

impl SourceRecord {
    fn new(id: u64, name: String, url: String, kind: SourceKind) -> Self {
        SourceRecord {
            id,
            name,
            url,
            kind,
            value: Json::Null,
            status: SourceStatus::Idle,
            error: None,
            select: None,
            sse_event: None,
            scoped: false,
        }
    }
}

/// The registry + dependency graph singleton. Everything that reads or
/// writes a definition, or reruns a binding, goes through here.
pub struct Engine {
    next_id: u64,
    states: HashMap<u64, StateRecord>,
    sources: HashMap<u64, SourceRecord>,
    /// name -> currently-registered global definition. Duplicate names are
    /// rejected at registration time (data model §"Definition names").
    state_names: HashMap<String, u64>,
    source_names: HashMap<String, u64>,
    /// Definitions whose value changed since the last flush; drained by
    /// the scheduler on each microtask.
    changed: HashSet<DefId>,
    pub deps: DepGraph,
}

impl Engine {
    fn new() -> Self {
        Engine {
            next_id: 0,
            states: HashMap::new(),
            sources: HashMap::new(),
            state_names: HashMap::new(),
            source_names: HashMap::new(),
            changed: HashSet::new(),
            deps: DepGraph::default(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Allocate a new state record. `name` is only entered into the global
    /// table when `scoped` is false; a duplicate global name is rejected
    /// (caller logs the warning) and `None` is returned.
    pub fn create_state(&mut self, name: &str, scoped: bool) -> Option<DefId> {
        if !scoped && self.state_names.contains_key(name) {
            return None;
        }
        let id = self.next_id();
        let mut rec = StateRecord::new(id, name.to_string());
        rec.scoped = scoped;
        self.states.insert(id, rec);
        if !scoped {
            self.state_names.insert(name.to_string(), id);
        }
        Some(DefId::State(id))
    }

    pub fn create_source(&mut self, name: &str, url: &str, kind: SourceKind, scoped: bool) -> Option<DefId> {
        if !scoped && self.source_names.contains_key(name) {
            return None;
        }
        let id = self.next_id();
        let mut rec = SourceRecord::new(id, name.to_string(), url.to_string(), kind);
        rec.scoped = scoped;
        self.sources.insert(id, rec);
        if !scoped {
            self.source_names.insert(name.to_string(), id);
        }
        Some(DefId::Source(id))
    }

    pub fn lookup_global_state(&self, name: &str) -> Option<DefId> {
        self.state_names.get(name).map(|id| DefId::State(*id))
    }

    pub fn lookup_global_source(&self, name: &str) -> Option<DefId> {
        self.source_names.get(name).map(|id| DefId::Source(*id))
    }

    pub fn state(&self, def: DefId) -> &StateRecord {
        self.states.get(&def.id()).expect("dangling StateHandle")
    }

    pub fn state_mut(&mut self, def: DefId) -> &mut StateRecord {
        self.states.get_mut(&def.id()).expect("dangling StateHandle")
    }

    pub fn source(&self, def: DefId) -> &SourceRecord {
        self.sources.get(&def.id()).expect("dangling SourceHandle")
    }

    pub fn source_mut(&mut self, def: DefId) -> &mut SourceRecord {
        self.sources.get_mut(&def.id()).expect("dangling SourceHandle")
    }

    pub fn source_by_id(&self, id: u64) -> &SourceRecord {
        self.sources.get(&id).expect("dangling source id")
    }

    pub fn source_by_id_mut(&mut self, id: u64) -> &mut SourceRecord {
        self.sources.get_mut(&id).expect("dangling source id")
    }

    pub fn mark_changed(&mut self, def: DefId) {
        self.changed.insert(def);
    }

    /// Drain the changed set, handing the caller ownership so a re-entrant
    /// write during the flush accumulates into a *fresh* set rather than
    /// being lost or re-processed in the same pass (concurrency model:
    /// "each flush consumes a finite changed-set").
    pub fn take_changed(&mut self) -> HashSet<DefId> {
        std::mem::take(&mut self.changed)
    }

    /// Every state whose `pending_keys` is non-empty, for the flush's
    /// persist/URL-sync/`update`-event step. Returns ids so the caller can
    /// re-borrow mutably per state without holding an aliasing iterator.
    pub fn states_with_pending(&self) -> Vec<u64> {
        self.states
            .iter()
            .filter(|(_, s)| !s.pending_keys.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn state_by_id(&self, id: u64) -> &StateRecord {
        self.states.get(&id).expect("dangling state id")
    }

    pub fn state_by_id_mut(&mut self, id: u64) -> &mut StateRecord {
        self.states.get_mut(&id).expect("dangling state id")
    }

    /// Destroy a definition when its defining element leaves the tree
    /// (data model lifecycle: "destroyed when that element leaves the
    /// tree"). A scoped definition is simply dropped; a global definition
    /// is only removed from the name table if it is still the current
    /// holder of that name (a later same-named definition may have already
    /// replaced it — unlikely since duplicates are rejected, but cheap to
    /// guard).
    pub fn destroy_state(&mut self, id: u64) {
        if let Some(rec) = self.states.remove(&id) {
            if let Some(held) = self.state_names.get(&rec.name) {
                if *held == id {
                    self.state_names.remove(&rec.name);
                }
            }
        }
        self.deps.remove_definition(DefId::State(id));
    }

    pub fn destroy_source(&mut self, id: u64) {
        if let Some(rec) = self.sources.remove(&id) {
            if let Some(held) = self.source_names.get(&rec.name) {
                if *held == id {
                    self.source_names.remove(&rec.name);
                }
            }
        }
        self.deps.remove_definition(DefId::Source(id));
    }

    pub fn remove_binding(&mut self, binding: BindingId) {
        self.deps.remove_binding(binding);
    }
}

thread_local! {
    static ENGINE: RefCell<Engine> = RefCell::new(Engine::new());
}

/// The single entry point for touching the registry. Borrows the
/// thread-local `RefCell` for the duration of `f`; a handler, binding
/// update, or scheduler step that tries to re-enter while already holding
/// the borrow panics immediately rather than silently deadlocking (there is
/// no deadlock possible on a single thread, only a `BorrowMutError`), which
/// is deliberate: it surfaces re-entrancy bugs in tests instead of hanging
/// a browser tab.
pub fn with_engine<R>(f: impl FnOnce(&mut Engine) -> R) -> R {
    ENGINE.with(|cell| f(&mut cell.borrow_mut()))
}

#[cfg(test)]
pub fn reset_for_test() {
    ENGINE.with(|cell| *cell.borrow_mut() = Engine::new());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_global_state_name_rejected() {
        reset_for_test();
        with_engine(|e| {
            assert!(e.create_state("ui", false).is_some());
            assert!(e.create_state("ui", false).is_none());
        });
    }

    #[test]
    fn scoped_states_never_collide_on_name() {
        reset_for_test();
        with_engine(|e| {
            assert!(e.create_state("ui", true).is_some());
            assert!(e.create_state("ui", true).is_some());
            assert!(e.lookup_global_state("ui").is_none());
        });
    }

    #[test]
    fn destroy_state_frees_the_name_for_reuse() {
        reset_for_test();
        with_engine(|e| {
            let a = e.create_state("ui", false).unwrap();
            e.destroy_state(a.id());
            assert!(e.lookup_global_state("ui").is_none());
            assert!(e.create_state("ui", false).is_some());
        });
    }
}
