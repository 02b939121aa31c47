//! The dependency graph and the microtask-batched render scheduler.
//!
//! Two indices (`binding_deps`, `dep_bindings`) let either direction of the
//! binding/dependency relationship be walked, as the design notes call for.
//! A binding's edges are rebuilt from scratch on every rerun by recording
//! whichever definitions its update function actually reads through
//! `current_binding`/`record_dependency`, so conditional reads stay
//! accurate without any manual unsubscribe bookkeeping.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};

use crate::registry::DefId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(pub u64);

/// Bidirectional binding/dependency index.
#[derive(Default)]
pub struct DepGraph {
    binding_deps: HashMap<BindingId, HashSet<DefId>>,
    dep_bindings: HashMap<DefId, HashSet<BindingId>>,
}

impl DepGraph {
    /// Replace `binding`'s entire dependency set. Called once per rerun
    /// with whatever was recorded during that rerun — this is the
    /// "rebuilt fresh on each update" rule that makes conditional reads
    /// work without stale edges lingering.
    pub fn set_deps(&mut self, binding: BindingId, deps: HashSet<DefId>) {
        if let Some(old) = self.binding_deps.remove(&binding) {
            for d in old {
                if let Some(set) = self.dep_bindings.get_mut(&d) {
                    set.remove(&binding);
                }
            }
        }
        for &d in &deps {
            self.dep_bindings.entry(d).or_default().insert(binding);
        }
        self.binding_deps.insert(binding, deps);
    }

    pub fn bindings_for(&self, dep: DefId) -> Vec<BindingId> {
        self.dep_bindings
            .get(&dep)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn deps_for(&self, binding: BindingId) -> Vec<DefId> {
        self.binding_deps
            .get(&binding)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn remove_binding(&mut self, binding: BindingId) {
        if let Some(old) = self.binding_deps.remove(&binding) {
            for d in old {
                if let Some(set) = self.dep_bindings.get_mut(&d) {
                    set.remove(&binding);
                }
            }
        }
    }

    /// A definition left the registry: drop it from every binding's
    /// recorded set too, so a stale `DefId` never resurfaces in
    /// `bindings_for` after reuse of the same numeric id is impossible
    /// (ids are never reused, but the edge would otherwise dangle forever).
    pub fn remove_definition(&mut self, dep: DefId) {
        if let Some(bindings) = self.dep_bindings.remove(&dep) {
            for b in bindings {
                if let Some(set) = self.binding_deps.get_mut(&b) {
                    set.remove(&dep);
                }
            }
        }
    }
}

thread_local! {
    static NEXT_BINDING_ID: Cell<u64> = Cell::new(0);
    /// The binding currently executing its update function, if any. Reads
    /// of definitions route through `record_dependency` while this is set.
    static CURRENT_BINDING: RefCell<Option<BindingId>> = RefCell::new(None);
    static PENDING_DEPS: RefCell<HashSet<DefId>> = RefCell::new(HashSet::new());
    static RENDER_SCHEDULED: Cell<bool> = Cell::new(false);
}

pub fn new_binding_id() -> BindingId {
    NEXT_BINDING_ID.with(|c| {
        let id = c.get();
        c.set(id + 1);
        BindingId(id)
    })
}

/// Run `f` as the body of `binding`'s update, recording every definition it
/// reads, then commit the fresh dependency set to the graph. Returns
/// whatever `f` returns.
pub fn with_binding_scope<R>(binding: BindingId, f: impl FnOnce() -> R) -> R {
    CURRENT_BINDING.with(|c| *c.borrow_mut() = Some(binding));
    PENDING_DEPS.with(|c| c.borrow_mut().clear());
    let result = f();
    let deps = PENDING_DEPS.with(|c| std::mem::take(&mut *c.borrow_mut()));
    CURRENT_BINDING.with(|c| *c.borrow_mut() = None);
    crate::registry::with_engine(|e| e.deps.set_deps(binding, deps));
    result
}

/// Called by the scope resolver / reference proxies whenever a definition
/// is actually read. A no-op outside a binding's update scope (e.g. state
/// initialization, which intentionally does not establish reactivity over
/// its own seeding expressions).
pub fn record_dependency(def: DefId) {
    CURRENT_BINDING.with(|c| {
        if c.borrow().is_some() {
            PENDING_DEPS.with(|p| {
                p.borrow_mut().insert(def);
            });
        }
    });
}

/// Ensure at most one render microtask is pending. On `wasm32` this should
/// queue a real microtask (`wasm_bindgen_futures::spawn_local` resolving an
/// already-ready future, or `queueMicrotask` via `js_sys`); the pure-Rust
/// test profile runs the flush synchronously through `flush_now` instead,
/// since there is no event loop to hand a microtask to.
pub fn schedule_render() {
    let already = RENDER_SCHEDULED.with(|c| c.replace(true));
    if already {
        return;
    }
    #[cfg(target_arch = "wasm32")]
    {
        crate::dom::queue_microtask(flush_now);
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        flush_now();
    }
}

/// Run one flush cycle: persist/URL-sync changed state keys and fire their
/// `update` events, then rerun every binding attached to a changed
/// dependency exactly once. Writes performed by a rerun mark their own
/// dependencies changed again, but are *not* reflushed in this same call —
/// `schedule_render` will be invoked again by those writes and will pick
/// them up on the next microtask, which is what keeps the system's
/// progress monotonic.
pub fn flush_now() {
    RENDER_SCHEDULED.with(|c| c.set(false));

    let pending_state_ids = crate::registry::with_engine(|e| e.states_with_pending());
    for id in pending_state_ids {
        #[cfg(target_arch = "wasm32")]
        crate::state_def::flush_pending(id);
        #[cfg(not(target_arch = "wasm32"))]
        crate::registry::with_engine(|e| {
            e.state_by_id_mut(id).pending_keys.clear();
        });
    }

    let changed = crate::registry::with_engine(|e| e.take_changed());
    if changed.is_empty() {
        return;
    }
    let mut to_run: Vec<BindingId> = Vec::new();
    let mut seen = HashSet::new();
    crate::registry::with_engine(|e| {
        for dep in changed {
            for b in e.deps.bindings_for(dep) {
                if seen.insert(b) {
                    to_run.push(b);
                }
            }
        }
    });
    to_run.sort();
    #[cfg(target_arch = "wasm32")]
    for b in to_run {
        crate::bindings::run_binding(b);
    }
    #[cfg(not(target_arch = "wasm32"))]
    let _ = to_run;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dep_graph_is_bidirectional() {
        let mut g = DepGraph::default();
        let b = BindingId(1);
        let d = DefId::State(7);
        g.set_deps(b, HashSet::from([d]));
        assert_eq!(g.bindings_for(d), vec![b]);
        assert_eq!(g.deps_for(b), vec![d]);
    }

    #[test]
    fn set_deps_replaces_prior_edges() {
        let mut g = DepGraph::default();
        let b = BindingId(1);
        let d1 = DefId::State(1);
        let d2 = DefId::State(2);
        g.set_deps(b, HashSet::from([d1]));
        g.set_deps(b, HashSet::from([d2]));
        assert!(g.bindings_for(d1).is_empty());
        assert_eq!(g.bindings_for(d2), vec![b]);
    }

    #[test]
    fn remove_binding_clears_both_indices() {
        let mut g = DepGraph::default();
        let b = BindingId(1);
        let d = DefId::State(1);
        g.set_deps(b, HashSet::from([d]));
        g.remove_binding(b);
        assert!(g.bindings_for(d).is_empty());
        assert!(g.deps_for(b).is_empty());
    }
}
