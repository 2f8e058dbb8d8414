//! Process-wide descriptor registry (spec §3 "Descriptor context", Design
//! Notes §9 "Global registry").
//!
//! The call-interception layer that routes a bare `close(2)`/`read(2)`/
//! `write(2)` to the right context is an external collaborator (spec §4.3)
//! and is not part of this crate. What this crate owns is the table that
//! collaborator would consult: "is this fd one of ours, what kind is it,
//! and is it still alive". Every descriptor kind registers itself here on
//! construction and removes itself on `Drop`.
//!
//! Entries are handed out as `Arc<Entry>`, per Design Notes §9
//! ("destruction of individual entries is ref-counted against in-flight
//! waits to avoid freeing a context while another thread is inside its
//! kqueue wait"): a lookup clones the `Arc` rather than borrowing from the
//! table, so a thread that obtained one mid-wait keeps that allocation
//! alive even if `unregister` runs concurrently and drops the table's own
//! reference. `unregister` additionally flips the entry's `alive` flag, so
//! a caller holding a stale clone can still tell the context is gone
//! without consulting the table again.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Which of the four descriptor families an fd belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    PollSet,
    Timer,
    Signal,
    Counter,
}

/// What the registry hands back for a lookup: the descriptor's kind, and
/// whether its context has since been dropped.
pub struct Entry {
    kind: Kind,
    alive: AtomicBool,
}

impl Entry {
    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

fn table() -> &'static Mutex<HashMap<RawFd, Arc<Entry>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<RawFd, Arc<Entry>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Record that `fd` is a descriptor of `kind`. Called once by each
/// context's constructor, after the backing kqueue handle is created.
/// Returns the registry's `Arc` for the entry; most callers discard it and
/// look it up again later through [`kind_of`].
pub fn register(fd: RawFd, kind: Kind) -> Arc<Entry> {
    let mut t = table().lock().unwrap();
    debug_assert!(
        !t.contains_key(&fd),
        "fd {} registered twice (kernel fd reuse without a prior unregister?)",
        fd
    );
    let entry = Arc::new(Entry {
        kind,
        alive: AtomicBool::new(true),
    });
    t.insert(fd, Arc::clone(&entry));
    log::trace!("registry: {:?} registered as {:?}", fd, kind);
    entry
}

/// Remove `fd`'s entry and mark it dead. Called from each context's `Drop`
/// impl, before the underlying fd is actually closed, so a recycled fd
/// number is never looked up against a stale kind. Any `Arc` a concurrent
/// reader already cloned out of the table stays valid — only its
/// `is_alive()` flips.
pub fn unregister(fd: RawFd) {
    if let Some(entry) = table().lock().unwrap().remove(&fd) {
        entry.alive.store(false, Ordering::Release);
        log::trace!("registry: {:?} unregistered", fd);
    }
}

/// What kind of descriptor `fd` is, if it's one of ours, as a cloned `Arc`
/// that outlives a concurrent `unregister` on the same fd.
pub fn kind_of(fd: RawFd) -> Option<Arc<Entry>> {
    table().lock().unwrap().get(&fd).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_unregister() {
        // Use a fd number guaranteed not to collide with other tests
        // running concurrently in this process.
        let fd = -(std::process::id() as RawFd) - 1000;

        assert!(kind_of(fd).is_none());
        let handle = register(fd, Kind::Timer);
        assert_eq!(handle.kind(), Kind::Timer);
        assert!(handle.is_alive());

        let looked_up = kind_of(fd).unwrap();
        assert_eq!(looked_up.kind(), Kind::Timer);

        unregister(fd);
        assert!(kind_of(fd).is_none());

        // A clone obtained before unregister stays valid and observes the
        // liveness flag flip, instead of dangling.
        assert!(!handle.is_alive());
        assert!(!looked_up.is_alive());
    }
}
