//! `ClientAttachment`: the handle a client shares with the event loop it
//! runs on. Attaching one client to another's loop is how a handler
//! fans a request out to a back-end connection without spinning up a
//! second reactor -- the "attach semantics" described in §2 as "sharing
//! a `LocalSet`/task-spawn handle rather than a bespoke reactor."

use std::any::Any;
use std::sync::Arc;

/// Opaque handle to whatever task-spawning facility the owning runtime
/// crate provides (a `tokio::task::LocalSet`, an `async-std` executor
/// handle, ...). `mctext-core` never looks inside it; it only clones and
/// compares it so that `attach_to` can be checked against the "before
/// any connect_*" invariant.
#[derive(Clone)]
pub struct LoopHandle(Arc<dyn Any + Send + Sync>);

impl LoopHandle {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        LoopHandle(Arc::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LoopHandle(..)")
    }
}
