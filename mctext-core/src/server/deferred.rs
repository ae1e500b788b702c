//! The deferred-reply lifetime machinery: a [`DeferredContext`] links a
//! handler-constructed [`DeferredReply`] back to its connection's reply
//! reorderer, and keeps working (as a silent no-op) even after the
//! connection that created it has been torn down.

use super::reorder::ReplyReorderer;
use crate::client::StoreResult;
use std::sync::{Arc, Mutex};

struct Inner {
    reorderer: Option<Arc<Mutex<ReplyReorderer>>>,
}

/// Reference-counted handle linking a handler's outstanding deferred
/// replies back to the connection's reorderer. Cloning shares the same
/// underlying state; the connection holds one clone, and each
/// [`DeferredReply`] holds another for as long as it lives. There is no
/// explicit refcount field: `Arc`'s own strong count plays that role,
/// and [`DeferredContext::detach`] is what actually matters --- it is
/// what turns every subsequent deferred send into a silent no-op.
#[derive(Clone)]
pub struct DeferredContext {
    inner: Arc<Mutex<Inner>>,
}

impl DeferredContext {
    pub fn new(reorderer: Arc<Mutex<ReplyReorderer>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                reorderer: Some(reorderer),
            })),
        }
    }

    /// Called when the owning connection is torn down. Further deferred
    /// sends through any still-outstanding `DeferredReply` become no-ops.
    pub fn detach(&self) {
        self.inner.lock().unwrap().reorderer = None;
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().unwrap().reorderer.is_some()
    }

    /// Diagnostic only: the number of live handles (the connection plus
    /// every outstanding `DeferredReply`), mirroring the source's manual
    /// refcount but backed by `Arc::strong_count`.
    pub fn live_handles(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    fn reorderer(&self) -> Option<Arc<Mutex<ReplyReorderer>>> {
        self.inner.lock().unwrap().reorderer.clone()
    }

    fn drain(&self) {
        if let Some(r) = self.reorderer() {
            r.lock().unwrap().send_end();
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ErrorReplyKind {
    ClientError,
    ServerError,
}

impl ErrorReplyKind {
    fn token(self) -> &'static str {
        match self {
            ErrorReplyKind::ClientError => "CLIENT_ERROR",
            ErrorReplyKind::ServerError => "SERVER_ERROR",
        }
    }
}

/// A deferred response under construction. Constructed by a handler when
/// it returns `ResponseResult::Deferred`; must receive exactly one
/// terminal `deferred_reply_*` call. If dropped without one (and the
/// connection is still attached), a `SERVER_ERROR` is emitted in its
/// place to keep the wire synchronized.
pub struct DeferredReply {
    context: DeferredContext,
    id: u64,
    finished: bool,
}

impl DeferredReply {
    pub(crate) fn new(context: DeferredContext, id: u64) -> Self {
        Self {
            context,
            id,
            finished: false,
        }
    }

    fn send(&mut self, data: &[u8], last: bool) {
        if let Some(r) = self.context.reorderer() {
            r.lock().unwrap().deferred_send(self.id, data, last);
        }
        if last {
            self.finished = true;
            self.context.drain();
        }
    }

    pub fn deferred_reply_store(mut self, result: StoreResult) {
        let line: &[u8] = match result {
            StoreResult::Stored => b"STORED\r\n",
            StoreResult::NotStored => b"NOT_STORED\r\n",
            StoreResult::Exists => b"EXISTS\r\n",
            StoreResult::NotFound => b"NOT_FOUND\r\n",
        };
        self.send(line, true);
    }

    pub fn deferred_reply_increment(mut self, value: Option<u64>) {
        match value {
            Some(v) => self.send(format!("{}\r\n", v).as_bytes(), true),
            None => self.send(b"NOT_FOUND\r\n", true),
        }
    }

    pub fn deferred_reply_delete(mut self, found: bool) {
        self.send(if found { b"DELETED\r\n" } else { b"NOT_FOUND\r\n" }, true);
    }

    pub fn deferred_reply_touch(mut self, found: bool) {
        self.send(if found { b"TOUCHED\r\n" } else { b"NOT_FOUND\r\n" }, true);
    }

    /// Emits one `VALUE` line plus its body. Does not terminate the
    /// reply; the handler must still call `deferred_reply_get_end`.
    pub fn deferred_reply_get(&mut self, key: &[u8], value: &[u8], flags: u32, cas_id: Option<u64>) {
        let header = match cas_id {
            Some(cas) => format!(
                "VALUE {} {} {} {}\r\n",
                String::from_utf8_lossy(key),
                flags,
                value.len(),
                cas
            ),
            None => format!("VALUE {} {} {}\r\n", String::from_utf8_lossy(key), flags, value.len()),
        };
        self.send(header.as_bytes(), false);
        self.send(value, false);
        self.send(b"\r\n", false);
    }

    pub fn deferred_reply_get_end(mut self) {
        self.send(b"END\r\n", true);
    }

    pub fn deferred_reply_error(mut self, kind: ErrorReplyKind, msg: &str) {
        let line = format!("{} {}\r\n", kind.token(), msg);
        self.send(line.as_bytes(), true);
    }
}

impl Drop for DeferredReply {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(r) = self.context.reorderer() {
                r.lock().unwrap().deferred_send(self.id, b"SERVER_ERROR deferred reply unfinished\r\n", true);
            }
            self.context.drain();
        }
    }
}
