//! The server-side reply reorderer (`AsyncServerReply` in the source):
//! assigns monotonically increasing request IDs and guarantees bytes
//! reach the wire in strictly increasing ID order regardless of which
//! order handlers actually finish in.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dest {
    Wire,
    Queued,
}

/// Per-connection reply reorderer. `take_ready_bytes` drains whatever
/// has reached the front of the queue (or been written straight
/// through) since the last call, for the caller to push onto the
/// connection's write buffer.
pub struct ReplyReorderer {
    gen_id: u64,
    next_id: u64,
    queue: BTreeMap<u64, Vec<u8>>,
    prev_id: Option<u64>,
    prev_dest: Dest,
    wire: Vec<u8>,
}

impl ReplyReorderer {
    pub fn new() -> Self {
        Self {
            gen_id: 0,
            next_id: 0,
            queue: BTreeMap::new(),
            prev_id: None,
            prev_dest: Dest::Wire,
            wire: Vec::new(),
        }
    }

    /// Assigns the next request ID and advances the generator.
    pub fn gen_id(&mut self) -> u64 {
        let id = self.gen_id;
        self.gen_id += 1;
        id
    }

    /// Appends `data` as (part of) the reply for `id`, sent immediately
    /// if this is the head of the queue, otherwise buffered until its
    /// turn comes.
    pub fn send(&mut self, id: u64, data: &[u8]) {
        if self.prev_id == Some(id) {
            match self.prev_dest {
                Dest::Wire => self.wire.extend_from_slice(data),
                Dest::Queued => {
                    self.queue.entry(id).or_default().extend_from_slice(data);
                }
            }
            return;
        }

        self.drain_ready();

        if id == self.next_id {
            self.wire.extend_from_slice(data);
            self.next_id += 1;
            self.drain_ready();
            self.prev_dest = Dest::Wire;
        } else {
            self.queue.entry(id).or_default().extend_from_slice(data);
            self.prev_dest = Dest::Queued;
        }
        self.prev_id = Some(id);
    }

    /// Drains every reply that has reached the front of the queue.
    pub fn send_end(&mut self) {
        self.drain_ready();
    }

    /// Same routing as [`ReplyReorderer::send`], but does not disturb the
    /// `prev_id`/`prev_dest` fast path, and only advances `next_id` when
    /// `last` is true. Multiple `deferred_send` calls for the same `id`
    /// append to its buffer in call order.
    pub fn deferred_send(&mut self, id: u64, data: &[u8], last: bool) {
        if id == self.next_id {
            self.wire.extend_from_slice(data);
            if last {
                self.next_id += 1;
                self.drain_ready();
            }
        } else {
            self.queue.entry(id).or_default().extend_from_slice(data);
            if last {
                // Stays queued; send_end/deferred_end will drain it once
                // it reaches the head.
            }
        }
        if self.prev_id == Some(id) {
            self.prev_id = None;
        }
    }

    /// Declares that `id` will never produce a reply (the command that
    /// generated it carried `noreply`). If `id` is the most recently
    /// generated, unused ID, the generator simply rolls back; otherwise a
    /// zero-byte placeholder is queued so the gap is skipped over once
    /// `next_id` reaches it.
    pub fn nosend(&mut self, id: u64) {
        if id + 1 == self.gen_id {
            self.gen_id -= 1;
            self.queue.remove(&id);
            if self.prev_id == Some(id) {
                self.prev_id = None;
            }
            return;
        }
        if id == self.next_id {
            self.next_id += 1;
            self.drain_ready();
        } else {
            self.queue.entry(id).or_insert_with(Vec::new);
        }
    }

    fn drain_ready(&mut self) {
        while let Some((&id, _)) = self.queue.iter().next() {
            if id != self.next_id {
                break;
            }
            let data = self.queue.remove(&id).unwrap();
            self.wire.extend_from_slice(&data);
            self.next_id += 1;
        }
    }

    /// Drains and returns whatever has reached the wire since the last
    /// call.
    pub fn take_ready_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.wire)
    }

    #[cfg(test)]
    fn is_sorted_and_above_next_id(&self) -> bool {
        let mut prev = None;
        for &id in self.queue.keys() {
            if id <= self.next_id.saturating_sub(1) && self.next_id > 0 {
                return false;
            }
            if let Some(p) = prev {
                if id <= p {
                    return false;
                }
            }
            prev = Some(id);
        }
        true
    }
}

impl Default for ReplyReorderer {
    fn default() -> Self {
        Self::new()
    }
}
