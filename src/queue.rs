//! Per-connection message queue: strict arrival order plus a
//! priority-ordered view over the same entries (§4.2, §4.5).
//!
//! Grounded directly on `original_source/connection.c`'s rb-tree priority
//! queue (`kdbus_conn_queue_insert`/`kdbus_conn_queue_remove`): entries
//! sharing a priority value are chained off one tree node as a FIFO
//! sibling list, and the tree itself caches its leftmost (highest
//! priority) node so peek-by-priority never walks the tree. `BTreeMap<i64,
//! BTreeMap<u64, u64>>` is the safe-Rust analogue used here: the outer map
//! gives O(log n) first-key lookup, and keying each sibling list by this
//! queue's own arrival counter (rather than storing it as a `VecDeque`)
//! keeps removing one entry from the middle of a bucket O(log n) too,
//! instead of the linear scan a `VecDeque::remove` needs.

use std::collections::{BTreeMap, HashMap};

use crate::error::BusError;
use crate::resource::ResourceHolder;

/// One queued message: the encoded frame bytes plus any fds/memfds it
/// carries, not yet installed into the receiver.
#[derive(Debug)]
pub struct QueueEntry {
    pub id: u64,
    pub priority: i64,
    pub sender: u64,
    pub bytes: Vec<u8>,
    pub resources: ResourceHolder,
    /// True for entries synthesized by the bus itself (name-owner-changed,
    /// reply-timeout, peer-died) rather than relayed from another sender.
    pub synthetic: bool,
    /// Sequence number of the well-known name this entry was addressed to
    /// at send time, when the sender addressed it by name rather than by
    /// id (§3's "destination-name sequence number"). Lets activator
    /// handoff (§4.8) select only the entries addressed to the specific
    /// name being handed off, not every queued entry an activator happens
    /// to be holding for other names it also registered.
    pub name_sequence: Option<u64>,
    /// Cookie of the Reply Slot waiting on `sender`'s own connection for
    /// this entry's reply, when the sender set `EXPECT_REPLY` (§3's
    /// "optional back-pointer to a Reply Slot"). Activator handoff uses
    /// `(sender, reply_cookie)` to find that slot and retarget its `peer`
    /// to the new owner, since the entry moves to a different queue but
    /// the slot waiting for its answer does not.
    pub reply_cookie: Option<u64>,
    /// This queue's own arrival-order key, distinct from `id`: `reinsert`
    /// preserves the original `id` (so an outstanding reply back-pointer
    /// that names it stays valid) but must still order after every entry
    /// already present in the destination queue, so ordering needs its
    /// own counter independent of id reuse across queues.
    seq: u64,
}

/// FIFO-plus-priority message queue for a single connection.
///
/// Lower numeric priority sorts first (kdbus convention: priority is a
/// signed value and more negative is "more urgent"; the default priority
/// for ordinary sends is 0).
#[derive(Debug, Default)]
pub struct MessageQueue {
    next_id: u64,
    next_seq: u64,
    fifo: BTreeMap<u64, u64>,
    by_priority: BTreeMap<i64, BTreeMap<u64, u64>>,
    entries: HashMap<u64, QueueEntry>,
}

impl MessageQueue {
    pub fn new() -> Self {
        MessageQueue::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn fresh_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Enqueue a message, assigning it a fresh id. Returns the id so the
    /// caller can correlate a subsequent synchronous reply.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &mut self,
        priority: i64,
        sender: u64,
        bytes: Vec<u8>,
        resources: ResourceHolder,
        synthetic: bool,
        name_sequence: Option<u64>,
        reply_cookie: Option<u64>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.fresh_seq();

        self.fifo.insert(seq, id);
        self.by_priority.entry(priority).or_default().insert(seq, id);
        self.entries.insert(
            id,
            QueueEntry { id, priority, sender, bytes, resources, synthetic, name_sequence, reply_cookie, seq },
        );
        id
    }

    /// Look at (without removing) the oldest entry by arrival order.
    pub fn peek_fifo(&self) -> Option<&QueueEntry> {
        self.fifo.values().next().and_then(|id| self.entries.get(id))
    }

    /// Look at the highest-priority entry, i.e. the one at the cached
    /// leftmost position in the priority index. `floor` mirrors the
    /// kdbus `priority` receive-flag argument: when set, only an entry
    /// whose priority is `<= floor` satisfies the peek, else
    /// `BusError::NoMessage` (§7) is returned rather than falling back to
    /// FIFO order.
    pub fn peek_priority(&self, floor: Option<i64>) -> Result<Option<&QueueEntry>, BusError> {
        let Some((&top_priority, bucket)) = self.by_priority.iter().next() else {
            return Ok(None);
        };
        if let Some(floor) = floor {
            if top_priority > floor {
                return Err(BusError::NoMessage);
            }
        }
        let id = bucket.values().next().expect("priority bucket is never left empty");
        Ok(self.entries.get(id))
    }

    /// Remove and return the entry with `id`, dropping it from both
    /// indices. Mirrors `kdbus_conn_queue_remove`'s structural
    /// replacement: when the removed entry was the only one at its
    /// priority, the whole bucket is dropped so `by_priority`'s first key
    /// is always a live, non-empty bucket and the next `peek_priority`
    /// recomputes the cached-highest position for free via `BTreeMap`.
    /// Both index removals are direct key lookups (`entry.seq`), not a
    /// scan: O(log n) rather than O(n) in queue depth.
    pub fn remove(&mut self, id: u64) -> Option<QueueEntry> {
        let entry = self.entries.remove(&id)?;

        self.fifo.remove(&entry.seq);
        if let Some(bucket) = self.by_priority.get_mut(&entry.priority) {
            bucket.remove(&entry.seq);
            if bucket.is_empty() {
                self.by_priority.remove(&entry.priority);
            }
        }
        Some(entry)
    }

    /// Borrow an entry by id without disturbing either index. Used by the
    /// receive pipeline to install resources for an already-selected
    /// entry before committing to removing it.
    pub fn entries_mut(&mut self) -> &mut HashMap<u64, QueueEntry> {
        &mut self.entries
    }

    /// Remove and return the oldest entry by arrival order.
    pub fn pop_fifo(&mut self) -> Option<QueueEntry> {
        let id = *self.fifo.values().next()?;
        self.remove(id)
    }

    /// Remove and return the highest-priority entry, respecting `floor`
    /// exactly as `peek_priority` does.
    pub fn pop_priority(&mut self, floor: Option<i64>) -> Result<Option<QueueEntry>, BusError> {
        let id = match self.peek_priority(floor)? {
            Some(entry) => entry.id,
            None => return Ok(None),
        };
        Ok(self.remove(id))
    }

    /// Re-insert an entry produced by an earlier `drain`/`remove`,
    /// preserving its original id (so any outstanding reply back-pointer
    /// that names it stays valid) rather than minting a fresh one, but
    /// assigning it a fresh arrival-order key in *this* queue so it sorts
    /// after everything already here. Used when an activator's queued
    /// messages move to a name's new real owner (§4.8).
    pub fn reinsert(&mut self, mut entry: QueueEntry) {
        let id = entry.id;
        self.next_id = self.next_id.max(id + 1);
        entry.seq = self.fresh_seq();
        self.fifo.insert(entry.seq, id);
        self.by_priority.entry(entry.priority).or_default().insert(entry.seq, id);
        self.entries.insert(id, entry);
    }

    /// Drain every entry in arrival order, leaving the queue empty. Used
    /// when a connection disconnects and its queue must be torn down
    /// (resources dropped, closing any held fds) rather than delivered.
    pub fn drain(&mut self) -> Vec<QueueEntry> {
        let ids: Vec<u64> = std::mem::take(&mut self.fifo).into_values().collect();
        self.by_priority.clear();
        ids.into_iter().filter_map(|id| self.entries.remove(&id)).collect()
    }

    /// Drain only the entries matching `pred`, leaving the rest in place
    /// in their original relative order. Used by activator handoff (§4.8)
    /// to move just the entries addressed to one name, not an
    /// activator's whole queue.
    pub fn drain_matching(&mut self, pred: impl Fn(&QueueEntry) -> bool) -> Vec<QueueEntry> {
        let ids: Vec<u64> = self
            .entries
            .values()
            .filter(|e| pred(e))
            .map(|e| e.id)
            .collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(q: &mut MessageQueue, priority: i64) -> u64 {
        q.insert(priority, 1, vec![], ResourceHolder::default(), false, None, None)
    }

    #[test]
    fn fifo_order_is_arrival_order_regardless_of_priority() {
        let mut q = MessageQueue::new();
        let a = entry(&mut q, 5);
        let b = entry(&mut q, -5);
        let c = entry(&mut q, 0);
        assert_eq!(q.peek_fifo().unwrap().id, a);
        q.remove(a);
        assert_eq!(q.peek_fifo().unwrap().id, b);
        q.remove(b);
        assert_eq!(q.peek_fifo().unwrap().id, c);
    }

    #[test]
    fn priority_order_picks_lowest_numeric_value_first() {
        let mut q = MessageQueue::new();
        entry(&mut q, 5);
        let urgent = entry(&mut q, -10);
        entry(&mut q, 0);
        assert_eq!(q.peek_priority(None).unwrap().unwrap().id, urgent);
    }

    #[test]
    fn same_priority_entries_are_fifo_among_themselves() {
        let mut q = MessageQueue::new();
        let first = entry(&mut q, 0);
        let second = entry(&mut q, 0);
        assert_eq!(q.peek_priority(None).unwrap().unwrap().id, first);
        q.remove(first);
        assert_eq!(q.peek_priority(None).unwrap().unwrap().id, second);
    }

    #[test]
    fn priority_floor_rejects_when_cached_highest_is_too_low_priority() {
        let mut q = MessageQueue::new();
        entry(&mut q, 10);
        let err = q.peek_priority(Some(-1)).unwrap_err();
        assert!(matches!(err, BusError::NoMessage));
    }

    #[test]
    fn remove_drops_empty_priority_bucket() {
        let mut q = MessageQueue::new();
        let only = entry(&mut q, 3);
        q.remove(only);
        assert!(q.by_priority.is_empty());
        assert_eq!(q.peek_priority(None).unwrap(), None);
    }

    #[test]
    fn remove_from_the_middle_of_a_deep_queue_leaves_arrival_order_intact() {
        let mut q = MessageQueue::new();
        let ids: Vec<u64> = (0..50).map(|_| entry(&mut q, 0)).collect();
        q.remove(ids[25]);
        let mut remaining = Vec::new();
        while let Some(e) = q.pop_fifo() {
            remaining.push(e.id);
        }
        let mut expected = ids;
        expected.remove(25);
        assert_eq!(remaining, expected);
    }

    #[test]
    fn reinsert_preserves_original_id_and_is_visible_afterward() {
        let mut source = MessageQueue::new();
        let id = entry(&mut source, -2);
        let moved = source.remove(id).unwrap();
        assert_eq!(moved.id, id);

        let mut dest = MessageQueue::new();
        dest.reinsert(moved);
        assert_eq!(dest.peek_fifo().unwrap().id, id);
        assert_eq!(dest.peek_priority(None).unwrap().unwrap().id, id);
    }

    #[test]
    fn drain_empties_queue_and_returns_arrival_order() {
        let mut q = MessageQueue::new();
        let a = entry(&mut q, 1);
        let b = entry(&mut q, -1);
        let drained = q.drain();
        assert_eq!(drained.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a, b]);
        assert!(q.is_empty());
        assert_eq!(q.peek_fifo(), None);
    }

    #[test]
    fn drain_matching_moves_only_the_selected_entries() {
        let mut q = MessageQueue::new();
        let keep = q.insert(0, 1, vec![], ResourceHolder::default(), false, Some(1), None);
        let move_me = q.insert(0, 1, vec![], ResourceHolder::default(), false, Some(2), None);
        let moved = q.drain_matching(|e| e.name_sequence == Some(2));
        assert_eq!(moved.iter().map(|e| e.id).collect::<Vec<_>>(), vec![move_me]);
        assert_eq!(q.len(), 1);
        assert_eq!(q.peek_fifo().unwrap().id, keep);
    }
}
