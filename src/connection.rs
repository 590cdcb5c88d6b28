//! A single bus connection: its pool, queue, reply list, owned names,
//! and disconnect protocol (§3 "Connection", §4.7).
//!
//! Grounded on the teacher's `broker/connection.rs` `Session`/
//! `BrokerConnection` ownership shape (one struct per peer, shared state
//! behind a mutex) and `original_source/connection.c`'s disconnect
//! protocol (CAS `disconnected`, drain queue synthesizing reply-dead
//! notifications, orphan outstanding reply slots with deadline 0).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::BusError;
use crate::pool::Pool;
use crate::queue::{MessageQueue, QueueEntry};
use crate::reply::ReplyTracker;

/// Feature flags set at `hello` time (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnFlags(u64);

impl ConnFlags {
    pub const ACCEPT_FD: ConnFlags = ConnFlags(crate::protocol::hello_flags::ACCEPT_FD);
    pub const ACTIVATOR: ConnFlags = ConnFlags(crate::protocol::hello_flags::ACTIVATOR);
    pub const MONITOR: ConnFlags = ConnFlags(crate::protocol::hello_flags::MONITOR);

    pub const fn empty() -> Self {
        ConnFlags(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        ConnFlags(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn bits(self) -> u64 {
        self.0
    }
}

impl std::ops::BitOr for ConnFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        ConnFlags(self.0 | rhs.0)
    }
}

/// A boolean subscription filter consulted for broadcast delivery
/// (§1, GLOSSARY "Match predicate"). Out of scope per spec.md §1; this
/// crate ships a permissive default alongside the trait (see
/// `policy.rs`).
pub trait MatchPredicate: Send + Sync {
    fn matches(&self, sender: u64, dst_name: Option<&str>) -> bool;
}

/// A connection attached to the bus.
///
/// Mutex-guarded fields mirror §5's "one mutex guarding its message
/// queue, reply list, names list, and disconnected flag." `id`,
/// `flags`, and `pool` never change after construction so they're
/// readable without the lock.
pub struct Connection {
    pub id: u64,
    pub flags: ConnFlags,
    pub pool: Arc<dyn Pool>,
    pub label: Option<String>,
    disconnected: AtomicBool,
    refcount: AtomicU64,
    inner: Mutex<ConnectionInner>,
}

struct ConnectionInner {
    queue: MessageQueue,
    replies: ReplyTracker,
    owned_names: Vec<String>,
    matcher: Box<dyn MatchPredicate>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

impl Connection {
    pub fn new(
        id: u64,
        flags: ConnFlags,
        pool: Arc<dyn Pool>,
        matcher: Box<dyn MatchPredicate>,
        label: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Connection {
            id,
            flags,
            pool,
            label,
            disconnected: AtomicBool::new(false),
            refcount: AtomicU64::new(1),
            inner: Mutex::new(ConnectionInner {
                queue: MessageQueue::new(),
                replies: ReplyTracker::new(),
                owned_names: Vec::new(),
                matcher,
            }),
        })
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn is_activator(&self) -> bool {
        self.flags.contains(ConnFlags::ACTIVATOR)
    }

    pub fn is_monitor(&self) -> bool {
        self.flags.contains(ConnFlags::MONITOR)
    }

    pub fn accepts_fds(&self) -> bool {
        self.flags.contains(ConnFlags::ACCEPT_FD)
    }

    pub fn retain(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop a strong reference; returns true if this was the last one,
    /// mirroring `kref_put`'s "do final teardown" signal (§4.7). Callers
    /// that see `true` are responsible for dropping pool/match-database/
    /// owner-metadata references that don't live inside `Connection`
    /// itself (e.g. the bus's own `Arc` is one such reference).
    pub fn release(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Enqueue a fully serialized message. No-ops (returns `ConnectionReset`)
    /// if the connection already disconnected (§3 invariant: "no enqueue
    /// occurs after disconnected"). `name_sequence` and `reply_cookie`
    /// populate the entry's Data Model back-pointers (§3); pass `None` for
    /// either when the send wasn't addressed by name or doesn't expect a
    /// reply.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
        &self,
        priority: i64,
        sender: u64,
        bytes: Vec<u8>,
        resources: crate::resource::ResourceHolder,
        synthetic: bool,
        name_sequence: Option<u64>,
        reply_cookie: Option<u64>,
    ) -> Result<u64, BusError> {
        if self.is_disconnected() {
            return Err(BusError::ConnectionReset);
        }
        let mut inner = self.inner.lock().expect("connection mutex poisoned");
        Ok(inner.queue.insert(priority, sender, bytes, resources, synthetic, name_sequence, reply_cookie))
    }

    pub fn with_queue<R>(&self, f: impl FnOnce(&mut MessageQueue) -> R) -> R {
        let mut inner = self.inner.lock().expect("connection mutex poisoned");
        f(&mut inner.queue)
    }

    pub fn with_replies<R>(&self, f: impl FnOnce(&mut ReplyTracker) -> R) -> R {
        let mut inner = self.inner.lock().expect("connection mutex poisoned");
        f(&mut inner.replies)
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().expect("connection mutex poisoned").queue.len()
    }

    pub fn matches(&self, sender: u64, dst_name: Option<&str>) -> bool {
        let inner = self.inner.lock().expect("connection mutex poisoned");
        inner.matcher.matches(sender, dst_name)
    }

    pub fn owned_names(&self) -> Vec<String> {
        self.inner.lock().expect("connection mutex poisoned").owned_names.clone()
    }

    pub fn note_name_owned(&self, name: &str) {
        let mut inner = self.inner.lock().expect("connection mutex poisoned");
        if !inner.owned_names.iter().any(|n| n == name) {
            inner.owned_names.push(name.to_string());
        }
    }

    pub fn note_name_released(&self, name: &str) {
        let mut inner = self.inner.lock().expect("connection mutex poisoned");
        inner.owned_names.retain(|n| n != name);
    }

    /// Step 1 of the disconnect protocol (§4.7): CAS false->true, failing
    /// `Already` if some other caller already won the race.
    pub fn mark_disconnected(&self) -> Result<(), BusError> {
        match self.disconnected.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => Ok(()),
            Err(_) => Err(BusError::Already),
        }
    }

    /// Step 4: drain the queue, returning every entry so the caller can
    /// synthesize reply-dead notifications for entries that carried an
    /// expecting sender, free pool ranges, and drop resource references
    /// (dropping `QueueEntry` closes any held fds via `ResourceHolder`'s
    /// `Drop`).
    pub fn drain_queue(&self) -> Vec<QueueEntry> {
        let mut inner = self.inner.lock().expect("connection mutex poisoned");
        inner.queue.drain()
    }

    /// Step 5/7: surface every reply slot referencing this connection as
    /// orphaned. Called on *other* connections that hold a slot pointing
    /// here; returns the cookies of sync slots that were woken, so the
    /// caller can log/trace if desired.
    pub fn orphan_replies_to(&self, peer: u64) -> Vec<u64> {
        let mut inner = self.inner.lock().expect("connection mutex poisoned");
        inner.replies.orphan_peer(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TestPool;

    struct AllowAll;
    impl MatchPredicate for AllowAll {
        fn matches(&self, _sender: u64, _dst_name: Option<&str>) -> bool {
            true
        }
    }

    fn test_conn(id: u64) -> Arc<Connection> {
        Connection::new(id, ConnFlags::empty(), Arc::new(TestPool::new(4096)), Box::new(AllowAll), None)
    }

    #[test]
    fn mark_disconnected_is_idempotent_false_then_already() {
        let conn = test_conn(1);
        assert!(conn.mark_disconnected().is_ok());
        assert!(matches!(conn.mark_disconnected(), Err(BusError::Already)));
    }

    #[test]
    fn enqueue_fails_after_disconnect() {
        let conn = test_conn(1);
        conn.mark_disconnected().unwrap();
        let result = conn.enqueue(0, 0, vec![], Default::default(), false, None, None);
        assert!(matches!(result, Err(BusError::ConnectionReset)));
    }

    #[test]
    fn drain_queue_empties_and_returns_entries() {
        let conn = test_conn(1);
        conn.enqueue(0, 5, vec![1, 2, 3], Default::default(), false, None, None).unwrap();
        let drained = conn.drain_queue();
        assert_eq!(drained.len(), 1);
        assert_eq!(conn.queue_len(), 0);
    }

    #[test]
    fn owned_names_add_and_remove() {
        let conn = test_conn(1);
        conn.note_name_owned("com.example.A");
        conn.note_name_owned("com.example.A");
        assert_eq!(conn.owned_names(), vec!["com.example.A".to_string()]);
        conn.note_name_released("com.example.A");
        assert!(conn.owned_names().is_empty());
    }
}
