//! The bus: connection table, monitor list, name registry, and the
//! bus-wide counters send/receive pipelines share (§2, §5).
//!
//! Grounded on `broker/mod.rs`'s `Broker` (`HashMap<u32, Session>` keyed
//! by a monotonic id, shared state behind a mutex), generalized from "one
//! Hub peer" to "all bus peers," plus the lock-order rule of §5: bus lock
//! > name-registry lock > connection lock. Cross-connection operations
//! here always acquire the bus lock to snapshot membership and release it
//! before touching any one connection's own lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::connection::{Connection, ConnFlags, MatchPredicate};
use crate::error::BusError;
use crate::names::NameRegistry;
use crate::policy::Policy;
use crate::pool::Pool;

/// Shared bus state. One `Bus` serves every connection attached to it;
/// an `Arc<Bus>` is handed to the send/receive pipelines and to each
/// connection's timeout-scan closure.
pub struct Bus {
    connections: Mutex<BTreeMap<u64, Arc<Connection>>>,
    registry: Mutex<NameRegistry>,
    next_conn_id: AtomicU64,
    next_sequence: AtomicU64,
    policy: Box<dyn Policy>,
}

impl Bus {
    pub fn new(policy: Box<dyn Policy>) -> Arc<Self> {
        Arc::new(Bus {
            connections: Mutex::new(BTreeMap::new()),
            registry: Mutex::new(NameRegistry::new()),
            next_conn_id: AtomicU64::new(1),
            next_sequence: AtomicU64::new(1),
            policy,
        })
    }

    pub fn policy(&self) -> &dyn Policy {
        self.policy.as_ref()
    }

    /// §9: "bus-wide message sequence... model as atomically incremented
    /// 64-bit counters."
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Create and attach a new connection, returning its freshly assigned
    /// bus-wide id (§9: "per-bus connection-id counter").
    pub fn attach(
        &self,
        flags: ConnFlags,
        pool: Arc<dyn Pool>,
        matcher: Box<dyn MatchPredicate>,
        label: Option<String>,
    ) -> Arc<Connection> {
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn = Connection::new(id, flags, pool, matcher, label);
        self.connections.lock().expect("bus mutex poisoned").insert(id, conn.clone());
        conn
    }

    pub fn get(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.lock().expect("bus mutex poisoned").get(&id).cloned()
    }

    /// Snapshot every attached connection, in ascending id (attach) order.
    /// Used for broadcast and monitor fan-out: the bus lock is held only
    /// long enough to clone the `Arc`s (§5: "acquire the bus lock briefly
    /// to snapshot membership, then release it before taking
    /// per-connection locks"). The ordering matters for broadcast: it's
    /// what makes the metadata-buffer-reuse quirk in `send.rs`'s
    /// `send_broadcast` (spec.md §9) a deterministic function of attach
    /// order rather than hash order.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().expect("bus mutex poisoned").values().cloned().collect()
    }

    pub fn monitors(&self) -> Vec<Arc<Connection>> {
        self.snapshot().into_iter().filter(|c| c.is_monitor()).collect()
    }

    pub fn with_registry<R>(&self, f: impl FnOnce(&mut NameRegistry) -> R) -> R {
        let mut registry = self.registry.lock().expect("registry mutex poisoned");
        f(&mut registry)
    }

    /// Full disconnect protocol (§4.7). Steps 1-2 are the connection's own
    /// concern (`Connection::mark_disconnected`, queue non-empty check
    /// left to the caller as "drain-check" mode is parametric and not
    /// exercised by this crate's default path); this method carries out
    /// steps 3, 5, 6, 7 under the correct lock order, and returns the
    /// drained queue entries (step 4) for the caller to convert into
    /// reply-dead notifications and pool frees.
    pub fn disconnect(&self, conn: &Arc<Connection>) -> Result<DisconnectOutcome, BusError> {
        conn.mark_disconnected()?;

        // Step 3: remove from the bus's id hash (monitor membership is
        // derived from `flags`, so removing from `connections` removes it
        // from the monitor view too).
        self.connections.lock().expect("bus mutex poisoned").remove(&conn.id);

        // Step 7 (names first, while other connections can still see the
        // registry mid-transition is fine: the registry has its own lock
        // and release() is self-contained).
        let name_events = self.with_registry(|registry| registry.remove_connection(conn.id));

        // Step 4: drain this connection's own queue.
        let drained = conn.drain_queue();

        // Step 5: walk every other connection and orphan any reply slot
        // that referenced this one. Never hold two connection locks at
        // once: `orphan_replies_to` takes exactly one (the peer's). The
        // peer's own id travels with each cookie so the caller knows
        // whose queue to deliver the matching reply-dead notification to
        // (§8 Scenario S5: the sync wake inside `orphan()` is immediate,
        // but a queued notification is owed too).
        let mut orphaned_sync_cookies = Vec::new();
        for peer in self.snapshot() {
            if peer.id == conn.id {
                continue;
            }
            for cookie in peer.orphan_replies_to(conn.id) {
                orphaned_sync_cookies.push((peer.id, cookie));
            }
        }

        Ok(DisconnectOutcome { drained_queue: drained, name_events, orphaned_sync_cookies })
    }
}

/// Everything a caller needs to finish the disconnect protocol's
/// notification side (steps 4's reply-dead synthesis and step 6's
/// `ID_REMOVE`) once `Bus::disconnect` returns.
pub struct DisconnectOutcome {
    pub drained_queue: Vec<crate::queue::QueueEntry>,
    pub name_events: Vec<crate::names::NameEvent>,
    /// `(holder_id, cookie)` pairs: `holder_id` is the connection whose
    /// reply slot referenced the one that just disconnected.
    pub orphaned_sync_cookies: Vec<(u64, u64)>,
}
