//! Reply Slot state machine and per-connection timeout scan (§4.6).
//!
//! Grounded on `original_source/connection.c`'s `kdbus_conn_reply_entry`
//! and `kdbus_conn_scan_timeout`: sync entries own their own wait with a
//! timeout and are skipped by the scan; async entries are compared
//! against the current time, expired ones moved to a local list so
//! notifications fire after the connection lock is released, and the
//! timer rearms to the minimum remaining deadline.
//!
//! A slot's mutable state lives behind its own small `Mutex`, separate
//! from the owning connection's mutex (§5 lock order only names bus >
//! registry > connection locks; a reply slot's internal lock is a leaf
//! never held across any of those). That lets a sync sender clone the
//! slot, drop the connection lock, and block in `wait_sync` without
//! holding anything the rest of the bus might need.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::BusError;

/// Sentinel meaning "no offset yet / peer died or timed out" (§3, §6
/// `offset_reply`).
pub const OFFSET_NONE: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    Pending,
    Answered,
    TimedOut,
    Orphaned,
}

#[derive(Debug)]
struct Inner {
    state: ReplyState,
    /// `None` once orphaned/answered/timed-out; `Some(deadline)` while an
    /// async slot is still pending. Sync slots keep a deadline too (their
    /// own wait uses it) but are never touched by `scan_timeouts`.
    deadline: Option<Instant>,
    waiting: bool,
    offset: u64,
}

/// A single outstanding reply expectation. Cheap to clone: clones share
/// the same underlying state, so the tracker's copy and a sync sender's
/// own copy observe each other's mutations.
#[derive(Debug, Clone)]
pub struct ReplySlot {
    pub cookie: u64,
    pub peer: u64,
    pub sync: bool,
    inner: Arc<Mutex<Inner>>,
    condvar: Arc<Condvar>,
}

impl ReplySlot {
    pub fn new_async(cookie: u64, peer: u64, timeout: Duration) -> Self {
        ReplySlot {
            cookie,
            peer,
            sync: false,
            inner: Arc::new(Mutex::new(Inner {
                state: ReplyState::Pending,
                deadline: Some(Instant::now() + timeout),
                waiting: false,
                offset: OFFSET_NONE,
            })),
            condvar: Arc::new(Condvar::new()),
        }
    }

    pub fn new_sync(cookie: u64, peer: u64, timeout: Duration) -> Self {
        ReplySlot {
            cookie,
            peer,
            sync: true,
            inner: Arc::new(Mutex::new(Inner {
                state: ReplyState::Pending,
                deadline: Some(Instant::now() + timeout),
                waiting: true,
                offset: OFFSET_NONE,
            })),
            condvar: Arc::new(Condvar::new()),
        }
    }

    pub fn state(&self) -> ReplyState {
        self.inner.lock().expect("reply slot mutex poisoned").state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.lock().expect("reply slot mutex poisoned").deadline
    }

    /// Peer's send matched this slot's cookie: mark it answered and wake
    /// any sync waiter with its offset.
    pub fn answer(&self, offset: u64) {
        let mut inner = self.inner.lock().expect("reply slot mutex poisoned");
        inner.state = ReplyState::Answered;
        inner.deadline = None;
        inner.offset = offset;
        inner.waiting = false;
        self.condvar.notify_all();
    }

    /// Peer disconnected: deadline -> "dead" sentinel (§4.7 step 5). Sync
    /// slots wake their waiter with the "none" offset (`BrokenPipe`);
    /// async slots are suppressed from the timeout scan entirely because
    /// their deadline becomes `None`.
    pub fn orphan(&self) {
        let mut inner = self.inner.lock().expect("reply slot mutex poisoned");
        inner.deadline = None;
        inner.state = ReplyState::Orphaned;
        inner.offset = OFFSET_NONE;
        inner.waiting = false;
        self.condvar.notify_all();
    }

    /// Async-only: the timeout scan found this entry's deadline elapsed.
    pub fn expire(&self) {
        let mut inner = self.inner.lock().expect("reply slot mutex poisoned");
        debug_assert!(!self.sync, "sync slots own their own timeout, never scanned");
        inner.state = ReplyState::TimedOut;
        inner.deadline = None;
    }

    /// Block the calling (sync) sender until answered, orphaned, or the
    /// deadline elapses. Returns the delivered offset, or an error
    /// describing why no offset arrived. Uses `Condvar::wait_timeout` so
    /// spurious wakeups don't prematurely report success.
    pub fn wait_sync(&self) -> Result<u64, BusError> {
        let mut guard = self.inner.lock().expect("reply slot mutex poisoned");
        while guard.waiting {
            let Some(deadline) = guard.deadline else { break };
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (next_guard, timeout_result) = self
                .condvar
                .wait_timeout(guard, deadline - now)
                .expect("reply slot mutex poisoned");
            guard = next_guard;
            if timeout_result.timed_out() && guard.waiting {
                break;
            }
        }

        if guard.waiting {
            return Err(BusError::TimedOut);
        }
        if guard.offset == OFFSET_NONE {
            return Err(BusError::BrokenPipe);
        }
        Ok(guard.offset)
    }
}

/// Per-connection collection of outstanding reply slots plus the
/// minimal "arm at deadline" bookkeeping described in §9. The owning
/// connection's mutex guards this list; `scan_timeouts` expects to be
/// called with that lock already held and returns the cookies that
/// expired so the caller can synthesize "reply-timed-out" notifications
/// after releasing the lock.
#[derive(Debug, Default)]
pub struct ReplyTracker {
    slots: Vec<ReplySlot>,
}

impl ReplyTracker {
    pub fn new() -> Self {
        ReplyTracker::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn push(&mut self, slot: ReplySlot) {
        self.slots.push(slot);
    }

    /// Whether a pending slot exists for `cookie` whose counterpart is
    /// `peer` (§4.4 step 5's match check, performed before deciding
    /// whether to consult policy).
    pub fn has_pending(&self, cookie: u64, peer: u64) -> bool {
        self.slots.iter().any(|s| s.cookie == cookie && s.peer == peer && s.state() == ReplyState::Pending)
    }

    /// Find and remove the slot matching `cookie` and `peer`, answering
    /// it with `offset` (§8 Property 4: reply matching is exactly-once).
    /// Returns the matched slot so the caller can inspect/drop it.
    pub fn match_and_answer(&mut self, cookie: u64, peer: u64, offset: u64) -> Option<ReplySlot> {
        let idx = self
            .slots
            .iter()
            .position(|s| s.cookie == cookie && s.peer == peer && s.state() == ReplyState::Pending)?;
        let slot = self.slots.remove(idx);
        slot.answer(offset);
        Some(slot)
    }

    /// Remove and return a slot by cookie, e.g. once its waiter has
    /// woken and consumed the result.
    pub fn take(&mut self, cookie: u64) -> Option<ReplySlot> {
        let idx = self.slots.iter().position(|s| s.cookie == cookie)?;
        Some(self.slots.remove(idx))
    }

    /// Activator handoff (§4.8): a slot waiting on the activator's id
    /// now needs to match the name's new real owner instead. `peer` is a
    /// plain field outside the slot's shared `Inner`, so this only
    /// touches this tracker's own copy -- exactly the copy `has_pending`/
    /// `match_and_answer` consult.
    pub fn retarget_peer(&mut self, cookie: u64, new_peer: u64) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.cookie == cookie) {
            slot.peer = new_peer;
        }
    }

    /// Mark every slot referencing `peer` as orphaned (§4.7 step 5),
    /// returning the cookies of the sync slots among them (those have
    /// already woken their waiter inside `orphan`; async slots are left
    /// in the list -- with deadline cleared -- so a subsequent scan
    /// simply skips them, matching "no timeout notification emitted
    /// because deadline = 0").
    pub fn orphan_peer(&mut self, peer: u64) -> Vec<u64> {
        let mut woke = Vec::new();
        for slot in self.slots.iter().filter(|s| s.peer == peer && s.state() == ReplyState::Pending) {
            slot.orphan();
            if slot.sync {
                woke.push(slot.cookie);
            }
        }
        woke
    }

    /// Run one timeout scan: remove and return cookies of async slots
    /// whose deadline has elapsed, along with the earliest remaining
    /// deadline among survivors (for rearming the timer). Sync slots are
    /// never touched here (§4.6: "sync entries are skipped").
    pub fn scan_timeouts(&mut self, now: Instant) -> (Vec<u64>, Option<Instant>) {
        let mut expired = Vec::new();
        let mut next_deadline: Option<Instant> = None;

        self.slots.retain(|slot| {
            if slot.sync {
                return true;
            }
            match slot.deadline() {
                None => true, // orphaned or already resolved; no notification
                Some(deadline) if deadline <= now => {
                    slot.expire();
                    expired.push(slot.cookie);
                    false
                }
                Some(deadline) => {
                    next_deadline = Some(next_deadline.map_or(deadline, |d| d.min(deadline)));
                    true
                }
            }
        });

        (expired, next_deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn async_slot_past_deadline_is_scanned_out() {
        let mut tracker = ReplyTracker::new();
        tracker.push(ReplySlot::new_async(1, 99, Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        let (expired, next) = tracker.scan_timeouts(Instant::now());
        assert_eq!(expired, vec![1]);
        assert_eq!(next, None);
        assert!(tracker.is_empty());
    }

    #[test]
    fn sync_slot_is_never_touched_by_scan() {
        let mut tracker = ReplyTracker::new();
        tracker.push(ReplySlot::new_sync(1, 99, Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        let (expired, _) = tracker.scan_timeouts(Instant::now());
        assert!(expired.is_empty());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn match_and_answer_wakes_sync_waiter_with_offset() {
        let mut tracker = ReplyTracker::new();
        let slot = ReplySlot::new_sync(42, 7, Duration::from_secs(5));
        tracker.push(slot.clone());
        let matched = tracker.match_and_answer(42, 7, 1234);
        assert!(matched.is_some());
        assert!(tracker.is_empty());
        assert_eq!(slot.wait_sync().unwrap(), 1234);
    }

    #[test]
    fn match_requires_matching_peer() {
        let mut tracker = ReplyTracker::new();
        tracker.push(ReplySlot::new_sync(42, 7, Duration::from_secs(5)));
        assert!(tracker.match_and_answer(42, 8, 1).is_none());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn sync_wait_times_out_when_never_answered() {
        let slot = ReplySlot::new_sync(1, 1, Duration::from_millis(20));
        let result = slot.wait_sync();
        assert!(matches!(result, Err(BusError::TimedOut)));
    }

    #[test]
    fn sync_wait_returns_offset_once_answered_from_another_thread() {
        let slot = ReplySlot::new_sync(1, 1, Duration::from_secs(5));
        let slot_clone = slot.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            slot_clone.answer(555);
        });
        let result = slot.wait_sync();
        handle.join().unwrap();
        assert_eq!(result.unwrap(), 555);
    }

    #[test]
    fn orphan_peer_wakes_sync_slots_with_broken_pipe_and_leaves_async_slots_deadline_cleared() {
        let mut tracker = ReplyTracker::new();
        let sync_slot = ReplySlot::new_sync(1, 9, Duration::from_secs(5));
        tracker.push(sync_slot.clone());
        tracker.push(ReplySlot::new_async(2, 9, Duration::from_secs(5)));
        let woke = tracker.orphan_peer(9);
        assert_eq!(woke, vec![1]);
        assert!(matches!(sync_slot.wait_sync(), Err(BusError::BrokenPipe)));
        // async slot remains, with deadline cleared -> future scans skip it.
        let (expired, next) = tracker.scan_timeouts(Instant::now());
        assert!(expired.is_empty());
        assert_eq!(next, None);
    }
}
