//! Name Registry: well-known name ownership, conflict resolution, queued
//! claimants, and activator handoff (§4.8).
//!
//! Grounded on `original_source/names.c`'s `kdbus_name_acquire`/
//! `_release`/`_list` for the conflict/queue/replace mechanics. `names.c`
//! predates per-name sequence numbers and activator-handoff-of-queued-
//! messages as specified here; those are supplemented per spec.md §4.8/§9
//! and implemented directly against the contract text rather than a
//! specific original routine.

use std::collections::HashMap;

use crate::error::BusError;

/// Name-acquisition flags (§4.8, §6). A plain bitset rather than the
/// `bitflags` crate: three bits don't earn a new dependency here, and
/// `protocol.rs`'s `msg_flags`/`hello_flags` modules already establish
/// the same raw-bits-plus-`const` convention for this crate's wire flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NameFlags(u32);

impl NameFlags {
    pub const REPLACEABLE: NameFlags = NameFlags(1 << 0);
    pub const QUEUE: NameFlags = NameFlags(1 << 1);
    pub const REPLACE_EXISTING: NameFlags = NameFlags(1 << 2);

    pub const fn empty() -> Self {
        NameFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u32) -> Self {
        NameFlags(bits & (Self::REPLACEABLE.0 | Self::QUEUE.0 | Self::REPLACE_EXISTING.0))
    }

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for NameFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        NameFlags(self.0 | rhs.0)
    }
}

/// Outcome of a successful `acquire` beyond plain ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Caller now owns the name outright.
    Owner { sequence: u64 },
    /// Name was owned and not replaceable (or replacement wasn't
    /// requested); caller was queued behind the incumbent.
    Queued,
}

/// A notification the registry asks the caller to deliver after a
/// mutation; kept decoupled from the bus's message types so this module
/// has no dependency on `protocol`/`connection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameEvent {
    /// `name` changed hands from `old_owner` (`None` = previously
    /// activator-only or unowned) to `new_owner`, with the name's fresh
    /// sequence number.
    Changed { name: String, old_owner: Option<u64>, new_owner: u64, sequence: u64 },
}

struct NameEntry {
    sequence: u64,
    flags: NameFlags,
    owner: Option<u64>,
    activator: Option<u64>,
    queue: Vec<u64>,
}

/// The bus-wide well-known-name table.
#[derive(Default)]
pub struct NameRegistry {
    next_sequence: u64,
    names: HashMap<String, NameEntry>,
}

impl NameRegistry {
    pub fn new() -> Self {
        NameRegistry::default()
    }

    fn fresh_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    /// Register `conn` as the activator for `name`, creating the entry if
    /// absent. Fails `Already` if the name already has a real owner or a
    /// different activator.
    pub fn register_activator(&mut self, name: &str, conn: u64) -> Result<u64, BusError> {
        if let Some(entry) = self.names.get(name) {
            if entry.owner.is_some() || entry.activator.is_some() {
                return Err(BusError::Already);
            }
        }
        let sequence = self.fresh_sequence();
        self.names.insert(
            name.to_string(),
            NameEntry { sequence, flags: NameFlags::empty(), owner: None, activator: Some(conn), queue: Vec::new() },
        );
        Ok(sequence)
    }

    /// Acquire `name` for `conn` with `flags` (§4.8).
    ///
    /// Returns the name-change event to deliver (both to the new owner
    /// implicitly via the `Owner` outcome, and, on replacement, to the
    /// dispossessed incumbent via the returned `NameEvent`) plus
    /// activator-handoff info when the prior owner was an activator
    /// (caller uses this to move queued messages, §4.8 last paragraph).
    pub fn acquire(
        &mut self,
        name: &str,
        conn: u64,
        flags: NameFlags,
    ) -> Result<(AcquireOutcome, Option<NameEvent>, Option<ActivatorHandoff>), BusError> {
        if !self.names.contains_key(name) {
            let sequence = self.fresh_sequence();
            self.names.insert(
                name.to_string(),
                NameEntry { sequence, flags, owner: Some(conn), activator: None, queue: Vec::new() },
            );
            return Ok((AcquireOutcome::Owner { sequence }, None, None));
        }

        let entry = self.names.get_mut(name).expect("just checked contains_key");

        if entry.owner.is_none() {
            // Activator-only: a fresh connection takes ownership outright
            // and the activator's pending queue for this name moves over.
            let prior_activator = entry.activator.take();
            let prior_sequence = entry.sequence;
            entry.sequence = self.fresh_sequence();
            entry.owner = Some(conn);
            entry.flags = flags;
            let handoff = prior_activator.map(|activator| ActivatorHandoff {
                activator,
                new_owner: conn,
                prior_sequence,
            });
            return Ok((
                AcquireOutcome::Owner { sequence: entry.sequence },
                Some(NameEvent::Changed {
                    name: name.to_string(),
                    old_owner: None,
                    new_owner: conn,
                    sequence: entry.sequence,
                }),
                handoff,
            ));
        }

        if entry.owner == Some(conn) {
            return Err(BusError::Already);
        }

        let incumbent = entry.owner.expect("checked is_none above");
        if flags.contains(NameFlags::REPLACE_EXISTING) && entry.flags.contains(NameFlags::REPLACEABLE) {
            entry.owner = Some(conn);
            entry.flags = flags;
            entry.sequence = self.fresh_sequence();
            return Ok((
                AcquireOutcome::Owner { sequence: entry.sequence },
                Some(NameEvent::Changed {
                    name: name.to_string(),
                    old_owner: Some(incumbent),
                    new_owner: conn,
                    sequence: entry.sequence,
                }),
                None,
            ));
        }

        if flags.contains(NameFlags::QUEUE) {
            if !entry.queue.contains(&conn) {
                entry.queue.push(conn);
            }
            return Ok((AcquireOutcome::Queued, None, None));
        }

        Err(BusError::Already)
    }

    /// Release `name` on behalf of `conn`. If `conn` was the owner, the
    /// first queued claimant (if any) is promoted with a fresh sequence
    /// number; if `conn` was only queued, it is simply dequeued.
    pub fn release(&mut self, name: &str, conn: u64) -> Result<Option<NameEvent>, BusError> {
        let entry = self.names.get_mut(name).ok_or(BusError::NoSuchAddress)?;

        if entry.owner == Some(conn) {
            if let Some(next_owner) = entry.queue.first().copied() {
                entry.queue.remove(0);
                entry.owner = Some(next_owner);
                entry.sequence = self.fresh_sequence();
                return Ok(Some(NameEvent::Changed {
                    name: name.to_string(),
                    old_owner: Some(conn),
                    new_owner: next_owner,
                    sequence: entry.sequence,
                }));
            }
            entry.owner = None;
            if entry.activator.is_none() {
                self.names.remove(name);
            }
            return Ok(None);
        }

        if let Some(pos) = entry.queue.iter().position(|&c| c == conn) {
            entry.queue.remove(pos);
            return Ok(None);
        }

        Err(BusError::NoSuchAddress)
    }

    /// Remove every name `conn` owns or is queued behind (called from the
    /// disconnect protocol, §4.7 step 7: "release all owned names").
    /// Returns the change events for any promotions that resulted.
    pub fn remove_connection(&mut self, conn: u64) -> Vec<NameEvent> {
        let owned: Vec<String> = self
            .names
            .iter()
            .filter(|(_, e)| e.owner == Some(conn) || e.queue.contains(&conn))
            .map(|(n, _)| n.clone())
            .collect();

        let mut events = Vec::new();
        for name in owned {
            if let Ok(Some(event)) = self.release(&name, conn) {
                events.push(event);
            }
        }
        events
    }

    /// Resolve `name` to its current effective destination: the owner if
    /// present, else the activator if present, else `None` (§4.4 step 4).
    /// Both variants carry the name's current sequence number so the
    /// caller can stamp it onto the queue entry (§3's "destination-name
    /// sequence number"), which activator handoff later uses to tell
    /// apart messages addressed to different names the same activator
    /// happens to be registered for.
    pub fn lookup(&self, name: &str) -> Option<NameLookup> {
        let entry = self.names.get(name)?;
        match (entry.owner, entry.activator) {
            (Some(owner), _) => Some(NameLookup::Owner(owner, entry.sequence)),
            (None, Some(activator)) => Some(NameLookup::Activator(activator, entry.sequence)),
            (None, None) => None,
        }
    }

    /// Snapshot of every currently-registered name and its owner/activator
    /// (§4.8 `list()`).
    pub fn list(&self) -> Vec<(String, Option<u64>, Option<u64>)> {
        self.names.iter().map(|(n, e)| (n.clone(), e.owner, e.activator)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameLookup {
    /// Connection id, current sequence number.
    Owner(u64, u64),
    /// Connection id, current sequence number.
    Activator(u64, u64),
}

/// Tells the caller to move queued messages addressed to `name` under
/// `prior_sequence` from the activator's queue to `new_owner`'s queue,
/// rewriting any reply back-pointer to target the new owner (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivatorHandoff {
    pub activator: u64,
    pub new_owner: u64,
    pub prior_sequence: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_acquire_of_a_fresh_name_succeeds_with_sequence_one() {
        let mut reg = NameRegistry::new();
        let (outcome, event, handoff) = reg.acquire("com.example.Foo", 1, NameFlags::empty()).unwrap();
        assert!(matches!(outcome, AcquireOutcome::Owner { sequence: 1 }));
        assert!(event.is_none());
        assert!(handoff.is_none());
    }

    #[test]
    fn reacquiring_owned_name_without_queue_or_replace_fails_already() {
        let mut reg = NameRegistry::new();
        reg.acquire("n", 1, NameFlags::empty()).unwrap();
        let err = reg.acquire("n", 2, NameFlags::empty()).unwrap_err();
        assert!(matches!(err, BusError::Already));
    }

    #[test]
    fn replace_existing_requires_incumbent_replaceable_flag() {
        let mut reg = NameRegistry::new();
        reg.acquire("n", 1, NameFlags::empty()).unwrap();
        let err = reg.acquire("n", 2, NameFlags::REPLACE_EXISTING).unwrap_err();
        assert!(matches!(err, BusError::Already));

        let mut reg2 = NameRegistry::new();
        reg2.acquire("n", 1, NameFlags::REPLACEABLE).unwrap();
        let (outcome, event, _) = reg2.acquire("n", 2, NameFlags::REPLACE_EXISTING).unwrap();
        assert!(matches!(outcome, AcquireOutcome::Owner { .. }));
        assert!(matches!(event, Some(NameEvent::Changed { old_owner: Some(1), new_owner: 2, .. })));
    }

    #[test]
    fn queue_flag_queues_behind_non_replaceable_incumbent() {
        let mut reg = NameRegistry::new();
        reg.acquire("n", 1, NameFlags::empty()).unwrap();
        let (outcome, _, _) = reg.acquire("n", 2, NameFlags::QUEUE).unwrap();
        assert!(matches!(outcome, AcquireOutcome::Queued));
    }

    #[test]
    fn release_promotes_first_queued_claimant_with_new_sequence() {
        let mut reg = NameRegistry::new();
        let (_, _, _) = reg.acquire("n", 1, NameFlags::empty()).unwrap();
        reg.acquire("n", 2, NameFlags::QUEUE).unwrap();
        let event = reg.release("n", 1).unwrap().unwrap();
        match event {
            NameEvent::Changed { old_owner, new_owner, sequence, .. } => {
                assert_eq!(old_owner, Some(1));
                assert_eq!(new_owner, 2);
                assert!(sequence > 1);
            }
        }
        assert!(matches!(reg.lookup("n"), Some(NameLookup::Owner(2, _))));
    }

    #[test]
    fn activator_handoff_fires_when_real_owner_takes_over() {
        let mut reg = NameRegistry::new();
        reg.register_activator("n", 9).unwrap();
        let (outcome, event, handoff) = reg.acquire("n", 1, NameFlags::empty()).unwrap();
        assert!(matches!(outcome, AcquireOutcome::Owner { .. }));
        assert!(matches!(event, Some(NameEvent::Changed { old_owner: None, new_owner: 1, .. })));
        let handoff = handoff.unwrap();
        assert_eq!(handoff.activator, 9);
        assert_eq!(handoff.new_owner, 1);
        assert_eq!(handoff.prior_sequence, 1);
    }

    #[test]
    fn sequence_numbers_strictly_increase_across_acquisitions_of_same_name() {
        let mut reg = NameRegistry::new();
        reg.acquire("n", 1, NameFlags::REPLACEABLE).unwrap();
        reg.release("n", 1).unwrap();
        let (outcome, _, _) = reg.acquire("n", 2, NameFlags::empty()).unwrap();
        assert!(matches!(outcome, AcquireOutcome::Owner { sequence } if sequence > 1));
    }

    #[test]
    fn remove_connection_releases_every_owned_and_queued_name() {
        let mut reg = NameRegistry::new();
        reg.acquire("a", 1, NameFlags::empty()).unwrap();
        reg.acquire("b", 1, NameFlags::empty()).unwrap();
        reg.acquire("b", 2, NameFlags::QUEUE).unwrap();
        let events = reg.remove_connection(1);
        // "a" had no queue -> dropped silently; "b" promotes 2.
        assert_eq!(events.len(), 1);
        assert_eq!(reg.lookup("a"), None);
        assert!(matches!(reg.lookup("b"), Some(NameLookup::Owner(2, _))));
    }
}
