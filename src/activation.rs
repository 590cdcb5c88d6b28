//! Activator handoff execution (§4.8 last paragraph, Testable Property 10).
//!
//! `NameRegistry::acquire` only decides *that* a handoff is owed; it has
//! no connection or message-queue access (see names.rs's own grounding
//! note on why that split exists). This module carries it out: move every
//! message addressed to the specific name/sequence being handed off from
//! the activator's queue over to the name's new real owner, retargeting
//! each message's `dst_id` along the way so a synchronous sender still
//! waiting on one of those cookies sees its reply matched against the
//! right connection -- and retargeting that sender's own reply slot too,
//! since the slot's `peer` still names the activator otherwise.
//!
//! No original_source/ routine does this verbatim -- `names.c` predates
//! per-connection activator-queue migration as specified here -- so this
//! is built directly against spec.md §4.8's contract text.

use crate::bus::Bus;
use crate::error::BusError;
use crate::names::ActivatorHandoff;
use crate::protocol;

/// Move queued messages addressed to `handoff.prior_sequence` over to
/// `handoff.new_owner`, rewriting each message's destination id in place.
/// A message's id (used to correlate a pending synchronous reply) is
/// preserved by `MessageQueue::reinsert`. Entries addressed to a
/// *different* name the same activator also registered are left in
/// place -- an activator can own more than one name.
pub fn execute_handoff(bus: &Bus, handoff: &ActivatorHandoff) -> Result<(), BusError> {
    let activator = bus.get(handoff.activator).ok_or(BusError::NoSuchId)?;
    let new_owner = bus.get(handoff.new_owner).ok_or(BusError::NoSuchId)?;

    let entries = activator.with_queue(|q| q.drain_matching(|e| e.name_sequence == Some(handoff.prior_sequence)));
    for mut entry in entries {
        if let Some(cookie) = entry.reply_cookie {
            if let Some(sender) = bus.get(entry.sender) {
                sender.with_replies(|r| r.retarget_peer(cookie, new_owner.id));
            }
        }
        let (mut header, items) = protocol::decode_message(&entry.bytes)?;
        header.dst_id = new_owner.id;
        entry.bytes = protocol::encode_message(header, &items);
        new_owner.with_queue(|q| q.reinsert(entry));
    }
    Ok(())
}
