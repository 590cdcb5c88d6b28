//! Send Pipeline: resolve destination, enforce policy, serialize into
//! the receiver's pool, register reply expectations, perform the
//! synchronous wait (§4.4).
//!
//! Grounded step-by-step on spec.md §4.4, with `broker/mod.rs`'s
//! `handle_connection` dispatch loop ("decode a frame, resolve
//! destination, act, reply") as the structural model.

use std::sync::Arc;
use std::time::Duration;

use crate::bus::Bus;
use crate::config::Config;
use crate::connection::Connection;
use crate::error::BusError;
use crate::names::NameLookup;
use crate::protocol::{self, Header, Item};
use crate::recv;
use crate::reply::ReplySlot;
use crate::resource::{PendingFd, PendingMemfd, ResourceHolder, SealedObject};

/// A message as prepared by its sender, before destination resolution.
/// Sender-side payload vectors are plain owned buffers here rather than
/// (address, size) pairs: this crate models a single-process bus where
/// "sender virtual addresses" have already been read into memory by the
/// caller (§9: cross-process fd/memory installation requires a platform
/// primitive this crate does not assume; see `resource.rs`).
pub struct OutboundMessage {
    pub dst_id: u64,
    pub dst_name: Option<String>,
    pub cookie: u64,
    pub cookie_reply: u64,
    pub priority: i64,
    pub flags: u64,
    pub timeout_ns: u64,
    pub payloads: Vec<Vec<u8>>,
    pub memfds: Vec<(Box<dyn SealedObject>, u64)>,
    pub fds: Vec<std::os::fd::OwnedFd>,
    /// Opaque credential/seclabel bytes attached only for user-originated
    /// sends (§4.4 step 2); `None` for kernel-originated messages.
    pub creds: Option<Vec<u8>>,
    /// Set only by `send_from_kernel` callers that are synthesizing a
    /// notification (`notify.rs`): encoded as a trailing `Metadata` item
    /// rather than a dedicated wire type, the same low-ceremony choice
    /// `control.rs` makes for its own irregularly-shaped control data.
    pub notify: Option<Vec<u8>>,
}

impl OutboundMessage {
    pub fn new(dst_id: u64, cookie: u64, priority: i64) -> Self {
        OutboundMessage {
            dst_id,
            dst_name: None,
            cookie,
            cookie_reply: 0,
            priority,
            flags: 0,
            timeout_ns: 0,
            payloads: Vec::new(),
            memfds: Vec::new(),
            fds: Vec::new(),
            creds: None,
            notify: None,
        }
    }
}

/// Outcome of a successful send. For a synchronous send, `reply_offset`
/// is the pool offset of the delivered reply in the *source's* pool
/// (§4.4 step 10: "mirror the reply's offset into the caller's receive
/// field"); the receive pipeline has already run for that single message.
pub struct SendOutcome {
    pub sequence: u64,
    pub reply_offset: Option<u64>,
}

/// Resolve `msg`'s destination. When addressed by name, also returns the
/// name's sequence number at resolution time, to be stamped onto the
/// queue entry so activator handoff can later tell apart entries
/// addressed to different names (§3's "destination-name sequence
/// number").
fn resolve_destination(bus: &Bus, msg: &OutboundMessage) -> Result<(Arc<Connection>, Option<u64>), BusError> {
    if let Some(name) = &msg.dst_name {
        match bus.with_registry(|r| r.lookup(name)) {
            None => Err(BusError::NoSuchAddress),
            Some(NameLookup::Owner(id, sequence)) => {
                bus.get(id).map(|c| (c, Some(sequence))).ok_or(BusError::NoSuchAddress)
            }
            Some(NameLookup::Activator(id, sequence)) => {
                if msg.flags & protocol::msg_flags::NO_AUTO_START != 0 {
                    Err(BusError::AddressNotAvailable)
                } else {
                    bus.get(id).map(|c| (c, Some(sequence))).ok_or(BusError::NoSuchAddress)
                }
            }
        }
    } else {
        let conn = bus.get(msg.dst_id).ok_or(BusError::NoSuchId)?;
        if conn.is_activator() || conn.is_monitor() {
            return Err(BusError::NoSuchId);
        }
        Ok((conn, None))
    }
}

/// Serialize `msg` into `dest`'s pool, returning the destination queue
/// entry's would-be byte buffer (header + items, with `PAYLOAD_OFF`
/// offsets already pointing into `dest`'s pool) and the resource holder
/// for any fds/memfds it carries, ready for `Connection::enqueue`.
///
/// Enforces the pool-fairness rule (§4.4 step 7, §8 Property 8): a
/// requested allocation smaller than the pool's current free space but
/// larger than half of it is refused with `QuotaExceeded`.
fn serialize_into(
    sequence: u64,
    source_id: u64,
    dest: &Connection,
    msg: &mut OutboundMessage,
    include_metadata: bool,
) -> Result<(Vec<u8>, ResourceHolder), BusError> {
    let mut items = Vec::new();
    let mut pending_fds = Vec::new();
    let mut pending_memfds = Vec::new();

    if let Some(name) = &msg.dst_name {
        items.push(Item::DstName(name.clone()));
    }

    for payload in msg.payloads.drain(..) {
        if payload.is_empty() {
            items.push(Item::PayloadOff { offset: protocol::OFFSET_NONE, size: 0 });
            continue;
        }
        enforce_pool_fairness(dest, payload.len() as u64)?;
        let range = dest.pool.alloc(payload.len() as u64)?;
        dest.pool.write(range, 0, &payload)?;
        items.push(Item::PayloadOff { offset: range.offset, size: range.len });
    }

    for (object, declared_size) in msg.memfds.drain(..) {
        crate::resource::validate_sealed_memfd(object.as_ref(), declared_size).into_result()?;
        let item_offset = header_relative_item_offset(&items);
        items.push(Item::PayloadMemfd { fd: protocol::FD_PLACEHOLDER, size: declared_size });
        pending_memfds.push(PendingMemfd { item_offset, object });
    }

    if !msg.fds.is_empty() {
        if !dest.accepts_fds() {
            return Err(BusError::CommunicationError);
        }
        let item_offset = header_relative_item_offset(&items);
        let placeholders = vec![protocol::FD_PLACEHOLDER; msg.fds.len()];
        items.push(Item::Fds(placeholders));
        for fd in msg.fds.drain(..) {
            pending_fds.push(PendingFd { item_offset, fd });
        }
    }

    if include_metadata {
        if let Some(creds) = &msg.creds {
            items.push(Item::Creds(creds.clone()));
        }
    }

    if let Some(note) = &msg.notify {
        items.push(Item::Metadata(note.clone()));
    }

    let header = Header {
        size: 0,
        flags: msg.flags,
        dst_id: dest.id,
        src_id: source_id,
        cookie: msg.cookie,
        timeout_ns: msg.timeout_ns,
        cookie_reply: msg.cookie_reply,
        priority: msg.priority,
        offset_reply: 0,
    };
    let _ = sequence; // sequence numbers order delivery but aren't wire-visible (§4.4 step 1, §9)

    let bytes = protocol::encode_message(header, &items);
    Ok((bytes, ResourceHolder { fds: pending_fds, memfds: pending_memfds }))
}

/// Running byte offset items would occupy, used only to compute where a
/// not-yet-appended item's body will land once `encode_message` lays
/// everything out; mirrors `encode_message`'s own `align8` accumulation.
fn header_relative_item_offset(items_so_far: &[Item]) -> usize {
    let mut off = Header::WIRE_SIZE;
    for item in items_so_far {
        off += 16 + align8_len(item);
    }
    off
}

fn align8_len(item: &Item) -> usize {
    let len = match item {
        Item::PayloadVec(b) => b.len(),
        Item::PayloadOff { .. } => 16,
        Item::PayloadMemfd { .. } => 12,
        Item::Fds(v) => v.len() * 4,
        Item::DstName(s) | Item::ConnName(s) | Item::Name(s) => s.as_bytes().len() + 1,
        Item::Creds(b) | Item::SecLabel(b) | Item::Metadata(b) => b.len(),
    };
    (len + 7) & !7
}

fn enforce_pool_fairness(dest: &Connection, requested: u64) -> Result<(), BusError> {
    let free = dest.pool.free();
    let capacity = dest.pool.capacity();
    // §8 Property 8: only bites once the pool has been drawn down at all
    // ("the free amount is less than total pool size"); an empty,
    // never-touched pool never trips it.
    if free < capacity && requested < free && requested > free / 2 {
        return Err(BusError::QuotaExceeded);
    }
    Ok(())
}

/// Kernel-originated send (no `source`): used for synthesized
/// notifications (`reply-dead`, `reply-timed-out`, `ID_REMOVE`, name
/// changes). Skips policy, reply-ceiling accounting, and credential
/// attachment entirely.
pub fn send_from_kernel(bus: &Bus, dest: &Arc<Connection>, mut msg: OutboundMessage) -> Result<u64, BusError> {
    if dest.is_disconnected() {
        return Err(BusError::ConnectionReset);
    }
    let sequence = bus.next_sequence();
    let (bytes, resources) = serialize_into(sequence, protocol::KERNEL_SRC, dest, &mut msg, false)?;
    dest.enqueue(msg.priority, protocol::KERNEL_SRC, bytes, resources, true, None, None)?;
    Ok(sequence)
}

/// The full unicast/broadcast send pipeline (§4.4). `source` is the
/// sending connection; broadcast is handled by the caller iterating the
/// bus and calling this once per surviving receiver is *not* how
/// broadcast fan-out works here -- see [`send_broadcast`] for the
/// dedicated best-effort path matching step 3's "errors are swallowed"
/// rule, which a per-receiver call to this function would not give you
/// (this function propagates every error to the caller).
pub fn send(bus: &Bus, source: &Arc<Connection>, config: &Config, mut msg: OutboundMessage) -> Result<SendOutcome, BusError> {
    let sequence = bus.next_sequence();

    if msg.dst_id == protocol::BROADCAST && msg.dst_name.is_none() {
        send_broadcast(bus, source, sequence, msg);
        return Ok(SendOutcome { sequence, reply_offset: None });
    }

    let (dest, name_sequence) = resolve_destination(bus, &msg)?;
    if dest.is_disconnected() {
        return Err(BusError::ConnectionReset);
    }

    let is_reply_match =
        msg.cookie_reply != 0 && dest.with_replies(|r| r.has_pending(msg.cookie_reply, source.id));

    if !is_reply_match && !bus.policy().allow_send(source.id, dest.id) {
        return Err(BusError::PermissionDenied);
    }

    let expect_reply = msg.flags & protocol::msg_flags::EXPECT_REPLY != 0;
    let is_sync = msg.flags & protocol::msg_flags::SYNC_REPLY != 0;
    let mut sync_slot: Option<ReplySlot> = None;

    if expect_reply {
        let within_ceiling = source.with_replies(|r| r.len() < config.reply_ceiling);
        if !within_ceiling {
            return Err(BusError::TooManyLinks);
        }
        let timeout = Duration::from_nanos(msg.timeout_ns);
        let slot = if is_sync {
            ReplySlot::new_sync(msg.cookie, dest.id, timeout)
        } else {
            ReplySlot::new_async(msg.cookie, dest.id, timeout)
        };
        source.with_replies(|r| r.push(slot.clone()));
        if is_sync {
            sync_slot = Some(slot);
        }
    }

    let shares_namespace = source.label.is_some() && source.label == dest.label;
    let (bytes, resources) = serialize_into(sequence, source.id, &dest, &mut msg, shares_namespace)?;

    let queue_len = dest.queue_len();
    if queue_len >= config.queue_ceiling && !bus.policy().is_privileged(source.id) {
        return Err(BusError::OutOfBuffers);
    }

    let reply_cookie = if expect_reply { Some(msg.cookie) } else { None };
    let entry_id = dest.enqueue(msg.priority, source.id, bytes, resources, false, name_sequence, reply_cookie)?;

    if is_reply_match {
        // This send itself IS the reply the destination has been
        // waiting for; the offset it was enqueued at is the value the
        // original synchronous (or async) caller receives (§4.4 step 10
        // is driven from the *other* side's `send` call -- here we just
        // perform the match so that side's `wait_sync`/timeout scan
        // observes it).
        dest.with_replies(|r| r.match_and_answer(msg.cookie_reply, source.id, entry_id));
    }

    for monitor in bus.monitors() {
        if monitor.id == source.id || monitor.id == dest.id {
            continue;
        }
        let _ = monitor.enqueue(msg.priority, source.id, Vec::new(), ResourceHolder::default(), true, None, None);
    }

    let reply_offset = if let Some(slot) = sync_slot {
        let offset = slot.wait_sync()?;
        source.with_replies(|r| {
            r.take(msg.cookie);
        });
        // The reply landed in `source`'s own queue: the replying peer's
        // `send` call resolved *its* `dest` to this connection when it
        // answered `msg.cookie`, and enqueued there -- not in `dest`,
        // which is this call's destination for the original request.
        recv::install_single(source, offset)?;
        Some(offset)
    } else {
        None
    };

    Ok(SendOutcome { sequence, reply_offset })
}

/// Broadcast fan-out (§4.4 step 3): skip the sender, activators, and
/// connections whose match predicate rejects the message; enqueue a
/// copy per surviving receiver; per-receiver errors are swallowed.
///
/// `metadata_sticky` reproduces the buffer-reuse quirk spec.md §9 calls
/// out to preserve: the first receiver in the batch that shares the
/// sender's namespace flips it, and it stays flipped for every
/// subsequent receiver in the same broadcast regardless of that
/// receiver's own namespace -- not a per-pair decision.
fn send_broadcast(bus: &Bus, source: &Arc<Connection>, sequence: u64, mut msg: OutboundMessage) {
    let mut metadata_sticky = false;
    for receiver in bus.snapshot() {
        if receiver.id == source.id || receiver.is_activator() {
            continue;
        }
        if !receiver.matches(source.id, msg.dst_name.as_deref()) {
            continue;
        }
        if source.label.is_some() && source.label == receiver.label {
            metadata_sticky = true;
        }
        // Broadcast does not carry fds/memfds in this design (every
        // receiver would need its own install, and §4.4 doesn't specify
        // per-receiver fd duplication for broadcast); payloads are
        // cloned per receiver instead of drained.
        let mut per_receiver = OutboundMessage {
            dst_id: protocol::BROADCAST,
            dst_name: msg.dst_name.clone(),
            cookie: msg.cookie,
            cookie_reply: msg.cookie_reply,
            priority: msg.priority,
            flags: msg.flags,
            timeout_ns: msg.timeout_ns,
            payloads: msg.payloads.clone(),
            memfds: Vec::new(),
            fds: Vec::new(),
            creds: msg.creds.clone(),
            notify: None,
        };
        if let Ok((bytes, resources)) =
            serialize_into(sequence, source.id, &receiver, &mut per_receiver, metadata_sticky)
        {
            let _ = receiver.enqueue(msg.priority, source.id, bytes, resources, false, None, None);
        }
    }
    msg.payloads.clear();
}
