//! Receive Pipeline: select the next message (FIFO or by priority
//! floor), install fds into the receiver, and support peek/drop (§4.5).
//!
//! Grounded on spec.md §4.5 step-by-step, with `broker/mod.rs`'s
//! `handle_connection` dispatch loop as the structural model for
//! "decode a frame, resolve destination, act, reply."

use std::collections::{HashMap, VecDeque};

use crate::connection::Connection;
use crate::error::BusError;
use crate::pool::PoolRange;
use crate::protocol::{self, recv_flags, Header, Item};
use crate::queue::QueueEntry;
use crate::resource::FdTable;

/// Result of a receive command.
#[derive(Debug)]
pub enum RecvOutcome {
    /// `DROP` succeeded: entry removed, pool ranges freed, no payload
    /// reported.
    Dropped,
    /// `PEEK` succeeded: entry left on the queue, nothing installed.
    Peeked { entry_id: u64, header: Header, items: Vec<Item> },
    /// Full receive succeeded: entry removed and fds installed.
    Delivered { entry_id: u64, header: Header, items: Vec<Item> },
}

pub(crate) fn free_payload_ranges(pool: &dyn crate::pool::Pool, items: &[Item]) -> Result<(), BusError> {
    for item in items {
        if let Item::PayloadOff { offset, size } = item {
            if *offset != protocol::OFFSET_NONE {
                pool.free_range(PoolRange { offset: *offset, len: *size })?;
            }
        }
    }
    Ok(())
}

fn encoded_item_len(item: &Item) -> usize {
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

/// Patch placeholder fd numbers (`-1`) in a decoded item list with the
/// numbers actually installed in the receiver. `patches` pairs a byte
/// offset (as computed by `send.rs`'s `serialize_into`, identical in
/// meaning to the running offset this function recomputes while walking
/// the freshly decoded `items`) with the fd installed for it; several
/// patches can share one offset when an `Fds` item carries more than one
/// descriptor.
fn apply_fd_patches(items: &mut [Item], patches: &[(usize, i32)]) {
    let mut by_offset: HashMap<usize, VecDeque<i32>> = HashMap::new();
    for (offset, fd) in patches {
        by_offset.entry(*offset).or_default().push_back(*fd);
    }

    let mut byte_off = Header::WIRE_SIZE;
    for item in items.iter_mut() {
        let len = encoded_item_len(item);
        if let Some(queued) = by_offset.get_mut(&byte_off) {
            match item {
                Item::PayloadMemfd { fd, .. } => {
                    if let Some(new_fd) = queued.pop_front() {
                        *fd = new_fd;
                    }
                }
                Item::Fds(fds) => {
                    for slot in fds.iter_mut().filter(|f| **f == protocol::FD_PLACEHOLDER) {
                        match queued.pop_front() {
                            Some(new_fd) => *slot = new_fd,
                            None => break,
                        }
                    }
                }
                _ => {}
            }
        }
        byte_off += 16 + len;
    }
}

fn find_entry(q: &mut crate::queue::MessageQueue, id: u64) -> Option<&mut QueueEntry> {
    q.entries_mut().get_mut(&id)
}

/// Run one receive command against `conn`'s queue (§4.5).
pub fn receive(
    conn: &Connection,
    flags: u64,
    priority_floor: Option<i64>,
    fd_table: &dyn FdTable,
) -> Result<RecvOutcome, BusError> {
    let use_priority = flags & recv_flags::USE_PRIORITY != 0;
    let peek = flags & recv_flags::PEEK != 0;
    let drop_flag = flags & recv_flags::DROP != 0;

    if drop_flag {
        let entry = conn.with_queue(|q| {
            if use_priority { q.pop_priority(priority_floor) } else { Ok(q.pop_fifo()) }
        })?;
        let entry = entry.ok_or(BusError::TryAgain)?;
        let (_, items) = protocol::decode_message(&entry.bytes)?;
        free_payload_ranges(conn.pool.as_ref(), &items)?;
        return Ok(RecvOutcome::Dropped);
    }

    let selected = conn.with_queue(|q| {
        let found = if use_priority { q.peek_priority(priority_floor) } else { Ok(q.peek_fifo()) }?;
        Ok::<_, BusError>(found.map(|e| (e.id, e.bytes.clone())))
    })?;
    let (entry_id, bytes) = selected.ok_or(BusError::TryAgain)?;
    let (header, mut items) = protocol::decode_message(&bytes)?;

    if peek {
        return Ok(RecvOutcome::Peeked { entry_id, header, items });
    }

    // Attempt the install before removing anything from the queue: on
    // failure nothing above has mutated the queue or the entry's
    // `ResourceHolder`, so the entry is trivially left for retry (§4.5).
    let patches = conn.with_queue(|q| -> Result<Vec<(usize, i32)>, BusError> {
        let entry_ref = find_entry(q, entry_id).ok_or(BusError::TryAgain)?;
        let mut patches = Vec::new();
        entry_ref.resources.install_into(fd_table, |off, fd| patches.push((off, fd)))?;
        Ok(patches)
    })?;
    apply_fd_patches(&mut items, &patches);

    let entry = conn.with_queue(|q| q.remove(entry_id)).ok_or(BusError::TryAgain)?;
    drop(entry); // closes the broker's own fd/memfd references now that install succeeded
    free_payload_ranges(conn.pool.as_ref(), &items)?;

    Ok(RecvOutcome::Delivered { entry_id, header, items })
}

/// Install resources for exactly one already-enqueued message without
/// going through the full `receive` flag machinery -- used by the send
/// pipeline's synchronous-reply path (§4.4 step 10: "invoke the receive
/// pipeline on the source connection to install resources for that
/// single message").
pub fn install_single(conn: &Connection, entry_id: u64) -> Result<(), BusError> {
    let bytes = conn
        .with_queue(|q| find_entry(q, entry_id).map(|e| e.bytes.clone()))
        .ok_or(BusError::NoMessage)?;
    let (_, mut items) = protocol::decode_message(&bytes)?;

    let table = crate::resource::TestFdTable::new();
    let patches = conn.with_queue(|q| -> Result<Vec<(usize, i32)>, BusError> {
        let entry_ref = find_entry(q, entry_id).ok_or(BusError::NoMessage)?;
        let mut patches = Vec::new();
        entry_ref.resources.install_into(&table, |off, fd| patches.push((off, fd)))?;
        Ok(patches)
    })?;
    apply_fd_patches(&mut items, &patches);
    Ok(())
}
