//! The per-receiver pool allocator contract.
//!
//! Spec treats the pool as an external collaborator, used only through its
//! allocate/write/free/move contract (§1, §4.2, §5): "single-writer (only
//! the broker writes; the receiver reads via memory mapping)", serialized
//! under the connection lock. There is no pool allocator in the teacher
//! repo to ground this on directly — this is new code built strictly to
//! the stated contract, with a `Vec<u8>`-backed test implementation
//! standing in for a real shared-memory-file-backed allocator.

use crate::error::BusError;

/// A range allocated from a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRange {
    pub offset: u64,
    pub len: u64,
}

/// Per-receiver byte allocator with offset-based writes, range free, and
/// cross-pool move.
///
/// Implementations must be `Send + Sync`: the broker serializes writes
/// under the owning connection's mutex (§5), but the pool itself is shared
/// via `Arc` alongside the connection.
pub trait Pool: Send + Sync + std::fmt::Debug {
    /// Total capacity of the pool in bytes.
    fn capacity(&self) -> u64;

    /// Bytes currently free (not covered by a live allocation).
    fn free(&self) -> u64;

    /// Allocate `len` bytes, returning the range. Fails if there isn't a
    /// contiguous free span of that length.
    fn alloc(&self, len: u64) -> Result<PoolRange, BusError>;

    /// Write `data` at `range.offset`. `data.len()` must not exceed
    /// `range.len`.
    fn write(&self, range: PoolRange, offset_within: u64, data: &[u8]) -> Result<(), BusError>;

    /// Read back bytes written at `range` (test/debug use — a real receiver
    /// would memory-map the pool and read directly, never through the
    /// broker).
    fn read(&self, range: PoolRange) -> Result<Vec<u8>, BusError>;

    /// Release a previously allocated range.
    fn free_range(&self, range: PoolRange) -> Result<(), BusError>;

    /// Flush a range for DMA/cache coherence after a full receive (§4.5).
    /// A no-op for in-memory test pools; present so the contract mirrors a
    /// real shared-memory pool.
    fn flush(&self, _range: PoolRange) -> Result<(), BusError> {
        Ok(())
    }

    /// Copy bytes from another pool's range into a fresh allocation in this
    /// pool (used when retargeting a queued entry, e.g. name-activation
    /// handoff never needs this today, but broadcast-from-sender-pool
    /// designs commonly do; kept as part of the external contract).
    fn move_from(&self, src: &dyn Pool, src_range: PoolRange) -> Result<PoolRange, BusError> {
        let bytes = src.read(src_range)?;
        let dst_range = self.alloc(bytes.len() as u64)?;
        self.write(dst_range, 0, &bytes)?;
        Ok(dst_range)
    }
}

/// A simple `Vec<u8>`-backed pool with a free-list allocator. Sufficient to
/// drive every test in this crate; not meant to be a production allocator.
#[derive(Debug)]
pub struct TestPool {
    capacity: u64,
    inner: std::sync::Mutex<TestPoolInner>,
}

#[derive(Debug)]
struct TestPoolInner {
    bytes: Vec<u8>,
    // Sorted list of (offset, len) free spans.
    free_spans: Vec<(u64, u64)>,
}

impl TestPool {
    pub fn new(capacity: u64) -> Self {
        TestPool {
            capacity,
            inner: std::sync::Mutex::new(TestPoolInner {
                bytes: vec![0u8; capacity as usize],
                free_spans: vec![(0, capacity)],
            }),
        }
    }
}

impl Pool for TestPool {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn free(&self) -> u64 {
        let inner = self.inner.lock().expect("pool mutex poisoned");
        inner.free_spans.iter().map(|(_, l)| l).sum()
    }

    fn alloc(&self, len: u64) -> Result<PoolRange, BusError> {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        let idx = inner
            .free_spans
            .iter()
            .position(|(_, span_len)| *span_len >= len)
            .ok_or(BusError::OutOfBuffers)?;
        let (span_off, span_len) = inner.free_spans[idx];
        if span_len == len {
            inner.free_spans.remove(idx);
        } else {
            inner.free_spans[idx] = (span_off + len, span_len - len);
        }
        Ok(PoolRange { offset: span_off, len })
    }

    fn write(&self, range: PoolRange, offset_within: u64, data: &[u8]) -> Result<(), BusError> {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        if offset_within + data.len() as u64 > range.len {
            return Err(BusError::Internal("write overruns allocated range".into()));
        }
        let start = (range.offset + offset_within) as usize;
        inner.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, range: PoolRange) -> Result<Vec<u8>, BusError> {
        let inner = self.inner.lock().expect("pool mutex poisoned");
        let start = range.offset as usize;
        let end = start + range.len as usize;
        Ok(inner.bytes[start..end].to_vec())
    }

    fn free_range(&self, range: PoolRange) -> Result<(), BusError> {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        inner.free_spans.push((range.offset, range.len));
        inner.free_spans.sort_unstable_by_key(|(off, _)| *off);
        // Coalesce adjacent spans so repeated alloc/free doesn't fragment
        // the pool into unusable slivers across a long-running test.
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(inner.free_spans.len());
        for (off, len) in inner.free_spans.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.0 + last.1 == off {
                    last.1 += len;
                    continue;
                }
            }
            merged.push((off, len));
        }
        inner.free_spans = merged;
        Ok(())
    }
}
