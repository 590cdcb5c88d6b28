//! Wire protocol: message header, TLV items, and frame codec.
//!
//! Wire format for a frame on the bus socket (identical in shape to the
//! teacher's `broker::protocol::BrokerFrameDecoder`):
//!
//! ```text
//! [u32 LE: payload_len + 1] [u8: frame_type] [payload_bytes]
//! ```
//!
//! A `Send` frame's payload is a [`Header`] followed by [`Item`]s, laid out
//! per §4.3: every item is `[u64 size][u64 type][payload, 8-byte padded]`.

use crate::error::BusError;

/// Maximum frame payload size. Same cap the teacher uses for its own
/// length-prefixed socket protocol.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Destination id sentinel meaning "broadcast to every connection".
pub const BROADCAST: u64 = 0;
/// Source id sentinel meaning "message originated from the broker itself".
pub const KERNEL_SRC: u64 = 0;
/// Pool offset sentinel meaning "no address" (a null payload vector).
pub const OFFSET_NONE: u64 = u64::MAX;
/// Placeholder fd value for an item not yet installed in the receiver.
pub const FD_PLACEHOLDER: i32 = -1;

// ─── Frame type bytes ──────────────────────────────────────────────────────

/// Frame type byte constants for the bus wire protocol.
pub mod frame_type {
    /// Hello command (connection open).
    pub const HELLO: u8 = 0x01;
    /// Hello response: assigned connection id.
    pub const HELLO_REPLY: u8 = 0x02;
    /// Send command: a full [`super::Header`] + items.
    pub const SEND: u8 = 0x03;
    /// Send response: success or an error kind.
    pub const SEND_REPLY: u8 = 0x04;
    /// Receive command.
    pub const RECV: u8 = 0x05;
    /// Receive response: a delivered message or an error kind.
    pub const RECV_REPLY: u8 = 0x06;
    /// Conn-info command.
    pub const CONN_INFO: u8 = 0x07;
    /// Conn-info response.
    pub const CONN_INFO_REPLY: u8 = 0x08;
    /// Acquire a well-known name (§4.8).
    pub const NAME_ACQUIRE: u8 = 0x09;
    /// Acquire response: outcome (owner/queued) or an error kind.
    pub const NAME_ACQUIRE_REPLY: u8 = 0x0A;
    /// Release a well-known name this connection owns or is queued behind.
    pub const NAME_RELEASE: u8 = 0x0B;
    /// Release response: success or an error kind.
    pub const NAME_RELEASE_REPLY: u8 = 0x0C;
    /// List every registered name and its owner/activator.
    pub const NAME_LIST: u8 = 0x0D;
    /// List response.
    pub const NAME_LIST_REPLY: u8 = 0x0E;
}

// ─── Reply status codes ─────────────────────────────────────────────────────

/// Stable wire byte for each [`BusError`] variant, carried in a `*_REPLY`
/// frame so a client can match on the failure kind instead of parsing
/// `Display` text. Order mirrors `BusError`'s own declaration.
pub mod status {
    pub const OK: u8 = 0;
    pub const NO_SUCH_ADDRESS: u8 = 1;
    pub const NO_SUCH_ID: u8 = 2;
    pub const ADDRESS_NOT_AVAILABLE: u8 = 3;
    pub const CONNECTION_RESET: u8 = 4;
    pub const COMMUNICATION_ERROR: u8 = 5;
    pub const QUOTA_EXCEEDED: u8 = 6;
    pub const OUT_OF_BUFFERS: u8 = 7;
    pub const TOO_MANY_LINKS: u8 = 8;
    pub const BAD_FD: u8 = 9;
    pub const WRONG_MEDIUM: u8 = 10;
    pub const TEXT_BUSY: u8 = 11;
    pub const PERMISSION_DENIED: u8 = 12;
    pub const TIMED_OUT: u8 = 13;
    pub const BROKEN_PIPE: u8 = 14;
    pub const ALREADY: u8 = 15;
    pub const TRY_AGAIN: u8 = 16;
    pub const NO_MESSAGE: u8 = 17;
    pub const INTERRUPTED: u8 = 18;
    pub const INTERNAL: u8 = 19;
}

/// Map a [`BusError`] to its stable wire status byte (§7: callers on the
/// other side of a socket need the error *kind*, not its `Display` text).
pub fn error_status(err: &BusError) -> u8 {
    match err {
        BusError::NoSuchAddress => status::NO_SUCH_ADDRESS,
        BusError::NoSuchId => status::NO_SUCH_ID,
        BusError::AddressNotAvailable => status::ADDRESS_NOT_AVAILABLE,
        BusError::ConnectionReset => status::CONNECTION_RESET,
        BusError::CommunicationError => status::COMMUNICATION_ERROR,
        BusError::QuotaExceeded => status::QUOTA_EXCEEDED,
        BusError::OutOfBuffers => status::OUT_OF_BUFFERS,
        BusError::TooManyLinks => status::TOO_MANY_LINKS,
        BusError::BadFd => status::BAD_FD,
        BusError::WrongMedium => status::WRONG_MEDIUM,
        BusError::TextBusy => status::TEXT_BUSY,
        BusError::PermissionDenied => status::PERMISSION_DENIED,
        BusError::TimedOut => status::TIMED_OUT,
        BusError::BrokenPipe => status::BROKEN_PIPE,
        BusError::Already => status::ALREADY,
        BusError::TryAgain => status::TRY_AGAIN,
        BusError::NoMessage => status::NO_MESSAGE,
        BusError::Interrupted => status::INTERRUPTED,
        BusError::Internal(_) => status::INTERNAL,
    }
}

// ─── Message flags ─────────────────────────────────────────────────────────

/// Flags carried in a message [`Header`].
pub mod msg_flags {
    /// Sender expects a reply; a Reply Slot is allocated.
    pub const EXPECT_REPLY: u64 = 1 << 0;
    /// The expected reply is synchronous: the sender blocks for it.
    pub const SYNC_REPLY: u64 = 1 << 1;
    /// Do not auto-activate a name that has no live owner.
    pub const NO_AUTO_START: u64 = 1 << 2;
}

/// Flags accepted by the Hello command (connection open).
pub mod hello_flags {
    /// Connection consents to receive fds.
    pub const ACCEPT_FD: u64 = 1 << 0;
    /// Connection is an activator (requires privilege + a `NAME` item).
    pub const ACTIVATOR: u64 = 1 << 1;
    /// Connection receives a copy of every bus message (requires privilege).
    pub const MONITOR: u64 = 1 << 2;
}

/// Flags accepted by the Receive command.
pub mod recv_flags {
    /// Honor the connection's priority index instead of plain FIFO.
    pub const USE_PRIORITY: u64 = 1 << 0;
    /// Do not remove the entry from the queue.
    pub const PEEK: u64 = 1 << 1;
    /// Remove and discard the entry without reporting its payload.
    pub const DROP: u64 = 1 << 2;
}

/// Flags accepted by the Conn-info command.
pub mod attach_flags {
    /// Include the subject's currently owned names in the descriptor.
    pub const ATTACH_NAMES: u64 = 1 << 0;
}

fn has(flags: u64, bit: u64) -> bool {
    flags & bit != 0
}

// ─── Message header ─────────────────────────────────────────────────────────

/// The fixed header every delivered message begins with (§6).
///
/// All fields are already 8-byte aligned by construction (nine `u64`/`i64`
/// fields), so the header needs no explicit padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Total serialized size, including items. Patched after layout.
    pub size: u64,
    pub flags: u64,
    /// 0 = `BROADCAST`; nonzero id, or resolved via a `DST_NAME` item.
    pub dst_id: u64,
    /// 0 = kernel-originated.
    pub src_id: u64,
    pub cookie: u64,
    /// Absolute-duration-until-deadline for a reply, nanoseconds.
    pub timeout_ns: u64,
    /// Nonzero marks this message as the reply to that cookie.
    pub cookie_reply: u64,
    pub priority: i64,
    /// Output field for synchronous replies: offset of the reply payload.
    pub offset_reply: u64,
}

impl Header {
    pub const WIRE_SIZE: usize = 9 * 8;

    pub fn expects_reply(&self) -> bool {
        has(self.flags, msg_flags::EXPECT_REPLY)
    }

    pub fn is_sync_reply(&self) -> bool {
        has(self.flags, msg_flags::SYNC_REPLY)
    }

    pub fn no_auto_start(&self) -> bool {
        has(self.flags, msg_flags::NO_AUTO_START)
    }

    pub fn is_reply(&self) -> bool {
        self.cookie_reply != 0
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.dst_id.to_le_bytes());
        out.extend_from_slice(&self.src_id.to_le_bytes());
        out.extend_from_slice(&self.cookie.to_le_bytes());
        out.extend_from_slice(&self.timeout_ns.to_le_bytes());
        out.extend_from_slice(&self.cookie_reply.to_le_bytes());
        out.extend_from_slice(&self.priority.to_le_bytes());
        out.extend_from_slice(&self.offset_reply.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Result<Self, BusError> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(BusError::Internal("header too short".into()));
        }
        let u = |off: usize| u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        Ok(Header {
            size: u(0),
            flags: u(8),
            dst_id: u(16),
            src_id: u(24),
            cookie: u(32),
            timeout_ns: u(40),
            cookie_reply: u(48),
            priority: u(56) as i64,
            offset_reply: u(64),
        })
    }
}

// ─── TLV items ──────────────────────────────────────────────────────────────

/// Item type constants (§6 Item TLV).
pub mod item_type {
    pub const PAYLOAD_VEC: u64 = 1;
    pub const PAYLOAD_OFF: u64 = 2;
    pub const PAYLOAD_MEMFD: u64 = 3;
    pub const FDS: u64 = 4;
    pub const DST_NAME: u64 = 5;
    pub const CREDS: u64 = 6;
    pub const SECLABEL: u64 = 7;
    pub const CONN_NAME: u64 = 8;
    pub const NAME: u64 = 9;
    pub const METADATA: u64 = 10;
}

/// A decoded item, as it appears in a delivered (receiver-side) message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// Sender-side payload bytes, used only in a client's own `Send`
    /// request: the broker never stores or forwards one of these, it reads
    /// the bytes and turns each into a `PayloadOff` pointing into the
    /// receiver's pool (`send.rs::serialize_into`). A decoded *delivered*
    /// message never contains this variant.
    PayloadVec(Vec<u8>),
    /// Receiver-side payload vector: pool offset + size. `OFFSET_NONE` marks
    /// a null-address vector (zero-padded to preserve alignment).
    PayloadOff { offset: u64, size: u64 },
    /// A sealed-memfd payload: fd (placeholder `-1` until receive) + size.
    PayloadMemfd { fd: i32, size: u64 },
    /// Array of placeholder fd numbers, updated in place at receive time.
    Fds(Vec<i32>),
    /// The well-known name this message was addressed to, if any.
    DstName(String),
    /// Opaque credential bytes, attached for user-originated messages when
    /// sender and receiver share a naming namespace.
    Creds(Vec<u8>),
    /// Opaque security-label bytes.
    SecLabel(Vec<u8>),
    /// Debug label of the connection.
    ConnName(String),
    /// Activator name (Hello command).
    Name(String),
    /// Opaque metadata, appended verbatim.
    Metadata(Vec<u8>),
}

impl Item {
    fn type_tag(&self) -> u64 {
        match self {
            Item::PayloadVec(_) => item_type::PAYLOAD_VEC,
            Item::PayloadOff { .. } => item_type::PAYLOAD_OFF,
            Item::PayloadMemfd { .. } => item_type::PAYLOAD_MEMFD,
            Item::Fds(_) => item_type::FDS,
            Item::DstName(_) => item_type::DST_NAME,
            Item::Creds(_) => item_type::CREDS,
            Item::SecLabel(_) => item_type::SECLABEL,
            Item::ConnName(_) => item_type::CONN_NAME,
            Item::Name(_) => item_type::NAME,
            Item::Metadata(_) => item_type::METADATA,
        }
    }

    fn body(&self) -> Vec<u8> {
        match self {
            Item::PayloadVec(bytes) => bytes.clone(),
            Item::PayloadOff { offset, size } => {
                let mut b = Vec::with_capacity(16);
                b.extend_from_slice(&offset.to_le_bytes());
                b.extend_from_slice(&size.to_le_bytes());
                b
            }
            Item::PayloadMemfd { fd, size } => {
                let mut b = Vec::with_capacity(12);
                b.extend_from_slice(&fd.to_le_bytes());
                b.extend_from_slice(&size.to_le_bytes());
                b
            }
            Item::Fds(fds) => fds.iter().flat_map(|f| f.to_le_bytes()).collect(),
            Item::DstName(s) | Item::ConnName(s) | Item::Name(s) => {
                let mut b = s.as_bytes().to_vec();
                b.push(0);
                b
            }
            Item::Creds(b) | Item::SecLabel(b) | Item::Metadata(b) => b.clone(),
        }
    }

    fn from_wire(tag: u64, body: &[u8]) -> Result<Self, BusError> {
        match tag {
            item_type::PAYLOAD_VEC => Ok(Item::PayloadVec(body.to_vec())),
            item_type::PAYLOAD_OFF => {
                if body.len() < 16 {
                    return Err(BusError::Internal("PAYLOAD_OFF item truncated".into()));
                }
                let offset = u64::from_le_bytes(body[0..8].try_into().unwrap());
                let size = u64::from_le_bytes(body[8..16].try_into().unwrap());
                Ok(Item::PayloadOff { offset, size })
            }
            item_type::PAYLOAD_MEMFD => {
                if body.len() < 12 {
                    return Err(BusError::Internal("PAYLOAD_MEMFD item truncated".into()));
                }
                let fd = i32::from_le_bytes(body[0..4].try_into().unwrap());
                let size = u64::from_le_bytes(body[4..12].try_into().unwrap());
                Ok(Item::PayloadMemfd { fd, size })
            }
            item_type::FDS => {
                if body.len() % 4 != 0 {
                    return Err(BusError::Internal("FDS item misaligned".into()));
                }
                let fds = body
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
                    .collect();
                Ok(Item::Fds(fds))
            }
            item_type::DST_NAME => Ok(Item::DstName(cstr(body)?)),
            item_type::CONN_NAME => Ok(Item::ConnName(cstr(body)?)),
            item_type::NAME => Ok(Item::Name(cstr(body)?)),
            item_type::CREDS => Ok(Item::Creds(body.to_vec())),
            item_type::SECLABEL => Ok(Item::SecLabel(body.to_vec())),
            item_type::METADATA => Ok(Item::Metadata(body.to_vec())),
            other => Err(BusError::Internal(format!("unknown item type {other}"))),
        }
    }
}

fn cstr(body: &[u8]) -> Result<String, BusError> {
    let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
    std::str::from_utf8(&body[..end])
        .map(|s| s.to_owned())
        .map_err(|e| BusError::Internal(format!("item is not UTF-8: {e}")))
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Encode a full message (header + items) into a contiguous byte buffer,
/// patching `size` after layout so a receiver can walk items without
/// trailing information (§4.3).
pub fn encode_message(mut header: Header, items: &[Item]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(Header::WIRE_SIZE + items.len() * 32);
    header.encode(&mut buf);
    for item in items {
        let body = item.body();
        let item_len = align8(body.len());
        buf.extend_from_slice(&(item_len as u64).to_le_bytes());
        buf.extend_from_slice(&item.type_tag().to_le_bytes());
        buf.extend_from_slice(&body);
        buf.resize(buf.len() + (item_len - body.len()), 0);
    }
    let total = buf.len() as u64;
    buf[0..8].copy_from_slice(&total.to_le_bytes());
    buf
}

/// Decode a full message (header + items) from a contiguous byte buffer.
pub fn decode_message(buf: &[u8]) -> Result<(Header, Vec<Item>), BusError> {
    let header = Header::decode(buf)?;
    let mut items = Vec::new();
    let mut off = Header::WIRE_SIZE;
    while off < buf.len() {
        if off + 16 > buf.len() {
            return Err(BusError::Internal("truncated item header".into()));
        }
        let item_len = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap()) as usize;
        let tag = u64::from_le_bytes(buf[off + 8..off + 16].try_into().unwrap());
        let body_start = off + 16;
        let body_end = body_start + item_len;
        if body_end > buf.len() {
            return Err(BusError::Internal("item body overruns message".into()));
        }
        // The body may be zero-padded beyond its logical length (e.g. the
        // null-address PAYLOAD_OFF sentinel); item decoders only look at
        // the bytes they need, so padding is harmless here.
        items.push(Item::from_wire(tag, &buf[body_start..body_end])?);
        off = body_end;
    }
    Ok((header, items))
}

// ─── Frame codec ────────────────────────────────────────────────────────────

fn encode_raw(ft: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32;
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(ft);
    buf.extend_from_slice(payload);
    buf
}

/// Encode a frame with the given type byte and raw payload bytes.
pub fn encode_frame(ft: u8, payload: &[u8]) -> Vec<u8> {
    encode_raw(ft, payload)
}

/// A decoded frame: the type byte and its payload bytes.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub frame_type: u8,
    pub payload: Vec<u8>,
}

/// Incremental length-prefixed frame decoder, same byte-accumulation design
/// as the teacher's `BrokerFrameDecoder`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes and extract all complete frames. Incomplete data is
    /// retained for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<RawFrame>, BusError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < 4 {
                break;
            }
            let length = u32::from_le_bytes(self.buf[0..4].try_into().unwrap());
            if length == 0 {
                return Err(BusError::Internal("zero-length frame".into()));
            }
            if length > MAX_FRAME_SIZE {
                return Err(BusError::Internal(format!("frame too large: {length} bytes")));
            }
            let total = 4 + length as usize;
            if self.buf.len() < total {
                break;
            }
            let frame_type = self.buf[4];
            let payload = self.buf[5..total].to_vec();
            frames.push(RawFrame { frame_type, payload });
            self.buf.drain(..total);
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            size: 0,
            flags: msg_flags::EXPECT_REPLY,
            dst_id: 20,
            src_id: 10,
            cookie: 1,
            timeout_ns: 0,
            cookie_reply: 0,
            priority: -5,
            offset_reply: 0,
        }
    }

    #[test]
    fn header_round_trip_via_message() {
        let header = sample_header();
        let items = vec![Item::DstName("org.example.Foo".into())];
        let encoded = encode_message(header, &items);
        let (decoded_header, decoded_items) = decode_message(&encoded).unwrap();
        assert_eq!(decoded_header.dst_id, 20);
        assert_eq!(decoded_header.src_id, 10);
        assert_eq!(decoded_header.cookie, 1);
        assert_eq!(decoded_header.priority, -5);
        assert_eq!(decoded_header.size, encoded.len() as u64);
        assert_eq!(decoded_items, items);
    }

    #[test]
    fn items_are_eight_byte_aligned() {
        let header = sample_header();
        let items = vec![
            Item::DstName("a".into()),
            Item::PayloadOff { offset: 0, size: 1 },
            Item::Fds(vec![1, 2, 3]),
        ];
        let encoded = encode_message(header, &items);
        let mut off = Header::WIRE_SIZE;
        while off < encoded.len() {
            let item_len = u64::from_le_bytes(encoded[off..off + 8].try_into().unwrap()) as usize;
            assert_eq!(item_len % 8, 0, "item length must be 8-byte aligned");
            off += 16 + item_len;
        }
    }

    #[test]
    fn null_address_vector_uses_offset_none_sentinel() {
        let header = sample_header();
        let items = vec![Item::PayloadOff { offset: OFFSET_NONE, size: 0 }];
        let encoded = encode_message(header, &items);
        let (_, decoded) = decode_message(&encoded).unwrap();
        assert_eq!(decoded[0], Item::PayloadOff { offset: OFFSET_NONE, size: 0 });
    }

    #[test]
    fn frame_decoder_reassembles_partial_feeds() {
        let frame = encode_frame(frame_type::SEND, b"hello");
        let mut dec = FrameDecoder::new();
        let mid = frame.len() / 2;
        assert!(dec.feed(&frame[..mid]).unwrap().is_empty());
        let frames = dec.feed(&frame[mid..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, frame_type::SEND);
        assert_eq!(frames[0].payload, b"hello");
    }

    #[test]
    fn frame_decoder_rejects_zero_length() {
        let bad = [0u8, 0, 0, 0, frame_type::SEND];
        assert!(FrameDecoder::new().feed(&bad).is_err());
    }

    #[test]
    fn frame_decoder_handles_multiple_frames_in_one_feed() {
        let f1 = encode_frame(frame_type::HELLO, b"x");
        let f2 = encode_frame(frame_type::RECV, b"yy");
        let mut combined = f1.clone();
        combined.extend_from_slice(&f2);
        let frames = FrameDecoder::new().feed(&combined).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame_type, frame_type::HELLO);
        assert_eq!(frames[1].frame_type, frame_type::RECV);
    }

    #[test]
    fn payload_vec_item_round_trips_raw_bytes() {
        let header = sample_header();
        let items = vec![Item::PayloadVec(b"raw client bytes".to_vec())];
        let encoded = encode_message(header, &items);
        let (_, decoded) = decode_message(&encoded).unwrap();
        assert_eq!(decoded[0], Item::PayloadVec(b"raw client bytes".to_vec()));
    }

    #[test]
    fn every_bus_error_variant_maps_to_a_distinct_status_byte() {
        let errs = [
            BusError::NoSuchAddress,
            BusError::NoSuchId,
            BusError::AddressNotAvailable,
            BusError::ConnectionReset,
            BusError::CommunicationError,
            BusError::QuotaExceeded,
            BusError::OutOfBuffers,
            BusError::TooManyLinks,
            BusError::BadFd,
            BusError::WrongMedium,
            BusError::TextBusy,
            BusError::PermissionDenied,
            BusError::TimedOut,
            BusError::BrokenPipe,
            BusError::Already,
            BusError::TryAgain,
            BusError::NoMessage,
            BusError::Interrupted,
            BusError::Internal("x".into()),
        ];
        let mut codes: Vec<u8> = errs.iter().map(error_status).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
        assert!(codes.iter().all(|c| *c != status::OK));
    }

    #[test]
    fn fds_item_round_trips_multiple_descriptors() {
        let header = sample_header();
        let items = vec![Item::Fds(vec![5, 6, 7, 8])];
        let encoded = encode_message(header, &items);
        let (_, decoded) = decode_message(&encoded).unwrap();
        assert_eq!(decoded[0], Item::Fds(vec![5, 6, 7, 8]));
    }
}
