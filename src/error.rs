//! Closed error enum for the broker core.
//!
//! One variant per row of the error-kind table: callers match on `BusError`
//! directly rather than parsing strings, which the synchronous reply path
//! and the test suite both depend on.

use thiserror::Error;

/// All ways a bus operation can fail.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// By-name destination not found.
    #[error("no such address")]
    NoSuchAddress,

    /// By-id destination not found, or not addressable (activator/monitor).
    #[error("no such id")]
    NoSuchId,

    /// `NO_AUTO_START` was set and only an activator exists for the name.
    #[error("address not available")]
    AddressNotAvailable,

    /// Destination (or endpoint) is already disconnected.
    #[error("connection reset")]
    ConnectionReset,

    /// Destination does not accept fds but the message carries fds.
    #[error("communication error")]
    CommunicationError,

    /// Requested allocation exceeds the fair share of the receiver's pool.
    #[error("quota exceeded")]
    QuotaExceeded,

    /// Receiver's per-connection queue ceiling reached.
    #[error("out of buffers")]
    OutOfBuffers,

    /// Source reached its pending-reply ceiling.
    #[error("too many links")]
    TooManyLinks,

    /// Fd lookup failed, or a memfd's declared size exceeds its real size.
    #[error("bad fd")]
    BadFd,

    /// Fd passed as a payload-memfd is not a broker memfd.
    #[error("wrong medium")]
    WrongMedium,

    /// Memfd payload is not sealed.
    #[error("text busy")]
    TextBusy,

    /// Policy refused the send, or privilege was required and absent.
    #[error("permission denied")]
    PermissionDenied,

    /// Synchronous reply deadline elapsed.
    #[error("timed out")]
    TimedOut,

    /// Synchronous peer died before replying.
    #[error("broken pipe")]
    BrokenPipe,

    /// Duplicate disconnect, or the name is already owned and conflict
    /// resolution did not apply.
    #[error("already")]
    Already,

    /// Receive attempted on an empty queue.
    #[error("try again")]
    TryAgain,

    /// Priority floor unmet by the cached-highest entry.
    #[error("no message")]
    NoMessage,

    /// Synchronous wait was interrupted before the deadline or an answer.
    #[error("interrupted")]
    Interrupted,

    /// An invariant the core relies on was violated (e.g. a poisoned lock).
    /// Never expected in correct operation; surfaced rather than panicking
    /// so a single broker bug cannot take down the whole bus process.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type BusResult<T> = Result<T, BusError>;
