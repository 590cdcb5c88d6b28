//! Daemon configuration: socket path, pool sizing, and the ceilings the
//! send pipeline enforces (§4.4 steps 6-7).
//!
//! Grounded on the teacher's `config.rs` load/save/default shape (a
//! `serde`-derived struct read from a JSON file on disk, falling back to
//! `Default` when absent).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// Per-source pending-reply ceiling and per-connection queue ceiling
/// aren't given concrete numbers anywhere in the spec ("enforce a
/// per-source pending-reply ceiling" / "per-connection queue-count
/// ceiling"); these defaults are picked to be generous for interactive
/// use while still bounding a misbehaving peer, matching the values
/// kdbus itself ships for its analogous `KDBUS_CONN_MAX_*` limits.
pub const DEFAULT_REPLY_CEILING: usize = 128;
pub const DEFAULT_QUEUE_CEILING: usize = 1024;
pub const DEFAULT_POOL_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Unix domain socket path the broker listens on.
    pub socket_path: PathBuf,
    /// Bytes allocated for each new connection's receive pool.
    pub pool_size: u64,
    /// Per-connection message queue ceiling (§4.4 step 7). Privileged
    /// connections (per `Policy::is_privileged`) are exempt.
    pub queue_ceiling: usize,
    /// Per-source outstanding-reply-slot ceiling (§4.4 step 6).
    pub reply_ceiling: usize,
    /// Uids treated as privileged for policy purposes when no richer
    /// `Policy` implementation is supplied.
    pub privileged_uids: Vec<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: PathBuf::from("/run/busd/bus"),
            pool_size: DEFAULT_POOL_SIZE,
            queue_ceiling: DEFAULT_QUEUE_CEILING,
            reply_ceiling: DEFAULT_REPLY_CEILING,
            privileged_uids: vec![0],
        }
    }
}

impl Config {
    /// Load from `path`, falling back to `Config::default()` if the file
    /// doesn't exist.
    pub fn load(path: &Path) -> Result<Self, BusError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| BusError::Internal(format!("invalid config at {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(BusError::Internal(format!("reading config at {}: {e}", path.display()))),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), BusError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BusError::Internal(format!("serializing config: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| BusError::Internal(format!("writing config to {}: {e}", path.display())))
    }
}
