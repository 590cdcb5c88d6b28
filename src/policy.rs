//! Policy and match-predicate collaborators (§1: "out of scope... consulted
//! via a boolean predicate"). New code: spec.md treats both as external
//! collaborators rather than naming a concrete algorithm, so this module
//! just ships the trait plus a permissive default so the crate is usable
//! standalone. `MatchPredicate` itself lives in `connection.rs` next to
//! the type it's stored alongside; this module adds the policy half and
//! the shared `AllowAll` implementations of both.

use crate::connection::MatchPredicate;

/// Consulted before a unicast send is allowed to proceed (§4.4 step 5).
/// Returning `false` yields `BusError::PermissionDenied`.
pub trait Policy: Send + Sync {
    fn allow_send(&self, source: u64, destination: u64) -> bool;

    /// Whether `conn` may set a privileged hello option (`ACTIVATOR`,
    /// `MONITOR`, `CREDS`/`SECLABEL` impersonation) or exceed the
    /// ordinary per-connection queue ceiling (§6, §4.4 step 7).
    fn is_privileged(&self, conn: u64) -> bool;
}

/// Default policy: every send and every privileged action is allowed.
/// Suitable for tests and for embedding in a trusted single-user
/// environment; a real deployment supplies its own `Policy`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Policy for AllowAll {
    fn allow_send(&self, _source: u64, _destination: u64) -> bool {
        true
    }

    fn is_privileged(&self, _conn: u64) -> bool {
        true
    }
}

impl MatchPredicate for AllowAll {
    fn matches(&self, _sender: u64, _dst_name: Option<&str>) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_all_allows_everything() {
        let p = AllowAll;
        assert!(p.allow_send(1, 2));
        assert!(p.is_privileged(1));
        assert!(MatchPredicate::matches(&p, 1, Some("x")));
    }
}
