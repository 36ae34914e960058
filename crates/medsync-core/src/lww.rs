//! Last-Writer-Wins merge rule
//!
//! Local and remote copies of an entity are reconciled by `updated_at`:
//!
//! - no local copy: the remote copy wins
//! - both present: the strictly later `updated_at` wins
//! - equal timestamps: the local copy wins, so a same-timestamp echo of a
//!   local edit coming back from the remote never discards it
//!
//! The tie rule makes the merge asymmetric on purpose. It is idempotent:
//! merging the same remote copy twice leaves the local copy unchanged the
//! second time.

use crate::entity::Timestamp;

/// Outcome of reconciling a local copy against an incoming remote copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// Keep what is in the local cache.
    KeepLocal,
    /// Replace (or insert) the local copy with the remote one.
    TakeRemote,
}

/// Anything carrying the timestamp the merge rule orders by.
pub trait Versioned {
    fn version(&self) -> Timestamp;
}

/// Decide between a local timestamp (if any) and a remote one.
pub fn resolve(local: Option<Timestamp>, remote: Timestamp) -> Resolution {
    match local {
        None => Resolution::TakeRemote,
        Some(local) if remote > local => Resolution::TakeRemote,
        Some(_) => Resolution::KeepLocal,
    }
}

/// Whether a direct write of `incoming` may overwrite `existing`.
///
/// Writes that are not older than what is stored are accepted, so a user
/// edit stamped in the same instant as the cached copy still lands.
pub fn accepts(existing: Option<Timestamp>, incoming: Timestamp) -> bool {
    match existing {
        None => true,
        Some(existing) => incoming >= existing,
    }
}

/// Pick the winner between a local and a remote value.
pub fn merge<'a, T: Versioned>(local: Option<&'a T>, remote: &'a T) -> &'a T {
    match (local, resolve(local.map(Versioned::version), remote.version())) {
        (Some(local), Resolution::KeepLocal) => local,
        _ => remote,
    }
}
