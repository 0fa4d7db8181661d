//! Download queue and transfer coordination core for a DC/ADC-family
//! peer-to-peer file sharing client.
//!
//! This crate owns the persistent download queue (bundles, queue items,
//! segments, sources), decides what a given peer connection should
//! transfer next, allocates byte-range segments to parallel connections,
//! and drives each peer connection through the handshake/transfer
//! lifecycle. File I/O, hashing, hub chat, and GUI concerns are external
//! collaborators reached through the traits in [`collaborators`].

#[macro_use]
extern crate serde_derive;

pub mod bundle;
pub mod collaborators;
pub mod conf;
pub mod connection;
pub mod context;
pub mod download;
pub mod download_manager;
pub mod error;
pub mod events;
pub mod persistence;
pub mod protocol;
pub mod queue_item;
mod queue_manager;
pub mod scheduler;
pub mod segment;
mod user_queue;

pub use queue_manager::QueueManager;

use std::fmt;

/// A 24-byte Tiger-Tree root hash: the content identity of a file.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tth(pub [u8; 24]);

/// A 24-byte client identifier of a user.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cid(pub [u8; 24]);

/// An opaque token correlating a connection-request with the resulting
/// inbound or outbound connection. Unique across all live
/// connection-requests (invariant 4, spec.md §3.4).
pub type Token = String;

/// Identifies a single bundle (directory-level download job).
pub type BundleToken = String;

impl Tth {
    pub fn to_base32(&self) -> String {
        base32::encode(base32::Alphabet::RFC4648 { padding: false }, &self.0)
    }
}

impl Cid {
    pub fn to_base32(&self) -> String {
        base32::encode(base32::Alphabet::RFC4648 { padding: false }, &self.0)
    }
}

impl fmt::Debug for Tth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tth({})", self.to_base32())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.to_base32())
    }
}

/// A user as seen by the queue: identity plus the hub through which we
/// currently know them (a user may be reachable via several hubs, but a
/// [`Source`](queue_item::Source) pins the hub hint it was discovered on).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct User {
    pub cid: Cid,
    pub nick: String,
}

/// A user together with the hub URL it was encountered on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HintedUser {
    pub user: User,
    pub hub_url: String,
}

/// Download priority, ordered from least to most eager. `PausedForced`
/// sorts below `Paused`: it additionally disconnects active downloads
/// (spec.md §4.4 "priority change").
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    PausedForced,
    Paused,
    Lowest,
    Low,
    Normal,
    High,
    Highest,
}

impl Priority {
    pub fn is_paused(&self) -> bool {
        matches!(self, Priority::Paused | Priority::PausedForced)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// The kind of download a connection is being picked for (spec.md §4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadType {
    /// Either kind is acceptable.
    Any,
    /// A small reserved channel for partial lists / tiny viewable files
    /// so they don't queue behind large file transfers.
    Small,
    /// A normal-sized MCN (multi-connection) slot.
    McnNormal,
}

/// Derives a [`QueueItem`](queue_item::QueueItem)'s `maxSegments` from its
/// size (spec.md §3.2): 1 below 2 MiB, scaling up to 10 at or above 1920
/// MiB.
pub fn default_max_segments(size: i64) -> u8 {
    const MIB: i64 = 1024 * 1024;
    if size < 2 * MIB {
        1
    } else if size >= 1920 * MIB {
        10
    } else {
        // linear ramp between 2 MiB (1 segment) and 1920 MiB (10 segments)
        let steps = 9;
        let span = 1920 * MIB - 2 * MIB;
        let frac = (size - 2 * MIB) as f64 / span as f64;
        1 + (frac * steps as f64).round() as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_max_segments() {
        const MIB: i64 = 1024 * 1024;
        assert_eq!(default_max_segments(MIB), 1);
        assert_eq!(default_max_segments(2 * MIB - 1), 1);
        assert_eq!(default_max_segments(1920 * MIB), 10);
        assert_eq!(default_max_segments(10_000 * MIB), 10);
        // somewhere in the middle should be strictly between 1 and 10
        let mid = default_max_segments(500 * MIB);
        assert!(mid > 1 && mid < 10);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::PausedForced < Priority::Paused);
        assert!(Priority::Paused < Priority::Lowest);
        assert!(Priority::Highest > Priority::High);
    }
}
