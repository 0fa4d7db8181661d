//! A `Download` tracks a single connection's ongoing transfer of one
//! segment of one queue item.

use std::time::{Duration, Instant};

use crate::{segment::Segment, Token};

/// What kind of content is being transferred.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadContentType {
    /// A byte range of a regular file.
    File,
    /// A TTH tree (needed before block-level segments can be requested,
    /// unless the tree is already cached).
    Tree,
    /// A full remote file listing.
    FullList,
    /// A partial (directory-scoped) remote file listing.
    PartialList,
}

/// A single connection's in-flight transfer.
///
/// This borrows its identity from the queue item and user connection that
/// own it (the target path and the connection token); it does not own
/// either. When the transfer completes or is aborted, the owner
/// ([`crate::queue_manager::QueueManager`]) is responsible for folding the
/// received bytes back into the queue item's `done` set.
#[derive(Clone, Debug)]
pub struct Download {
    pub token: Token,
    pub target: String,
    pub content_type: DownloadContentType,
    pub segment: Segment,
    /// Bytes transferred so far within `segment`.
    pub position: u64,
    pub started_at: Instant,
    /// Rolling average speed in bytes/sec, updated once per second by the
    /// download manager tick.
    pub average_speed: u32,
    pub overlapped: bool,
}

impl Download {
    pub fn new(token: Token, target: impl Into<String>, content_type: DownloadContentType, segment: Segment, started_at: Instant) -> Self {
        Self {
            token,
            target: target.into(),
            content_type,
            segment,
            position: 0,
            started_at,
            average_speed: 0,
            overlapped: segment.overlapped,
        }
    }

    pub fn running_for(&self, now: Instant) -> Duration {
        now.duration_since(self.started_at)
    }

    /// True once the transfer has delivered its whole segment. A
    /// whole-file-unknown-size segment ([`Segment::is_whole_file_unknown`])
    /// never self-finishes by byte count; its end is signalled externally
    /// (the connection closes or the collaborator reports the list/tree
    /// fetch complete) and the caller finishes it directly.
    pub fn is_finished(&self) -> bool {
        if self.segment.is_whole_file_unknown() {
            return false;
        }
        self.position >= self.segment.size
    }

    pub fn seconds_left(&self) -> u64 {
        let remaining = self.segment.size.saturating_sub(self.position);
        if self.average_speed == 0 {
            0
        } else {
            remaining / self.average_speed as u64
        }
    }

    pub fn on_bytes_received(&mut self, n: u64) {
        self.position = (self.position + n).min(self.segment.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_finished_once_position_reaches_size() {
        let mut d = Download::new(
            "tok1".to_owned(),
            "/x/a",
            DownloadContentType::File,
            Segment::new(0, 100),
            Instant::now(),
        );
        assert!(!d.is_finished());
        d.on_bytes_received(100);
        assert!(d.is_finished());
    }

    #[test]
    fn test_on_bytes_received_caps_at_segment_size() {
        let mut d = Download::new(
            "tok1".to_owned(),
            "/x/a",
            DownloadContentType::File,
            Segment::new(0, 10),
            Instant::now(),
        );
        d.on_bytes_received(100);
        assert_eq!(d.position, 10);
    }
}
