//! A single file within a bundle: its sources, its finished/running
//! segments, and the flags controlling how it is treated.

use std::collections::HashSet;

use crate::{
    segment::{DoneSet, PartialAvailability, UNKNOWN_SIZE},
    BundleToken, HintedUser, Priority, Tth,
};

/// Per-file flags (spec.md §3.2). Distinct from
/// [`crate::bundle::BundleFlags`]. A thin newtype over `u32` rather than
/// pulling in a flags crate, the same way the teacher represents its
/// bitfields as plain integer masks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FileFlags(u32);

impl FileFlags {
    pub const NORMAL: FileFlags = FileFlags(0x00);
    pub const USER_LIST: FileFlags = FileFlags(0x01);
    pub const DIRECTORY_DOWNLOAD: FileFlags = FileFlags(0x02);
    pub const CLIENT_VIEW: FileFlags = FileFlags(0x04);
    pub const TEXT: FileFlags = FileFlags(0x08);
    pub const MATCH_QUEUE: FileFlags = FileFlags(0x10);
    pub const PARTIAL_LIST: FileFlags = FileFlags(0x40);
    pub const OPEN: FileFlags = FileFlags(0x80);
    pub const VIEW_NFO: FileFlags = FileFlags(0x100);
    pub const RECURSIVE_LIST: FileFlags = FileFlags(0x200);
    pub const FINISHED: FileFlags = FileFlags(0x800);
    pub const PRIVATE: FileFlags = FileFlags(0x8000);

    pub fn contains(&self, other: FileFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FileFlags {
    type Output = FileFlags;
    fn bitor(self, rhs: FileFlags) -> FileFlags {
        FileFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for FileFlags {
    fn bitor_assign(&mut self, rhs: FileFlags) {
        self.0 |= rhs.0;
    }
}

/// Flags attached to a [`Source`] recording why it is currently unusable,
/// if at all (spec.md §3.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SourceFlags(u32);

impl SourceFlags {
    pub const NONE: SourceFlags = SourceFlags(0x00);
    pub const FILE_NOT_AVAILABLE: SourceFlags = SourceFlags(0x01);
    pub const REMOVED: SourceFlags = SourceFlags(0x04);
    pub const NO_TTHF: SourceFlags = SourceFlags(0x08);
    pub const BAD_TREE: SourceFlags = SourceFlags(0x10);
    pub const SLOW_SOURCE: SourceFlags = SourceFlags(0x20);
    pub const NO_TREE: SourceFlags = SourceFlags(0x40);
    pub const NO_NEED_PARTS: SourceFlags = SourceFlags(0x80);
    pub const PARTIAL: SourceFlags = SourceFlags(0x100);
    pub const TTH_INCONSISTENCY: SourceFlags = SourceFlags(0x200);
    pub const UNTRUSTED: SourceFlags = SourceFlags(0x400);

    pub fn intersects(&self, other: SourceFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for SourceFlags {
    type Output = SourceFlags;
    fn bitor(self, rhs: SourceFlags) -> SourceFlags {
        SourceFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for SourceFlags {
    fn bitor_assign(&mut self, rhs: SourceFlags) {
        self.0 |= rhs.0;
    }
}

/// A source's advertised partial-file availability, plus the query
/// throttling state that goes with it (NMDC PSR / ADC PSR queries).
#[derive(Clone, Debug, Default)]
pub struct PartialSourceInfo {
    pub availability: PartialAvailability,
    pub next_query_time: Option<std::time::Instant>,
    pub pending_query_count: u8,
}

/// A user offering (or once offering) a given file, together with the
/// hub-blocking state that governs whether it is currently usable.
#[derive(Clone, Debug)]
pub struct Source {
    pub user: HintedUser,
    pub flags: SourceFlags,
    pub partial: Option<PartialSourceInfo>,
    /// Hubs on which this source has been explicitly blocked (e.g. after
    /// a failed connection attempt via that hub).
    pub blocked_hubs: HashSet<String>,
}

impl Source {
    pub fn new(user: HintedUser) -> Self {
        Self {
            user,
            flags: SourceFlags::NONE,
            partial: None,
            blocked_hubs: HashSet::new(),
        }
    }

    pub fn is_usable(&self) -> bool {
        let bad = SourceFlags::FILE_NOT_AVAILABLE
            | SourceFlags::REMOVED
            | SourceFlags::BAD_TREE
            | SourceFlags::NO_TREE
            | SourceFlags::TTH_INCONSISTENCY
            | SourceFlags::UNTRUSTED;
        !self.flags.intersects(bad)
    }

    /// A source is reachable on a hub only if that hub is currently
    /// online for the user and is not one we've blocked for this file.
    pub fn update_hub_url(&self, online_hubs: &HashSet<String>) -> Option<String> {
        let hub = &self.user.hub_url;
        if online_hubs.contains(hub) && !self.blocked_hubs.contains(hub) {
            Some(hub.clone())
        } else {
            online_hubs
                .iter()
                .find(|h| !self.blocked_hubs.contains(*h))
                .cloned()
        }
    }
}

/// A single file entry in the queue: a target path, size, TTH, and the
/// bookkeeping needed to pick its next segment.
#[derive(Clone, Debug)]
pub struct QueueItem {
    pub target: String,
    pub temp_target: Option<String>,
    /// Total file size, or [`UNKNOWN_SIZE`] for a file-list/client-view
    /// item whose real length isn't known until it's fetched (spec.md §4.1
    /// step 1).
    pub size: u64,
    pub tth: Tth,
    pub priority: Priority,
    pub auto_priority: bool,
    pub flags: FileFlags,
    pub max_segments: u8,
    pub added: u64,
    pub done: DoneSet,
    pub sources: Vec<Source>,
    pub bad_sources: Vec<Source>,
    /// The owning bundle, if any (a plain file-list download has none).
    /// This is the non-owning half of the ownership pair described in
    /// spec.md §3.5: the bundle owns its queue items, a queue item only
    /// refers back to it by token.
    pub bundle: Option<BundleToken>,
}

impl QueueItem {
    pub fn new(target: impl Into<String>, size: u64, tth: Tth, priority: Priority, added: u64) -> Self {
        Self {
            target: target.into(),
            temp_target: None,
            size,
            tth,
            priority,
            auto_priority: false,
            flags: FileFlags::NORMAL,
            max_segments: crate::default_max_segments(size as i64),
            added,
            done: DoneSet::new(),
            sources: Vec::new(),
            bad_sources: Vec::new(),
            bundle: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        if self.flags.contains(FileFlags::FINISHED) {
            return true;
        }
        if self.size == UNKNOWN_SIZE {
            return false;
        }
        self.done.is_finished(self.size)
    }

    pub fn is_source(&self, user: &HintedUser) -> bool {
        self.sources.iter().any(|s| s.user.user == user.user)
    }

    pub fn is_bad_source(&self, user: &HintedUser) -> bool {
        self.bad_sources.iter().any(|s| s.user.user == user.user)
    }

    pub fn add_source(&mut self, user: HintedUser) {
        if !self.is_source(&user) {
            self.sources.push(Source::new(user));
        }
    }

    pub fn remove_source(&mut self, user: &HintedUser, reason: SourceFlags) {
        if let Some(idx) = self.sources.iter().position(|s| s.user.user == user.user) {
            let mut src = self.sources.remove(idx);
            src.flags |= reason;
            self.bad_sources.push(src);
        }
    }

    pub fn downloaded_fraction(&self) -> f64 {
        if self.flags.contains(FileFlags::FINISHED) {
            1.0
        } else if self.size == UNKNOWN_SIZE {
            0.0
        } else if self.size == 0 {
            1.0
        } else {
            self.done.downloaded_bytes() as f64 / self.size as f64
        }
    }

    /// Whether this item should be considered for starting a new
    /// download at all: it has room for more segments and isn't already
    /// finished.
    pub fn start_down(&self) -> bool {
        !self.is_finished()
    }

    pub fn adds_finished_segment(&mut self, segment: crate::segment::Segment) {
        self.done.add_finished(segment);
    }
}

/// The concrete tie-break comparator used within a user's priority
/// queue: partial lists sort first, then full lists, then small files,
/// then large files (spec.md §4.2, `QueueItem::SizeSortOrder`).
pub fn size_sort_key(item: &QueueItem) -> (u8, u64) {
    let class = if item.flags.contains(FileFlags::PARTIAL_LIST) {
        0
    } else if item.flags.contains(FileFlags::USER_LIST) {
        1
    } else if item.size < 65536 {
        2
    } else {
        3
    };
    (class, item.size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hinted(nick: &str) -> HintedUser {
        HintedUser {
            user: crate::User {
                cid: crate::Cid([0u8; 24]),
                nick: nick.to_owned(),
            },
            hub_url: "adc://hub".to_owned(),
        }
    }

    #[test]
    fn test_add_and_remove_source() {
        let mut qi = QueueItem::new("/x/a.bin", 100, Tth([1; 24]), Priority::Normal, 0);
        let user = hinted("alice");
        qi.add_source(user.clone());
        assert!(qi.is_source(&user));
        qi.remove_source(&user, SourceFlags::FILE_NOT_AVAILABLE);
        assert!(!qi.is_source(&user));
        assert!(qi.is_bad_source(&user));
    }

    #[test]
    fn test_size_sort_key_orders_partial_list_first() {
        let mut list = QueueItem::new("/x/list.xml", 10, Tth([0; 24]), Priority::Normal, 0);
        list.flags |= FileFlags::PARTIAL_LIST;
        let mut file = QueueItem::new("/x/a.bin", 10_000_000, Tth([1; 24]), Priority::Normal, 0);
        file.flags = FileFlags::NORMAL;
        assert!(size_sort_key(&list) < size_sort_key(&file));
    }

    #[test]
    fn test_is_finished() {
        let mut qi = QueueItem::new("/x/a.bin", 10, Tth([0; 24]), Priority::Normal, 0);
        assert!(!qi.is_finished());
        qi.adds_finished_segment(crate::segment::Segment::new(0, 10));
        assert!(qi.is_finished());
    }
}
