//! A bundle: a single file or a whole directory queued as one download
//! job. Bundles own their queue items and keep a secondary per-user index
//! used to pick the next item to download from a given user.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::{queue_item::QueueItem, BundleToken, Cid, DownloadType, HintedUser, Priority};

/// Lifecycle status of a bundle (spec.md §3.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    New,
    Queued,
    Downloaded,
    Moved,
    FailedMissing,
    SharingFailed,
    Finished,
    Hashing,
    HashFailed,
    Hashed,
    Shared,
}

/// A user contributing to a bundle, and how many of its files and bytes
/// they're known to provide.
#[derive(Clone, Debug)]
pub struct BundleSource {
    pub user: HintedUser,
    pub size: u64,
    pub files: u32,
}

/// Metadata about a single file planned for a directory bundle, before it
/// becomes a live [`QueueItem`] (spec.md §4.4 `addDirectoryBundle`,
/// grounded on `BundleFileInfo`).
#[derive(Clone, Debug)]
pub struct BundleFileInfo {
    pub file: String,
    pub tth: crate::Tth,
    pub size: u64,
    pub date: u64,
    pub priority: Priority,
}

/// A directory-level or single-file download job.
#[derive(Clone, Debug)]
pub struct Bundle {
    pub token: BundleToken,
    pub target: String,
    pub added: u64,
    pub priority: Priority,
    pub status: Status,
    pub is_file_bundle: bool,
    pub single_user: bool,
    pub seq_order: bool,
    pub recent: bool,
    pub dirty: bool,
    pub last_error: Option<String>,
    pub bundle_finished: Option<Instant>,
    pub running: u16,
    pub speed: u64,
    pub finished_segments: u64,
    pub current_downloaded: u64,

    /// Target keys (`QueueItem::target`) owned by this bundle, in
    /// insertion order.
    pub queue_items: Vec<String>,
    pub finished_files: Vec<String>,
    pub bundle_dirs: HashMap<String, (u32, u32)>,
    pub sources: Vec<BundleSource>,
    pub bad_sources: Vec<BundleSource>,
    pub running_users: HashMap<Cid, u16>,

    /// Per-user, per-priority candidate deques (spec.md §3.2
    /// `userQueue[priority][user]`). `get_next_qi` walks a user's buckets
    /// from highest priority down, and within a bucket front to back,
    /// rotating the chosen item to the back of its bucket afterward.
    user_queue: HashMap<Cid, BTreeMap<Priority, VecDeque<String>>>,
}

impl Bundle {
    pub fn new_directory(token: BundleToken, target: impl Into<String>, added: u64, priority: Priority) -> Self {
        Self {
            token,
            target: target.into(),
            added,
            priority,
            status: Status::New,
            is_file_bundle: false,
            single_user: true,
            seq_order: false,
            recent: false,
            dirty: true,
            last_error: None,
            bundle_finished: None,
            running: 0,
            speed: 0,
            finished_segments: 0,
            current_downloaded: 0,
            queue_items: Vec::new(),
            finished_files: Vec::new(),
            bundle_dirs: HashMap::new(),
            sources: Vec::new(),
            bad_sources: Vec::new(),
            running_users: HashMap::new(),
            user_queue: HashMap::new(),
        }
    }

    pub fn new_file(token: BundleToken, target: impl Into<String>, added: u64, priority: Priority) -> Self {
        let mut b = Self::new_directory(token, target, added, priority);
        b.is_file_bundle = true;
        b
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.current_downloaded + self.finished_segments
    }

    pub fn is_finished(&self) -> bool {
        self.queue_items.is_empty()
    }

    pub fn is_source(&self, user: &HintedUser) -> bool {
        self.sources.iter().any(|s| s.user.user == user.user)
    }

    pub fn add_queue_item(&mut self, target: String) {
        if !self.queue_items.contains(&target) {
            self.queue_items.push(target);
        }
    }

    pub fn remove_queue_item(&mut self, target: &str, finished: bool) {
        self.queue_items.retain(|t| t != target);
        if finished {
            self.finished_files.push(target.to_owned());
        }
    }

    /// Inserts a queue item's target into this user's per-priority bucket
    /// (spec.md §4.4 step 4 `userQueue[prio][user]`), in alphabetical
    /// target order if [`Bundle::seq_order`] is set, or at a random
    /// position otherwise (spec.md §3.2: random insertion boosts
    /// partial-bundle sharing for fresh bundles). Returns `true` the first
    /// time this user is added to the bundle (so the caller knows to also
    /// register the bundle in the outer per-user bundle index).
    pub fn add_user_queue(&mut self, item: &QueueItem, user: &HintedUser) -> bool {
        let is_new_user = !self.user_queue.contains_key(&user.user.cid);
        let buckets = self.user_queue.entry(user.user.cid).or_default();
        let bucket = buckets.entry(item.priority).or_default();
        if bucket.contains(&item.target) {
            return is_new_user;
        }
        let pos = if self.seq_order {
            bucket.iter().position(|t| t.as_str() > item.target.as_str()).unwrap_or(bucket.len())
        } else {
            rand::random::<usize>() % (bucket.len() + 1)
        };
        bucket.insert(pos, item.target.clone());
        is_new_user
    }

    /// Returns `true` if the user has no more items queued in this
    /// bundle afterward (caller should then drop the user from the
    /// outer bundle index).
    pub fn remove_user_queue(&mut self, target: &str, user: &HintedUser) -> bool {
        let buckets = match self.user_queue.get_mut(&user.user.cid) {
            Some(b) => b,
            None => return false,
        };
        let mut emptied = None;
        for (prio, bucket) in buckets.iter_mut() {
            let before = bucket.len();
            bucket.retain(|t| t != target);
            if bucket.len() != before {
                if bucket.is_empty() {
                    emptied = Some(*prio);
                }
                break;
            }
        }
        if let Some(prio) = emptied {
            buckets.remove(&prio);
        }
        if buckets.is_empty() {
            self.user_queue.remove(&user.user.cid);
            return true;
        }
        false
    }

    /// Moves the named item to the back of its priority bucket, preserving
    /// relative order of the rest: used after a pick so the next call
    /// round-robins among same-priority items (`rotateUserQueue`).
    pub fn rotate_user_queue(&mut self, target: &str, user: &HintedUser) {
        if let Some(buckets) = self.user_queue.get_mut(&user.user.cid) {
            for bucket in buckets.values_mut() {
                if let Some(pos) = bucket.iter().position(|t| t == target) {
                    if let Some(t) = bucket.remove(pos) {
                        bucket.push_back(t);
                    }
                    break;
                }
            }
        }
    }

    /// Picks the next queue item for `user` with priority at least
    /// `min_prio`, walking priority buckets from highest to lowest
    /// (spec.md §4.2 step 2 "walks its `userQueue[priority][user]` deques
    /// from highest priority down") and consulting `items` (the owning
    /// `QueueManager`'s item table) to evaluate segment availability via
    /// `has_segment`.
    pub fn get_next_qi<'a>(
        &mut self,
        user: &HintedUser,
        items: &'a HashMap<String, QueueItem>,
        min_prio: Priority,
        mut has_segment: impl FnMut(&QueueItem) -> bool,
    ) -> Option<&'a QueueItem> {
        let buckets = self.user_queue.get(&user.user.cid)?.clone();
        for (prio, bucket) in buckets.iter().rev() {
            if *prio < min_prio {
                break;
            }
            for target in bucket.iter() {
                if let Some(qi) = items.get(target) {
                    if has_segment(qi) {
                        self.rotate_user_queue(target, user);
                        return items.get(target);
                    }
                }
            }
        }
        None
    }
}

/// Ordering used for `userBundleQueue`: priority descending, then added
/// time ascending (`Bundle::SortOrder`).
pub fn bundle_sort_key(bundle: &Bundle) -> (std::cmp::Reverse<Priority>, u64) {
    (std::cmp::Reverse(bundle.priority), bundle.added)
}

/// How long a finished bundle is still reported as "recent" to the UI.
pub fn is_recent(bundle_finished: Instant, recent_hours: u32, now: Instant) -> bool {
    now.duration_since(bundle_finished) < Duration::from_secs(recent_hours as u64 * 3600)
}

pub fn uses_small_slot(download_type: DownloadType) -> bool {
    matches!(download_type, DownloadType::Small)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(nick: &str) -> HintedUser {
        HintedUser {
            user: crate::User {
                cid: Cid([1; 24]),
                nick: nick.to_owned(),
            },
            hub_url: "adc://hub".to_owned(),
        }
    }

    #[test]
    fn test_add_and_remove_queue_item() {
        let mut b = Bundle::new_directory("t1".to_owned(), "/x", 0, Priority::Normal);
        b.add_queue_item("/x/a".to_owned());
        b.add_queue_item("/x/a".to_owned());
        assert_eq!(b.queue_items.len(), 1);
        b.remove_queue_item("/x/a", true);
        assert!(b.queue_items.is_empty());
        assert_eq!(b.finished_files.len(), 1);
    }

    #[test]
    fn test_user_queue_add_remove() {
        let mut items = HashMap::new();
        let qi = QueueItem::new("/x/a", 10, crate::Tth([0; 24]), Priority::Normal, 0);
        items.insert(qi.target.clone(), qi.clone());

        let mut b = Bundle::new_directory("t1".to_owned(), "/x", 0, Priority::Normal);
        let u = user("bob");
        let is_new = b.add_user_queue(&qi, &u);
        assert!(is_new);

        let next = b.get_next_qi(&u, &items, Priority::Lowest, |_| true);
        assert_eq!(next.unwrap().target, "/x/a");

        let emptied = b.remove_user_queue("/x/a", &u);
        assert!(emptied);
    }

    #[test]
    fn test_bundle_sort_key_orders_by_priority_then_added() {
        let high = Bundle::new_directory("a".to_owned(), "/a", 10, Priority::High);
        let low_older = Bundle::new_directory("b".to_owned(), "/b", 5, Priority::Low);
        assert!(bundle_sort_key(&high) < bundle_sort_key(&low_older));
    }

    #[test]
    fn test_get_next_qi_visits_higher_priority_bucket_first() {
        let mut items = HashMap::new();
        let low = QueueItem::new("/x/low", 10, crate::Tth([0; 24]), Priority::Low, 0);
        let high = QueueItem::new("/x/high", 10, crate::Tth([1; 24]), Priority::High, 0);
        items.insert(low.target.clone(), low.clone());
        items.insert(high.target.clone(), high.clone());

        let mut b = Bundle::new_directory("t1".to_owned(), "/x", 0, Priority::Normal);
        let u = user("carl");
        // inserted low-priority first; high-priority must still come out
        // first since buckets are scanned highest-first.
        b.add_user_queue(&low, &u);
        b.add_user_queue(&high, &u);

        let next = b.get_next_qi(&u, &items, Priority::Lowest, |_| true);
        assert_eq!(next.unwrap().target, "/x/high");
    }

    #[test]
    fn test_get_next_qi_respects_min_prio() {
        let mut items = HashMap::new();
        let low = QueueItem::new("/x/low", 10, crate::Tth([0; 24]), Priority::Low, 0);
        items.insert(low.target.clone(), low.clone());

        let mut b = Bundle::new_directory("t1".to_owned(), "/x", 0, Priority::Normal);
        let u = user("dina");
        b.add_user_queue(&low, &u);

        let next = b.get_next_qi(&u, &items, Priority::Normal, |_| true);
        assert!(next.is_none());
    }

    #[test]
    fn test_seq_order_inserts_alphabetically() {
        let mut b = Bundle::new_directory("t1".to_owned(), "/x", 0, Priority::Normal);
        b.seq_order = true;
        let u = user("eli");
        let b_item = QueueItem::new("/x/b", 10, crate::Tth([0; 24]), Priority::Normal, 0);
        let a_item = QueueItem::new("/x/a", 10, crate::Tth([1; 24]), Priority::Normal, 0);
        b.add_user_queue(&b_item, &u);
        b.add_user_queue(&a_item, &u);

        let bucket = b.user_queue.get(&u.user.cid).unwrap().get(&Priority::Normal).unwrap();
        assert_eq!(bucket.iter().collect::<Vec<_>>(), vec!["/x/a", "/x/b"]);
    }
}
