//! The top level owner of the download queue: bundles, queue items, and
//! the per-user secondary index used to pick what to download next.

use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::bundle::{Bundle, BundleFileInfo};
use crate::conf::QueueConf;
use crate::error::{Error, Result};
use crate::events::{QueueEvent, QueueEventBus, QueueEventReceiver};
use crate::queue_item::{QueueItem, SourceFlags};
use crate::segment::{next_segment, PartialAvailability, RunningSegment, Segment};
use crate::user_queue::UserQueue;
use crate::{BundleToken, DownloadType, HintedUser, Priority, Tth};

/// Block size a partial (unfinished) segment must be aligned to before it
/// is persisted into `QueueItem::done` on disconnect (spec.md §4.4
/// `putDownload`, `!finished` case). Matches the chunk boundary
/// [`QueueManager::get_next`] hands out segments on.
const PARTIAL_PERSIST_BLOCK: u64 = 65536;

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Owns every bundle and queue item, and the per-user index over them.
/// All mutation of the queue goes through this type; [`Bundle`] and
/// [`QueueItem`] themselves only hold the data needed to answer
/// questions about their own state.
pub struct QueueManager {
    conf: QueueConf,
    bundles: HashMap<BundleToken, Bundle>,
    items: HashMap<String, QueueItem>,
    user_queue: UserQueue,
    running_bundles: std::collections::HashSet<BundleToken>,
    events: QueueEventBus,
    next_bundle_id: u64,
}

impl QueueManager {
    pub fn new(conf: QueueConf) -> Self {
        Self {
            conf,
            bundles: HashMap::new(),
            items: HashMap::new(),
            user_queue: UserQueue::new(),
            running_bundles: std::collections::HashSet::new(),
            events: QueueEventBus::new(),
            next_bundle_id: 1,
        }
    }

    pub fn subscribe(&mut self) -> QueueEventReceiver {
        self.events.subscribe()
    }

    fn fresh_token(&mut self) -> BundleToken {
        let id = self.next_bundle_id;
        self.next_bundle_id += 1;
        format!("{:016x}", id)
    }

    /// Checks the configured skiplist/dupe rules before a file is
    /// allowed into the queue (spec.md §4.4).
    fn validate_add(&self, tth: Tth, size: u64, target: &str) -> Result<()> {
        if self.conf.dont_dl_already_queued && size >= self.conf.min_dupe_check_size {
            if let Some(existing) = self.items.values().find(|qi| qi.tth == tth) {
                if existing.target != target {
                    return Err(Error::FileWithDifferentTth);
                }
                return Err(Error::AlreadyFinished);
            }
        }
        for pattern in &self.conf.skiplist_download {
            if pattern_matches(pattern, target, self.conf.download_skiplist_use_regexp) {
                return Err(Error::TargetExists);
            }
        }
        Ok(())
    }

    fn priority_for_new_file(&self, target: &str, size: u64) -> Priority {
        for pattern in &self.conf.high_prio_files {
            if pattern_matches(pattern, target, self.conf.highest_priority_use_regexp) {
                return Priority::Highest;
            }
        }
        let _ = size;
        Priority::Normal
    }

    /// Queues a single file as its own bundle (spec.md §4.4
    /// `addFileBundle`).
    pub fn add_file_bundle(&mut self, target: impl Into<String>, size: u64, tth: Tth, source: Option<HintedUser>) -> Result<BundleToken> {
        let target = target.into();
        self.validate_add(tth, size, &target)?;

        let token = self.fresh_token();
        let added = now_secs();
        let priority = self.priority_for_new_file(&target, size);
        let mut bundle = Bundle::new_file(token.clone(), target.clone(), added, priority);

        let mut qi = QueueItem::new(target.clone(), size, tth, priority, added);
        qi.bundle = Some(token.clone());
        if self.conf.segments_manual {
            qi.max_segments = self.conf.manual_segments;
        }
        if let Some(user) = source.clone() {
            qi.add_source(user);
        }

        bundle.add_queue_item(target.clone());
        if let Some(user) = source {
            let is_new = bundle.add_user_queue(&qi, &user);
            self.user_queue.add_bundle(token.clone(), &user, &self.bundles);
            let _ = is_new;
        }

        self.items.insert(target.clone(), qi);
        self.bundles.insert(token.clone(), bundle);
        log::info!("added file bundle {} for {}", token, target);
        self.events.emit(QueueEvent::BundleAdded(token.clone()));
        Ok(token)
    }

    /// Queues a whole directory as one bundle (spec.md §4.4
    /// `addDirectoryBundle`).
    pub fn add_directory_bundle(&mut self, target_dir: impl Into<String>, files: Vec<BundleFileInfo>, priority: Priority) -> Result<BundleToken> {
        let target_dir = target_dir.into();
        let token = self.fresh_token();
        let added = now_secs();
        let mut bundle = Bundle::new_directory(token.clone(), target_dir.clone(), added, priority);

        for file in files {
            let target = format!("{}/{}", target_dir.trim_end_matches('/'), file.file);
            if self.validate_add(file.tth, file.size, &target).is_err() {
                continue;
            }
            let item_priority = if file.priority == Priority::Normal { priority } else { file.priority };
            let mut qi = QueueItem::new(target.clone(), file.size, file.tth, item_priority, file.date.max(added));
            qi.bundle = Some(token.clone());
            if self.conf.segments_manual {
                qi.max_segments = self.conf.manual_segments;
            }
            bundle.add_queue_item(target.clone());
            self.items.insert(target, qi);
        }

        if bundle.queue_items.is_empty() {
            return Err(Error::TargetExists);
        }

        log::info!("added directory bundle {} with {} file(s)", token, bundle.queue_items.len());
        self.bundles.insert(token.clone(), bundle);
        self.events.emit(QueueEvent::BundleAdded(token.clone()));
        Ok(token)
    }

    /// Re-inserts a bundle and its items loaded from persisted XML
    /// (spec.md §4.7), bumping `next_bundle_id` past the restored token
    /// when it looks like one of ours so freshly minted tokens never
    /// collide with a restored one.
    pub fn restore_bundle(&mut self, bundle: Bundle, items: Vec<QueueItem>) {
        if let Ok(id) = u64::from_str_radix(&bundle.token, 16) {
            self.next_bundle_id = self.next_bundle_id.max(id + 1);
        }
        let token = bundle.token.clone();
        for qi in items {
            self.items.insert(qi.target.clone(), qi);
        }
        self.bundles.insert(token, bundle);
    }

    pub fn bundle(&self, token: &str) -> Option<&Bundle> {
        self.bundles.get(token)
    }

    pub fn item(&self, target: &str) -> Option<&QueueItem> {
        self.items.get(target)
    }

    /// Adds `user` as a source for every item in `token` that it offers,
    /// matched by TTH (spec.md §4.2 source addition).
    pub fn add_source(&mut self, token: &str, user: HintedUser, offered: &[Tth]) -> Result<()> {
        let bundle = self.bundles.get_mut(token).ok_or_else(|| Error::BundleNotFound(token.to_owned()))?;
        let targets = bundle.queue_items.clone();
        let mut any = false;
        for target in targets {
            let qi = match self.items.get_mut(&target) {
                Some(qi) => qi,
                None => continue,
            };
            if !offered.contains(&qi.tth) {
                continue;
            }
            qi.add_source(user.clone());
            let bundle = self.bundles.get_mut(token).unwrap();
            let is_new = bundle.add_user_queue(qi, &user);
            if is_new {
                self.user_queue.add_bundle(token.to_owned(), &user, &self.bundles);
            }
            any = true;
        }
        if any {
            self.events.emit(QueueEvent::BundleSourcesChanged(token.to_owned()));
        }
        Ok(())
    }

    /// Changes a bundle's priority, re-sorting it in every source's
    /// per-user bundle queue (spec.md §4.4 `setBundlePriority`).
    pub fn set_bundle_priority(&mut self, token: &str, priority: Priority) -> Result<()> {
        let bundle = self.bundles.get_mut(token).ok_or_else(|| Error::BundleNotFound(token.to_owned()))?;
        if bundle.is_finished() {
            return Err(Error::InvalidPriority);
        }
        let sources: Vec<HintedUser> = bundle.sources.iter().map(|s| s.user.clone()).collect();
        bundle.priority = priority;
        self.user_queue.set_bundle_priority(token, &sources, &self.bundles);
        self.events.emit(QueueEvent::BundleStatusChanged(token.to_owned()));
        Ok(())
    }

    /// Picks the next segment this `user` should be asked for, reserving
    /// nothing: the caller is expected to attach the returned segment to a
    /// `Download` and hand it to the `DownloadManager` once a connection
    /// accepts.
    pub fn get_next(
        &mut self,
        user: &HintedUser,
        running: &HashMap<String, Vec<RunningSegment>>,
        last_speed: u32,
        partial_source: Option<&PartialAvailability>,
        download_type: DownloadType,
    ) -> Option<(String, crate::segment::Segment)> {
        let conf = &self.conf;
        let items = &self.items;
        let max_running = conf.max_running_bundles;
        let target = self.user_queue.get_next(
            user,
            items,
            &mut self.bundles,
            &self.running_bundles,
            max_running,
            Priority::Lowest,
            download_type,
            |qi, _dl_type, allow_overlap| {
                if qi.priority.is_paused() || !qi.start_down() {
                    return false;
                }
                let empty = Vec::new();
                let run = running.get(&qi.target).unwrap_or(&empty);
                let wanted_size = conf.min_segment_size.max(64 * 1024);
                next_segment(
                    &qi.done,
                    run,
                    qi.size,
                    65536,
                    wanted_size,
                    qi.max_segments,
                    qi.size > conf.min_segment_size,
                    last_speed,
                    partial_source,
                    allow_overlap,
                    conf.overlap_min_running,
                    conf.overlap_min_remaining.as_secs(),
                    conf.overlap_slow_sources_speedup,
                )
                .is_some()
            },
        )?;

        let qi = self.items.get(&target)?;
        let empty = Vec::new();
        let run = running.get(&target).unwrap_or(&empty);
        let wanted_size = self.conf.min_segment_size.max(64 * 1024);
        let seg = next_segment(
            &qi.done,
            run,
            qi.size,
            65536,
            wanted_size,
            qi.max_segments,
            qi.size > self.conf.min_segment_size,
            last_speed,
            partial_source,
            false,
            self.conf.overlap_min_running,
            self.conf.overlap_min_remaining.as_secs(),
            self.conf.overlap_slow_sources_speedup,
        )?;
        if let Some(token) = qi.bundle.clone() {
            self.running_bundles.insert(token);
        }
        Some((target, seg))
    }

    /// Records that a segment has finished downloading, folding it into
    /// the item's done set and checking for bundle completion (spec.md
    /// §4.6 transfer completion).
    pub fn complete_segment(&mut self, target: &str, segment: crate::segment::Segment) -> Result<()> {
        let qi = self.items.get_mut(target).ok_or(Error::QueueItemNotFound)?;
        qi.adds_finished_segment(segment);
        let finished = qi.is_finished();
        let bundle_token = qi.bundle.clone();

        if finished {
            log::info!("finished file {}", target);
            if let Some(token) = &bundle_token {
                if let Some(bundle) = self.bundles.get_mut(token) {
                    bundle.remove_queue_item(target, true);
                    self.events.emit(QueueEvent::ItemFinished {
                        bundle: token.clone(),
                        target: target.to_owned(),
                    });
                    if bundle.is_finished() {
                        bundle.status = crate::bundle::Status::Finished;
                        self.running_bundles.remove(token);
                        log::info!("bundle {} finished", token);
                        self.events.emit(QueueEvent::BundleStatusChanged(token.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Folds the outcome of a `TYPE_FILE` download back into the queue
    /// (spec.md §4.4 `putDownload`). Returns whether the queue item is now
    /// fully finished, so the caller can decide whether to disconnect any
    /// other downloads still in flight on the same item.
    ///
    /// On `!finished` (disconnect or cancellation): any portion of
    /// `position` bytes already aligned to [`PARTIAL_PERSIST_BLOCK`] is
    /// persisted into `done` rather than discarded; `no_access` blocks the
    /// source's current hub for this item; `rotate_queue` moves the item
    /// to the back of the user's priority bucket so a retry doesn't
    /// immediately re-target it.
    pub fn put_download_file(
        &mut self,
        target: &str,
        user: &HintedUser,
        segment: Segment,
        position: u64,
        finished: bool,
        no_access: bool,
        rotate_queue: bool,
    ) -> Result<bool> {
        if !finished {
            let aligned = (position / PARTIAL_PERSIST_BLOCK) * PARTIAL_PERSIST_BLOCK;
            if aligned > 0 {
                if let Some(qi) = self.items.get_mut(target) {
                    qi.adds_finished_segment(Segment::new(segment.start, aligned));
                }
            }
            if no_access {
                self.block_hub_for_source(target, user);
            }
            if rotate_queue {
                self.rotate_item_for_user(target, user);
            }
            return Ok(false);
        }

        self.complete_segment(target, segment)?;
        Ok(self.items.get(target).map_or(true, |qi| qi.is_finished()))
    }

    /// Marks a file-list/tree queue item (whose size is
    /// [`crate::segment::UNKNOWN_SIZE`] and so never self-completes via
    /// `done` coverage) as finished directly, running the same
    /// bundle-completion bookkeeping as [`QueueManager::complete_segment`]
    /// (spec.md §4.4 `putDownload`, `TYPE_FULL_LIST`/`TYPE_PARTIAL_LIST`).
    pub fn finish_list_item(&mut self, target: &str) -> Result<()> {
        let qi = self.items.get_mut(target).ok_or(Error::QueueItemNotFound)?;
        qi.flags |= crate::queue_item::FileFlags::FINISHED;
        let bundle_token = qi.bundle.clone();

        if let Some(token) = &bundle_token {
            if let Some(bundle) = self.bundles.get_mut(token) {
                bundle.remove_queue_item(target, true);
                self.events.emit(QueueEvent::ItemFinished {
                    bundle: token.clone(),
                    target: target.to_owned(),
                });
                if bundle.is_finished() {
                    bundle.status = crate::bundle::Status::Finished;
                    self.running_bundles.remove(token);
                    self.events.emit(QueueEvent::BundleStatusChanged(token.clone()));
                }
            }
        }
        Ok(())
    }

    /// Blocks `user`'s current hub for `target`, recording that the source
    /// refused or failed the request on it (spec.md §4.4 `putDownload`
    /// `no_access`).
    pub fn block_hub_for_source(&mut self, target: &str, user: &HintedUser) {
        if let Some(qi) = self.items.get_mut(target) {
            if let Some(src) = qi.sources.iter_mut().find(|s| s.user.user == user.user) {
                src.blocked_hubs.insert(user.hub_url.clone());
            }
        }
    }

    /// Moves `target` to the back of `user`'s priority bucket in its
    /// bundle (spec.md §4.4 `putDownload` `rotate_queue`).
    pub fn rotate_item_for_user(&mut self, target: &str, user: &HintedUser) {
        if let Some(bundle_token) = self.items.get(target).and_then(|qi| qi.bundle.clone()) {
            if let Some(bundle) = self.bundles.get_mut(&bundle_token) {
                bundle.rotate_user_queue(target, user);
            }
        }
    }

    /// Drops `user` as a source of `target` and removes them from the
    /// owning bundle's per-user queue (spec.md §4.4 `putDownload`
    /// `TYPE_TREE` mismatch: "mark source BAD_TREE and requeue").
    pub fn remove_source_from_item(&mut self, target: &str, user: &HintedUser, reason: SourceFlags) {
        if let Some(qi) = self.items.get_mut(target) {
            qi.remove_source(user, reason);
        }
        if let Some(bundle_token) = self.items.get(target).and_then(|qi| qi.bundle.clone()) {
            if let Some(bundle) = self.bundles.get_mut(&bundle_token) {
                bundle.remove_user_queue(target, user);
            }
        }
    }

    pub fn remove_bundle(&mut self, token: &str) -> Result<()> {
        let bundle = self.bundles.remove(token).ok_or_else(|| Error::BundleNotFound(token.to_owned()))?;
        for target in &bundle.queue_items {
            self.items.remove(target);
        }
        self.running_bundles.remove(token);
        log::info!("removed bundle {}", token);
        self.events.emit(QueueEvent::BundleRemoved(token.to_owned()));
        Ok(())
    }

    pub fn bundles(&self) -> impl Iterator<Item = &Bundle> {
        self.bundles.values()
    }

    pub fn running_bundle_count(&self) -> usize {
        self.running_bundles.len()
    }
}

/// Matches `target` against `pattern`, either as a case-insensitive
/// regex or a plain case-insensitive substring (spec.md §6.3
/// `DOWNLOAD_SKIPLIST_USE_REGEXP` / `HIGHEST_PRIORITY_USE_REGEXP`). An
/// invalid regex never matches rather than panicking or rejecting the
/// whole add.
fn pattern_matches(pattern: &str, target: &str, use_regexp: bool) -> bool {
    if use_regexp {
        regex::RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map(|re| re.is_match(target))
            .unwrap_or(false)
    } else {
        target.to_lowercase().contains(&pattern.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(nick: &str) -> HintedUser {
        HintedUser {
            user: crate::User {
                cid: crate::Cid([5; 24]),
                nick: nick.to_owned(),
            },
            hub_url: "adc://hub".to_owned(),
        }
    }

    #[test]
    fn test_add_file_bundle_and_fetch() {
        let mut qm = QueueManager::new(QueueConf::new("/tmp/dl"));
        let token = qm.add_file_bundle("/tmp/dl/a.bin", 1000, Tth([1; 24]), Some(user("eve"))).unwrap();
        assert!(qm.bundle(&token).is_some());
        assert!(qm.item("/tmp/dl/a.bin").is_some());
    }

    #[test]
    fn test_duplicate_tth_different_path_rejected() {
        let mut qm = QueueManager::new(QueueConf::new("/tmp/dl"));
        qm.add_file_bundle("/tmp/dl/a.bin", 1000, Tth([1; 24]), None).unwrap();
        let err = qm.add_file_bundle("/tmp/dl/b.bin", 1000, Tth([1; 24]), None);
        assert!(matches!(err, Err(Error::FileWithDifferentTth)));
    }

    #[test]
    fn test_get_next_and_complete_segment_finishes_bundle() {
        let mut qm = QueueManager::new(QueueConf::new("/tmp/dl"));
        let token = qm.add_file_bundle("/tmp/dl/a.bin", 100, Tth([2; 24]), Some(user("frank"))).unwrap();

        let running = HashMap::new();
        let (target, seg) = qm.get_next(&user("frank"), &running, 0, None, DownloadType::Any).unwrap();
        assert_eq!(target, "/tmp/dl/a.bin");
        assert_eq!(seg.start, 0);

        qm.complete_segment(&target, crate::segment::Segment::new(0, 100)).unwrap();
        let bundle = qm.bundle(&token).unwrap();
        assert_eq!(bundle.status, crate::bundle::Status::Finished);
    }

    #[test]
    fn test_set_bundle_priority_rejects_finished_bundle() {
        let mut qm = QueueManager::new(QueueConf::new("/tmp/dl"));
        let token = qm.add_file_bundle("/tmp/dl/a.bin", 10, Tth([3; 24]), None).unwrap();
        qm.complete_segment("/tmp/dl/a.bin", crate::segment::Segment::new(0, 10)).unwrap();
        let err = qm.set_bundle_priority(&token, Priority::High);
        assert!(matches!(err, Err(Error::InvalidPriority)));
    }

    #[test]
    fn test_put_download_file_finished_marks_bundle_complete() {
        let mut qm = QueueManager::new(QueueConf::new("/tmp/dl"));
        let token = qm.add_file_bundle("/tmp/dl/a.bin", 100, Tth([6; 24]), Some(user("holly"))).unwrap();
        let finished = qm
            .put_download_file("/tmp/dl/a.bin", &user("holly"), crate::segment::Segment::new(0, 100), 100, true, false, false)
            .unwrap();
        assert!(finished);
        assert_eq!(qm.bundle(&token).unwrap().status, crate::bundle::Status::Finished);
    }

    #[test]
    fn test_put_download_file_not_finished_persists_aligned_prefix() {
        let mut qm = QueueManager::new(QueueConf::new("/tmp/dl"));
        qm.add_file_bundle("/tmp/dl/a.bin", 1_000_000, Tth([7; 24]), Some(user("ivy"))).unwrap();
        let finished = qm
            .put_download_file(
                "/tmp/dl/a.bin",
                &user("ivy"),
                crate::segment::Segment::new(0, 200_000),
                150_000,
                false,
                false,
                false,
            )
            .unwrap();
        assert!(!finished);
        let qi = qm.item("/tmp/dl/a.bin").unwrap();
        assert!(qi.done.downloaded_bytes() >= PARTIAL_PERSIST_BLOCK * 2);
        assert!(qi.done.downloaded_bytes() < 150_000);
    }

    #[test]
    fn test_put_download_file_no_access_blocks_hub() {
        let mut qm = QueueManager::new(QueueConf::new("/tmp/dl"));
        qm.add_file_bundle("/tmp/dl/a.bin", 100, Tth([8; 24]), Some(user("jack"))).unwrap();
        qm.put_download_file("/tmp/dl/a.bin", &user("jack"), crate::segment::Segment::new(0, 100), 0, false, true, false)
            .unwrap();
        let qi = qm.item("/tmp/dl/a.bin").unwrap();
        let src = qi.sources.iter().find(|s| s.user.user.nick == "jack").unwrap();
        assert!(src.blocked_hubs.contains("adc://hub"));
    }

    #[test]
    fn test_finish_list_item_completes_bundle() {
        let mut qm = QueueManager::new(QueueConf::new("/tmp/dl"));
        let token = qm
            .add_file_bundle("/tmp/dl/files.xml.bz2", crate::segment::UNKNOWN_SIZE, Tth([9; 24]), Some(user("kay")))
            .unwrap();
        qm.finish_list_item("/tmp/dl/files.xml.bz2").unwrap();
        assert_eq!(qm.bundle(&token).unwrap().status, crate::bundle::Status::Finished);
    }

    #[test]
    fn test_remove_source_from_item_drops_user_queue_entry() {
        let mut qm = QueueManager::new(QueueConf::new("/tmp/dl"));
        qm.add_file_bundle("/tmp/dl/a.bin", 100, Tth([10; 24]), Some(user("liam"))).unwrap();
        qm.remove_source_from_item("/tmp/dl/a.bin", &user("liam"), SourceFlags::BAD_TREE);
        {
            let qi = qm.item("/tmp/dl/a.bin").unwrap();
            assert!(!qi.is_source(&user("liam")));
            assert!(qi.is_bad_source(&user("liam")));
        }
        // user no longer queued against this bundle: get_next finds nothing.
        let running = HashMap::new();
        assert!(qm.get_next(&user("liam"), &running, 0, None, DownloadType::Any).is_none());
    }
}
