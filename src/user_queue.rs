//! Secondary per-user index over the queue: given a user, which item or
//! bundle should they download from next. This is a cache over the
//! queue's own item/bundle tables, not an owner of anything.

use std::collections::{HashMap, HashSet};

use crate::{
    bundle::{bundle_sort_key, Bundle},
    queue_item::{size_sort_key, QueueItem},
    BundleToken, Cid, DownloadType, HintedUser, Priority,
};

/// Indexes queue items and bundles by the users offering them, in the
/// order each user's items should be tried.
#[derive(Default)]
pub struct UserQueue {
    /// Bundles by user, ordered by [`bundle_sort_key`].
    user_bundle_queue: HashMap<Cid, Vec<BundleToken>>,
    /// `Highest`-priority standalone items by user, ordered by
    /// [`size_sort_key`]. These bypass bundle scheduling entirely, the
    /// same way the original special-cases `QueueItem::HIGHEST`.
    user_prio_queue: HashMap<Cid, Vec<String>>,
    pub last_error: Option<String>,
}

impl UserQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `item` to `user`'s indexes. If the item is `Highest` priority
    /// it also joins the flat prio queue. If the item belongs to a
    /// bundle, that bundle's own per-user deque is updated by the caller
    /// (the `QueueManager`, which owns the `Bundle`); this only updates
    /// the user -> bundle-token index, adding it if this is the user's
    /// first item in that bundle.
    pub fn add_qi(
        &mut self,
        item: &QueueItem,
        user: &HintedUser,
        bundle_is_new_to_user: bool,
        bundles: &HashMap<BundleToken, Bundle>,
        items: &HashMap<String, QueueItem>,
    ) {
        if item.priority == Priority::Highest {
            let list = self.user_prio_queue.entry(user.user.cid).or_default();
            if !list.contains(&item.target) {
                let key = size_sort_key(item);
                let pos = list
                    .iter()
                    .position(|t| items.get(t).map_or(false, |other| size_sort_key(other) > key))
                    .unwrap_or(list.len());
                list.insert(pos, item.target.clone());
            }
        }

        if let Some(token) = &item.bundle {
            if bundle_is_new_to_user {
                self.add_bundle(token.clone(), user, bundles);
            }
        }
    }

    pub fn remove_qi(&mut self, item: &QueueItem, user: &HintedUser, bundle_emptied_for_user: bool) {
        if item.priority == Priority::Highest {
            if let Some(list) = self.user_prio_queue.get_mut(&user.user.cid) {
                list.retain(|t| t != &item.target);
                if list.is_empty() {
                    self.user_prio_queue.remove(&user.user.cid);
                }
            }
        }
        if let Some(token) = &item.bundle {
            if bundle_emptied_for_user {
                self.remove_bundle(token, user);
            }
        }
    }

    pub fn add_bundle(&mut self, token: BundleToken, user: &HintedUser, bundles: &HashMap<BundleToken, Bundle>) {
        let list = self.user_bundle_queue.entry(user.user.cid).or_default();
        if list.contains(&token) {
            return;
        }
        let key = bundles.get(&token).map(bundle_sort_key);
        let pos = match key {
            Some(k) => list
                .iter()
                .position(|t| bundles.get(t).map(bundle_sort_key).map_or(false, |ok| ok > k))
                .unwrap_or(list.len()),
            None => list.len(),
        };
        list.insert(pos, token);
    }

    pub fn remove_bundle(&mut self, token: &str, user: &HintedUser) {
        if let Some(list) = self.user_bundle_queue.get_mut(&user.user.cid) {
            list.retain(|t| t != token);
            if list.is_empty() {
                self.user_bundle_queue.remove(&user.user.cid);
            }
        }
    }

    pub fn set_bundle_priority(&mut self, token: &str, sources: &[HintedUser], bundles: &HashMap<BundleToken, Bundle>) {
        for u in sources {
            self.remove_bundle(token, u);
        }
        for u in sources {
            self.add_bundle(token.to_owned(), u, bundles);
        }
    }

    /// Highest-priority standalone items for this user first, then
    /// bundle items; if nothing is found and overlap wasn't already
    /// allowed, retries once more with `allow_overlap = true` so a slow
    /// running segment can be taken over instead of giving up entirely.
    pub fn get_next<'a>(
        &mut self,
        user: &HintedUser,
        items: &'a HashMap<String, QueueItem>,
        bundles: &mut HashMap<BundleToken, Bundle>,
        running_bundles: &HashSet<BundleToken>,
        max_running_bundles: usize,
        min_prio: Priority,
        download_type: DownloadType,
        mut has_segment: impl FnMut(&QueueItem, DownloadType, bool) -> bool,
    ) -> Option<String> {
        if let Some(target) = self.get_next_prio_qi(user, items, download_type, false, &mut has_segment) {
            return Some(target);
        }
        if let Some(target) = self.get_next_bundle_qi(
            user,
            items,
            bundles,
            running_bundles,
            max_running_bundles,
            min_prio,
            download_type,
            false,
            &mut has_segment,
        ) {
            return Some(target);
        }
        // second pass: allow overlap preemption of a slow running segment.
        if let Some(target) = self.get_next_prio_qi(user, items, download_type, true, &mut has_segment) {
            return Some(target);
        }
        self.get_next_bundle_qi(
            user,
            items,
            bundles,
            running_bundles,
            max_running_bundles,
            min_prio,
            download_type,
            true,
            &mut has_segment,
        )
    }

    fn get_next_prio_qi(
        &mut self,
        user: &HintedUser,
        items: &HashMap<String, QueueItem>,
        download_type: DownloadType,
        allow_overlap: bool,
        has_segment: &mut impl FnMut(&QueueItem, DownloadType, bool) -> bool,
    ) -> Option<String> {
        self.last_error = None;
        let list = self.user_prio_queue.get(&user.user.cid)?;
        for target in list {
            if let Some(qi) = items.get(target) {
                if has_segment(qi, download_type, allow_overlap) {
                    return Some(target.clone());
                }
            }
        }
        None
    }

    /// Scans this user's bundles in priority/added order (spec.md §4.2 step
    /// 2). Once `running_bundles` has reached `max_running_bundles`, a
    /// bundle whose token isn't already in that set is skipped rather than
    /// the whole scan being abandoned — an already-running bundle stays
    /// selectable past the cap, since granting it another segment doesn't
    /// start a new one.
    fn get_next_bundle_qi(
        &mut self,
        user: &HintedUser,
        items: &HashMap<String, QueueItem>,
        bundles: &mut HashMap<BundleToken, Bundle>,
        running_bundles: &HashSet<BundleToken>,
        max_running_bundles: usize,
        min_prio: Priority,
        download_type: DownloadType,
        allow_overlap: bool,
        has_segment: &mut impl FnMut(&QueueItem, DownloadType, bool) -> bool,
    ) -> Option<String> {
        self.last_error = None;
        let tokens = self.user_bundle_queue.get(&user.user.cid)?.clone();
        for token in tokens {
            let at_cap = max_running_bundles > 0 && running_bundles.len() >= max_running_bundles;
            let bundle = bundles.get_mut(&token)?;
            if at_cap && !running_bundles.contains(&token) {
                self.last_error = Some("maximum number of running bundles reached".to_owned());
                continue;
            }
            if bundle.priority < min_prio {
                break;
            }
            if let Some(qi) = bundle.get_next_qi(user, items, min_prio, |qi| has_segment(qi, download_type, allow_overlap)) {
                return Some(qi.target.clone());
            }
        }
        None
    }

    pub fn user_bundle_count(&self, user: &HintedUser) -> usize {
        self.user_bundle_queue.get(&user.user.cid).map_or(0, |l| l.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(nick: &str) -> HintedUser {
        HintedUser {
            user: crate::User {
                cid: Cid([2; 24]),
                nick: nick.to_owned(),
            },
            hub_url: "adc://hub".to_owned(),
        }
    }

    #[test]
    fn test_add_and_get_next_prio_qi() {
        let mut uq = UserQueue::new();
        let mut items = HashMap::new();
        let mut qi = QueueItem::new("/x/a", 10, crate::Tth([0; 24]), Priority::Highest, 0);
        qi.add_source(user("carl"));
        items.insert(qi.target.clone(), qi.clone());

        let bundles = HashMap::new();
        uq.add_qi(&qi, &user("carl"), false, &bundles, &items);

        let next = uq.get_next_prio_qi(&user("carl"), &items, DownloadType::Any, false, &mut |_, _, _| true);
        assert_eq!(next, Some("/x/a".to_owned()));
    }

    #[test]
    fn test_bundle_limit_skips_non_running_bundles() {
        let mut uq = UserQueue::new();
        let mut bundles = HashMap::new();
        let mut b1 = Bundle::new_directory("b1".to_owned(), "/b1", 0, Priority::Normal);
        let qi = QueueItem::new("/b1/a", 10, crate::Tth([0; 24]), Priority::Normal, 0);
        b1.add_queue_item(qi.target.clone());
        b1.add_user_queue(&qi, &user("dave"));
        bundles.insert("b1".to_owned(), b1);

        let mut items = HashMap::new();
        items.insert(qi.target.clone(), qi);

        uq.add_bundle("b1".to_owned(), &user("dave"), &bundles);

        // one other bundle is already running and fills the cap; "b1"
        // itself is not in the running set, so it must be skipped.
        let running = HashSet::from(["other".to_owned()]);
        let got = uq.get_next_bundle_qi(
            &user("dave"),
            &items,
            &mut bundles,
            &running,
            1,
            Priority::Lowest,
            DownloadType::Any,
            false,
            &mut |_, _, _| true,
        );
        assert!(got.is_none());
        assert!(uq.last_error.is_some());
    }

    #[test]
    fn test_bundle_limit_still_allows_already_running_bundle() {
        let mut uq = UserQueue::new();
        let mut bundles = HashMap::new();
        let mut b1 = Bundle::new_directory("b1".to_owned(), "/b1", 0, Priority::Normal);
        let qi = QueueItem::new("/b1/a", 10, crate::Tth([0; 24]), Priority::Normal, 0);
        b1.add_queue_item(qi.target.clone());
        b1.add_user_queue(&qi, &user("dave"));
        bundles.insert("b1".to_owned(), b1);

        let mut items = HashMap::new();
        items.insert(qi.target.clone(), qi);

        uq.add_bundle("b1".to_owned(), &user("dave"), &bundles);

        // the cap is already reached, but "b1" is itself one of the
        // running bundles, so it must still be selectable.
        let running = HashSet::from(["b1".to_owned()]);
        let got = uq.get_next_bundle_qi(
            &user("dave"),
            &items,
            &mut bundles,
            &running,
            1,
            Priority::Lowest,
            DownloadType::Any,
            false,
            &mut |_, _, _| true,
        );
        assert_eq!(got, Some("/b1/a".to_owned()));
    }
}
