//! Drives the transfer lifecycle: tracks running downloads, updates
//! per-second speed, and disconnects slow sources according to policy
//! (spec.md §4.6).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::conf::ConnectionConf;
use crate::download::Download;
use crate::segment::RunningSegment;
use crate::{HintedUser, Token};

/// A download actively tracked by the manager, together with the user
/// connection token driving it and a short history of bytes received for
/// speed averaging.
struct TrackedDownload {
    download: Download,
    user: HintedUser,
    bytes_last_tick: u64,
}

/// Owns the set of in-flight downloads and evaluates, once a second,
/// whether any should be disconnected for being too slow (spec.md §4.6,
/// `ConnectionConf::disconnect_*`).
#[derive(Default)]
pub struct DownloadManager {
    downloads: HashMap<Token, TrackedDownload>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickAction {
    /// Disconnect this download: too slow for too long, and enough other
    /// sources exist to make it worth retrying elsewhere.
    Disconnect,
    /// Leave the download as is.
    Continue,
}

impl DownloadManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, token: Token, user: HintedUser, download: Download) {
        log::debug!("starting download {} of {} from {}", token, download.target, user.user.nick);
        self.downloads.insert(
            token,
            TrackedDownload {
                download,
                user,
                bytes_last_tick: 0,
            },
        );
    }

    pub fn stop(&mut self, token: &str) -> Option<Download> {
        self.downloads.remove(token).map(|t| t.download)
    }

    /// Removes and returns every download that has received its full
    /// segment (`Download::is_finished`), together with the user driving
    /// it, so the caller can fold each into the queue via
    /// `AppContext::put_download` (spec.md §4.6 "on completion, call
    /// `QueueManager.putDownload(d, finished=true)`").
    pub fn drain_finished(&mut self) -> Vec<(Token, HintedUser, Download)> {
        let done: Vec<Token> = self
            .downloads
            .iter()
            .filter(|(_, t)| t.download.is_finished())
            .map(|(token, _)| token.clone())
            .collect();
        done.into_iter()
            .filter_map(|token| self.downloads.remove(&token).map(|t| (token, t.user, t.download)))
            .collect()
    }

    /// Tokens of every other download currently running against `target`,
    /// used to cut loose any still-overlapping downloads once the item is
    /// fully complete (spec.md §4.4 `putDownload`).
    pub fn tokens_for_target(&self, target: &str, exclude: &str) -> Vec<Token> {
        self.downloads
            .iter()
            .filter(|(token, t)| t.download.target == target && token.as_str() != exclude)
            .map(|(token, _)| token.clone())
            .collect()
    }

    pub fn on_bytes_received(&mut self, token: &str, n: u64) {
        if let Some(tracked) = self.downloads.get_mut(token) {
            tracked.download.on_bytes_received(n);
            tracked.bytes_last_tick += n;
        }
    }

    pub fn running_segments_by_target(&self) -> HashMap<String, Vec<RunningSegment>> {
        let mut map: HashMap<String, Vec<RunningSegment>> = HashMap::new();
        for tracked in self.downloads.values() {
            let d = &tracked.download;
            map.entry(d.target.clone()).or_default().push(RunningSegment {
                segment: d.segment,
                position: d.position,
                running_for: d.running_for(Instant::now()),
                average_speed: d.average_speed,
                overlapped: d.overlapped,
            });
        }
        map
    }

    /// The once-a-second tick: folds `bytes_last_tick` into each
    /// download's rolling average speed, then decides per-download
    /// whether to disconnect it for being too slow, per
    /// `ConnectionConf::disconnect_*` (mirrors the original's
    /// `Bundle::onDownloadTick` speed bookkeeping, simplified to a flat
    /// per-download rolling average rather than a bundle-wide multimap).
    pub fn tick(&mut self, conf: &ConnectionConf, now: Instant, other_sources_available: impl Fn(&str) -> usize) -> Vec<(Token, TickAction)> {
        let mut actions = Vec::new();
        for (token, tracked) in self.downloads.iter_mut() {
            tracked.download.average_speed = tracked.bytes_last_tick as u32;
            tracked.bytes_last_tick = 0;

            let d = &tracked.download;
            let running_long_enough = d.running_for(now) >= conf.disconnect_time;
            let too_slow = d.average_speed < conf.disconnect_speed;
            let big_enough = d.segment.size >= conf.disconnect_filesize;
            let enough_sources = other_sources_available(&d.target) >= conf.disconnect_min_sources;

            let action = if conf.dl_auto_disconnect_mode != 0 && running_long_enough && too_slow && big_enough && enough_sources {
                TickAction::Disconnect
            } else {
                TickAction::Continue
            };
            actions.push((token.clone(), action));
        }
        actions
    }

    pub fn len(&self) -> usize {
        self.downloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty()
    }
}

/// How often UBN (user bundle notification) progress updates are sent to
/// sources currently uploading to us, per spec.md §5.
pub const UBN_INTERVAL: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DownloadContentType;
    use crate::segment::Segment;

    fn user() -> HintedUser {
        HintedUser {
            user: crate::User {
                cid: crate::Cid([4; 24]),
                nick: "gina".to_owned(),
            },
            hub_url: "adc://hub".to_owned(),
        }
    }

    #[test]
    fn test_tick_disconnects_slow_download_with_alternates() {
        let mut dm = DownloadManager::new();
        let start = Instant::now() - Duration::from_secs(30);
        let mut d = Download::new("tok1".to_owned(), "/x/a", DownloadContentType::File, Segment::new(0, 50 * 1024 * 1024), start);
        d.on_bytes_received(1000);
        dm.start("tok1".to_owned(), user(), d);

        let mut conf = ConnectionConf::new();
        conf.dl_auto_disconnect_mode = 2;
        conf.disconnect_time = Duration::from_secs(20);
        conf.disconnect_speed = 1_000_000;
        conf.disconnect_filesize = 1024;
        conf.disconnect_min_sources = 1;

        let actions = dm.tick(&conf, Instant::now(), |_| 2);
        assert_eq!(actions[0].1, TickAction::Disconnect);
    }

    #[test]
    fn test_tick_leaves_download_when_disabled() {
        let mut dm = DownloadManager::new();
        let start = Instant::now() - Duration::from_secs(30);
        let d = Download::new("tok1".to_owned(), "/x/a", DownloadContentType::File, Segment::new(0, 50 * 1024 * 1024), start);
        dm.start("tok1".to_owned(), user(), d);

        let conf = ConnectionConf::new();
        let actions = dm.tick(&conf, Instant::now(), |_| 2);
        assert_eq!(actions[0].1, TickAction::Continue);
    }

    #[test]
    fn test_drain_finished_removes_only_completed_downloads() {
        let mut dm = DownloadManager::new();
        let start = Instant::now();
        let mut finished = Download::new("tok1".to_owned(), "/x/a", DownloadContentType::File, Segment::new(0, 10), start);
        finished.on_bytes_received(10);
        dm.start("tok1".to_owned(), user(), finished);

        let running = Download::new("tok2".to_owned(), "/x/b", DownloadContentType::File, Segment::new(0, 10), start);
        dm.start("tok2".to_owned(), user(), running);

        let drained = dm.drain_finished();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, "tok1");
        assert_eq!(dm.len(), 1);
    }

    #[test]
    fn test_tokens_for_target_excludes_given_token() {
        let mut dm = DownloadManager::new();
        let start = Instant::now();
        dm.start(
            "tok1".to_owned(),
            user(),
            Download::new("tok1".to_owned(), "/x/a", DownloadContentType::File, Segment::overlapping(0, 10), start),
        );
        dm.start(
            "tok2".to_owned(),
            user(),
            Download::new("tok2".to_owned(), "/x/a", DownloadContentType::File, Segment::new(5, 5), start),
        );

        let others = dm.tokens_for_target("/x/a", "tok2");
        assert_eq!(others, vec!["tok1".to_owned()]);
    }
}
