//! Saves and loads bundle queue state as XML, one file per bundle
//! (spec.md §4.7), using the same actor shape as the teacher's disk IO
//! task: a command channel in, an alert channel out, run from a
//! dedicated background task so a slow disk never blocks the queue
//! manager's own event loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::bundle::Bundle;
use crate::error::{PersistenceError, Result};
use crate::queue_item::QueueItem;
use crate::{BundleToken, Cid, HintedUser, Priority, Tth, User};

/// Bundle files written by this module carry this version; anything
/// missing the attribute (every file from before versioning was added)
/// is treated as version 1 and read the same way version 2 is, since
/// the schema hasn't actually changed shape yet. Bumped the day a field
/// changes meaning rather than just gaining an optional attribute.
const CURRENT_VERSION: u32 = 2;

fn default_version() -> u32 {
    1
}

/// The on-disk representation of one bundle, serialized to
/// `Bundle<token>.xml`. Deliberately flatter than the in-memory
/// [`Bundle`]/[`QueueItem`] graph: only what's needed to reconstruct the
/// queue on restart is persisted (run state like `running`/`speed` is
/// not).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename = "Bundle")]
pub struct PersistedBundle {
    #[serde(rename = "@Version", default = "default_version")]
    pub version: u32,
    #[serde(rename = "@Token")]
    pub token: BundleToken,
    #[serde(rename = "@Target")]
    pub target: String,
    #[serde(rename = "@Added")]
    pub added: u64,
    #[serde(rename = "@Priority")]
    pub priority: String,
    /// Files that completed before the last save; kept distinct from
    /// `files` so a finished file never ends up re-requested from a
    /// source (spec.md §4.7).
    #[serde(rename = "Finished", default)]
    pub finished: Vec<PersistedFinishedFile>,
    #[serde(rename = "Download", default)]
    pub files: Vec<PersistedFile>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedFinishedFile {
    #[serde(rename = "@TTH")]
    pub tth: String,
    #[serde(rename = "@Target")]
    pub target: String,
    #[serde(rename = "@Size")]
    pub size: u64,
    #[serde(rename = "@Added")]
    pub added: u64,
    #[serde(rename = "@TimeFinished")]
    pub time_finished: u64,
    #[serde(rename = "@LastSource", default)]
    pub last_source: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedFile {
    #[serde(rename = "@Target")]
    pub name: String,
    #[serde(rename = "@Size")]
    pub size: u64,
    #[serde(rename = "@TTH")]
    pub tth: String,
    #[serde(rename = "@Priority")]
    pub priority: String,
    #[serde(rename = "@TempTarget", default, skip_serializing_if = "Option::is_none")]
    pub temp_target: Option<String>,
    #[serde(rename = "@AutoPriority", default)]
    pub auto_priority: bool,
    #[serde(rename = "@MaxSegments", default)]
    pub max_segments: u8,
    #[serde(rename = "Segment", default)]
    pub segments: Vec<PersistedSegment>,
    #[serde(rename = "Source", default)]
    pub sources: Vec<PersistedSource>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedSegment {
    #[serde(rename = "@Start")]
    pub start: u64,
    #[serde(rename = "@Size")]
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedSource {
    #[serde(rename = "@CID")]
    pub cid: String,
    #[serde(rename = "@Nick")]
    pub nick: String,
    #[serde(rename = "@HubUrl")]
    pub hub_url: String,
}

/// Decodes a base32 CID or TTH, both 24 raw bytes.
fn decode_24(s: &str) -> Option<[u8; 24]> {
    let bytes = base32::decode(base32::Alphabet::RFC4648 { padding: false }, s)?;
    if bytes.len() != 24 {
        return None;
    }
    let mut arr = [0u8; 24];
    arr.copy_from_slice(&bytes);
    Some(arr)
}

fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn priority_to_str(p: Priority) -> &'static str {
    match p {
        Priority::PausedForced => "PausedForced",
        Priority::Paused => "Paused",
        Priority::Lowest => "Lowest",
        Priority::Low => "Low",
        Priority::Normal => "Normal",
        Priority::High => "High",
        Priority::Highest => "Highest",
    }
}

fn priority_from_str(s: &str) -> Priority {
    match s {
        "PausedForced" => Priority::PausedForced,
        "Paused" => Priority::Paused,
        "Lowest" => Priority::Lowest,
        "Low" => Priority::Low,
        "High" => Priority::High,
        "Highest" => Priority::Highest,
        _ => Priority::Normal,
    }
}

/// Converts live queue state into its persisted form. `items` must
/// contain every target named in `bundle.queue_items` and
/// `bundle.finished_files`; an entry whose target is missing from
/// `items` is silently dropped (it was already removed from the queue
/// manager entirely, e.g. a finished file list with nothing to persist).
pub fn to_persisted(bundle: &Bundle, items: &HashMap<String, QueueItem>) -> PersistedBundle {
    PersistedBundle {
        version: CURRENT_VERSION,
        token: bundle.token.clone(),
        target: bundle.target.clone(),
        added: bundle.added,
        priority: priority_to_str(bundle.priority).to_owned(),
        finished: bundle
            .finished_files
            .iter()
            .filter_map(|target| items.get(target))
            .map(|qi| PersistedFinishedFile {
                tth: qi.tth.to_base32(),
                target: qi.target.clone(),
                size: qi.size,
                added: qi.added,
                time_finished: now_secs(),
                last_source: qi.sources.first().map(|s| s.user.user.nick.clone()).unwrap_or_default(),
            })
            .collect(),
        files: bundle
            .queue_items
            .iter()
            .filter_map(|target| items.get(target))
            .map(|qi| PersistedFile {
                name: qi.target.clone(),
                size: qi.size,
                tth: qi.tth.to_base32(),
                priority: priority_to_str(qi.priority).to_owned(),
                temp_target: qi.temp_target.clone(),
                auto_priority: qi.auto_priority,
                max_segments: qi.max_segments,
                segments: qi
                    .done
                    .iter()
                    .map(|s| PersistedSegment { start: s.start, size: s.size })
                    .collect(),
                sources: qi
                    .sources
                    .iter()
                    .map(|s| PersistedSource {
                        cid: s.user.user.cid.to_base32(),
                        nick: s.user.user.nick.clone(),
                        hub_url: s.user.hub_url.clone(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// Reconstructs a bundle and its queue items from their persisted form.
/// Entries whose TTH fails to decode are dropped with a logged warning
/// rather than failing the whole bundle load.
pub fn from_persisted(persisted: PersistedBundle) -> (Bundle, Vec<QueueItem>) {
    let mut bundle = Bundle::new_directory(
        persisted.token,
        persisted.target,
        persisted.added,
        priority_from_str(&persisted.priority),
    );

    let mut items = Vec::new();

    for finished in persisted.finished {
        let tth = match decode_24(&finished.tth) {
            Some(bytes) => Tth(bytes),
            None => {
                log::warn!("dropping finished file {} with unparseable TTH", finished.target);
                continue;
            }
        };
        let mut qi = QueueItem::new(finished.target.clone(), finished.size, tth, Priority::Normal, finished.added);
        qi.bundle = Some(bundle.token.clone());
        qi.flags |= crate::queue_item::FileFlags::FINISHED;
        qi.done.add_finished(crate::segment::Segment::new(0, finished.size));
        bundle.finished_files.push(qi.target.clone());
        items.push(qi);
    }

    for file in persisted.files {
        let tth = match decode_24(&file.tth) {
            Some(bytes) => Tth(bytes),
            None => {
                log::warn!("dropping file {} with unparseable TTH", file.name);
                continue;
            }
        };
        let mut qi = QueueItem::new(file.name.clone(), file.size, tth, priority_from_str(&file.priority), persisted.added);
        qi.bundle = Some(bundle.token.clone());
        qi.temp_target = file.temp_target.clone();
        qi.auto_priority = file.auto_priority;
        if file.max_segments > 0 {
            qi.max_segments = file.max_segments;
        }
        for seg in file.segments {
            qi.done.add_finished(crate::segment::Segment::new(seg.start, seg.size));
        }
        for src in file.sources {
            if let Some(bytes) = decode_24(&src.cid) {
                qi.add_source(HintedUser {
                    user: User { cid: Cid(bytes), nick: src.nick },
                    hub_url: src.hub_url,
                });
            }
        }
        bundle.add_queue_item(qi.target.clone());
        items.push(qi);
    }

    (bundle, items)
}

fn bundle_file_path(dir: &Path, token: &str) -> PathBuf {
    dir.join(format!("Bundle{}.xml", token))
}

/// Serializes `bundle` and writes it to `<dir>/Bundle<token>.xml`.
pub async fn save_bundle(dir: &Path, bundle: &Bundle, items: &HashMap<String, QueueItem>) -> Result<()> {
    let persisted = to_persisted(bundle, items);
    let xml = quick_xml::se::to_string(&persisted).map_err(|e| PersistenceError::Xml(e.to_string()))?;
    let path = bundle_file_path(dir, &bundle.token);
    tokio::fs::write(&path, xml).await.map_err(PersistenceError::from)?;
    Ok(())
}

/// Loads a single bundle file. A corrupt file (fails to parse) is
/// reported as an error to the caller rather than silently skipped; the
/// caller (the load-all sweep) decides whether to delete it.
pub async fn load_bundle(path: &Path) -> Result<(Bundle, Vec<QueueItem>)> {
    let xml = tokio::fs::read_to_string(path).await.map_err(PersistenceError::from)?;
    let persisted: PersistedBundle =
        quick_xml::de::from_str(&xml).map_err(|e| PersistenceError::Xml(e.to_string()))?;
    Ok(from_persisted(persisted))
}

/// Name of the legacy monolithic queue file, carried over from before
/// bundles were split one-file-per-token. Holds every directory and its
/// downloads under a single `<Downloads>` root.
const LEGACY_QUEUE_FILE: &str = "Queue.xml";

#[derive(Debug, Deserialize)]
#[serde(rename = "Downloads")]
struct LegacyQueueFile {
    #[serde(rename = "Directory", default)]
    directories: Vec<LegacyDirectory>,
}

#[derive(Debug, Deserialize)]
struct LegacyDirectory {
    #[serde(rename = "@Path")]
    path: String,
    #[serde(rename = "@Priority", default)]
    priority: Option<String>,
    #[serde(rename = "Download", default)]
    downloads: Vec<LegacyDownload>,
}

#[derive(Debug, Deserialize)]
struct LegacyDownload {
    #[serde(rename = "@Target")]
    target: String,
    #[serde(rename = "@Size")]
    size: u64,
    #[serde(rename = "@TTH")]
    tth: String,
    #[serde(rename = "@Priority", default)]
    priority: Option<String>,
    #[serde(rename = "@TempTarget", default)]
    temp_target: Option<String>,
    #[serde(rename = "Segment", default)]
    segments: Vec<PersistedSegment>,
}

/// Converts the legacy monolithic `Queue.xml` into one `Bundle<token>.xml`
/// per directory it lists, the layout every later version of this module
/// reads back, then renames the legacy file aside rather than deleting
/// it so a failed migration can be retried or inspected by hand.
async fn migrate_legacy_queue(dir: &Path) -> Result<Vec<(Bundle, Vec<QueueItem>)>> {
    let path = dir.join(LEGACY_QUEUE_FILE);
    let xml = tokio::fs::read_to_string(&path).await.map_err(PersistenceError::from)?;
    let legacy: LegacyQueueFile = quick_xml::de::from_str(&xml)
        .map_err(|e| PersistenceError::LegacyMigrationFailed(e.to_string()))?;

    let mut migrated = Vec::new();
    for (i, directory) in legacy.directories.into_iter().enumerate() {
        let token = format!("legacy{}", i);
        let dir_priority = directory.priority.as_deref().map(priority_from_str).unwrap_or(Priority::Normal);
        let mut bundle = Bundle::new_directory(token.clone(), directory.path, now_secs(), dir_priority);

        let mut items = HashMap::new();
        for download in directory.downloads {
            let tth = match decode_24(&download.tth) {
                Some(bytes) => Tth(bytes),
                None => {
                    log::warn!("legacy migration: dropping {} with unparseable TTH", download.target);
                    continue;
                }
            };
            let file_priority = download.priority.as_deref().map(priority_from_str).unwrap_or(dir_priority);
            let mut qi = QueueItem::new(download.target.clone(), download.size, tth, file_priority, now_secs());
            qi.bundle = Some(token.clone());
            qi.temp_target = download.temp_target;
            for seg in download.segments {
                qi.done.add_finished(crate::segment::Segment::new(seg.start, seg.size));
            }
            bundle.add_queue_item(qi.target.clone());
            items.insert(qi.target.clone(), qi);
        }

        save_bundle(dir, &bundle, &items).await?;
        migrated.push((bundle, items.into_values().collect()));
    }

    let aside = dir.join(format!("{}.migrated", LEGACY_QUEUE_FILE));
    tokio::fs::rename(&path, &aside).await.map_err(PersistenceError::from)?;
    log::info!("migrated legacy {} into {} bundle file(s)", LEGACY_QUEUE_FILE, migrated.len());
    Ok(migrated)
}

/// Loads every `Bundle*.xml` file in `dir` in parallel, first migrating
/// a legacy monolithic `Queue.xml` if one is present. Files that fail to
/// parse are deleted after being logged, matching the original's "don't
/// let one corrupt bundle file block the whole queue from loading"
/// behavior; the legacy file itself is never deleted on failure, only
/// renamed aside on success.
pub async fn load_all(dir: &Path) -> Result<Vec<(Bundle, Vec<QueueItem>)>> {
    let mut migrated = Vec::new();
    if tokio::fs::metadata(dir.join(LEGACY_QUEUE_FILE)).await.is_ok() {
        match migrate_legacy_queue(dir).await {
            Ok(bundles) => migrated = bundles,
            Err(e) => log::warn!("failed to migrate legacy {}: {}", LEGACY_QUEUE_FILE, e),
        }
    }

    let mut read_dir = tokio::fs::read_dir(dir).await.map_err(PersistenceError::from)?;
    let mut paths = Vec::new();
    while let Some(entry) = read_dir.next_entry().await.map_err(PersistenceError::from)? {
        let path = entry.path();
        if path.extension().map_or(false, |ext| ext == "xml") {
            paths.push(path);
        }
    }

    let loads = paths.into_iter().map(|path| async move {
        match load_bundle(&path).await {
            Ok(result) => Some(result),
            Err(e) => {
                log::warn!("failed to load {:?}, deleting: {}", path, e);
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
        }
    });

    let mut loaded: Vec<_> = futures::future::join_all(loads).await.into_iter().flatten().collect();
    loaded.extend(migrated);
    Ok(loaded)
}

/// Commands accepted by the persistence actor.
pub enum Command {
    /// Schedule a debounced save; multiple saves for the same bundle
    /// within `persistence_debounce` collapse into one write.
    Save { token: BundleToken, bundle: Bundle, items: HashMap<String, QueueItem> },
    Shutdown,
}

/// Results reported back by the persistence actor.
pub enum Alert {
    Saved(BundleToken),
    SaveFailed { token: BundleToken, error: String },
}

pub type CommandSender = mpsc::UnboundedSender<Command>;
pub type CommandReceiver = mpsc::UnboundedReceiver<Command>;
pub type AlertSender = mpsc::UnboundedSender<Alert>;
pub type AlertReceiver = mpsc::UnboundedReceiver<Alert>;

/// The persistence actor's event loop: debounces saves per bundle token
/// and writes them out after `debounce` has elapsed with no further
/// update for that token.
pub struct Persistence {
    dir: PathBuf,
    debounce: Duration,
    cmd_port: CommandReceiver,
    alert_chan: AlertSender,
    pending: HashMap<BundleToken, (Bundle, HashMap<String, QueueItem>)>,
}

impl Persistence {
    pub fn new(dir: PathBuf, debounce: Duration) -> (Self, CommandSender, AlertReceiver) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        (
            Self {
                dir,
                debounce,
                cmd_port,
                alert_chan,
                pending: HashMap::new(),
            },
            cmd_chan,
            alert_port,
        )
    }

    pub async fn start(&mut self) {
        log::info!("starting persistence event loop");
        loop {
            let flush_in = self.debounce;
            tokio::select! {
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::Save { token, bundle, items }) => {
                            self.pending.insert(token, (bundle, items));
                        }
                        Some(Command::Shutdown) | None => {
                            self.flush_all().await;
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(flush_in), if !self.pending.is_empty() => {
                    self.flush_all().await;
                }
            }
        }
    }

    async fn flush_all(&mut self) {
        for (token, (bundle, items)) in self.pending.drain() {
            match save_bundle(&self.dir, &bundle, &items).await {
                Ok(()) => {
                    let _ = self.alert_chan.send(Alert::Saved(token));
                }
                Err(e) => {
                    let _ = self.alert_chan.send(Alert::SaveFailed {
                        token,
                        error: e.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persisted_roundtrip_preserves_segments() {
        let mut bundle = Bundle::new_directory("b1".to_owned(), "/x", 1000, Priority::High);
        let mut qi = QueueItem::new("/x/a.bin", 100, Tth([9; 24]), Priority::Normal, 1000);
        qi.adds_finished_segment(crate::segment::Segment::new(0, 40));
        qi.bundle = Some("b1".to_owned());
        bundle.add_queue_item(qi.target.clone());

        let mut items = HashMap::new();
        items.insert(qi.target.clone(), qi);

        let persisted = to_persisted(&bundle, &items);
        assert_eq!(persisted.files.len(), 1);
        assert_eq!(persisted.files[0].segments[0].size, 40);

        let (rebuilt_bundle, rebuilt_items) = from_persisted(persisted);
        assert_eq!(rebuilt_bundle.token, "b1");
        assert_eq!(rebuilt_items.len(), 1);
        assert_eq!(rebuilt_items[0].done.downloaded_bytes(), 40);
    }

    #[test]
    fn test_bundle_file_path() {
        let path = bundle_file_path(Path::new("/q"), "abc");
        assert_eq!(path, PathBuf::from("/q/Bundleabc.xml"));
    }

    #[test]
    fn test_persisted_roundtrip_preserves_sources_and_finished_files() {
        let mut bundle = Bundle::new_directory("b2".to_owned(), "/y", 2000, Priority::Normal);

        let mut qi = QueueItem::new("/y/a.bin", 100, Tth([1; 24]), Priority::Normal, 2000);
        qi.bundle = Some("b2".to_owned());
        qi.add_source(HintedUser {
            user: User { cid: Cid([2; 24]), nick: "mimi".to_owned() },
            hub_url: "adc://hub".to_owned(),
        });
        bundle.add_queue_item(qi.target.clone());

        let mut done = QueueItem::new("/y/b.bin", 50, Tth([3; 24]), Priority::Normal, 2000);
        done.bundle = Some("b2".to_owned());
        bundle.add_queue_item(done.target.clone());
        bundle.remove_queue_item(&done.target.clone(), true);

        let mut items = HashMap::new();
        items.insert(qi.target.clone(), qi);
        items.insert(done.target.clone(), done);

        let persisted = to_persisted(&bundle, &items);
        assert_eq!(persisted.files.len(), 1);
        assert_eq!(persisted.files[0].sources.len(), 1);
        assert_eq!(persisted.files[0].sources[0].nick, "mimi");
        assert_eq!(persisted.finished.len(), 1);
        assert_eq!(persisted.finished[0].target, "/y/b.bin");

        let (rebuilt_bundle, rebuilt_items) = from_persisted(persisted);
        assert_eq!(rebuilt_bundle.finished_files, vec!["/y/b.bin".to_owned()]);
        let rebuilt_source = rebuilt_items
            .iter()
            .find(|i| i.target == "/y/a.bin")
            .unwrap();
        assert_eq!(rebuilt_source.sources[0].user.user.nick, "mimi");
        let rebuilt_done = rebuilt_items.iter().find(|i| i.target == "/y/b.bin").unwrap();
        assert!(rebuilt_done.is_finished());
    }

    #[tokio::test]
    async fn test_migrate_legacy_queue_converts_directories_to_bundles() {
        let dir = std::env::temp_dir().join(format!("peerqueue_legacy_test_{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let tth = Tth([7; 24]).to_base32();
        let xml = format!(
            r#"<Downloads><Directory Path="/z" Priority="High"><Download Target="/z/a.bin" Size="10" TTH="{}"><Segment Start="0" Size="5"/></Download></Directory></Downloads>"#,
            tth
        );
        tokio::fs::write(dir.join(LEGACY_QUEUE_FILE), xml).await.unwrap();

        let migrated = migrate_legacy_queue(&dir).await.unwrap();
        assert_eq!(migrated.len(), 1);
        assert_eq!(migrated[0].1.len(), 1);
        assert_eq!(migrated[0].1[0].target, "/z/a.bin");
        assert_eq!(migrated[0].1[0].done.downloaded_bytes(), 5);

        assert!(!tokio::fs::metadata(dir.join(LEGACY_QUEUE_FILE)).await.is_ok());
        assert!(tokio::fs::metadata(dir.join(format!("{}.migrated", LEGACY_QUEUE_FILE))).await.is_ok());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
