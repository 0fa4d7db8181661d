//! Wires the queue, connection, and download managers together with
//! their external collaborators into a single owned value, replacing the
//! global singletons the original reaches for (spec.md §9 "Global
//! singletons").

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::collaborators::{FileListService, HashService, HubClient, ShareIndex};
use crate::conf::Conf;
use crate::connection::ConnectionManager;
use crate::download::{Download, DownloadContentType};
use crate::download_manager::DownloadManager;
use crate::persistence::{self, Persistence};
use crate::queue_item::SourceFlags;
use crate::{HintedUser, QueueManager, Token};

/// The collaborators a host application must supply; the core never
/// constructs these itself (spec.md §6.1).
pub struct Collaborators {
    pub hash_service: Arc<dyn HashService>,
    pub share_index: Arc<dyn ShareIndex>,
    pub hub_client: Arc<dyn HubClient>,
    pub file_list_service: Arc<dyn FileListService>,
}

/// Everything a running instance of the core needs, in one place instead
/// of scattered statics. Constructed once at startup and threaded through
/// to whatever drives the event loop (typically [`crate::scheduler`]).
pub struct AppContext {
    pub conf: Conf,
    pub queue: QueueManager,
    pub connections: ConnectionManager,
    pub downloads: DownloadManager,
    pub collaborators: Collaborators,
    persistence_cmd: persistence::CommandSender,
}

impl AppContext {
    /// Builds a fresh context and spawns the persistence actor as a
    /// background task. Returns the context, the persistence actor's
    /// alert stream (so the caller can log save failures), and the
    /// actor's join handle (so it can be awaited on shutdown).
    pub fn new(conf: Conf, collaborators: Collaborators) -> (Self, persistence::AlertReceiver, JoinHandle<()>) {
        let (mut persistence_actor, persistence_cmd, alerts) =
            Persistence::new(conf.queue.download_dir.clone(), conf.download.persistence_debounce);
        let handle = tokio::spawn(async move { persistence_actor.start().await });

        let queue = QueueManager::new(conf.queue.clone());
        let connections = ConnectionManager::new(conf.connection.clone());
        let downloads = DownloadManager::new();

        (
            Self {
                conf,
                queue,
                connections,
                downloads,
                collaborators,
                persistence_cmd,
            },
            alerts,
            handle,
        )
    }

    /// Loads any bundles persisted from a previous run, replaying each
    /// into the queue manager. Intended to run once at startup, before
    /// any new bundles are added.
    pub async fn load_queue_from_disk(&mut self) -> crate::error::Result<()> {
        let loaded = persistence::load_all(&self.conf.queue.download_dir).await?;
        log::info!("loaded {} persisted bundle(s)", loaded.len());
        for (bundle, items) in loaded {
            self.queue.restore_bundle(bundle, items);
        }
        Ok(())
    }

    /// Schedules `bundle`/`items` to be written to disk once the
    /// persistence debounce window elapses. Never blocks on actual disk
    /// IO: a full/closed channel is logged and otherwise ignored, matching
    /// the "never let a stalled disk writer back up the queue" posture
    /// used in [`Persistence`].
    pub fn schedule_save(&self, token: crate::BundleToken, bundle: crate::bundle::Bundle, items: std::collections::HashMap<String, crate::queue_item::QueueItem>) {
        if self
            .persistence_cmd
            .send(persistence::Command::Save { token, bundle, items })
            .is_err()
        {
            log::warn!("persistence actor is gone, dropping save request");
        }
    }

    pub fn shutdown_persistence(&self) {
        let _ = self.persistence_cmd.send(persistence::Command::Shutdown);
    }

    /// Folds a finished or aborted transfer back into the queue, branching
    /// on content type and calling out to collaborators where the spec
    /// requires it (spec.md §4.4 `putDownload`). `token` is the connection
    /// the transfer ran on, used to find and disconnect any other download
    /// still overlapping an item that has just become fully complete.
    pub async fn put_download(&mut self, token: &Token, user: &HintedUser, download: Download, finished: bool, no_access: bool, rotate_queue: bool) {
        let target = download.target.clone();
        match download.content_type {
            DownloadContentType::File => {
                let result = self.queue.put_download_file(&target, user, download.segment, download.position, finished, no_access, rotate_queue);
                match result {
                    Ok(item_finished) if finished && item_finished => {
                        for other in self.downloads.tokens_for_target(&target, token) {
                            log::info!("disconnecting overlapped download {} now that {} is finished", other, target);
                            self.downloads.stop(&other);
                            self.connections.disconnect(&other);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("put_download({}) failed: {}", target, e),
                }
            }
            DownloadContentType::Tree => {
                if !finished {
                    log::debug!("tree download for {} aborted", target);
                    return;
                }
                let expected = self.queue.item(&target).map(|qi| qi.tth).unwrap_or(crate::Tth([0; 24]));
                if let Err(e) = self.collaborators.hash_service.request_hash(&target, expected).await {
                    log::warn!("tree for {} rejected by hash service: {}", target, e);
                    self.queue.remove_source_from_item(&target, user, SourceFlags::BAD_TREE);
                }
            }
            DownloadContentType::FullList | DownloadContentType::PartialList => {
                if !finished {
                    return;
                }
                log::info!("file list from {} ready, handing off to list processor", user.user.nick);
                if let Err(e) = self.queue.finish_list_item(&target) {
                    log::debug!("no queue item to finish for list download {}: {}", target, e);
                }
            }
        }
    }
}
