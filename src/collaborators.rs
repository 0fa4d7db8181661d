//! External collaborators the core depends on but does not implement:
//! hashing, the share index, hub chat, and remote file lists (spec.md
//! §6.1). The core calls these through trait objects instead of the
//! original's global singletons (spec.md §9 "Global singletons"),
//! so a host application supplies its own implementation and the core
//! stays testable with fakes.

use async_trait::async_trait;

use crate::error::Result;
use crate::{HintedUser, Tth};

/// Verifies and produces TTH hashes for finished files. Hashing itself is
/// out of scope (spec.md Non-goals); the core only needs to know when to
/// ask for it and what to do with the answer.
#[async_trait]
pub trait HashService: Send + Sync {
    /// Schedules `path` for hashing and returns once the request has been
    /// accepted (not once hashing completes — that result arrives later
    /// via [`HashService::hash_result`]).
    async fn request_hash(&self, path: &str, expected: Tth) -> Result<()>;

    /// Polls whether a previously requested hash has completed, and
    /// whether it matched what was expected.
    async fn hash_result(&self, path: &str) -> Option<HashOutcome>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashOutcome {
    Matched,
    Mismatched,
    Failed,
}

/// Looks up whether a file is already present in the local share, used by
/// the dupe checks in `QueueManager::add_file` (spec.md §4.4).
#[async_trait]
pub trait ShareIndex: Send + Sync {
    async fn is_shared(&self, tth: Tth) -> bool;
    async fn shared_path(&self, tth: Tth) -> Option<String>;
}

/// Sends and receives hub protocol messages (connect requests, search
/// results, UBN notifications). The wire codec in [`crate::protocol`] is
/// owned by the core; actually opening hub connections is not.
#[async_trait]
pub trait HubClient: Send + Sync {
    async fn connect_to_me(&self, hub_url: &str, user: &HintedUser, token: &str) -> Result<()>;
    async fn reverse_connect_to_me(&self, hub_url: &str, user: &HintedUser, token: &str) -> Result<()>;
    async fn send_ubn(&self, hub_url: &str, user: &HintedUser, percent: f64) -> Result<()>;
    fn online_hubs(&self) -> Vec<String>;
}

/// Fetches a user's remote file list, used by auto-search / directory
/// matching. Parsing the returned list's XML/bzip2 container is out of
/// scope (spec.md Non-goals): the core only asks for it and is handed a
/// path to a local copy of it, and logs when it hands that path onward.
#[async_trait]
pub trait FileListService: Send + Sync {
    async fn request_partial_list(&self, user: &HintedUser, dir: &str) -> Result<String>;
    async fn request_full_list(&self, user: &HintedUser) -> Result<String>;
}
