use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Position in the remote change feed. `None` is the "no baseline yet"
/// sentinel: the next synchronization run must first acquire a fresh
/// baseline token before listing changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    None,
    At(String),
}

impl Cursor {
    pub fn from_stored(value: Option<String>) -> Self {
        match value {
            Some(token) if !token.is_empty() && token != "none" => Cursor::At(token),
            _ => Cursor::None,
        }
    }

    pub fn as_token(&self) -> Option<&str> {
        match self {
            Cursor::None => None,
            Cursor::At(token) => Some(token),
        }
    }
}

/// One entry from the remote change feed. Tombstones carry no `file`
/// metadata and are dropped by the synchronizer.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub file_id: String,
    pub removed: bool,
    pub file: Option<ChangedFile>,
}

#[derive(Debug, Clone)]
pub struct ChangedFile {
    pub name: String,
    pub md5: Option<String>,
    pub size: Option<u64>,
    pub parent_ids: Vec<String>,
    pub trashed: bool,
}

/// Download-queue payload. Owned by the queue once enqueued; redelivered
/// until a worker pass acknowledges it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub group_id: Option<String>,
}

/// A folder acting as a tag. Identity is the store-assigned id; name
/// equality is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFolder {
    pub id: String,
    pub name: String,
}

/// "file X is tagged Y" without moving the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortcutLink {
    pub id: String,
    pub target_file_id: String,
    pub parent_id: String,
}

/// File metadata as reported by the remote store.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub id: String,
    pub name: String,
    pub md5: Option<String>,
    pub size: Option<u64>,
    pub parent_ids: Vec<String>,
    pub can_move: bool,
    pub trashed: bool,
}

/// A top-level shared container as returned by root discovery, before
/// owner filtering.
#[derive(Debug, Clone)]
pub struct SharedRoot {
    pub id: String,
    pub name: String,
    pub owner: Option<String>,
}

/// One active push-notification subscription, anchored to a cursor.
/// Superseded on renewal, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookLease {
    pub id: String,
    pub resource_id: String,
    #[serde(default)]
    pub resource_uri: Option<String>,
    pub kind: String,
    pub address: String,
    /// Milliseconds since the unix epoch.
    pub expiration: i64,
    pub cursor: String,
}

/// Which alias of a monitored root a folder id denotes: the shared folder
/// itself, or its `original` archival subfolder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootRef {
    Shared(String),
    OriginalOf(String),
}

impl RootRef {
    pub fn root_id(&self) -> &str {
        match self {
            RootRef::Shared(id) => id,
            RootRef::OriginalOf(id) => id,
        }
    }
}

/// Monitored roots resolved once at discovery time into a flat map from
/// folder id to the root it belongs to.
#[derive(Debug, Clone, Default)]
pub struct RootSet {
    entries: HashMap<String, RootRef>,
    roots: Vec<String>,
}

impl RootSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, root_id: String, original_id: Option<String>) {
        if !self.roots.contains(&root_id) {
            self.roots.push(root_id.clone());
        }
        self.entries
            .insert(root_id.clone(), RootRef::Shared(root_id.clone()));
        if let Some(original) = original_id {
            self.entries.insert(original, RootRef::OriginalOf(root_id));
        }
    }

    /// Root ids only, in insertion order.
    pub fn root_ids(&self) -> &[String] {
        &self.roots
    }

    /// Every folder id that counts as "inside" a monitored root.
    pub fn monitored_ids(&self) -> HashSet<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// The root owning the first monitored id found among `parent_ids`.
    pub fn owning_root(&self, parent_ids: &[String]) -> Option<&str> {
        parent_ids
            .iter()
            .find_map(|parent| self.entries.get(parent))
            .map(RootRef::root_id)
    }

    /// Folder ids (root itself plus its `original`, when known) that place
    /// a file inside the given root.
    pub fn aliases_of(&self, root_id: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, root)| root.root_id() == root_id)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

pub fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
