use std::collections::HashMap;
use std::sync::Mutex;

use futures_util::future::join_all;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{FileMeta, RootSet, TagFolder};
use crate::remote::{RemoteError, RemoteStore};
use crate::sync::roots::{self, SYSTEM_FOLDER_NAME, SystemFolders};

pub const INBOX_TAG: &str = "inbox";
pub const DEFAULT_BUCKET: &str = "xx";

#[derive(Debug, Error)]
pub enum TagError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// What one reconciliation actually changed, summed across roots.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub roots_attempted: usize,
    pub links_created: usize,
    pub links_removed: usize,
    pub moves: usize,
}

/// Trim, drop empties, dedupe case-insensitively. An empty set defaults to
/// `["inbox"]`; if inbox is present it is the only tag kept.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let trimmed = tag.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(SYSTEM_FOLDER_NAME) {
            continue;
        }
        if trimmed.eq_ignore_ascii_case(INBOX_TAG) {
            return vec![INBOX_TAG.to_string()];
        }
        if !out.iter().any(|t| t.eq_ignore_ascii_case(trimmed)) {
            out.push(trimmed.to_string());
        }
    }
    if out.is_empty() {
        return vec![INBOX_TAG.to_string()];
    }
    out
}

/// Alphabetical-index bucket of a filename: its first two characters
/// lower-cased, or `"xx"` when the name is too short.
pub fn alpha_bucket(name: &str) -> String {
    let bucket: String = name.chars().take(2).flat_map(char::to_lowercase).collect();
    if bucket.chars().count() < 2 {
        return DEFAULT_BUCKET.to_string();
    }
    bucket
}

struct RootOutcome {
    links_created: usize,
    links_removed: usize,
    moved: bool,
}

/// Drives a file's shortcut links to match its desired tag set, per root.
/// Idempotent: a second identical run issues no writes.
pub struct TagEngine<R> {
    remote: R,
    // Best-effort memo only; correctness never depends on it.
    system_cache: Mutex<HashMap<String, SystemFolders>>,
}

impl<R: RemoteStore> TagEngine<R> {
    pub fn new(remote: R) -> Self {
        Self {
            remote,
            system_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub async fn reconcile(
        &self,
        file_id: &str,
        desired_tags: &[String],
        roots: &RootSet,
    ) -> Result<ReconcileReport, TagError> {
        let tags = normalize_tags(desired_tags);
        let meta = self.remote.get_metadata(file_id).await?;
        if meta.trashed {
            debug!(file = file_id, "skipping trashed file");
            return Ok(ReconcileReport::default());
        }
        let bucket = alpha_bucket(&meta.name);

        let attempts = join_all(
            roots
                .root_ids()
                .iter()
                .map(|root_id| self.reconcile_root(root_id, &meta, &tags, &bucket, roots)),
        )
        .await;

        let mut report = ReconcileReport::default();
        let mut first_error = None;
        for outcome in attempts {
            match outcome {
                Ok(Some(root)) => {
                    report.roots_attempted += 1;
                    report.links_created += root.links_created;
                    report.links_removed += root.links_removed;
                    report.moves += usize::from(root.moved);
                }
                Ok(None) => {}
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(report),
        }
    }

    /// One root's share of the reconciliation. Returns `None` when the root
    /// does not contain the file.
    async fn reconcile_root(
        &self,
        root_id: &str,
        meta: &FileMeta,
        tags: &[String],
        bucket: &str,
        roots: &RootSet,
    ) -> Result<Option<RootOutcome>, RemoteError> {
        let aliases = roots.aliases_of(root_id);
        if !meta.parent_ids.iter().any(|p| aliases.contains(&p.as_str())) {
            debug!(file = %meta.id, root = root_id, "file not inside root, skipping");
            return Ok(None);
        }

        let system = self.system_folders(root_id).await?;
        let moved = self.ensure_archived(meta, root_id, &system, roots).await?;

        // Plain tags resolve against the root's direct children only (minus
        // the system container). The alphabetical buckets live under the
        // system folder and are never targets for a named tag, even when a
        // tag spells the same as a bucket.
        let mut root_children: Vec<TagFolder> = self
            .remote
            .list_folders(root_id)
            .await?
            .into_iter()
            .filter(|folder| folder.id != system.sysfolder.id)
            .collect();
        let buckets = self.remote.list_folders(&system.alphabetical.id).await?;

        let mut wanted_ids: Vec<String> = Vec::with_capacity(tags.len() + 1);
        for tag in tags {
            let folder = match roots::canonical_folder(&root_children, tag) {
                Some(folder) => folder,
                None => {
                    let created = roots::get_or_create_folder(&self.remote, root_id, tag).await?;
                    root_children.push(created.clone());
                    created
                }
            };
            if !wanted_ids.contains(&folder.id) {
                wanted_ids.push(folder.id);
            }
        }
        let bucket_folder = match roots::canonical_folder(&buckets, bucket) {
            Some(folder) => folder,
            None => {
                roots::get_or_create_folder(&self.remote, &system.alphabetical.id, bucket).await?
            }
        };
        if !wanted_ids.contains(&bucket_folder.id) {
            wanted_ids.push(bucket_folder.id);
        }

        let mut known = root_children;
        known.extend(buckets);

        let current: Vec<_> = self
            .remote
            .list_links(&meta.id)
            .await?
            .into_iter()
            .filter(|link| known.iter().any(|folder| folder.id == link.parent_id))
            .collect();

        let to_add: Vec<&str> = wanted_ids
            .iter()
            .map(String::as_str)
            .filter(|id| !current.iter().any(|link| link.parent_id == *id))
            .collect();
        let to_remove: Vec<_> = current
            .iter()
            .filter(|link| !wanted_ids.contains(&link.parent_id))
            .collect();

        if to_add.is_empty() && to_remove.is_empty() {
            debug!(file = %meta.id, root = root_id, "links already converged");
            return Ok(Some(RootOutcome {
                links_created: 0,
                links_removed: 0,
                moved,
            }));
        }

        let mut links_created = 0;
        for parent_id in to_add {
            match self.remote.create_shortcut(&meta.id, parent_id).await {
                Ok(_) => links_created += 1,
                Err(RemoteError::AlreadyExists) => {}
                Err(err) => return Err(err),
            }
        }
        let mut links_removed = 0;
        for link in to_remove {
            match self.remote.delete_shortcut(&link.id).await {
                Ok(()) => links_removed += 1,
                Err(RemoteError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        debug!(
            file = %meta.id,
            root = root_id,
            created = links_created,
            removed = links_removed,
            "links reconciled"
        );
        Ok(Some(RootOutcome {
            links_created,
            links_removed,
            moved,
        }))
    }

    /// Ensures the file's real parentage inside this root is the `original`
    /// folder. Skipped when the store denies moves on the file.
    async fn ensure_archived(
        &self,
        meta: &FileMeta,
        root_id: &str,
        system: &SystemFolders,
        roots: &RootSet,
    ) -> Result<bool, RemoteError> {
        let aliases = roots.aliases_of(root_id);
        let misplaced: Vec<String> = meta
            .parent_ids
            .iter()
            .filter(|p| aliases.contains(&p.as_str()) && **p != system.original.id)
            .cloned()
            .collect();
        if misplaced.is_empty() {
            return Ok(false);
        }
        if !meta.can_move {
            warn!(file = %meta.id, root = root_id, "no move permission, leaving file in place");
            return Ok(false);
        }
        let add = if meta.parent_ids.contains(&system.original.id) {
            Vec::new()
        } else {
            vec![system.original.id.clone()]
        };
        self.remote.update_parents(&meta.id, &add, &misplaced).await?;
        debug!(file = %meta.id, root = root_id, "archived under original folder");
        Ok(true)
    }

    async fn system_folders(&self, root_id: &str) -> Result<SystemFolders, RemoteError> {
        if let Ok(cache) = self.system_cache.lock() {
            if let Some(cached) = cache.get(root_id) {
                return Ok(cached.clone());
            }
        }
        let system = roots::ensure_system_folders(&self.remote, root_id).await?;
        if let Ok(mut cache) = self.system_cache.lock() {
            cache.insert(root_id.to_string(), system.clone());
        }
        Ok(system)
    }
}
