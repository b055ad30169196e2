use tracing::debug;

use crate::model::{RootSet, TagFolder};
use crate::remote::{RemoteError, RemoteStore};

/// Well-known container under each root for structural (non-tag) folders.
pub const SYSTEM_FOLDER_NAME: &str = "sysfolder";
/// Archival home of each file's single real parent.
pub const ORIGINAL_FOLDER_NAME: &str = "original";
/// Container of the two-letter alphabetical index buckets.
pub const ALPHABETICAL_FOLDER_NAME: &str = "alphabetical";

/// The structural folder roles owned by one root.
#[derive(Debug, Clone)]
pub struct SystemFolders {
    pub sysfolder: TagFolder,
    pub original: TagFolder,
    pub alphabetical: TagFolder,
}

/// Picks the canonical folder among same-named candidates. Concurrent
/// creations can leave duplicates; the lowest id wins and the rest are
/// treated as orphans, never deleted here.
pub fn canonical_folder(folders: &[TagFolder], name: &str) -> Option<TagFolder> {
    folders
        .iter()
        .filter(|folder| folder.name.eq_ignore_ascii_case(name))
        .min_by(|a, b| a.id.cmp(&b.id))
        .cloned()
}

/// Looks a folder up by name under a parent, creating it when absent.
/// A lost creation race self-heals: the duplicate is resolved to the
/// canonical folder on the next lookup.
pub async fn get_or_create_folder<R: RemoteStore>(
    remote: &R,
    parent_id: &str,
    name: &str,
) -> Result<TagFolder, RemoteError> {
    let existing = remote.list_folders(parent_id).await?;
    if let Some(folder) = canonical_folder(&existing, name) {
        return Ok(folder);
    }
    match remote.create_folder(parent_id, name).await {
        Ok(folder) => {
            debug!(parent = parent_id, name, id = %folder.id, "created folder");
            Ok(folder)
        }
        Err(RemoteError::AlreadyExists) => {
            let refreshed = remote.list_folders(parent_id).await?;
            canonical_folder(&refreshed, name).ok_or(RemoteError::NotFound)
        }
        Err(err) => Err(err),
    }
}

/// Creates (or finds) the full system-folder set of a root.
pub async fn ensure_system_folders<R: RemoteStore>(
    remote: &R,
    root_id: &str,
) -> Result<SystemFolders, RemoteError> {
    let sysfolder = get_or_create_folder(remote, root_id, SYSTEM_FOLDER_NAME).await?;
    let original = get_or_create_folder(remote, &sysfolder.id, ORIGINAL_FOLDER_NAME).await?;
    let alphabetical =
        get_or_create_folder(remote, &sysfolder.id, ALPHABETICAL_FOLDER_NAME).await?;
    Ok(SystemFolders {
        sysfolder,
        original,
        alphabetical,
    })
}

/// Finds a root's `original` folder id without creating anything. Used by
/// the synchronizer to widen matching to files already archived.
pub async fn find_original_folder<R: RemoteStore>(
    remote: &R,
    root_id: &str,
) -> Result<Option<String>, RemoteError> {
    let children = remote.list_folders(root_id).await?;
    let Some(sysfolder) = canonical_folder(&children, SYSTEM_FOLDER_NAME) else {
        return Ok(None);
    };
    let inner = remote.list_folders(&sysfolder.id).await?;
    Ok(canonical_folder(&inner, ORIGINAL_FOLDER_NAME).map(|folder| folder.id))
}

/// Resolves the monitored root set: explicitly configured roots plus
/// shared containers whose owner is on the allow-list, each widened with
/// its `original` folder when one already exists.
pub async fn discover_roots<R: RemoteStore>(
    remote: &R,
    explicit: &[String],
    allowed_owners: &[String],
) -> Result<RootSet, RemoteError> {
    let mut root_ids: Vec<String> = explicit.to_vec();
    if !allowed_owners.is_empty() {
        for shared in remote.list_shared_roots().await? {
            let allowed = shared
                .owner
                .as_deref()
                .is_some_and(|owner| allowed_owners.iter().any(|a| a.eq_ignore_ascii_case(owner)));
            if !allowed {
                debug!(root = %shared.id, "ignoring shared root from unlisted owner");
                continue;
            }
            if !root_ids.contains(&shared.id) {
                root_ids.push(shared.id);
            }
        }
    }

    let mut roots = RootSet::new();
    for root_id in root_ids {
        let original = find_original_folder(remote, &root_id).await?;
        roots.insert(root_id, original);
    }
    Ok(roots)
}
