use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use gator_core::{ApiErrorClass, DriveClient, DriveError, FOLDER_MIME_TYPE};
use rand::Rng;
use thiserror::Error;

use crate::model::{
    ChangeRecord, ChangedFile, FileMeta, HookLease, SharedRoot, ShortcutLink, TagFolder, now_unix,
};

/// Closed error-kind surface for every remote operation. Engines branch on
/// these kinds, never on message text.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote object not found")]
    NotFound,
    #[error("permission denied by remote store")]
    PermissionDenied,
    #[error("remote object already exists")]
    AlreadyExists,
    #[error("rate limited by remote store")]
    RateLimited,
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("remote request failed: {0}")]
    Permanent(String),
}

impl From<DriveError> for RemoteError {
    fn from(err: DriveError) -> Self {
        match err.classification() {
            Some(ApiErrorClass::NotFound) => RemoteError::NotFound,
            Some(ApiErrorClass::Permission) => RemoteError::PermissionDenied,
            Some(ApiErrorClass::Auth) => RemoteError::PermissionDenied,
            Some(ApiErrorClass::RateLimit) => RemoteError::RateLimited,
            Some(ApiErrorClass::Transient) => RemoteError::Transient(err.to_string()),
            Some(ApiErrorClass::Permanent) => RemoteError::Permanent(err.to_string()),
            // Network-level failures never reached the API; retryable.
            None => RemoteError::Transient(err.to_string()),
        }
    }
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::RateLimited | RemoteError::Transient(_))
    }
}

/// One page of the change feed: either a continuation token for the next
/// page, or the new baseline token that terminates the traversal.
#[derive(Debug)]
pub struct ChangePage {
    pub records: Vec<ChangeRecord>,
    pub next: PageToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageToken {
    NextPage(String),
    NewBaseline(String),
}

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Capability surface of the remote hierarchical file store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn baseline_cursor(&self) -> Result<String, RemoteError>;

    async fn changes_page(&self, cursor: &str) -> Result<ChangePage, RemoteError>;

    async fn list_folders(&self, parent_id: &str) -> Result<Vec<TagFolder>, RemoteError>;

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<TagFolder, RemoteError>;

    async fn get_metadata(&self, file_id: &str) -> Result<FileMeta, RemoteError>;

    async fn update_parents(
        &self,
        file_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), RemoteError>;

    async fn create_shortcut(
        &self,
        target_id: &str,
        parent_id: &str,
    ) -> Result<ShortcutLink, RemoteError>;

    /// Removing an already-gone link counts as success.
    async fn delete_shortcut(&self, link_id: &str) -> Result<(), RemoteError>;

    /// Every shortcut whose target is the given file, across the store.
    async fn list_links(&self, target_id: &str) -> Result<Vec<ShortcutLink>, RemoteError>;

    async fn register_hook(&self, address: &str, cursor: &str) -> Result<HookLease, RemoteError>;

    /// Releasing an unknown lease counts as success.
    async fn release_hook(&self, lease: &HookLease) -> Result<(), RemoteError>;

    async fn list_shared_roots(&self) -> Result<Vec<SharedRoot>, RemoteError>;

    async fn download(&self, file_id: &str) -> Result<ByteStream, RemoteError>;
}

/// `RemoteStore` adapter over the Drive REST client.
#[derive(Clone)]
pub struct DriveRemote {
    client: DriveClient,
}

impl DriveRemote {
    pub fn new(client: DriveClient) -> Self {
        Self { client }
    }

    fn channel_id() -> String {
        let nonce: u32 = rand::thread_rng().r#gen();
        format!("gator-{}-{nonce:08x}", now_unix())
    }
}

#[async_trait]
impl RemoteStore for DriveRemote {
    async fn baseline_cursor(&self) -> Result<String, RemoteError> {
        Ok(self.client.get_start_page_token().await?)
    }

    async fn changes_page(&self, cursor: &str) -> Result<ChangePage, RemoteError> {
        let page = self.client.list_changes(cursor).await?;
        let records = page
            .changes
            .into_iter()
            .map(|change| ChangeRecord {
                file_id: change.file_id,
                removed: change.removed,
                file: change.file.map(|file| ChangedFile {
                    name: file.name.unwrap_or_default(),
                    md5: file.md5_checksum,
                    size: file.size,
                    parent_ids: file.parents,
                    trashed: file.trashed,
                }),
            })
            .collect();
        let next = match (page.next_page_token, page.new_start_page_token) {
            (Some(token), _) => PageToken::NextPage(token),
            (None, Some(token)) => PageToken::NewBaseline(token),
            (None, None) => {
                return Err(RemoteError::Permanent(
                    "change page carried neither continuation nor baseline token".into(),
                ));
            }
        };
        Ok(ChangePage { records, next })
    }

    async fn list_folders(&self, parent_id: &str) -> Result<Vec<TagFolder>, RemoteError> {
        let folders = self.client.list_child_folders(parent_id).await?;
        Ok(folders
            .into_iter()
            .map(|folder| TagFolder {
                id: folder.id,
                name: folder.name.unwrap_or_default(),
            })
            .collect())
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<TagFolder, RemoteError> {
        let folder = self.client.create_folder(parent_id, name).await?;
        Ok(TagFolder {
            id: folder.id,
            name: folder.name.unwrap_or_else(|| name.to_string()),
        })
    }

    async fn get_metadata(&self, file_id: &str) -> Result<FileMeta, RemoteError> {
        let file = self.client.get_file(file_id).await?;
        Ok(FileMeta {
            id: file.id,
            name: file.name.unwrap_or_default(),
            md5: file.md5_checksum,
            size: file.size,
            parent_ids: file.parents,
            can_move: file
                .capabilities
                .map(|caps| caps.can_move_item_within_drive)
                .unwrap_or(false),
            trashed: file.trashed,
        })
    }

    async fn update_parents(
        &self,
        file_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), RemoteError> {
        self.client.update_parents(file_id, add, remove).await?;
        Ok(())
    }

    async fn create_shortcut(
        &self,
        target_id: &str,
        parent_id: &str,
    ) -> Result<ShortcutLink, RemoteError> {
        let link = self.client.create_shortcut(target_id, parent_id, None).await?;
        Ok(ShortcutLink {
            id: link.id,
            target_file_id: target_id.to_string(),
            parent_id: parent_id.to_string(),
        })
    }

    async fn delete_shortcut(&self, link_id: &str) -> Result<(), RemoteError> {
        match self.client.delete_file(link_id).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_links(&self, target_id: &str) -> Result<Vec<ShortcutLink>, RemoteError> {
        let files = self.client.list_shortcuts_to(target_id).await?;
        Ok(files
            .into_iter()
            .flat_map(|file| {
                let id = file.id;
                file.parents
                    .into_iter()
                    .map(move |parent_id| ShortcutLink {
                        id: id.clone(),
                        target_file_id: target_id.to_string(),
                        parent_id,
                    })
            })
            .collect())
    }

    async fn register_hook(&self, address: &str, cursor: &str) -> Result<HookLease, RemoteError> {
        let channel_id = Self::channel_id();
        let channel = self
            .client
            .watch_changes(cursor, &channel_id, address)
            .await?;
        Ok(HookLease {
            id: channel.id,
            resource_id: channel.resource_id,
            resource_uri: channel.resource_uri,
            kind: "web_hook".to_string(),
            address: address.to_string(),
            expiration: channel.expiration,
            cursor: cursor.to_string(),
        })
    }

    async fn release_hook(&self, lease: &HookLease) -> Result<(), RemoteError> {
        match self.client.stop_channel(&lease.id, &lease.resource_id).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_shared_roots(&self) -> Result<Vec<SharedRoot>, RemoteError> {
        let files = self.client.list_shared_with_me().await?;
        Ok(files
            .into_iter()
            .filter(|file| file.mime_type.as_deref() == Some(FOLDER_MIME_TYPE))
            .map(|file| SharedRoot {
                id: file.id,
                name: file.name.unwrap_or_default(),
                owner: file
                    .owners
                    .first()
                    .and_then(|owner| owner.email_address.clone()),
            })
            .collect())
    }

    async fn download(&self, file_id: &str) -> Result<ByteStream, RemoteError> {
        let response = self.client.download(file_id).await?;
        Ok(Box::pin(response.bytes_stream().map_err(io::Error::other)))
    }
}
