//! In-memory `RemoteStore` double for engine tests. Scriptable failures,
//! deterministic ids, call counters.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;

use crate::model::{ChangeRecord, FileMeta, HookLease, SharedRoot, ShortcutLink, TagFolder};
use crate::remote::{ByteStream, ChangePage, PageToken, RemoteError, RemoteStore};

/// Which `RemoteError` a scripted failure turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FakeFailure {
    NotFound,
    Permission,
    RateLimited,
    Transient,
}

impl FakeFailure {
    fn to_error(self) -> RemoteError {
        match self {
            FakeFailure::NotFound => RemoteError::NotFound,
            FakeFailure::Permission => RemoteError::PermissionDenied,
            FakeFailure::RateLimited => RemoteError::RateLimited,
            FakeFailure::Transient => RemoteError::Transient("scripted failure".into()),
        }
    }
}

struct FakeFolder {
    name: String,
    parent: String,
}

#[derive(Default)]
struct Counters {
    folders_created: u64,
    shortcuts_created: u64,
    shortcuts_deleted: u64,
    parent_updates: u64,
    downloads: u64,
}

#[derive(Default)]
struct State {
    folders: HashMap<String, FakeFolder>,
    files: HashMap<String, FileMeta>,
    links: HashMap<String, ShortcutLink>,
    shared: Vec<SharedRoot>,
    pages: VecDeque<(Vec<ChangeRecord>, PageToken)>,
    requested_cursors: Vec<String>,
    baseline: String,
    blobs: HashMap<String, Vec<u8>>,
    download_failures: HashMap<String, FakeFailure>,
    op_failures: HashMap<&'static str, VecDeque<FakeFailure>>,
    registered: Vec<HookLease>,
    released: Vec<String>,
    hook_expiration_ms: i64,
    next_id: u64,
    counters: Counters,
}

#[derive(Clone)]
pub(crate) struct FakeRemote {
    state: Arc<Mutex<State>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        let state = State {
            baseline: "baseline-1".to_string(),
            hook_expiration_ms: 1_900_000_000_000,
            ..State::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn fresh_id(state: &mut State, prefix: &str) -> String {
        state.next_id += 1;
        format!("{prefix}-{:04}", state.next_id)
    }

    fn take_failure(state: &mut State, op: &'static str) -> Option<FakeFailure> {
        state.op_failures.get_mut(op).and_then(VecDeque::pop_front)
    }

    pub fn add_root(&self, id: &str) {
        self.lock().folders.insert(
            id.to_string(),
            FakeFolder {
                name: id.to_string(),
                parent: String::new(),
            },
        );
    }

    pub fn add_folder(&self, parent_id: &str, name: &str) -> String {
        let mut state = self.lock();
        let id = Self::fresh_id(&mut state, "fold");
        state.folders.insert(
            id.clone(),
            FakeFolder {
                name: name.to_string(),
                parent: parent_id.to_string(),
            },
        );
        id
    }

    pub fn add_file(&self, meta: FileMeta) {
        self.lock().files.insert(meta.id.clone(), meta);
    }

    pub fn add_shared_root(&self, id: &str, name: &str, owner: Option<&str>) {
        self.lock().shared.push(SharedRoot {
            id: id.to_string(),
            name: name.to_string(),
            owner: owner.map(str::to_string),
        });
    }

    pub fn add_link(&self, target_id: &str, parent_id: &str) -> String {
        let mut state = self.lock();
        let id = Self::fresh_id(&mut state, "link");
        state.links.insert(
            id.clone(),
            ShortcutLink {
                id: id.clone(),
                target_file_id: target_id.to_string(),
                parent_id: parent_id.to_string(),
            },
        );
        id
    }

    pub fn push_page(&self, records: Vec<ChangeRecord>, next: PageToken) {
        self.lock().pages.push_back((records, next));
    }

    pub fn set_baseline(&self, token: &str) {
        self.lock().baseline = token.to_string();
    }

    pub fn set_blob(&self, file_id: &str, bytes: &[u8]) {
        self.lock().blobs.insert(file_id.to_string(), bytes.to_vec());
    }

    pub fn fail_download(&self, file_id: &str, failure: FakeFailure) {
        self.lock()
            .download_failures
            .insert(file_id.to_string(), failure);
    }

    pub fn fail_next(&self, op: &'static str, failure: FakeFailure) {
        self.lock()
            .op_failures
            .entry(op)
            .or_default()
            .push_back(failure);
    }

    pub fn set_hook_expiration_ms(&self, expiration: i64) {
        self.lock().hook_expiration_ms = expiration;
    }

    pub fn created_folder_count(&self) -> u64 {
        self.lock().counters.folders_created
    }

    pub fn created_shortcut_count(&self) -> u64 {
        self.lock().counters.shortcuts_created
    }

    pub fn deleted_shortcut_count(&self) -> u64 {
        self.lock().counters.shortcuts_deleted
    }

    pub fn parent_update_count(&self) -> u64 {
        self.lock().counters.parent_updates
    }

    pub fn download_count(&self) -> u64 {
        self.lock().counters.downloads
    }

    pub fn requested_cursors(&self) -> Vec<String> {
        self.lock().requested_cursors.clone()
    }

    pub fn released_hooks(&self) -> Vec<String> {
        self.lock().released.clone()
    }

    pub fn registered_hooks(&self) -> Vec<HookLease> {
        self.lock().registered.clone()
    }

    pub fn links_snapshot(&self) -> Vec<ShortcutLink> {
        let mut links: Vec<_> = self.lock().links.values().cloned().collect();
        links.sort_by(|a, b| a.id.cmp(&b.id));
        links
    }

    pub fn file_parents(&self, file_id: &str) -> Vec<String> {
        self.lock()
            .files
            .get(file_id)
            .map(|file| file.parent_ids.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn baseline_cursor(&self) -> Result<String, RemoteError> {
        let mut state = self.lock();
        if let Some(failure) = Self::take_failure(&mut state, "baseline_cursor") {
            return Err(failure.to_error());
        }
        Ok(state.baseline.clone())
    }

    async fn changes_page(&self, cursor: &str) -> Result<ChangePage, RemoteError> {
        let mut state = self.lock();
        state.requested_cursors.push(cursor.to_string());
        if let Some(failure) = Self::take_failure(&mut state, "changes_page") {
            return Err(failure.to_error());
        }
        match state.pages.pop_front() {
            Some((records, next)) => Ok(ChangePage { records, next }),
            None => Ok(ChangePage {
                records: Vec::new(),
                next: PageToken::NewBaseline(state.baseline.clone()),
            }),
        }
    }

    async fn list_folders(&self, parent_id: &str) -> Result<Vec<TagFolder>, RemoteError> {
        let state = self.lock();
        Ok(state
            .folders
            .iter()
            .filter(|(_, folder)| folder.parent == parent_id)
            .map(|(id, folder)| TagFolder {
                id: id.clone(),
                name: folder.name.clone(),
            })
            .collect())
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<TagFolder, RemoteError> {
        let mut state = self.lock();
        if let Some(failure) = Self::take_failure(&mut state, "create_folder") {
            return Err(failure.to_error());
        }
        state.counters.folders_created += 1;
        let id = Self::fresh_id(&mut state, "fold");
        state.folders.insert(
            id.clone(),
            FakeFolder {
                name: name.to_string(),
                parent: parent_id.to_string(),
            },
        );
        Ok(TagFolder {
            id,
            name: name.to_string(),
        })
    }

    async fn get_metadata(&self, file_id: &str) -> Result<FileMeta, RemoteError> {
        let mut state = self.lock();
        if let Some(failure) = Self::take_failure(&mut state, "get_metadata") {
            return Err(failure.to_error());
        }
        state.files.get(file_id).cloned().ok_or(RemoteError::NotFound)
    }

    async fn update_parents(
        &self,
        file_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        if let Some(failure) = Self::take_failure(&mut state, "update_parents") {
            return Err(failure.to_error());
        }
        state.counters.parent_updates += 1;
        let file = state.files.get_mut(file_id).ok_or(RemoteError::NotFound)?;
        for parent in add {
            if !file.parent_ids.contains(parent) {
                file.parent_ids.push(parent.clone());
            }
        }
        file.parent_ids.retain(|parent| !remove.contains(parent));
        Ok(())
    }

    async fn create_shortcut(
        &self,
        target_id: &str,
        parent_id: &str,
    ) -> Result<ShortcutLink, RemoteError> {
        let mut state = self.lock();
        if let Some(failure) = Self::take_failure(&mut state, "create_shortcut") {
            return Err(failure.to_error());
        }
        state.counters.shortcuts_created += 1;
        let id = Self::fresh_id(&mut state, "link");
        let link = ShortcutLink {
            id: id.clone(),
            target_file_id: target_id.to_string(),
            parent_id: parent_id.to_string(),
        };
        state.links.insert(id, link.clone());
        Ok(link)
    }

    async fn delete_shortcut(&self, link_id: &str) -> Result<(), RemoteError> {
        let mut state = self.lock();
        if let Some(failure) = Self::take_failure(&mut state, "delete_shortcut") {
            return Err(failure.to_error());
        }
        state.counters.shortcuts_deleted += 1;
        state.links.remove(link_id);
        Ok(())
    }

    async fn list_links(&self, target_id: &str) -> Result<Vec<ShortcutLink>, RemoteError> {
        let state = self.lock();
        Ok(state
            .links
            .values()
            .filter(|link| link.target_file_id == target_id)
            .cloned()
            .collect())
    }

    async fn register_hook(&self, address: &str, cursor: &str) -> Result<HookLease, RemoteError> {
        let mut state = self.lock();
        if let Some(failure) = Self::take_failure(&mut state, "register_hook") {
            return Err(failure.to_error());
        }
        let seq = Self::fresh_id(&mut state, "chan");
        let lease = HookLease {
            id: seq.clone(),
            resource_id: format!("res-{seq}"),
            resource_uri: None,
            kind: "web_hook".to_string(),
            address: address.to_string(),
            expiration: state.hook_expiration_ms,
            cursor: cursor.to_string(),
        };
        state.registered.push(lease.clone());
        Ok(lease)
    }

    async fn release_hook(&self, lease: &HookLease) -> Result<(), RemoteError> {
        let mut state = self.lock();
        if let Some(failure) = Self::take_failure(&mut state, "release_hook") {
            return Err(failure.to_error());
        }
        state.released.push(lease.id.clone());
        Ok(())
    }

    async fn list_shared_roots(&self) -> Result<Vec<SharedRoot>, RemoteError> {
        Ok(self.lock().shared.clone())
    }

    async fn download(&self, file_id: &str) -> Result<ByteStream, RemoteError> {
        let mut state = self.lock();
        state.counters.downloads += 1;
        if let Some(failure) = state.download_failures.get(file_id) {
            return Err(failure.to_error());
        }
        let bytes = state
            .blobs
            .get(file_id)
            .cloned()
            .ok_or(RemoteError::NotFound)?;
        let chunk: std::io::Result<Bytes> = Ok(Bytes::from(bytes));
        Ok(Box::pin(stream::iter(vec![chunk])))
    }
}
