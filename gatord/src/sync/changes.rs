use thiserror::Error;
use tracing::debug;

use crate::model::{Cursor, FileRef, RootSet};
use crate::remote::{PageToken, RemoteError, RemoteStore};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Outcome of one synchronization run. The new cursor must only be
/// persisted after every file in `files` has been handed to the queue.
#[derive(Debug)]
pub struct ChangeBatch {
    pub files: Vec<FileRef>,
    pub next_cursor: String,
}

/// Walks the remote change feed from a cursor and reduces it to the
/// matching files inside the monitored roots.
pub struct ChangeSync<R> {
    remote: R,
    suffix: String,
}

impl<R: RemoteStore> ChangeSync<R> {
    pub fn new(remote: R, suffix: impl Into<String>) -> Self {
        Self {
            remote,
            suffix: suffix.into().to_ascii_lowercase(),
        }
    }

    /// Drains the feed until the remote hands back a new baseline token.
    /// A run that fails mid-way leaves the caller's cursor untouched, so
    /// the next run replays the same window.
    pub async fn sync(&self, cursor: &Cursor, roots: &RootSet) -> Result<ChangeBatch, SyncError> {
        let mut token = match cursor.as_token() {
            Some(token) => token.to_string(),
            None => {
                let baseline = self.remote.baseline_cursor().await?;
                debug!(cursor = %baseline, "acquired fresh baseline cursor");
                baseline
            }
        };

        let mut files = Vec::new();
        let next_cursor = loop {
            let page = self.remote.changes_page(&token).await?;
            for record in page.records {
                if record.removed {
                    continue;
                }
                let Some(file) = record.file else {
                    continue;
                };
                if file.trashed {
                    continue;
                }
                if !file.name.to_ascii_lowercase().ends_with(&self.suffix) {
                    continue;
                }
                let Some(group_id) = roots.owning_root(&file.parent_ids) else {
                    continue;
                };
                files.push(FileRef {
                    id: record.file_id,
                    name: file.name,
                    md5: file.md5,
                    size: file.size,
                    group_id: Some(group_id.to_string()),
                });
            }
            match page.next {
                PageToken::NextPage(next) => token = next,
                PageToken::NewBaseline(baseline) => break baseline,
            }
        };

        debug!(matched = files.len(), next_cursor = %next_cursor, "change feed drained");
        Ok(ChangeBatch { files, next_cursor })
    }
}
