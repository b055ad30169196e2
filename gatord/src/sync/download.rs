use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::archive::ArchiveStore;
use crate::model::FileRef;
use crate::remote::{RemoteError, RemoteStore};
use crate::store::{StateStore, StoreError};

/// Archive key of a remote file, mirroring the upload layout.
pub fn archive_key(file_id: &str) -> String {
    format!("uploads/drive-{file_id}")
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub received: usize,
    pub downloaded: usize,
    pub skipped_existing: usize,
    pub permanent_failures: usize,
    pub transient_failures: usize,
}

enum ItemOutcome {
    Downloaded(u64),
    SkippedExisting,
    /// Acked without content; redelivery cannot fix it.
    Permanent(String),
    /// Left on the queue for redelivery after the visibility window.
    Transient(String),
}

/// Drains the download queue into the content-addressed archive. Items are
/// acknowledged only when fully stored or classified permanent; everything
/// else redelivers after the visibility window lapses.
pub struct DownloadWorker<'a, R> {
    remote: R,
    store: &'a StateStore,
    archive: &'a ArchiveStore,
    visibility: Duration,
}

impl<'a, R: RemoteStore> DownloadWorker<'a, R> {
    pub fn new(
        remote: R,
        store: &'a StateStore,
        archive: &'a ArchiveStore,
        visibility: Duration,
    ) -> Self {
        Self {
            remote,
            store,
            archive,
            visibility,
        }
    }

    pub async fn drain(&self, max: usize) -> Result<DrainReport, DownloadError> {
        let messages = self.store.receive(max, self.visibility).await?;
        let mut report = DrainReport {
            received: messages.len(),
            ..DrainReport::default()
        };

        for message in messages {
            let file = &message.file;
            match self.process(file).await {
                ItemOutcome::Downloaded(bytes) => {
                    self.store.ack(message.receipt).await?;
                    report.downloaded += 1;
                    debug!(file = %file.id, bytes, "stored in archive");
                }
                ItemOutcome::SkippedExisting => {
                    self.store.ack(message.receipt).await?;
                    report.skipped_existing += 1;
                    debug!(file = %file.id, "already archived, skipping transfer");
                }
                ItemOutcome::Permanent(reason) => {
                    self.store.ack(message.receipt).await?;
                    report.permanent_failures += 1;
                    warn!(file = %file.id, attempt = message.attempt, reason, "permanent failure, dropping item");
                }
                ItemOutcome::Transient(reason) => {
                    report.transient_failures += 1;
                    warn!(file = %file.id, attempt = message.attempt, reason, "transient failure, leaving for redelivery");
                }
            }
        }

        if report.received > 0 {
            info!(
                received = report.received,
                downloaded = report.downloaded,
                skipped = report.skipped_existing,
                permanent = report.permanent_failures,
                transient = report.transient_failures,
                "drain pass finished"
            );
        }
        Ok(report)
    }

    async fn process(&self, file: &FileRef) -> ItemOutcome {
        let key = archive_key(&file.id);
        match self.archive.exists(&key, file.md5.as_deref()).await {
            Ok(true) => return ItemOutcome::SkippedExisting,
            Ok(false) => {}
            Err(err) => return ItemOutcome::Transient(err.to_string()),
        }

        let stream = match self.remote.download(&file.id).await {
            Ok(stream) => stream,
            Err(err) if err.is_transient() => return ItemOutcome::Transient(err.to_string()),
            Err(err) => return ItemOutcome::Permanent(err.to_string()),
        };

        match self.archive.put(&key, stream, file.md5.as_deref()).await {
            Ok(bytes) => ItemOutcome::Downloaded(bytes),
            Err(err) if err.is_permanent() => ItemOutcome::Permanent(err.to_string()),
            Err(err) => ItemOutcome::Transient(err.to_string()),
        }
    }
}
