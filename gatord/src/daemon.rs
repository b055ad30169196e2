use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use gator_core::{DriveClient, OAuthClient};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::archive::ArchiveStore;
use crate::model::{Cursor, RootSet};
use crate::remote::DriveRemote;
use crate::store::StateStore;
use crate::sync::backoff::Backoff;
use crate::sync::changes::ChangeSync;
use crate::sync::download::DownloadWorker;
use crate::sync::lease::LeaseKeeper;
use crate::sync::roots;
use crate::sync::tags::{ReconcileReport, TagEngine};
use crate::token_provider::{AuthState, TokenProvider};

const DEFAULT_SUFFIX: &str = ".pdf";
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 30;
const DEFAULT_DRAIN_BATCH: u64 = 10;
const DEFAULT_VISIBILITY_SECS: u64 = 120;
const DEFAULT_LEASE_SAFETY_SECS: u64 = 360;
const DEFAULT_LEASE_RETRY_SECS: u64 = 300;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub db_path: PathBuf,
    pub archive_dir: PathBuf,
    pub suffix: String,
    pub roots: Vec<String>,
    pub owners: Vec<String>,
    pub hook_address: Option<String>,
    pub sync_interval: Duration,
    pub drain_interval: Duration,
    pub drain_batch: usize,
    pub visibility: Duration,
    pub max_object_bytes: Option<u64>,
    pub lease_safety: Duration,
    pub lease_retry: Duration,
    pub base_url: Option<String>,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let data_root = dirs::data_dir()
            .unwrap_or_else(|| home.join(".local/share"))
            .join("gator");
        let db_path = std::env::var("GATOR_DB_PATH")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| data_root.join("gator.db"));
        let archive_dir = std::env::var("GATOR_ARCHIVE_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| data_root.join("archive"));
        let suffix =
            std::env::var("GATOR_SUFFIX").unwrap_or_else(|_| DEFAULT_SUFFIX.to_string());
        let roots = read_list_env("GATOR_ROOTS");
        let owners = read_list_env("GATOR_OWNERS");
        let hook_address = std::env::var("GATOR_HOOK_ADDRESS").ok().filter(|v| !v.is_empty());
        let sync_interval = Duration::from_secs(read_u64_env(
            "GATOR_SYNC_INTERVAL_SECS",
            DEFAULT_SYNC_INTERVAL_SECS,
        ));
        let drain_interval = Duration::from_secs(read_u64_env(
            "GATOR_DRAIN_INTERVAL_SECS",
            DEFAULT_DRAIN_INTERVAL_SECS,
        ));
        let drain_batch = read_u64_env("GATOR_DRAIN_BATCH", DEFAULT_DRAIN_BATCH) as usize;
        let visibility =
            Duration::from_secs(read_u64_env("GATOR_VISIBILITY_SECS", DEFAULT_VISIBILITY_SECS));
        let max_object_bytes = std::env::var("GATOR_MAX_OBJECT_BYTES")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0);
        let lease_safety = Duration::from_secs(read_u64_env(
            "GATOR_LEASE_SAFETY_SECS",
            DEFAULT_LEASE_SAFETY_SECS,
        ));
        let lease_retry = Duration::from_secs(read_u64_env(
            "GATOR_LEASE_RETRY_SECS",
            DEFAULT_LEASE_RETRY_SECS,
        ));
        let base_url = std::env::var("GATOR_BASE_URL").ok().filter(|v| !v.is_empty());

        Ok(Self {
            db_path,
            archive_dir,
            suffix,
            roots,
            owners,
            hook_address,
            sync_interval,
            drain_interval,
            drain_batch,
            visibility,
            max_object_bytes,
            lease_safety,
            lease_retry,
            base_url,
        })
    }
}

enum TokenSource {
    Static(String),
    OAuth(Mutex<TokenProvider>),
}

impl TokenSource {
    fn from_env() -> anyhow::Result<Self> {
        if let Ok(token) = std::env::var("GATOR_ACCESS_TOKEN")
            && !token.is_empty()
        {
            return Ok(TokenSource::Static(token));
        }
        let client_id =
            std::env::var("GATOR_CLIENT_ID").context("GATOR_CLIENT_ID is not set")?;
        let client_secret =
            std::env::var("GATOR_CLIENT_SECRET").context("GATOR_CLIENT_SECRET is not set")?;
        let refresh_token =
            std::env::var("GATOR_REFRESH_TOKEN").context("GATOR_REFRESH_TOKEN is not set")?;
        let oauth_client = match std::env::var("GATOR_OAUTH_BASE_URL") {
            Ok(url) if !url.is_empty() => {
                OAuthClient::with_base_url(&url, client_id, client_secret)
            }
            _ => OAuthClient::new(client_id, client_secret),
        }
        .context("invalid oauth config")?;
        let state = AuthState {
            refresh_token: Some(refresh_token),
            ..AuthState::default()
        };
        Ok(TokenSource::OAuth(Mutex::new(TokenProvider::new(
            state,
            oauth_client,
        ))))
    }

    async fn access_token(&self) -> anyhow::Result<String> {
        match self {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::OAuth(provider) => provider
                .lock()
                .await
                .valid_access_token()
                .await
                .context("failed to resolve valid access token"),
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    store: StateStore,
    archive: ArchiveStore,
    tokens: TokenSource,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.archive_dir)
            .await
            .with_context(|| format!("failed to create archive dir at {:?}", config.archive_dir))?;
        let store = StateStore::open(&config.db_path)
            .await
            .context("failed to open state database")?;
        store.init().await.context("failed to run migrations")?;
        let archive = ArchiveStore::new(&config.archive_dir, config.max_object_bytes);
        let tokens = TokenSource::from_env()?;
        Ok(Self {
            config,
            store,
            archive,
            tokens,
        })
    }

    async fn remote(&self) -> anyhow::Result<DriveRemote> {
        let token = self.tokens.access_token().await?;
        let client = match self.config.base_url.as_deref() {
            Some(url) => DriveClient::with_base_url(url, token),
            None => DriveClient::new(token),
        }
        .context("failed to build drive client")?;
        Ok(DriveRemote::new(client))
    }

    async fn resolve_roots(&self, remote: &DriveRemote) -> anyhow::Result<RootSet> {
        let roots = roots::discover_roots(remote, &self.config.roots, &self.config.owners)
            .await
            .context("root discovery failed")?;
        Ok(roots)
    }

    /// One change-feed pass: matching files are enqueued before the cursor
    /// advances, so a crash in between redelivers rather than drops.
    pub async fn run_sync_once(&self) -> anyhow::Result<usize> {
        let remote = self.remote().await?;
        let roots = self.resolve_roots(&remote).await?;
        if roots.is_empty() {
            warn!("no monitored roots resolved, skipping sync pass");
            return Ok(0);
        }
        let cursor = Cursor::from_stored(self.store.get_cursor().await?);
        let engine = ChangeSync::new(remote, self.config.suffix.as_str());
        let batch = engine
            .sync(&cursor, &roots)
            .await
            .context("change feed traversal failed")?;
        for file in &batch.files {
            self.store.enqueue(file).await?;
        }
        self.store.put_cursor(&batch.next_cursor).await?;
        info!(
            enqueued = batch.files.len(),
            cursor = %batch.next_cursor,
            "sync pass finished"
        );
        Ok(batch.files.len())
    }

    pub async fn run_drain_once(&self) -> anyhow::Result<usize> {
        let remote = self.remote().await?;
        let worker =
            DownloadWorker::new(remote, &self.store, &self.archive, self.config.visibility);
        let report = worker.drain(self.config.drain_batch).await?;
        Ok(report.downloaded + report.skipped_existing)
    }

    /// One lease-renewal pass; returns the delay until the next one.
    pub async fn run_renew_once(&self) -> anyhow::Result<Duration> {
        let address = self
            .config
            .hook_address
            .as_deref()
            .context("GATOR_HOOK_ADDRESS is not set")?;
        let remote = self.remote().await?;
        let keeper = LeaseKeeper::new(remote, &self.store, address)
            .with_timing(self.config.lease_safety, self.config.lease_retry);
        Ok(keeper.run_once().await?.delay())
    }

    pub async fn set_tags(&self, file_id: &str, tags: &[String]) -> anyhow::Result<ReconcileReport> {
        let remote = self.remote().await?;
        let roots = self.resolve_roots(&remote).await?;
        let engine = TagEngine::new(remote);
        let report = engine
            .reconcile(file_id, tags, &roots)
            .await
            .context("tag reconciliation failed")?;
        info!(
            file = file_id,
            created = report.links_created,
            removed = report.links_removed,
            moves = report.moves,
            "tags reconciled"
        );
        Ok(report)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            db = %self.config.db_path.display(),
            archive = %self.config.archive_dir.display(),
            roots = self.config.roots.len(),
            hook = self.config.hook_address.is_some(),
            "gatord started"
        );
        let runtime = Arc::new(self);
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(300), true);

        let sync_runtime = Arc::clone(&runtime);
        let sync_handle = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                match sync_runtime.run_sync_once().await {
                    Ok(_) => failures = 0,
                    Err(err) => {
                        failures = failures.saturating_add(1);
                        warn!(error = %err, failures, "sync pass failed");
                        tokio::time::sleep(backoff.delay(failures)).await;
                    }
                }
                tokio::time::sleep(sync_runtime.config.sync_interval).await;
            }
        });

        let drain_runtime = Arc::clone(&runtime);
        let drain_handle = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                match drain_runtime.run_drain_once().await {
                    Ok(_) => failures = 0,
                    Err(err) => {
                        failures = failures.saturating_add(1);
                        warn!(error = %err, failures, "drain pass failed");
                        tokio::time::sleep(backoff.delay(failures)).await;
                    }
                }
                tokio::time::sleep(drain_runtime.config.drain_interval).await;
            }
        });

        let lease_handle = runtime.config.hook_address.as_ref().map(|_| {
            let lease_runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                loop {
                    let delay = match lease_runtime.run_renew_once().await {
                        Ok(delay) => delay,
                        Err(err) => {
                            warn!(error = %err, "lease pass failed");
                            lease_runtime.config.lease_retry
                        }
                    };
                    tokio::time::sleep(delay).await;
                }
            })
        });

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutdown signal received");

        sync_handle.abort();
        drain_handle.abort();
        if let Some(handle) = lease_handle {
            handle.abort();
        }
        Ok(())
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_list_env(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_u64_env_falls_back_on_missing_or_zero() {
        assert_eq!(read_u64_env("GATOR_NO_SUCH_ENV", 42), 42);
        unsafe { std::env::set_var("GATOR_TEST_ZERO_ENV", "0") };
        assert_eq!(read_u64_env("GATOR_TEST_ZERO_ENV", 7), 7);
        unsafe { std::env::remove_var("GATOR_TEST_ZERO_ENV") };
    }

    #[test]
    fn read_list_env_splits_and_trims() {
        unsafe { std::env::set_var("GATOR_TEST_LIST_ENV", "root-1, root-2,,root-3 ") };
        assert_eq!(
            read_list_env("GATOR_TEST_LIST_ENV"),
            vec!["root-1", "root-2", "root-3"]
        );
        unsafe { std::env::remove_var("GATOR_TEST_LIST_ENV") };
    }

    #[test]
    fn expand_with_home_handles_tilde() {
        let home = Path::new("/home/user");
        assert_eq!(expand_with_home("~", home), PathBuf::from("/home/user"));
        assert_eq!(
            expand_with_home("~/data", home),
            PathBuf::from("/home/user/data")
        );
        assert_eq!(expand_with_home("/abs", home), PathBuf::from("/abs"));
    }
}
