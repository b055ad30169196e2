use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{Cursor, now_unix};
use crate::remote::{RemoteError, RemoteStore};
use crate::store::{StateStore, StoreError};

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// When the lease loop should fire again, as a delay from now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRenewal {
    /// Computed from the fresh lease's expiration minus the safety margin.
    At(Duration),
    /// Fixed retry pause after a failed registration.
    After(Duration),
}

impl NextRenewal {
    pub fn delay(self) -> Duration {
        match self {
            NextRenewal::At(d) | NextRenewal::After(d) => d,
        }
    }
}

/// Keeps exactly one push-notification lease alive. The persisted lease is
/// only replaced after a successful registration, so a crash mid-renewal
/// leaves the last-known-good lease in place.
pub struct LeaseKeeper<'a, R> {
    remote: R,
    store: &'a StateStore,
    address: String,
    safety_margin: Duration,
    retry_backoff: Duration,
}

impl<'a, R: RemoteStore> LeaseKeeper<'a, R> {
    pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(360);
    pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(300);

    pub fn new(remote: R, store: &'a StateStore, address: impl Into<String>) -> Self {
        Self {
            remote,
            store,
            address: address.into(),
            safety_margin: Self::DEFAULT_SAFETY_MARGIN,
            retry_backoff: Self::DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_timing(mut self, safety_margin: Duration, retry_backoff: Duration) -> Self {
        self.safety_margin = safety_margin;
        self.retry_backoff = retry_backoff;
        self
    }

    /// One renewal pass: release the old lease when there is one, register a
    /// replacement anchored to the latest persisted cursor, persist it, and
    /// report when to run again.
    pub async fn run_once(&self) -> Result<NextRenewal, LeaseError> {
        let cursor = match Cursor::from_stored(self.store.get_cursor().await?) {
            Cursor::At(token) => token,
            Cursor::None => {
                let baseline = self.remote.baseline_cursor().await?;
                debug!(cursor = %baseline, "no stored cursor, anchoring lease to baseline");
                baseline
            }
        };

        if let Some(old) = self.store.get_lease().await? {
            match self.remote.release_hook(&old).await {
                Ok(()) => debug!(lease = %old.id, "released previous lease"),
                // Releasing best-effort: a stuck old lease expires on its own.
                Err(err) => warn!(lease = %old.id, error = %err, "failed to release previous lease"),
            }
        }

        let lease = match self.remote.register_hook(&self.address, &cursor).await {
            Ok(lease) => lease,
            Err(err) => {
                warn!(error = %err, "lease registration failed, keeping previous state");
                return Ok(NextRenewal::After(self.retry_backoff));
            }
        };
        self.store.put_lease(&lease).await?;

        let expires_in = (lease.expiration / 1000 - now_unix()).max(0) as u64;
        let delay = Duration::from_secs(expires_in).saturating_sub(self.safety_margin);
        info!(lease = %lease.id, expires_at = %format_expiry(lease.expiration), "lease registered");
        Ok(NextRenewal::At(delay))
    }
}

fn format_expiry(expiration_ms: i64) -> String {
    time::OffsetDateTime::from_unix_timestamp(expiration_ms / 1000)
        .ok()
        .and_then(|ts| ts.format(&time::format_description::well_known::Rfc3339).ok())
        .unwrap_or_else(|| expiration_ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testutil::{FakeFailure, FakeRemote};

    async fn store() -> StateStore {
        let store = StateStore::new("sqlite::memory:").await.unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn first_registration_persists_and_schedules_before_expiry() {
        let store = store().await;
        store.put_cursor("cursor-7").await.unwrap();
        let remote = FakeRemote::new();
        remote.set_hook_expiration_ms((now_unix() + 3600) * 1000);

        let keeper = LeaseKeeper::new(remote.clone(), &store, "https://hooks.example/notify")
            .with_timing(Duration::from_secs(360), Duration::from_secs(300));
        let next = keeper.run_once().await.unwrap();

        let lease = store.get_lease().await.unwrap().unwrap();
        assert_eq!(lease.cursor, "cursor-7");
        assert_eq!(lease.address, "https://hooks.example/notify");
        let delay = next.delay().as_secs();
        assert!((3230..=3240).contains(&delay), "delay was {delay}");
    }

    #[tokio::test]
    async fn renewal_releases_the_old_lease_first() {
        let store = store().await;
        store.put_cursor("cursor-7").await.unwrap();
        let remote = FakeRemote::new();
        remote.set_hook_expiration_ms((now_unix() + 3600) * 1000);

        let keeper = LeaseKeeper::new(remote.clone(), &store, "https://hooks.example/notify");
        keeper.run_once().await.unwrap();
        let first = store.get_lease().await.unwrap().unwrap();
        keeper.run_once().await.unwrap();
        let second = store.get_lease().await.unwrap().unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(remote.released_hooks(), vec![first.id]);
    }

    #[tokio::test]
    async fn failed_registration_keeps_old_lease_and_backs_off() {
        let store = store().await;
        store.put_cursor("cursor-7").await.unwrap();
        let remote = FakeRemote::new();
        remote.set_hook_expiration_ms((now_unix() + 3600) * 1000);

        let keeper = LeaseKeeper::new(remote.clone(), &store, "https://hooks.example/notify")
            .with_timing(Duration::from_secs(360), Duration::from_secs(300));
        keeper.run_once().await.unwrap();
        let before = store.get_lease().await.unwrap().unwrap();

        remote.fail_next("register_hook", FakeFailure::Transient);
        let next = keeper.run_once().await.unwrap();

        assert_eq!(next, NextRenewal::After(Duration::from_secs(300)));
        let after = store.get_lease().await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn release_failure_does_not_block_renewal() {
        let store = store().await;
        store.put_cursor("cursor-7").await.unwrap();
        let remote = FakeRemote::new();
        remote.set_hook_expiration_ms((now_unix() + 3600) * 1000);

        let keeper = LeaseKeeper::new(remote.clone(), &store, "https://hooks.example/notify");
        keeper.run_once().await.unwrap();
        remote.fail_next("release_hook", FakeFailure::Transient);
        keeper.run_once().await.unwrap();

        assert_eq!(remote.registered_hooks().len(), 2);
    }

    #[tokio::test]
    async fn missing_cursor_anchors_to_fresh_baseline() {
        let store = store().await;
        let remote = FakeRemote::new();
        remote.set_baseline("baseline-42");
        remote.set_hook_expiration_ms((now_unix() + 3600) * 1000);

        let keeper = LeaseKeeper::new(remote.clone(), &store, "https://hooks.example/notify");
        keeper.run_once().await.unwrap();

        let lease = store.get_lease().await.unwrap().unwrap();
        assert_eq!(lease.cursor, "baseline-42");
    }
}
