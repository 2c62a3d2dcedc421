//! Bounded follow-up attempts for a sync that ended `Pending`.
//!
//! The scheduler owns at most one background task per engine. Scheduling
//! again replaces the earlier task, and the task stops as soon as the
//! session locks, the attempts run out, or a sync settles.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keyward_common::Error;
use keyward_vault::Session;

use crate::engine::{SyncEngine, SyncOutcome};

/// How a scheduled retry run ended.
#[derive(Debug)]
pub enum ScheduleOutcome {
    /// A sync went through.
    Synced(SyncOutcome),
    /// Every attempt ended `Pending`; the blob stays staged.
    Exhausted { attempts: u32 },
    /// The session locked or the run was replaced.
    Cancelled,
    /// A sync failed with a non-transient error.
    Failed(Error),
}

/// Schedules bounded retries of a pending sync.
pub struct RetryScheduler {
    engine: Arc<SyncEngine>,
    max_attempts: u32,
    interval: Duration,
    current: Mutex<Option<CancellationToken>>,
}

impl RetryScheduler {
    /// Retry up to `max_attempts` times, waiting `interval * n` before the
    /// n-th attempt.
    pub fn new(engine: Arc<SyncEngine>, max_attempts: u32, interval: Duration) -> Self {
        Self {
            engine,
            max_attempts,
            interval,
            current: Mutex::new(None),
        }
    }

    /// Start a retry run for `session`, replacing any earlier run.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, session: Arc<Session>) -> JoinHandle<ScheduleOutcome> {
        let token = session.cancellation_token().child_token();
        if let Some(previous) = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone())
        {
            previous.cancel();
        }

        let engine = Arc::clone(&self.engine);
        let max_attempts = self.max_attempts;
        let interval = self.interval;

        tokio::spawn(async move {
            for attempt in 1..=max_attempts {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!("Scheduled sync retries cancelled");
                        return ScheduleOutcome::Cancelled;
                    }
                    _ = tokio::time::sleep(interval * attempt) => {}
                }

                debug!(attempt, "Retrying pending sync");
                match engine.sync(&session).await {
                    Ok(SyncOutcome::Pending { reason }) => {
                        warn!(attempt, reason = %reason, "Pending sync still unreachable");
                    }
                    Ok(outcome) => {
                        info!(attempt, "Pending sync completed");
                        return ScheduleOutcome::Synced(outcome);
                    }
                    Err(Error::Cancelled) | Err(Error::Locked) => {
                        return ScheduleOutcome::Cancelled;
                    }
                    Err(e) => return ScheduleOutcome::Failed(e),
                }
            }

            warn!(attempts = max_attempts, "Giving up on pending sync until next trigger");
            ScheduleOutcome::Exhausted {
                attempts: max_attempts,
            }
        })
    }

    /// Cancel the current run, if any.
    pub fn cancel(&self) {
        if let Some(token) = self.current.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyncEngineConfig;
    use crate::retry::RetryConfig;
    use crate::state::SyncStatus;
    use keyward_common::{SensitiveBytes, SystemClock, VaultId};
    use keyward_crypto::kdf::ARGON2_MIN_MEMORY_KIB;
    use keyward_crypto::{KdfParameters, Profile};
    use keyward_storage::MemoryProvider;
    use keyward_vault::{SessionOptions, VaultEntry, VaultManager};
    use tempfile::TempDir;

    async fn setup(temp: &TempDir, provider: &MemoryProvider) -> (Arc<Session>, Arc<SyncEngine>) {
        let manager = VaultManager::new(
            temp.path().join("vaults"),
            None,
            Arc::new(SystemClock),
            SessionOptions::default(),
        );
        let passphrase = SensitiveBytes::from_passphrase("pw");
        let session = manager
            .create_vault(
                VaultId::new("personal").unwrap(),
                &passphrase,
                KdfParameters::primary_with(ARGON2_MIN_MEMORY_KIB, 2, 1).unwrap(),
                Profile::Local,
            )
            .await
            .unwrap();
        session.unlock(&passphrase).await.unwrap();
        session
            .with_store_mut(|s| s.add_entry(VaultEntry::login("Mail", "alice", "pw")))
            .await
            .unwrap();

        let engine = SyncEngine::new(
            VaultId::new("personal").unwrap(),
            Arc::new(provider.clone()),
            temp.path().join("sync"),
            Arc::new(SystemClock),
            SyncEngineConfig {
                retry: RetryConfig::new(0).with_initial_delay(Duration::from_millis(1)),
                ..SyncEngineConfig::default()
            },
        )
        .await
        .unwrap();

        (Arc::new(session), Arc::new(engine))
    }

    #[tokio::test]
    async fn test_retries_until_provider_recovers() {
        let temp = TempDir::new().unwrap();
        let provider = MemoryProvider::new();
        let (session, engine) = setup(&temp, &provider).await;

        provider.fail_next(2);
        assert!(matches!(
            engine.sync(&session).await.unwrap(),
            SyncOutcome::Pending { .. }
        ));

        let scheduler = RetryScheduler::new(Arc::clone(&engine), 5, Duration::from_millis(5));
        let outcome = scheduler.schedule(Arc::clone(&session)).await.unwrap();
        assert!(matches!(outcome, ScheduleOutcome::Synced(_)));
        assert_eq!(engine.status(), SyncStatus::Idle);
        assert!(provider.stored_blob().is_some());
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let temp = TempDir::new().unwrap();
        let provider = MemoryProvider::new();
        let (session, engine) = setup(&temp, &provider).await;
        provider.fail_next(u32::MAX);

        let scheduler = RetryScheduler::new(Arc::clone(&engine), 3, Duration::from_millis(1));
        let outcome = scheduler.schedule(Arc::clone(&session)).await.unwrap();
        assert!(matches!(outcome, ScheduleOutcome::Exhausted { attempts: 3 }));
        assert_eq!(provider.call_count(), 3);
        assert_eq!(engine.status(), SyncStatus::PendingSync);
    }

    #[tokio::test]
    async fn test_lock_stops_scheduled_retries() {
        let temp = TempDir::new().unwrap();
        let provider = MemoryProvider::new();
        let (session, engine) = setup(&temp, &provider).await;

        let scheduler = RetryScheduler::new(engine, 3, Duration::from_secs(60));
        let handle = scheduler.schedule(Arc::clone(&session));
        session.lock().await;

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, ScheduleOutcome::Cancelled));
        assert_eq!(provider.call_count(), 0);
    }
}
