//! Persistent unlock rate limiting.
//!
//! After `FREE_ATTEMPTS` consecutive failures every further failure opens a
//! lockout window, escalating through `LOCKOUT_WINDOWS` and then staying at
//! the last one. Counter and deadline are written to a JSON file on every
//! change so a restart cannot reset them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs;
use tracing::{debug, warn};

use crate::container::write_atomic;
use keyward_common::{Error, Result};

/// Failures tolerated before the first lockout window.
pub const FREE_ATTEMPTS: u32 = 5;

/// Escalating lockout windows in seconds: 1 min, 5 min, 15 min, 1 h, 4 h.
pub const LOCKOUT_WINDOWS: [i64; 5] = [60, 300, 900, 3_600, 14_400];

/// Persisted counter state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutState {
    pub consecutive_failures: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

impl LockoutState {
    /// Remaining lockout at `now`, if any.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        let until = self.locked_until?;
        if until <= now {
            return None;
        }
        (until - now).to_std().ok()
    }
}

/// Window opened by the `failures`-th consecutive failure, if any.
pub fn window_for(failures: u32) -> Option<Duration> {
    if failures < FREE_ATTEMPTS {
        return None;
    }
    let index = ((failures - FREE_ATTEMPTS) as usize).min(LOCKOUT_WINDOWS.len() - 1);
    Some(Duration::seconds(LOCKOUT_WINDOWS[index]))
}

/// Lockout counter backed by an optional JSON file.
#[derive(Debug)]
pub struct LockoutStore {
    path: Option<PathBuf>,
    state: Mutex<LockoutState>,
}

impl LockoutStore {
    /// Open or create the store at `path`.
    ///
    /// A missing file starts from zero. An unreadable file is treated as the
    /// maximum window, starting at `now`, rather than silently resetting the
    /// counter.
    pub async fn open(path: impl Into<PathBuf>, now: DateTime<Utc>) -> Result<Self> {
        let path = path.into();
        let state = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<LockoutState>(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Lockout state unreadable; applying maximum window");
                    let failures = FREE_ATTEMPTS + LOCKOUT_WINDOWS.len() as u32 - 1;
                    LockoutState {
                        consecutive_failures: failures,
                        locked_until: window_for(failures).map(|w| now + w),
                    }
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LockoutState::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Non-persistent store for tests and ephemeral sessions.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(LockoutState::default()),
        }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> LockoutState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Fail with `RateLimited` if a window is open at `now`.
    pub fn check(&self, now: DateTime<Utc>) -> Result<()> {
        match self.state().remaining(now) {
            Some(retry_after) => Err(Error::RateLimited { retry_after }),
            None => Ok(()),
        }
    }

    /// Count a failed attempt and open the next window when due.
    pub async fn record_failure(&self, now: DateTime<Utc>) -> Result<LockoutState> {
        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            if let Some(window) = window_for(state.consecutive_failures) {
                state.locked_until = Some(now + window);
                warn!(
                    failures = state.consecutive_failures,
                    window_secs = window.num_seconds(),
                    "Unlock lockout engaged"
                );
            }
            state.clone()
        };
        self.persist(&snapshot).await?;
        Ok(snapshot)
    }

    /// Reset after a successful unlock.
    pub async fn record_success(&self) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == LockoutState::default() {
                return Ok(());
            }
            *state = LockoutState::default();
            state.clone()
        };
        debug!("Unlock failure counter reset");
        self.persist(&snapshot).await
    }

    async fn persist(&self, state: &LockoutState) -> Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(path, &bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_window_escalation() {
        assert_eq!(window_for(4), None);
        assert_eq!(window_for(5), Some(Duration::minutes(1)));
        assert_eq!(window_for(6), Some(Duration::minutes(5)));
        assert_eq!(window_for(7), Some(Duration::minutes(15)));
        assert_eq!(window_for(8), Some(Duration::hours(1)));
        assert_eq!(window_for(9), Some(Duration::hours(4)));
        assert_eq!(window_for(50), Some(Duration::hours(4)));
    }

    #[tokio::test]
    async fn test_check_blocks_inside_window() {
        let store = LockoutStore::in_memory();
        let now = Utc::now();
        for _ in 0..5 {
            store.record_failure(now).await.unwrap();
        }

        match store.check(now + Duration::seconds(10)) {
            Err(Error::RateLimited { retry_after }) => assert_eq!(retry_after.as_secs(), 50),
            other => panic!("expected RateLimited, got {:?}", other),
        }
        assert!(store.check(now + Duration::seconds(61)).is_ok());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lockout.json");
        let now = Utc::now();

        {
            let store = LockoutStore::open(&path, now).await.unwrap();
            for _ in 0..5 {
                store.record_failure(now).await.unwrap();
            }
        }

        let reopened = LockoutStore::open(&path, now).await.unwrap();
        assert_eq!(reopened.state().consecutive_failures, 5);
        assert!(matches!(
            reopened.check(now),
            Err(Error::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_success_resets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lockout.json");
        let store = LockoutStore::open(&path, Utc::now()).await.unwrap();
        store.record_failure(Utc::now()).await.unwrap();
        store.record_success().await.unwrap();

        let reopened = LockoutStore::open(&path, Utc::now()).await.unwrap();
        assert_eq!(reopened.state(), LockoutState::default());
    }

    #[tokio::test]
    async fn test_corrupt_file_fails_closed_from_given_time() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lockout.json");
        std::fs::write(&path, b"not json").unwrap();
        let now = Utc::now() - Duration::days(30);

        let store = LockoutStore::open(&path, now).await.unwrap();
        assert_eq!(store.state().locked_until, Some(now + Duration::hours(4)));
        match store.check(now + Duration::hours(1)) {
            Err(Error::RateLimited { retry_after }) => {
                assert_eq!(retry_after.as_secs(), 3 * 3_600)
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
        assert!(store.check(now + Duration::hours(5)).is_ok());
    }
}
