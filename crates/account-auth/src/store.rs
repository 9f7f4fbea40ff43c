//! Atomic persistence of [`PoolState`] at a platform-specific path.
//!
//! Writes are coalesced: mutators call [`CredentialStore::request_save_to_disk`]
//! which only sets a dirty flag. A background task (or an explicit
//! [`CredentialStore::flush`] on shutdown) does the actual write-then-rename,
//! so a burst of mutations never produces more than one file write per flush
//! interval. This mirrors the account manager's "serialize in-memory updates,
//! persist eventually" concurrency model.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::Secret;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountCredential, PoolState};
use crate::error::{Error, Result};

/// Default coalescing interval for the background flush task ("no
/// more often than every ~250 ms").
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(250);

pub struct CredentialStore {
    path: PathBuf,
    state: RwLock<PoolState>,
    dirty: AtomicBool,
}

impl CredentialStore {
    /// Load the pool file from `path`. Tolerates absence (starts empty) and
    /// fails open to an empty state on malformed JSON rather than refusing
    /// to start — a corrupt file must not brick the process.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            match tokio::fs::read_to_string(&path).await {
                Ok(contents) => match serde_json::from_str::<PoolState>(&contents) {
                    Ok(state) => {
                        info!(path = %path.display(), accounts = state.accounts.len(), "loaded pool state");
                        state
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "pool file malformed, starting fail-open empty state");
                        PoolState::default()
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read pool file, starting empty");
                    PoolState::default()
                }
            }
        } else {
            info!(path = %path.display(), "pool file not found, starting with empty pool");
            PoolState::default()
        };

        let store = Self {
            path,
            state: RwLock::new(state),
            dirty: AtomicBool::new(false),
        };
        store.flush().await?;
        Ok(store)
    }

    /// Default platform-appropriate path: `{config_dir}/antigravity/accounts.json`.
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir()
            .ok_or_else(|| Error::Io("could not determine platform config directory".into()))?;
        Ok(base.join("antigravity").join("accounts.json"))
    }

    /// Run a closure against a read-only snapshot of the pool.
    pub async fn with_state<R>(&self, f: impl FnOnce(&PoolState) -> R) -> R {
        let state = self.state.read().await;
        f(&state)
    }

    /// Run a closure against the mutable pool state, then mark the store
    /// dirty so the next flush picks up the change. Does NOT write to disk
    /// synchronously — callers that need a durable write immediately (tests,
    /// shutdown) should call [`Self::flush`] afterward.
    pub async fn with_state_mut<R>(&self, f: impl FnOnce(&mut PoolState) -> R) -> R {
        let mut state = self.state.write().await;
        let result = f(&mut state);
        self.request_save_to_disk();
        result
    }

    /// Mark the store dirty without taking any lock beyond the atomic flag.
    /// Safe to call from any mutator; coalesces bursts into one flush.
    pub fn request_save_to_disk(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Write the current state to disk if dirty, clearing the flag. No-op
    /// (and cheap) when clean.
    pub async fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let state = self.state.read().await;
        write_atomic(&self.path, &state).await
    }

    /// Force a write regardless of the dirty flag. Used on process shutdown
    /// Flush unconditionally, bypassing the dirty-flag check ("always on shutdown").
    pub async fn flush_always(&self) -> Result<()> {
        self.dirty.store(false, Ordering::Release);
        let state = self.state.read().await;
        write_atomic(&self.path, &state).await
    }

    /// Spawn the background coalescing flush task. Idempotent to call once;
    /// the returned handle should be aborted (or left to run until process
    /// exit) by the caller.
    pub fn spawn_flush_task(self: std::sync::Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.flush().await {
                    warn!(error = %e, "periodic pool-state flush failed");
                }
            }
        })
    }

    /// Fold a batch of externally-minted credentials into the pool. Dedup by
    /// email first, then by refresh token; a collision updates the existing
    /// account's tokens in place rather than appending a duplicate. New
    /// accounts get the next free index and start `enabled`.
    pub async fn merge(&self, incoming: Vec<AccountCredential>) -> Result<usize> {
        let mut added = 0usize;
        self.with_state_mut(|state| {
            for cred in incoming {
                let existing = state.accounts.iter_mut().find(|a| {
                    (cred.email.is_some() && a.email == cred.email)
                        || a.refresh_token.expose() == &cred.refresh_token
                });
                match existing {
                    Some(account) => {
                        account.refresh_token = Secret::new(cred.refresh_token);
                        account.access_token = Some(Secret::new(cred.access_token));
                        account.expires_at = cred.expires_at;
                        if cred.email.is_some() {
                            account.email = cred.email;
                        }
                        if cred.project_id.is_some() {
                            account.project_id = cred.project_id;
                        }
                        if cred.managed_project_id.is_some() {
                            account.managed_project_id = cred.managed_project_id;
                        }
                        debug!(refresh_token_present = true, "merged credential into existing account");
                    }
                    None => {
                        let index = state.accounts.len();
                        state.accounts.push(Account {
                            index,
                            email: cred.email,
                            refresh_token: Secret::new(cred.refresh_token),
                            project_id: cred.project_id,
                            managed_project_id: cred.managed_project_id,
                            access_token: Some(Secret::new(cred.access_token)),
                            expires_at: cred.expires_at,
                            added_at: now_millis(),
                            last_used: 0,
                            enabled: true,
                            cooling_down_until: 0,
                            consecutive_failures: 0,
                            rate_limit_reset_times: Default::default(),
                            cached_quota: None,
                            fingerprint: None,
                        });
                        added += 1;
                    }
                }
            }
        })
        .await;
        self.flush().await?;
        Ok(added)
    }

    /// Remove an account by index, rebuilding indices so they stay stable
    /// ordinals (0..n) for everything still in the pool. Idempotent for an
    /// index already out of range (double-removal is a no-op).
    pub async fn remove_account(&self, index: usize) -> Result<bool> {
        let removed = self
            .with_state_mut(|state| {
                if index >= state.accounts.len() {
                    return false;
                }
                state.accounts.remove(index);
                for (i, account) in state.accounts.iter_mut().enumerate() {
                    account.index = i;
                }
                if state.active_index as usize == index {
                    state.active_index = -1;
                }
                true
            })
            .await;
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    pub async fn len(&self) -> usize {
        self.with_state(|s| s.accounts.len()).await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Write pool state to a file atomically: serialize, write to a temp file in
/// the same directory, set 0600 perms, then rename over the target. A reader
/// racing this write always observes either the prior complete file or the
/// new complete file, never a torn one.
async fn write_atomic(path: &Path, state: &PoolState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| Error::CredentialParse(format!("serializing pool state: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("pool file path has no parent directory".into()))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Io(format!("creating pool directory: {e}")))?;

    let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp pool file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting pool file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp pool file: {e}")))?;

    debug!(path = %path.display(), "persisted pool state");
    Ok(())
}
