//! Persisted security store
//!
//! Owns the single [`SecurityState`], writes it through to a backend on every
//! transition and broadcasts each change to other windows sharing the store.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::state::{PersistedState, SecurityState};

/// Store shared between the lock state machine and the attempt limiter
pub type SharedStore = Arc<RwLock<SecurityStore>>;

/// Byte-level persistence for the security record
pub trait StateBackend: Send + Sync {
    /// Read the stored record, `None` if nothing was ever written
    fn load(&self) -> Result<Option<Vec<u8>>>;

    /// Replace the stored record
    fn save(&self, bytes: &[u8]) -> Result<()>;

    /// Remove the stored record entirely
    fn clear(&self) -> Result<()>;
}

/// JSON file on local disk
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateBackend for FileBackend {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read(&self.path)?))
    }

    fn save(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write to temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, bytes)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// In-memory backend; clones share the same slot, which simulates a reload
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoded copy of the stored record, if any
    pub fn snapshot(&self) -> Option<PersistedState> {
        let slot = self.slot.lock().ok()?;
        slot.as_deref().and_then(|b| PersistedState::decode(b).ok())
    }
}

impl StateBackend for MemoryBackend {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        let slot = self
            .slot
            .lock()
            .map_err(|_| Error::Storage("memory backend poisoned".to_string()))?;
        Ok(slot.clone())
    }

    fn save(&self, bytes: &[u8]) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| Error::Storage("memory backend poisoned".to_string()))?;
        *slot = Some(bytes.to_vec());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| Error::Storage("memory backend poisoned".to_string()))?;
        *slot = None;
        Ok(())
    }
}

/// Notification published after every persisted change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    Locked,
    Unlocked { at_ms: u64 },
    ActivityRecorded { at_ms: u64 },
    AttemptsChanged {
        context: String,
        failed: u32,
        locked_until: Option<u64>,
    },
    /// State was re-read from the backend and merged
    Refreshed,
    /// State was wiped on logout
    Cleared,
}

/// The single owner of [`SecurityState`]
pub struct SecurityStore {
    state: SecurityState,
    backend: Arc<dyn StateBackend>,
    events: broadcast::Sender<StateChange>,
}

impl SecurityStore {
    /// Rehydrate from the backend.
    ///
    /// Nothing stored yields a fresh ACTIVE state. A record that cannot be read
    /// or decoded yields LOCKED.
    pub fn open(backend: Arc<dyn StateBackend>, now_ms: u64) -> Self {
        let state = match backend.load() {
            Ok(None) => {
                debug!("No persisted security state, starting fresh");
                SecurityState::fresh(now_ms)
            }
            Ok(Some(bytes)) => match PersistedState::decode(&bytes) {
                Ok(record) => {
                    let state = SecurityState::from_persisted(record);
                    info!("Rehydrated security state: {:?}", state.phase());
                    state
                }
                Err(e) => {
                    warn!("Persisted security state unusable, failing closed: {}", e);
                    SecurityState::fail_closed(now_ms)
                }
            },
            Err(e) => {
                warn!("Failed to read security state, failing closed: {}", e);
                SecurityState::fail_closed(now_ms)
            }
        };

        let (events, _) = broadcast::channel(32);
        let store = Self {
            state,
            backend,
            events,
        };
        if let Err(e) = store.persist() {
            warn!("Failed to persist rehydrated security state: {}", e);
        }
        store
    }

    /// Wrap into the shared handle used by the lock state machine and limiter
    pub fn shared(self) -> SharedStore {
        Arc::new(RwLock::new(self))
    }

    pub fn state(&self) -> &SecurityState {
        &self.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    pub fn lock(&mut self) -> Result<bool> {
        let changed = self.state.lock();
        if changed {
            self.commit(StateChange::Locked)?;
        }
        Ok(changed)
    }

    pub fn unlock(&mut self, now_ms: u64) -> Result<bool> {
        let changed = self.state.unlock(now_ms);
        self.commit(StateChange::Unlocked {
            at_ms: self.state.last_active_ms(),
        })?;
        Ok(changed)
    }

    pub fn record_activity(&mut self, at_ms: u64) -> Result<bool> {
        let changed = self.state.record_activity(at_ms);
        if changed {
            self.commit(StateChange::ActivityRecorded { at_ms })?;
        }
        Ok(changed)
    }

    pub fn record_failure(&mut self, context: &str) -> Result<u32> {
        let failed = self.state.record_failure(context);
        self.commit(self.attempts_change(context))?;
        Ok(failed)
    }

    pub fn impose_lockout(&mut self, context: &str, until_ms: u64) -> Result<()> {
        self.state.impose_lockout(context, until_ms);
        self.commit(self.attempts_change(context))
    }

    pub fn reset_attempts(&mut self, context: &str) -> Result<()> {
        let had_any = self.state.failed_attempts(context) > 0
            || self.state.locked_until(context).is_some();
        self.state.reset_attempts(context);
        if had_any {
            self.commit(self.attempts_change(context))?;
        }
        Ok(())
    }

    /// Re-read the backend and merge whatever another window wrote
    pub fn refresh(&mut self) -> Result<()> {
        let Some(bytes) = self.backend.load()? else {
            // Another window logged out; stay as restrictive as we are.
            return Ok(());
        };

        let merged = match PersistedState::decode(&bytes) {
            Ok(record) => self.state.merge(&SecurityState::from_persisted(record)),
            Err(e) => {
                warn!("Stored security state unusable on refresh, failing closed: {}", e);
                let mut locked = self.state.clone();
                locked.lock();
                locked
            }
        };

        if merged != self.state {
            self.state = merged;
            self.commit(StateChange::Refreshed)?;
        }
        Ok(())
    }

    /// Logout teardown: remove the record and start over as a fresh session
    pub fn clear(&mut self, now_ms: u64) -> Result<()> {
        self.backend.clear()?;
        self.state = SecurityState::fresh(now_ms);
        info!("Security state cleared");
        let _ = self.events.send(StateChange::Cleared);
        Ok(())
    }

    fn attempts_change(&self, context: &str) -> StateChange {
        StateChange::AttemptsChanged {
            context: context.to_string(),
            failed: self.state.failed_attempts(context),
            locked_until: self.state.locked_until(context),
        }
    }

    fn persist(&self) -> Result<()> {
        let bytes = self.state.to_persisted().encode()?;
        self.backend.save(&bytes)
    }

    fn commit(&self, change: StateChange) -> Result<()> {
        self.persist()?;
        // No receivers is not an error
        let _ = self.events.send(change);
        Ok(())
    }
}
