//! The session registry: user-id → session map, cancel handles for
//! in-flight invocations, and the on-disk snapshot used for crash recovery.
//!
//! The registry lock is only ever held for map mutations and the bounded
//! local snapshot write. Subprocess spawning and stream reading always happen
//! with the lock released.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Timelike;
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::claude::RunAsUser;
use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::memory::MemoryStore;
use crate::session::{Session, SessionStatus};
use crate::util::now_millis;

/// Sessions idle longer than this are cleaned during the daily reset window.
const RESET_WINDOW_IDLE_MS: i64 = 5 * 60_000;

pub(crate) struct Inner {
    pub sessions: HashMap<String, Session>,
    pub procs: HashMap<String, CancellationToken>,
}

pub struct SessionRegistry {
    pub(crate) inner: RwLock<Inner>,
    pub(crate) config: Config,
    pub(crate) memory: Arc<MemoryStore>,
    pub(crate) run_as: Option<RunAsUser>,
    /// Overrides claude binary resolution; used by tests.
    pub(crate) claude_path: Option<PathBuf>,
    state_dir: PathBuf,
    reset_tz: Tz,
}

impl SessionRegistry {
    pub fn new(config: Config, memory: Arc<MemoryStore>, run_as: Option<RunAsUser>) -> Self {
        Self::with_state_dir(config, memory, run_as, crate::config::state_dir())
    }

    pub fn with_state_dir(
        config: Config,
        memory: Arc<MemoryStore>,
        run_as: Option<RunAsUser>,
        state_dir: PathBuf,
    ) -> Self {
        let reset_tz = match config.sessions.timezone.parse::<Tz>() {
            Ok(tz) => tz,
            Err(_) => {
                warn!(timezone = %config.sessions.timezone, "invalid timezone, falling back to UTC");
                chrono_tz::UTC
            }
        };

        let registry = Self {
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                procs: HashMap::new(),
            }),
            config,
            memory,
            run_as,
            claude_path: None,
            state_dir,
            reset_tz,
        };
        registry.load_from_disk();
        registry
    }

    /// Force a specific claude binary instead of resolving `$CLAUDE_PATH`.
    pub fn with_claude_binary(mut self, path: PathBuf) -> Self {
        self.claude_path = Some(path);
        self
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("registry lock poisoned")
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("registry lock poisoned")
    }

    // --- Persistence ---

    fn snapshot_path(&self) -> PathBuf {
        self.state_dir.join("sessions.json")
    }

    fn load_from_disk(&self) {
        let Ok(data) = std::fs::read_to_string(self.snapshot_path()) else {
            return;
        };
        let sessions: Vec<Session> = match serde_json::from_str(&data) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable session snapshot");
                return;
            }
        };

        let mut inner = self.write();
        for mut session in sessions {
            // an in-flight invocation cannot survive a restart
            session.status = SessionStatus::Active;
            inner.sessions.insert(session.user_id.clone(), session);
        }
        info!(count = inner.sessions.len(), "loaded sessions from disk");
    }

    /// Write the full session array under the registry lock. Bounded local
    /// I/O, so holding the lock here is fine.
    pub(crate) fn save_locked(&self, inner: &Inner) {
        if let Err(e) = self.write_snapshot(&inner.sessions) {
            warn!(error = %e, "failed to persist sessions");
        }
    }

    fn write_snapshot(&self, sessions: &HashMap<String, Session>) -> std::io::Result<()> {
        create_private_dir(&self.state_dir)?;

        let list: Vec<&Session> = sessions.values().collect();
        let data = serde_json::to_vec_pretty(&list).map_err(std::io::Error::other)?;

        let path = self.snapshot_path();
        let tmp = path.with_extension("json.tmp");
        {
            let mut options = std::fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&tmp)?;
            file.write_all(&data)?;
        }
        std::fs::rename(&tmp, path)
    }

    // --- Operations ---

    pub fn get(&self, user_id: &str) -> Option<Session> {
        self.read().sessions.get(user_id).cloned()
    }

    pub fn list(&self) -> Vec<Session> {
        self.read().sessions.values().cloned().collect()
    }

    /// Whether a new session may be created under the concurrency cap.
    pub fn can_create(&self) -> bool {
        self.read().sessions.len() < self.config.sessions.max_concurrent
    }

    /// Return the user's session, creating one under the concurrency cap if
    /// absent. Fails `StillBusy` when the existing session is mid-turn and
    /// `ConcurrencyCap` when a new one cannot be created.
    pub fn resolve_or_create(&self, user_id: &str, chat_id: &str) -> Result<Session> {
        let mut inner = self.write();

        if let Some(session) = inner.sessions.get(user_id) {
            if session.is_busy() {
                return Err(BridgeError::StillBusy);
            }
            return Ok(session.clone());
        }

        if inner.sessions.len() >= self.config.sessions.max_concurrent {
            return Err(BridgeError::ConcurrencyCap);
        }

        let session = Session::new(user_id, chat_id, &self.config.sessions);
        inner
            .sessions
            .insert(user_id.to_string(), session.clone());
        self.save_locked(&inner);
        Ok(session)
    }

    /// Update the session's working directory. The caller has already
    /// validated the path. No-op when the session is absent.
    pub fn set_work_dir(&self, user_id: &str, work_dir: &str) {
        let mut inner = self.write();
        if let Some(session) = inner.sessions.get_mut(user_id) {
            session.work_dir = work_dir.to_string();
            self.save_locked(&inner);
        }
    }

    /// End the user's session: cancel any in-flight invocation, remove it
    /// from the registry, and flush its summary synchronously so it is on
    /// disk before the user's next message starts.
    pub async fn kill(&self, user_id: &str) -> bool {
        let flush = {
            let mut inner = self.write();
            let Some(session) = inner.sessions.remove(user_id) else {
                return false;
            };
            if let Some(token) = inner.procs.remove(&session.id) {
                token.cancel();
            }
            self.save_locked(&inner);
            (session.message_count > 0).then(|| (session.id, session.model))
        };

        if let Some((session_id, model)) = flush {
            self.memory
                .flush_session(user_id, &session_id, &model)
                .await;
        }
        true
    }

    /// Flush every session that has messages. Called once during graceful
    /// shutdown, synchronously, so context survives the exit.
    pub async fn flush_all(&self) {
        let to_flush: Vec<(String, String, String)> = self
            .read()
            .sessions
            .values()
            .filter(|s| s.message_count > 0)
            .map(|s| (s.user_id.clone(), s.id.clone(), s.model.clone()))
            .collect();

        if to_flush.is_empty() {
            return;
        }

        info!(count = to_flush.len(), "flushing sessions before shutdown");
        for (user_id, session_id, model) in to_flush {
            self.memory
                .flush_session(&user_id, &session_id, &model)
                .await;
        }
        info!("shutdown flush complete");
    }

    /// Clean idle sessions. Flushes happen outside the registry lock.
    pub async fn sweep_stale(&self) -> usize {
        let now = now_millis();
        let timeout_ms = self.config.sessions.timeout_minutes * 60_000;
        let reset_active = self.daily_reset_active();

        let mut to_flush: Vec<(String, String, String)> = Vec::new();
        let mut cleaned = 0;
        {
            let mut inner = self.write();

            let stale: Vec<String> = inner
                .sessions
                .iter()
                .filter(|(_, s)| !s.is_busy() && should_clean(now - s.last_activity_at, timeout_ms, reset_active))
                .map(|(user_id, _)| user_id.clone())
                .collect();

            for user_id in stale {
                let Some(session) = inner.sessions.remove(&user_id) else {
                    continue;
                };
                if reset_active && now - session.last_activity_at <= timeout_ms {
                    info!(session = session.short_id(), "daily reset cleaning session");
                }
                if let Some(token) = inner.procs.remove(&session.id) {
                    token.cancel();
                }
                if session.message_count > 0 {
                    to_flush.push((user_id, session.id, session.model));
                }
                cleaned += 1;
            }

            if cleaned > 0 {
                self.save_locked(&inner);
            }
        }

        for (user_id, session_id, model) in to_flush {
            let memory = self.memory.clone();
            tokio::spawn(async move {
                memory.flush_session(&user_id, &session_id, &model).await;
            });
        }

        // retention runs once a day, piggybacked on the reset window
        if reset_active {
            let memory = self.memory.clone();
            tokio::task::spawn_blocking(move || memory.clean_old_files());
        }

        cleaned
    }

    fn daily_reset_active(&self) -> bool {
        let reset_hour = self.config.sessions.reset_hour;
        if reset_hour < 0 {
            return false;
        }
        let local_hour = chrono::Utc::now().with_timezone(&self.reset_tz).hour();
        local_hour as i32 == reset_hour
    }

    /// Record the conversation id claude reported on its first event.
    pub(crate) fn assign_conversation_id(&self, user_id: &str, conversation_id: &str) {
        let mut inner = self.write();
        if let Some(session) = inner.sessions.get_mut(user_id) {
            // the busy flag makes a concurrent capture for one user impossible
            debug_assert!(session.is_busy(), "conversation id captured outside a turn");
            if session.claude_session_id.is_empty() {
                session.claude_session_id = conversation_id.to_string();
                debug!(
                    session = session.short_id(),
                    conversation = conversation_id,
                    "captured claude conversation id"
                );
                self.save_locked(&inner);
            }
        }
    }

    /// Wipe a resume token the assistant no longer recognizes.
    pub(crate) fn clear_conversation_id(&self, user_id: &str) {
        let mut inner = self.write();
        if let Some(session) = inner.sessions.get_mut(user_id) {
            session.claude_session_id.clear();
            self.save_locked(&inner);
        }
    }
}

/// Idle-based cleaning decision, shared by the sweeper and its tests.
fn should_clean(idle_ms: i64, timeout_ms: i64, reset_active: bool) -> bool {
    idle_ms > timeout_ms || (reset_active && idle_ms > RESET_WINDOW_IDLE_MS)
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}
