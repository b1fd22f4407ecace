use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::store::SessionStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Created,
    Running,
    Stopped,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Created | SessionStatus::Running)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "created" => Ok(SessionStatus::Created),
            "running" => Ok(SessionStatus::Running),
            "stopped" => Ok(SessionStatus::Stopped),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(AppError::Config(format!("unknown session status: {other}"))),
        }
    }
}

/// How a session's pool runs. Stored with the session so a resume picks
/// the same settings back up.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub enrich: bool,
    /// Lower starts first in a batch.
    pub priority: i32,
    pub worker_count: Option<usize>,
}

/// One tracked run against one source database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizationSession {
    pub id: i64,
    pub database_ref: String,
    pub status: SessionStatus,
    pub processed: u64,
    pub total: u64,
    pub errors: u64,
    pub priority: i32,
    pub enrich: bool,
    pub worker_count: Option<usize>,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Last transition or checkpoint.
    pub last_activity_at: DateTime<Utc>,
}

impl NormalizationSession {
    pub fn options(&self) -> SessionOptions {
        SessionOptions {
            enrich: self.enrich,
            priority: self.priority,
            worker_count: self.worker_count,
        }
    }

    fn apply_options(&mut self, options: &SessionOptions) {
        self.enrich = options.enrich;
        self.priority = options.priority;
        self.worker_count = options.worker_count;
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total == 0 {
            return if self.status == SessionStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.processed as f64 / self.total as f64 * 100.0).min(100.0)
    }
}

/// Read-only view of a session's run flag. Workers poll it; only the
/// controller can flip it.
#[derive(Clone)]
pub struct CancellationPredicate(Arc<dyn Fn() -> bool + Send + Sync>);

impl CancellationPredicate {
    pub fn from_fn<F>(check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(check))
    }

    pub fn never() -> Self {
        Self::from_fn(|| false)
    }

    fn from_flag(flag: Arc<RwLock<bool>>) -> Self {
        Self::from_fn(move || !*flag.read())
    }

    pub fn should_stop(&self) -> bool {
        (self.0)()
    }
}

impl fmt::Debug for CancellationPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationPredicate")
            .field("should_stop", &self.should_stop())
            .finish()
    }
}

/// What a worker pool needs to run or continue a session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub session_id: i64,
    pub database_ref: String,
    /// First record offset that has not been processed yet.
    pub resume_offset: u64,
    pub total: u64,
    pub prior_errors: u64,
    pub resumed: bool,
    pub options: SessionOptions,
    pub cancel: CancellationPredicate,
}

struct SessionSlot {
    session: NormalizationSession,
    run_flag: Arc<RwLock<bool>>,
    pool_active: bool,
}

impl SessionSlot {
    fn new(session: NormalizationSession) -> Self {
        Self {
            session,
            run_flag: Arc::new(RwLock::new(false)),
            pool_active: false,
        }
    }

    /// Swaps in a fresh run flag so predicates handed to an earlier pool
    /// keep reporting stop.
    fn arm(&mut self) -> CancellationPredicate {
        self.run_flag = Arc::new(RwLock::new(true));
        self.pool_active = true;
        CancellationPredicate::from_flag(Arc::clone(&self.run_flag))
    }

    fn disarm(&self) {
        *self.run_flag.write() = false;
    }

    fn handle(&self, cancel: CancellationPredicate, resumed: bool) -> SessionHandle {
        SessionHandle {
            session_id: self.session.id,
            database_ref: self.session.database_ref.clone(),
            resume_offset: self.session.processed,
            total: self.session.total,
            prior_errors: self.session.errors,
            resumed,
            options: self.session.options(),
            cancel,
        }
    }
}

/// Run/stop/resume state for every session this process knows about.
pub struct SessionController {
    slots: RwLock<HashMap<i64, SessionSlot>>,
    store: Arc<dyn SessionStore>,
}

impl SessionController {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Starts a session for `database_ref`, continuing a stopped or
    /// interrupted one when the latest stored session allows it.
    pub fn start(
        &self,
        database_ref: &str,
        total: u64,
        options: &SessionOptions,
    ) -> AppResult<SessionHandle> {
        let mut slots = self.slots.write();

        if slots
            .values()
            .any(|slot| slot.session.database_ref == database_ref && slot.session.status.is_active())
        {
            return Err(AppError::AlreadyRunning(database_ref.to_string()));
        }

        let known = slots
            .values()
            .filter(|slot| slot.session.database_ref == database_ref)
            .map(|slot| slot.session.id)
            .max();
        let previous = match known {
            Some(id) => slots.get(&id).map(|slot| slot.session.clone()),
            None => self.store.latest_for_database(database_ref)?,
        };

        if let Some(mut session) = previous {
            let continuable = match session.status {
                SessionStatus::Stopped => true,
                // Left behind by a process that exited mid-run.
                SessionStatus::Running | SessionStatus::Created => !slots.contains_key(&session.id),
                SessionStatus::Completed | SessionStatus::Failed => false,
            };
            if continuable {
                if slots.get(&session.id).map(|slot| slot.pool_active).unwrap_or(false) {
                    return Err(AppError::PoolActive(session.id));
                }
                session.total = total.max(session.processed);
                session.apply_options(options);
                let id = session.id;
                let slot = slots
                    .entry(id)
                    .or_insert_with(|| SessionSlot::new(session.clone()));
                slot.session = session;
                return Self::activate(&*self.store, slot, true);
            }
        }

        let session = self.store.create(database_ref, total, options)?;
        info!(
            session_id = session.id,
            database = database_ref,
            total,
            "normalization session created"
        );
        let slot = slots
            .entry(session.id)
            .or_insert_with(|| SessionSlot::new(session));
        Self::activate(&*self.store, slot, false)
    }

    fn activate(
        store: &dyn SessionStore,
        slot: &mut SessionSlot,
        resumed: bool,
    ) -> AppResult<SessionHandle> {
        slot.session.status = SessionStatus::Running;
        slot.session.finished_at = None;
        slot.session.last_activity_at = Utc::now();
        slot.session.processed = slot.session.processed.min(slot.session.total);
        store.save(&slot.session)?;
        let cancel = slot.arm();
        info!(
            session_id = slot.session.id,
            database = %slot.session.database_ref,
            processed = slot.session.processed,
            total = slot.session.total,
            resumed,
            "normalization session running"
        );
        Ok(slot.handle(cancel, resumed))
    }

    /// Stopping a stopped session is a no-op. A session left running by a
    /// process that exited is stopped at its stored offset.
    pub fn stop(&self, session_id: i64) -> AppResult<NormalizationSession> {
        let mut slots = self.slots.write();
        if !slots.contains_key(&session_id) {
            let session = self
                .store
                .load(session_id)?
                .ok_or(AppError::SessionNotFound(session_id))?;
            slots.insert(session_id, SessionSlot::new(session));
        }
        let Some(slot) = slots.get_mut(&session_id) else {
            return Err(AppError::SessionNotFound(session_id));
        };

        match slot.session.status {
            SessionStatus::Stopped => {
                debug!(session_id, "stop requested for an already stopped session");
                Ok(slot.session.clone())
            }
            SessionStatus::Running | SessionStatus::Created => {
                slot.disarm();
                Self::mark_stopped(&mut slot.session);
                self.store.save(&slot.session)?;
                info!(
                    session_id,
                    processed = slot.session.processed,
                    total = slot.session.total,
                    "normalization session stop requested"
                );
                Ok(slot.session.clone())
            }
            from => Err(AppError::InvalidTransition {
                session: session_id,
                from,
                to: SessionStatus::Stopped,
            }),
        }
    }

    fn mark_stopped(session: &mut NormalizationSession) {
        let now = Utc::now();
        session.status = SessionStatus::Stopped;
        session.finished_at = Some(now);
        session.last_activity_at = now;
    }

    pub fn resume(&self, session_id: i64) -> AppResult<SessionHandle> {
        let mut slots = self.slots.write();
        if !slots.contains_key(&session_id) {
            let session = self
                .store
                .load(session_id)?
                .ok_or(AppError::SessionNotFound(session_id))?;
            slots.insert(session_id, SessionSlot::new(session));
        }
        let Some(slot) = slots.get_mut(&session_id) else {
            return Err(AppError::SessionNotFound(session_id));
        };

        if slot.session.status != SessionStatus::Stopped {
            return Err(AppError::InvalidTransition {
                session: session_id,
                from: slot.session.status,
                to: SessionStatus::Running,
            });
        }
        if slot.pool_active {
            return Err(AppError::PoolActive(session_id));
        }
        Self::activate(&*self.store, slot, true)
    }

    pub fn cancellation_predicate(&self, session_id: i64) -> AppResult<CancellationPredicate> {
        let slots = self.slots.read();
        let slot = slots
            .get(&session_id)
            .ok_or(AppError::SessionNotFound(session_id))?;
        Ok(CancellationPredicate::from_flag(Arc::clone(&slot.run_flag)))
    }

    /// Checkpoint write from a pool. Counts only move forward and never
    /// pass the total.
    pub fn record_progress(&self, session_id: i64, processed: u64, errors: u64) -> AppResult<()> {
        let now = Utc::now();
        let (processed, errors) = {
            let mut slots = self.slots.write();
            let slot = slots
                .get_mut(&session_id)
                .ok_or(AppError::SessionNotFound(session_id))?;
            let session = &mut slot.session;
            session.processed = session.processed.max(processed.min(session.total));
            session.errors = session.errors.max(errors);
            session.last_activity_at = now;
            (session.processed, session.errors)
        };
        self.store.save_progress(session_id, processed, errors, now)?;
        debug!(session_id, processed, errors, "session checkpoint recorded");
        Ok(())
    }

    /// Marks a drained pool as finished. A stop that raced the last record
    /// keeps the session stopped.
    pub fn complete(&self, session_id: i64) -> AppResult<NormalizationSession> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(&session_id)
            .ok_or(AppError::SessionNotFound(session_id))?;
        match slot.session.status {
            SessionStatus::Running => {
                slot.disarm();
                slot.session.status = SessionStatus::Completed;
                slot.session.processed = slot.session.total;
                slot.session.finished_at = Some(Utc::now());
                slot.session.last_activity_at = Utc::now();
                self.store.save(&slot.session)?;
                info!(
                    session_id,
                    processed = slot.session.processed,
                    errors = slot.session.errors,
                    "normalization session completed"
                );
                Ok(slot.session.clone())
            }
            SessionStatus::Stopped => Ok(slot.session.clone()),
            from => Err(AppError::InvalidTransition {
                session: session_id,
                from,
                to: SessionStatus::Completed,
            }),
        }
    }

    pub fn fail(&self, session_id: i64, error: &str) -> AppResult<NormalizationSession> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(&session_id)
            .ok_or(AppError::SessionNotFound(session_id))?;
        slot.session.last_error = Some(error.to_string());
        match slot.session.status {
            SessionStatus::Running | SessionStatus::Created => {
                slot.disarm();
                slot.session.status = SessionStatus::Failed;
                slot.session.finished_at = Some(Utc::now());
                slot.session.last_activity_at = Utc::now();
                warn!(session_id, error, "normalization session failed");
            }
            status => {
                warn!(session_id, %status, error, "pool error after session left running state");
            }
        }
        self.store.save(&slot.session)?;
        Ok(slot.session.clone())
    }

    /// Called by the pool runner once its workers have all exited.
    pub fn release_pool(&self, session_id: i64) {
        if let Some(slot) = self.slots.write().get_mut(&session_id) {
            slot.pool_active = false;
        }
    }

    pub fn status(&self, session_id: i64) -> AppResult<NormalizationSession> {
        if let Some(slot) = self.slots.read().get(&session_id) {
            return Ok(slot.session.clone());
        }
        self.store
            .load(session_id)?
            .ok_or(AppError::SessionNotFound(session_id))
    }

    /// Most recent session this process has touched for `database_ref`.
    pub fn latest_for_database(&self, database_ref: &str) -> Option<NormalizationSession> {
        self.slots
            .read()
            .values()
            .filter(|slot| slot.session.database_ref == database_ref)
            .max_by_key(|slot| slot.session.id)
            .map(|slot| slot.session.clone())
    }

    /// Stops `running` sessions that have no live pool in this process and
    /// no checkpoint within `idle`. They stay resumable.
    pub fn stop_stale(&self, idle: Duration) -> AppResult<Vec<NormalizationSession>> {
        let idle = chrono::Duration::from_std(idle)
            .map_err(|err| AppError::Config(format!("invalid session timeout: {err}")))?;
        let cutoff = Utc::now() - idle;

        let mut candidates = self.store.with_status(SessionStatus::Running)?;
        candidates.extend(self.store.with_status(SessionStatus::Created)?);

        let mut slots = self.slots.write();
        let mut stopped = Vec::new();
        for stored in candidates {
            let (session, pool_active) = match slots.get(&stored.id) {
                Some(slot) => (slot.session.clone(), slot.pool_active),
                None => (stored, false),
            };
            if pool_active || !session.status.is_active() || session.last_activity_at > cutoff {
                continue;
            }

            let session_id = session.id;
            let slot = slots
                .entry(session_id)
                .or_insert_with(|| SessionSlot::new(session));
            slot.disarm();
            Self::mark_stopped(&mut slot.session);
            self.store.save(&slot.session)?;
            warn!(
                session_id,
                processed = slot.session.processed,
                total = slot.session.total,
                "stale session stopped"
            );
            stopped.push(slot.session.clone());
        }
        Ok(stopped)
    }

    /// Every stored session in `status`, not only the ones this process ran.
    pub fn sessions_with_status(&self, status: SessionStatus) -> AppResult<Vec<NormalizationSession>> {
        let stored = self.store.with_status(status)?;
        let slots = self.slots.read();
        Ok(stored
            .into_iter()
            .map(|session| {
                slots
                    .get(&session.id)
                    .map(|slot| slot.session.clone())
                    .unwrap_or(session)
            })
            .filter(|session| session.status == status)
            .collect())
    }

    pub fn sessions(&self) -> Vec<NormalizationSession> {
        let mut sessions: Vec<_> = self
            .slots
            .read()
            .values()
            .map(|slot| slot.session.clone())
            .collect();
        sessions.sort_by_key(|session| session.id);
        sessions
    }
}
