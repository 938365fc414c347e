//! Session orchestration and the chunk loop
//!
//! The orchestrator owns the lifecycle of sync sessions: it enforces the
//! single-active-session rule, spawns the worker that drives the chunk loop,
//! resumes interrupted sessions from their last committed checkpoint, and
//! cancels cooperatively between chunks.
//!
//! Each loop iteration fetches one page from the remote, classifies every
//! record against local state, and commits the results (entities, conflicts,
//! audit entries, session counters, checkpoint) in a single transaction.
//! A crash at any point leaves the store at the previous checkpoint.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pipesync_conflict::detector::{ChangeDetector, RecordChange};
use pipesync_conflict::policy::ConflictPolicy;
use pipesync_core::domain::audit::{AuditAction, AuditEntry};
use pipesync_core::domain::checkpoint::Checkpoint;
use pipesync_core::domain::conflict::{Conflict, ResolutionStatus};
use pipesync_core::domain::cursor::CursorState;
use pipesync_core::domain::entity::{EntityStatus, LocalEntity};
use pipesync_core::domain::newtypes::SessionId;
use pipesync_core::domain::session::{SessionKind, SyncPhase, SyncSession};
use pipesync_core::ports::remote_crm::{ChangePage, IRemoteCrm, RecordUpdate};
use pipesync_core::ports::state_repository::{ChunkWrite, IStateRepository};

use crate::progress::ProgressEvent;

/// Actor name for engine-initiated audit entries
const ENGINE_ACTOR: &str = "engine";

/// Transient failures are retried this many times before giving up
const MAX_RETRIES: u32 = 5;

/// First retry backoff; doubles per attempt
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Capacity of the progress broadcast channel; lagging observers miss
/// events rather than blocking the loop
const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Errors surfaced by orchestrator operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a sync session is already active: {0}")]
    AlreadyRunning(SessionId),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session {id} is not active (status: {status})")]
    NotActive { id: SessionId, status: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

struct ActiveRun {
    session_id: SessionId,
    cancel: CancellationToken,
}

struct Inner {
    remote: Arc<dyn IRemoteCrm + Send + Sync>,
    repository: Arc<dyn IStateRepository + Send + Sync>,
    detector: ChangeDetector,
    mapping_version: u32,
    push_batch_size: usize,
    progress: broadcast::Sender<ProgressEvent>,
    active: Mutex<Option<ActiveRun>>,
}

/// Drives sync sessions against the remote CRM and the local store
///
/// Cheap to clone; all clones share the same single-active-session guard.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(
        remote: Arc<dyn IRemoteCrm + Send + Sync>,
        repository: Arc<dyn IStateRepository + Send + Sync>,
        policy: ConflictPolicy,
        mapping_version: u32,
        push_batch_size: usize,
    ) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                remote,
                repository,
                detector: ChangeDetector::new(policy),
                mapping_version,
                // The remote rejects batches above 100 records
                push_batch_size: push_batch_size.clamp(1, 100),
                progress,
                active: Mutex::new(None),
            }),
        }
    }

    /// Subscribes to progress events for all sessions
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.progress.subscribe()
    }

    /// Starts a full export of the remote collection
    pub async fn start_full(&self) -> Result<SessionId, EngineError> {
        self.start(SessionKind::Full).await
    }

    /// Starts an incremental sync from the stored watermark
    pub async fn start_incremental(&self) -> Result<SessionId, EngineError> {
        self.start(SessionKind::Incremental).await
    }

    #[tracing::instrument(skip(self))]
    async fn start(&self, kind: SessionKind) -> Result<SessionId, EngineError> {
        let mut active = self.inner.active.lock().await;
        if let Some(run) = active.as_ref() {
            return Err(EngineError::AlreadyRunning(run.session_id));
        }
        // A session left running by a previous process must be resumed or
        // cancelled before a new one can start
        if let Some(existing) = self.inner.repository.find_active_session().await? {
            return Err(EngineError::AlreadyRunning(*existing.id()));
        }

        let mut session = SyncSession::new(kind, self.inner.mapping_version);
        let cursor = match kind {
            SessionKind::Full => CursorState::full_start().encode(),
            SessionKind::Incremental => {
                let watermark = self
                    .inner
                    .repository
                    .max_remote_modified_at()
                    .await?
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                CursorState::incremental_start(watermark).encode()
            }
        };
        session.set_cursor(cursor);
        self.inner.repository.save_session(&session).await?;

        let id = *session.id();
        let cancel = CancellationToken::new();
        *active = Some(ActiveRun {
            session_id: id,
            cancel: cancel.clone(),
        });
        drop(active);

        info!(session_id = %id, %kind, "sync session started");
        let this = self.clone();
        tokio::spawn(async move { this.run(session, cancel).await });
        Ok(id)
    }

    /// Requests cancellation of a session
    ///
    /// A running session stops cooperatively at the next chunk boundary;
    /// everything committed so far stays committed. An orphaned active
    /// session from a previous process is cancelled directly.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, session_id: &SessionId) -> Result<(), EngineError> {
        {
            let active = self.inner.active.lock().await;
            if let Some(run) = active.as_ref() {
                if run.session_id == *session_id {
                    info!(session_id = %session_id, "cancellation requested");
                    run.cancel.cancel();
                    return Ok(());
                }
            }
        }

        let Some(mut session) = self.inner.repository.get_session(session_id).await? else {
            return Err(EngineError::SessionNotFound(*session_id));
        };
        if session.cancel().is_err() {
            return Err(EngineError::NotActive {
                id: *session_id,
                status: session.status().to_string(),
            });
        }
        self.inner.repository.save_session(&session).await?;
        self.finish_audit(&session).await;
        info!(session_id = %session_id, "orphaned session cancelled");
        Ok(())
    }

    /// Resumes the active session left behind by a previous process, if any
    ///
    /// The saved checkpoint's cursor is validated against the remote first:
    /// remotes expire incremental cursors, and resuming with a stale one
    /// would silently skip changes. A session whose cursor is no longer
    /// honored (or whose checkpoint is corrupt) is failed, preserving its
    /// checkpoint for inspection; the caller may then start a fresh session.
    #[tracing::instrument(skip(self))]
    pub async fn resume(&self) -> Result<Option<SessionId>, EngineError> {
        let Some(mut session) = self.inner.repository.find_active_session().await? else {
            return Ok(None);
        };
        let id = *session.id();

        match self.inner.repository.get_checkpoint(&id).await? {
            Some(checkpoint) => {
                if let Err(e) = checkpoint.cursor.decode() {
                    warn!(session_id = %id, error = %e, "checkpoint cursor is corrupt");
                    return self.fail_unresumable(session, format!("checkpoint cursor is corrupt: {e}")).await;
                }
                let remote = Arc::clone(&self.inner.remote);
                let valid = with_retry("validate_cursor", || {
                    remote.validate_cursor(&checkpoint.cursor)
                })
                .await?;
                if !valid {
                    warn!(session_id = %id, "resume cursor no longer honored by the remote");
                    return self
                        .fail_unresumable(session, "resume cursor no longer honored by the remote")
                        .await;
                }
                session.set_cursor(checkpoint.cursor);
            }
            None => {
                // No chunk ever committed; restart from the initial cursor
                if session.cursor().is_none() {
                    return self
                        .fail_unresumable(session, "session has no cursor to resume from")
                        .await;
                }
            }
        }

        let mut active = self.inner.active.lock().await;
        if let Some(run) = active.as_ref() {
            return Err(EngineError::AlreadyRunning(run.session_id));
        }
        let cancel = CancellationToken::new();
        *active = Some(ActiveRun {
            session_id: id,
            cancel: cancel.clone(),
        });
        drop(active);

        info!(session_id = %id, records_processed = session.records_processed(), "resuming interrupted session");
        let this = self.clone();
        tokio::spawn(async move { this.run(session, cancel).await });
        Ok(Some(id))
    }

    async fn fail_unresumable(
        &self,
        mut session: SyncSession,
        reason: impl Into<String>,
    ) -> Result<Option<SessionId>, EngineError> {
        session.fail(reason);
        self.inner.repository.save_session(&session).await?;
        self.finish_audit(&session).await;
        Ok(None)
    }

    // ========================================================================
    // Worker
    // ========================================================================

    async fn run(self, mut session: SyncSession, cancel: CancellationToken) {
        let session_id = *session.id();
        if let Err(e) = self.run_loop(&mut session, &cancel).await {
            error!(session_id = %session_id, error = %e, "sync session failed");
            session.fail(format!("{e:#}"));
            if let Err(save_err) = self.inner.repository.save_session(&session).await {
                error!(session_id = %session_id, error = %save_err, "failed to persist session failure");
            }
        }
        self.finish_audit(&session).await;
        self.emit(&session, SyncPhase::Checkpointing);
        *self.inner.active.lock().await = None;
    }

    async fn run_loop(
        &self,
        session: &mut SyncSession,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        session.start()?;
        self.inner.repository.save_session(session).await?;
        self.inner
            .repository
            .save_audit(
                &AuditEntry::new(AuditAction::SessionStarted, ENGINE_ACTOR)
                    .with_session(*session.id()),
            )
            .await?;

        let session_id = *session.id();
        let kind = session.kind();

        loop {
            if cancel.is_cancelled() {
                session.cancel()?;
                self.inner.repository.save_session(session).await?;
                info!(
                    session_id = %session_id,
                    records_processed = session.records_processed(),
                    "session cancelled between chunks"
                );
                return Ok(());
            }

            let cursor = session
                .cursor()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("session has no cursor"))?;

            self.emit(session, SyncPhase::Fetching);
            let remote = Arc::clone(&self.inner.remote);
            let page = with_retry("fetch_page", || {
                remote.fetch_page(session_id, kind, &cursor)
            })
            .await?;
            session.record_api_call();
            if session.records_total().is_none() {
                if let Some(total) = page.records_total {
                    session.set_records_total(total);
                }
            }
            for _ in 0..page.malformed {
                session.record_malformed("malformed record dropped during fetch");
            }

            self.emit(session, SyncPhase::Classifying);
            let classified = self.classify_page(session, &page).await?;

            self.emit(session, SyncPhase::Writing);
            session.add_records_processed(page.records.len() as u64 + page.malformed);
            session.advance_cursor(page.next_cursor.clone());
            let checkpoint = Checkpoint::new(
                session_id,
                page.next_cursor.clone(),
                session.records_processed(),
            );
            let chunk = ChunkWrite {
                session: session.clone(),
                entities: classified.entities,
                conflicts: classified.conflicts,
                audits: classified.audits,
                checkpoint,
            };
            self.inner.repository.apply_chunk(&chunk).await?;
            self.emit(session, SyncPhase::Checkpointing);
            debug!(
                session_id = %session_id,
                records_processed = session.records_processed(),
                records_total = session.records_total(),
                "chunk committed"
            );

            if !classified.push_backs.is_empty() {
                self.push_back(session, classified.push_backs).await?;
            }

            if !page.has_more {
                session.complete()?;
                self.inner.repository.save_session(session).await?;
                info!(
                    session_id = %session_id,
                    records_processed = session.records_processed(),
                    api_calls = session.api_calls_made(),
                    record_errors = session.record_errors(),
                    "sync session completed"
                );
                return Ok(());
            }
        }
    }

    /// Classifies every record of a fetched page against local state
    async fn classify_page(
        &self,
        session: &SyncSession,
        page: &ChangePage,
    ) -> anyhow::Result<ClassifiedChunk> {
        let now = Utc::now();
        let session_id = *session.id();
        let mut out = ClassifiedChunk::default();

        for record in &page.records {
            let existing = self.inner.repository.get_entity(&record.remote_id).await?;
            match self.inner.detector.classify(record, existing.as_ref(), now) {
                RecordChange::Insert(entity) | RecordChange::Update { entity, .. } => {
                    out.audits.push(
                        AuditEntry::new(AuditAction::RemoteApplied, ENGINE_ACTOR)
                            .with_session(session_id)
                            .with_record(record.remote_id.clone()),
                    );
                    out.entities.push(entity);
                }
                RecordChange::BookkeepingOnly(entity) => {
                    out.entities.push(entity);
                }
                RecordChange::AutoMerge {
                    entity,
                    applied_fields,
                } => {
                    out.audits.push(
                        AuditEntry::new(AuditAction::MergeApplied, ENGINE_ACTOR)
                            .with_session(session_id)
                            .with_record(record.remote_id.clone())
                            .with_details(json!({ "applied_fields": applied_fields })),
                    );
                    out.entities.push(entity);
                }
                RecordChange::ConflictDetected {
                    entity,
                    conflict,
                    applied_fields,
                } => {
                    out.audits.push(
                        AuditEntry::new(AuditAction::ConflictDetected, ENGINE_ACTOR)
                            .with_session(session_id)
                            .with_record(record.remote_id.clone())
                            .with_values(conflict.local_values().clone(), conflict.remote_values().clone())
                            .with_details(json!({
                                "conflict_id": conflict.id().to_string(),
                                "fields": conflict.fields(),
                                "applied_fields": applied_fields,
                            })),
                    );
                    if conflict.is_resolved() {
                        out.audits.push(
                            AuditEntry::new(
                                AuditAction::ConflictResolved,
                                conflict.resolved_by().unwrap_or(ENGINE_ACTOR),
                            )
                            .with_session(session_id)
                            .with_record(record.remote_id.clone())
                            .with_details(json!({
                                "conflict_id": conflict.id().to_string(),
                                "resolution": conflict.resolution_status().to_string(),
                            })),
                        );
                    }
                    if conflict.resolution_status() == ResolutionStatus::ResolvedLocal {
                        out.push_backs.push(entity.clone());
                    }
                    out.conflicts.push(*conflict);
                    out.entities.push(entity);
                }
                RecordChange::Tombstone(entity) => {
                    out.audits.push(
                        AuditEntry::new(AuditAction::Tombstoned, ENGINE_ACTOR)
                            .with_session(session_id)
                            .with_record(record.remote_id.clone()),
                    );
                    out.entities.push(entity);
                }
                RecordChange::Skip => {}
            }
        }
        Ok(out)
    }

    /// Pushes locally kept values back to the remote
    ///
    /// Runs after the chunk is committed, so a push failure can never undo a
    /// recorded conflict. Batches respect the remote's 100-record ceiling;
    /// per-record failures mark the entity `Error` and count against the
    /// session's error counter without aborting the run.
    async fn push_back(
        &self,
        session: &mut SyncSession,
        entities: Vec<LocalEntity>,
    ) -> anyhow::Result<()> {
        let session_id = *session.id();
        for batch in entities.chunks(self.inner.push_batch_size) {
            let updates: Vec<RecordUpdate> = batch
                .iter()
                .map(|entity| RecordUpdate {
                    remote_id: entity.remote_id().clone(),
                    fields: entity
                        .locally_changed_fields()
                        .iter()
                        .filter_map(|name| {
                            entity.fields().get(name).map(|v| (name.clone(), v.clone()))
                        })
                        .collect(),
                })
                .collect();

            let remote = Arc::clone(&self.inner.remote);
            let outcomes = with_retry("update_records", || remote.update_records(&updates)).await?;
            session.record_api_call();

            let by_id: HashMap<&str, &Option<String>> = outcomes
                .iter()
                .map(|o| (o.remote_id.as_str(), &o.error))
                .collect();
            let now = Utc::now();
            for entity in batch {
                let mut entity = entity.clone();
                match by_id.get(entity.remote_id().as_str()) {
                    Some(None) => {
                        let pushed = entity.fields().clone();
                        entity.mark_pushed(now);
                        self.inner.repository.save_entity(&entity).await?;
                        self.inner
                            .repository
                            .save_audit(
                                &AuditEntry::new(AuditAction::PushedBack, ENGINE_ACTOR)
                                    .with_session(session_id)
                                    .with_record(entity.remote_id().clone())
                                    .with_values(entity.base_fields().clone(), pushed),
                            )
                            .await?;
                    }
                    Some(Some(message)) => {
                        warn!(
                            session_id = %session_id,
                            remote_id = %entity.remote_id(),
                            error = %message,
                            "push-back rejected by the remote"
                        );
                        entity.set_status(EntityStatus::Error);
                        self.inner.repository.save_entity(&entity).await?;
                        session.record_malformed(format!(
                            "push-back rejected for {}: {message}",
                            entity.remote_id()
                        ));
                    }
                    None => {
                        warn!(
                            session_id = %session_id,
                            remote_id = %entity.remote_id(),
                            "remote returned no outcome for pushed record"
                        );
                        session.record_malformed(format!(
                            "no push-back outcome for {}",
                            entity.remote_id()
                        ));
                    }
                }
            }
        }
        self.inner.repository.save_session(session).await?;
        Ok(())
    }

    async fn finish_audit(&self, session: &SyncSession) {
        let entry = AuditEntry::new(AuditAction::SessionFinished, ENGINE_ACTOR)
            .with_session(*session.id())
            .with_details(json!({
                "status": session.status().to_string(),
                "records_processed": session.records_processed(),
                "api_calls_made": session.api_calls_made(),
                "record_errors": session.record_errors(),
            }));
        if let Err(e) = self.inner.repository.save_audit(&entry).await {
            warn!(session_id = %session.id(), error = %e, "failed to write session audit entry");
        }
    }

    fn emit(&self, session: &SyncSession, phase: SyncPhase) {
        let _ = self
            .inner
            .progress
            .send(ProgressEvent::snapshot(session, phase));
    }
}

#[derive(Default)]
struct ClassifiedChunk {
    entities: Vec<LocalEntity>,
    conflicts: Vec<Conflict>,
    audits: Vec<AuditEntry>,
    /// Entities whose local values won and must be written to the remote
    push_backs: Vec<LocalEntity>,
}

// ============================================================================
// Retry
// ============================================================================

/// Retries transient failures with exponential backoff
async fn with_retry<T, F, Fut>(operation: &str, mut call: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut backoff = INITIAL_BACKOFF;
    for attempt in 1..=MAX_RETRIES {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient_error(&e) => {
                warn!(
                    operation,
                    attempt,
                    backoff_secs = backoff.as_secs(),
                    error = %e,
                    "transient error, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    call().await
}

/// Heuristic for errors worth retrying: network hiccups, remote throttling,
/// and local budget exhaustion all clear up with time
fn is_transient_error(error: &anyhow::Error) -> bool {
    let text = format!("{error:#}").to_lowercase();
    text.contains("timeout")
        || text.contains("timed out")
        || text.contains("connection")
        || text.contains("rate limit")
        || text.contains("rate budget")
        || text.contains("unavailable")
        || text.contains("429")
        || text.contains("502")
        || text.contains("503")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pipesync_core::domain::cursor::Cursor;
    use pipesync_core::domain::entity::{ChangeRecord, FieldMap};
    use pipesync_core::domain::newtypes::RemoteRecordId;
    use pipesync_core::domain::session::SessionStatus;
    use pipesync_core::ports::remote_crm::UpdateOutcome;
    use pipesync_core::ports::state_repository::ConflictFilter;
    use pipesync_store::{DatabasePool, SqliteStateRepository};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
            + chrono::Duration::seconds(i64::from(secs))
    }

    fn rid(i: u64) -> RemoteRecordId {
        RemoteRecordId::new(format!("rec-{i:05}")).unwrap()
    }

    /// Generates deterministic records over full-export offsets
    struct PagedRemote {
        total: u64,
        page_size: u64,
        delay: Duration,
        cursor_valid: bool,
        /// Errors returned (in order) before fetches start succeeding
        fetch_errors: StdMutex<VecDeque<String>>,
        /// Permanent failure once the requested offset reaches this
        fail_at_offset: Option<u64>,
        pushed: StdMutex<Vec<RecordUpdate>>,
    }

    impl PagedRemote {
        fn new(total: u64, page_size: u64) -> Self {
            Self {
                total,
                page_size,
                delay: Duration::ZERO,
                cursor_valid: true,
                fetch_errors: StdMutex::new(VecDeque::new()),
                fail_at_offset: None,
                pushed: StdMutex::new(Vec::new()),
            }
        }

        fn record(&self, i: u64, session_id: SessionId) -> ChangeRecord {
            let mut payload = FieldMap::new();
            payload.insert("stage".to_string(), json!("Proposal"));
            payload.insert("amount".to_string(), json!(i));
            ChangeRecord {
                remote_id: rid(i),
                payload,
                remote_modified_at: ts(i as u32),
                deleted: false,
                session_id,
            }
        }
    }

    #[async_trait]
    impl IRemoteCrm for PagedRemote {
        async fn fetch_page(
            &self,
            session_id: SessionId,
            _kind: SessionKind,
            cursor: &Cursor,
        ) -> anyhow::Result<ChangePage> {
            if let Some(message) = self.fetch_errors.lock().unwrap().pop_front() {
                anyhow::bail!("{message}");
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let CursorState::Full { offset } = cursor.decode()? else {
                anyhow::bail!("expected a full-export cursor");
            };
            if let Some(limit) = self.fail_at_offset {
                if offset >= limit {
                    anyhow::bail!("invalid api token");
                }
            }
            let end = (offset + self.page_size).min(self.total);
            let records: Vec<ChangeRecord> =
                (offset..end).map(|i| self.record(i, session_id)).collect();
            Ok(ChangePage {
                records,
                next_cursor: CursorState::Full { offset: end }.encode(),
                has_more: end < self.total,
                records_total: Some(self.total),
                malformed: 0,
            })
        }

        async fn validate_cursor(&self, _cursor: &Cursor) -> anyhow::Result<bool> {
            Ok(self.cursor_valid)
        }

        async fn update_records(
            &self,
            updates: &[RecordUpdate],
        ) -> anyhow::Result<Vec<UpdateOutcome>> {
            self.pushed.lock().unwrap().extend_from_slice(updates);
            Ok(updates
                .iter()
                .map(|u| UpdateOutcome {
                    remote_id: u.remote_id.clone(),
                    error: None,
                })
                .collect())
        }
    }

    /// Serves pre-built pages in order
    struct ScriptedRemote {
        pages: StdMutex<VecDeque<ChangePage>>,
        seen_cursors: StdMutex<Vec<Cursor>>,
        pushed: StdMutex<Vec<RecordUpdate>>,
    }

    impl ScriptedRemote {
        fn new(pages: Vec<ChangePage>) -> Self {
            Self {
                pages: StdMutex::new(pages.into()),
                seen_cursors: StdMutex::new(Vec::new()),
                pushed: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl IRemoteCrm for ScriptedRemote {
        async fn fetch_page(
            &self,
            _session_id: SessionId,
            _kind: SessionKind,
            cursor: &Cursor,
        ) -> anyhow::Result<ChangePage> {
            self.seen_cursors.lock().unwrap().push(cursor.clone());
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no more scripted pages"))
        }

        async fn validate_cursor(&self, _cursor: &Cursor) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn update_records(
            &self,
            updates: &[RecordUpdate],
        ) -> anyhow::Result<Vec<UpdateOutcome>> {
            self.pushed.lock().unwrap().extend_from_slice(updates);
            Ok(updates
                .iter()
                .map(|u| UpdateOutcome {
                    remote_id: u.remote_id.clone(),
                    error: None,
                })
                .collect())
        }
    }

    fn page(
        records: Vec<ChangeRecord>,
        next_offset: u64,
        has_more: bool,
        malformed: u64,
    ) -> ChangePage {
        ChangePage {
            records,
            next_cursor: CursorState::Full {
                offset: next_offset,
            }
            .encode(),
            has_more,
            records_total: None,
            malformed,
        }
    }

    fn change(
        id: &str,
        pairs: &[(&str, serde_json::Value)],
        modified: DateTime<Utc>,
        deleted: bool,
    ) -> ChangeRecord {
        ChangeRecord {
            remote_id: RemoteRecordId::new(id).unwrap(),
            payload: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            remote_modified_at: modified,
            deleted,
            session_id: SessionId::new(),
        }
    }

    async fn repo() -> Arc<SqliteStateRepository> {
        let db = DatabasePool::in_memory().await.unwrap();
        Arc::new(SqliteStateRepository::new(db.pool().clone()))
    }

    fn orchestrator(
        remote: Arc<dyn IRemoteCrm + Send + Sync>,
        repository: Arc<dyn IStateRepository + Send + Sync>,
        policy: ConflictPolicy,
    ) -> SyncOrchestrator {
        SyncOrchestrator::new(remote, repository, policy, 1, 100)
    }

    async fn wait_terminal(
        repository: &Arc<SqliteStateRepository>,
        id: &SessionId,
    ) -> SyncSession {
        for _ in 0..500 {
            if let Some(session) = repository.get_session(id).await.unwrap() {
                if session.status().is_terminal() {
                    return session;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn test_full_sync_walks_all_pages() {
        let repository = repo().await;
        let remote = Arc::new(PagedRemote::new(12, 5));
        let orch = orchestrator(remote, repository.clone(), ConflictPolicy::ManualOnly);

        let id = orch.start_full().await.unwrap();
        let session = wait_terminal(&repository, &id).await;

        assert_eq!(*session.status(), SessionStatus::Completed);
        assert_eq!(session.records_processed(), 12);
        assert_eq!(session.records_total(), Some(12));
        assert_eq!(session.api_calls_made(), 3);
        assert_eq!(repository.count_active_entities().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_progress_events_follow_chunk_commits() {
        let repository = repo().await;
        let remote = Arc::new(PagedRemote::new(12, 5));
        let orch = orchestrator(remote, repository.clone(), ConflictPolicy::ManualOnly);
        let mut rx = orch.subscribe();

        let id = orch.start_full().await.unwrap();
        wait_terminal(&repository, &id).await;

        let mut checkpoints = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.phase == SyncPhase::Checkpointing
                && event.status == SessionStatus::Running
            {
                checkpoints.push(event.records_processed);
            }
        }
        assert_eq!(checkpoints, vec![5, 10, 12]);
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_running() {
        let repository = repo().await;
        let mut remote = PagedRemote::new(100, 5);
        remote.delay = Duration::from_millis(20);
        let orch = orchestrator(Arc::new(remote), repository.clone(), ConflictPolicy::ManualOnly);

        let id = orch.start_full().await.unwrap();
        match orch.start_full().await {
            Err(EngineError::AlreadyRunning(running)) => assert_eq!(running, id),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }

        orch.cancel(&id).await.unwrap();
        wait_terminal(&repository, &id).await;
    }

    #[tokio::test]
    async fn test_cancel_stops_at_chunk_boundary() {
        let repository = repo().await;
        let mut remote = PagedRemote::new(500, 5);
        remote.delay = Duration::from_millis(20);
        let orch = orchestrator(Arc::new(remote), repository.clone(), ConflictPolicy::ManualOnly);
        let mut rx = orch.subscribe();

        let id = orch.start_full().await.unwrap();
        // Wait for the first committed chunk, then cancel
        loop {
            let event = rx.recv().await.unwrap();
            if event.phase == SyncPhase::Checkpointing {
                break;
            }
        }
        orch.cancel(&id).await.unwrap();

        let session = wait_terminal(&repository, &id).await;
        assert_eq!(*session.status(), SessionStatus::Cancelled);
        // Only whole chunks are ever committed
        assert!(session.records_processed() > 0);
        assert_eq!(session.records_processed() % 5, 0);
        assert_eq!(
            repository.count_active_entities().await.unwrap(),
            session.records_processed()
        );
        let checkpoint = repository.get_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(checkpoint.records_processed, session.records_processed());
    }

    #[tokio::test]
    async fn test_resume_finishes_remaining_records() {
        let repository = repo().await;
        let remote = Arc::new(PagedRemote::new(12, 5));

        // A previous process committed the first chunk and died
        let mut session = SyncSession::new(SessionKind::Full, 1);
        session.start().unwrap();
        session.add_records_processed(5);
        session.advance_cursor(CursorState::Full { offset: 5 }.encode());
        let id = *session.id();
        repository.save_session(&session).await.unwrap();
        repository
            .apply_chunk(&ChunkWrite {
                session: session.clone(),
                entities: (0..5)
                    .map(|i| {
                        let mut fields = FieldMap::new();
                        fields.insert("stage".to_string(), json!("Proposal"));
                        fields.insert("amount".to_string(), json!(i));
                        LocalEntity::from_remote(rid(i), fields, ts(i as u32), ts(100))
                    })
                    .collect(),
                conflicts: vec![],
                audits: vec![],
                checkpoint: Checkpoint::new(id, CursorState::Full { offset: 5 }.encode(), 5),
            })
            .await
            .unwrap();

        let orch = orchestrator(remote, repository.clone(), ConflictPolicy::ManualOnly);
        let resumed = orch.resume().await.unwrap();
        assert_eq!(resumed, Some(id));

        let session = wait_terminal(&repository, &id).await;
        assert_eq!(*session.status(), SessionStatus::Completed);
        assert_eq!(session.records_processed(), 12);
        // No duplicates: entity writes are keyed upserts
        assert_eq!(repository.count_active_entities().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_resume_with_expired_cursor_fails_session() {
        let repository = repo().await;
        let mut remote = PagedRemote::new(12, 5);
        remote.cursor_valid = false;

        let mut session = SyncSession::new(SessionKind::Incremental, 1);
        session.start().unwrap();
        let id = *session.id();
        repository.save_session(&session).await.unwrap();
        repository
            .apply_chunk(&ChunkWrite {
                session: session.clone(),
                entities: vec![],
                conflicts: vec![],
                audits: vec![],
                checkpoint: Checkpoint::new(
                    id,
                    CursorState::incremental_start(ts(10)).encode(),
                    0,
                ),
            })
            .await
            .unwrap();

        let orch = orchestrator(Arc::new(remote), repository.clone(), ConflictPolicy::ManualOnly);
        assert_eq!(orch.resume().await.unwrap(), None);

        let session = repository.get_session(&id).await.unwrap().unwrap();
        assert!(matches!(session.status(), SessionStatus::Failed(_)));
        assert!(session.last_error().unwrap().contains("cursor"));
    }

    #[tokio::test]
    async fn test_transient_fetch_errors_are_retried() {
        let repository = repo().await;
        // Real time: a paused clock auto-advances past the sqlx pool's
        // acquire timeout while queries run on the sqlite worker thread,
        // so this test sleeps through the 1s+2s retry backoffs instead.
        let remote = PagedRemote::new(5, 5);
        {
            let mut errors = remote.fetch_errors.lock().unwrap();
            errors.push_back("connection reset by peer".to_string());
            errors.push_back("rate budget exhausted for this window".to_string());
        }
        let orch = orchestrator(Arc::new(remote), repository.clone(), ConflictPolicy::ManualOnly);

        let id = orch.start_full().await.unwrap();
        let session = wait_terminal(&repository, &id).await;
        assert_eq!(*session.status(), SessionStatus::Completed);
        assert_eq!(session.records_processed(), 5);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_session_and_keeps_checkpoint() {
        let repository = repo().await;
        let mut remote = PagedRemote::new(12, 5);
        remote.fail_at_offset = Some(5);
        let orch = orchestrator(Arc::new(remote), repository.clone(), ConflictPolicy::ManualOnly);

        let id = orch.start_full().await.unwrap();
        let session = wait_terminal(&repository, &id).await;

        assert!(matches!(session.status(), SessionStatus::Failed(_)));
        assert!(session.last_error().unwrap().contains("invalid api token"));
        // The first chunk stays committed and resumable
        assert_eq!(session.records_processed(), 5);
        let checkpoint = repository.get_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(checkpoint.records_processed, 5);
        assert_eq!(
            checkpoint.cursor.decode().unwrap(),
            CursorState::Full { offset: 5 }
        );
    }

    #[tokio::test]
    async fn test_incremental_starts_from_stored_watermark() {
        let repository = repo().await;
        let mut fields = FieldMap::new();
        fields.insert("stage".to_string(), json!("Won"));
        repository
            .save_entity(&LocalEntity::from_remote(
                RemoteRecordId::new("opp-9").unwrap(),
                fields,
                ts(42),
                ts(43),
            ))
            .await
            .unwrap();

        let remote = Arc::new(ScriptedRemote::new(vec![page(vec![], 0, false, 0)]));
        let orch = orchestrator(remote.clone(), repository.clone(), ConflictPolicy::ManualOnly);
        let id = orch.start_incremental().await.unwrap();
        wait_terminal(&repository, &id).await;

        let seen = remote.seen_cursors.lock().unwrap();
        match seen[0].decode().unwrap() {
            CursorState::Incremental { watermark, .. } => assert_eq!(watermark, ts(42)),
            other => panic!("expected incremental cursor, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_conflict_recorded_and_local_value_kept() {
        let repository = repo().await;
        let mut fields = FieldMap::new();
        fields.insert("stage".to_string(), json!("Proposal"));
        let mut entity = LocalEntity::from_remote(
            RemoteRecordId::new("opp-1").unwrap(),
            fields,
            ts(0),
            ts(1),
        );
        entity.set_field("stage", json!("Negotiation"), ts(10));
        repository.save_entity(&entity).await.unwrap();

        let remote = Arc::new(ScriptedRemote::new(vec![page(
            vec![change(
                "opp-1",
                &[("stage", json!("Closed Lost"))],
                ts(20),
                false,
            )],
            1,
            false,
            0,
        )]));
        let orch = orchestrator(remote, repository.clone(), ConflictPolicy::ManualOnly);
        let id = orch.start_incremental().await.unwrap();
        wait_terminal(&repository, &id).await;

        let conflicts = repository
            .list_conflicts(&ConflictFilter::unresolved())
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].local_values()["stage"], json!("Negotiation"));
        assert_eq!(conflicts[0].remote_values()["stage"], json!("Closed Lost"));

        let entity = repository
            .get_entity(&RemoteRecordId::new("opp-1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*entity.status(), EntityStatus::Conflicted);
        assert_eq!(entity.fields()["stage"], json!("Negotiation"));
    }

    #[tokio::test]
    async fn test_local_wins_policy_pushes_back() {
        let repository = repo().await;
        let mut fields = FieldMap::new();
        fields.insert("stage".to_string(), json!("Proposal"));
        let mut entity = LocalEntity::from_remote(
            RemoteRecordId::new("opp-1").unwrap(),
            fields,
            ts(0),
            ts(1),
        );
        entity.set_field("stage", json!("Negotiation"), ts(10));
        repository.save_entity(&entity).await.unwrap();

        let remote = Arc::new(ScriptedRemote::new(vec![page(
            vec![change(
                "opp-1",
                &[("stage", json!("Closed Lost"))],
                ts(20),
                false,
            )],
            1,
            false,
            0,
        )]));
        let orch = orchestrator(remote.clone(), repository.clone(), ConflictPolicy::LocalWins);
        let id = orch.start_incremental().await.unwrap();
        let session = wait_terminal(&repository, &id).await;
        assert_eq!(*session.status(), SessionStatus::Completed);

        let pushed = remote.pushed.lock().unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].fields["stage"], json!("Negotiation"));

        let entity = repository
            .get_entity(&RemoteRecordId::new("opp-1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*entity.status(), EntityStatus::Synced);
        assert_eq!(entity.fields()["stage"], json!("Negotiation"));

        let conflicts = repository
            .list_conflicts(&ConflictFilter::default())
            .await
            .unwrap();
        assert_eq!(
            conflicts[0].resolution_status(),
            ResolutionStatus::ResolvedLocal
        );
    }

    #[tokio::test]
    async fn test_remote_deletion_tombstones_entity() {
        let repository = repo().await;
        let mut fields = FieldMap::new();
        fields.insert("stage".to_string(), json!("Proposal"));
        repository
            .save_entity(&LocalEntity::from_remote(
                RemoteRecordId::new("opp-1").unwrap(),
                fields,
                ts(0),
                ts(1),
            ))
            .await
            .unwrap();

        let remote = Arc::new(ScriptedRemote::new(vec![page(
            vec![change("opp-1", &[], ts(20), true)],
            1,
            false,
            0,
        )]));
        let orch = orchestrator(remote, repository.clone(), ConflictPolicy::ManualOnly);
        let id = orch.start_incremental().await.unwrap();
        wait_terminal(&repository, &id).await;

        let entity = repository
            .get_entity(&RemoteRecordId::new("opp-1").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*entity.status(), EntityStatus::Tombstoned);
        assert_eq!(repository.count_active_entities().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_records_counted_not_fatal() {
        let repository = repo().await;
        let remote = Arc::new(ScriptedRemote::new(vec![page(
            vec![change("opp-1", &[("stage", json!("Won"))], ts(20), false)],
            3,
            false,
            2,
        )]));
        let orch = orchestrator(remote, repository.clone(), ConflictPolicy::ManualOnly);
        let id = orch.start_full().await.unwrap();
        let session = wait_terminal(&repository, &id).await;

        assert_eq!(*session.status(), SessionStatus::Completed);
        assert_eq!(session.record_errors(), 2);
        assert_eq!(session.records_processed(), 3);
        assert_eq!(repository.count_active_entities().await.unwrap(), 1);
    }

    #[test]
    fn test_transient_error_heuristic() {
        assert!(is_transient_error(&anyhow::anyhow!(
            "connection reset by peer"
        )));
        assert!(is_transient_error(&anyhow::anyhow!(
            "rate limited by the remote, retry after 30s"
        )));
        assert!(is_transient_error(&anyhow::anyhow!("request timed out")));
        assert!(!is_transient_error(&anyhow::anyhow!("invalid api token")));
        assert!(!is_transient_error(&anyhow::anyhow!(
            "record payload is not an object"
        )));
    }
}
