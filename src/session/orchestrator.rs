use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cli::config::{PoolSettings, SessionSettings};
use crate::credentials::{CredentialOutcome, CredentialPool};
use crate::dedup::{DedupEngine, Verdict};
use crate::error::{OrchestratorError, Result};
use crate::platform::Platform;
use crate::queue::{QueueStatus, RoleLocationQueue, RoleLocationQueueEntry};
use crate::session::model::{
    BatchApplication, BatchApply, BatchKey, BatchOutcome, BatchProgress, JobLogFilter, JobLogStatus,
    PlatformFinish, PlatformOutcome, PlatformStatus, ScrapeSession, SessionDetail, SessionFilter,
    SessionJobLog, SessionJobs, SessionPlatformStatus, SessionStatus, TerminationReport,
};
use crate::session::stats::DashboardStats;
use crate::storage::{Page, PostingStore, SessionStore};
use crate::utils::Clock;

const TIMEOUT_MESSAGE: &str = "timeout";
const OPERATOR_MESSAGE: &str = "terminated by operator";

/// Why a session is being terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Operator,
    Timeout,
}

impl Termination {
    /// Status given to platforms that had not finished
    fn platform_status(self) -> PlatformStatus {
        match self {
            Termination::Operator => PlatformStatus::Skipped,
            Termination::Timeout => PlatformStatus::Failed,
        }
    }

    fn message(self) -> &'static str {
        match self {
            Termination::Operator => OPERATOR_MESSAGE,
            Termination::Timeout => TIMEOUT_MESSAGE,
        }
    }
}

/// In-process state of a live session: the cancellation token handed to
/// workers and one lane lock per platform. Ordering itself is enforced by
/// the store, the lane only keeps this process from racing itself.
#[derive(Debug, Default)]
struct SessionRuntime {
    cancel: CancellationToken,
    lanes: Mutex<HashMap<Platform, Arc<AsyncMutex<()>>>>,
}

impl SessionRuntime {
    fn lane(&self, platform: Platform) -> Arc<AsyncMutex<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(lanes.entry(platform).or_default())
    }
}

/// Top-level coordinator: turns queue entries into sessions, leases
/// credentials, applies worker batches through the dedup engine and
/// resolves sessions to a terminal state.
pub struct SessionOrchestrator {
    sessions: Arc<dyn SessionStore>,
    postings: Arc<dyn PostingStore>,
    pool: Arc<CredentialPool>,
    queue: Arc<RoleLocationQueue>,
    dedup: Arc<DedupEngine>,
    clock: Arc<dyn Clock>,
    settings: SessionSettings,
    runtimes: Mutex<HashMap<String, Arc<SessionRuntime>>>,
}

impl SessionOrchestrator {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        postings: Arc<dyn PostingStore>,
        pool: Arc<CredentialPool>,
        queue: Arc<RoleLocationQueue>,
        dedup: Arc<DedupEngine>,
        clock: Arc<dyn Clock>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            sessions,
            postings,
            pool,
            queue,
            dedup,
            clock,
            settings,
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    pub fn credential_pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<RoleLocationQueue> {
        &self.queue
    }

    /// Dequeue the next approved entry and start a session for it
    pub async fn dispatch_next(&self) -> Result<Option<SessionDetail>> {
        match self.queue.dequeue_next().await? {
            Some(entry) => self.create_session(&entry).await.map(Some),
            None => {
                debug!("Nothing approved to dispatch");
                Ok(None)
            }
        }
    }

    /// Start a session for an entry this orchestrator already moved to
    /// `processing`. Platforms that get no credential fail on their own;
    /// when none get one the session fails and the entry goes back.
    pub async fn create_session(&self, entry: &RoleLocationQueueEntry) -> Result<SessionDetail> {
        if entry.queue_status != QueueStatus::Processing {
            return Err(OrchestratorError::invalid_transition(
                "queue entry",
                entry.queue_status,
                "session started",
            ));
        }

        let now = self.clock.now();
        let session_id = Uuid::new_v4().to_string();
        let platforms = self.settings.platforms.clone();

        let session = ScrapeSession {
            session_id: session_id.clone(),
            role_location_queue_id: entry.id.clone(),
            role_id: entry.global_role_id.clone(),
            location: entry.location.clone(),
            status: SessionStatus::InProgress,
            platforms_total: platforms.len() as u32,
            platforms_completed: 0,
            platforms_failed: 0,
            jobs_found: 0,
            jobs_imported: 0,
            jobs_skipped: 0,
            total_batches: 0,
            completed_batches: 0,
            started_at: now,
            completed_at: None,
            last_progress_at: now,
            error_message: None,
        };
        let rows: Vec<_> = platforms
            .iter()
            .map(|p| SessionPlatformStatus::pending(&session_id, *p))
            .collect();

        if let Err(e) = self.sessions.insert_session(&session, &rows).await {
            error!("Failed to record session for entry {}: {}", entry.id, e);
            self.hand_back(&entry.id).await;
            return Err(e);
        }
        self.runtime(&session_id);

        info!(
            "Session {} started for {} in {} on {} platform(s)",
            session_id,
            entry.global_role_id,
            entry.location,
            platforms.len()
        );

        let leases = join_all(
            platforms
                .iter()
                .map(|platform| self.pool.acquire(*platform, &session_id)),
        )
        .await;

        let mut leased = 0;
        for (platform, lease) in platforms.iter().copied().zip(leases) {
            let failure = match lease {
                Ok(credential) => {
                    match self
                        .sessions
                        .set_platform_credential(&session_id, platform, &credential.id)
                        .await
                    {
                        Ok(()) => {
                            leased += 1;
                            continue;
                        }
                        Err(e) => {
                            if let Err(release_err) =
                                self.pool.relinquish(&credential.id, &session_id).await
                            {
                                warn!(
                                    "Failed to hand back credential {}: {}",
                                    credential.id, release_err
                                );
                            }
                            e
                        }
                    }
                }
                Err(e) => e,
            };

            warn!(
                "Platform {} of session {} cannot start: {}",
                platform, session_id, failure
            );
            self.sessions
                .finish_platform(&PlatformFinish {
                    session_id: session_id.clone(),
                    platform,
                    status: PlatformStatus::Failed,
                    error_message: Some(failure.to_string()),
                    at: self.clock.now(),
                })
                .await?;
        }

        if leased == 0 {
            warn!("Session {} has no usable platform, failing it", session_id);
            self.resolve_if_done(&session_id).await?;
        }

        self.get_session(&session_id).await
    }

    /// Apply one worker batch. Batches are applied strictly in index order
    /// per platform; early ones are held in storage, replays are no-ops.
    pub async fn record_batch_progress(
        &self,
        session_id: &str,
        platform: Platform,
        progress: BatchProgress,
    ) -> Result<BatchOutcome> {
        self.live_session(session_id).await?;
        let runtime = self.runtime(session_id);
        if runtime.cancel.is_cancelled() {
            return Err(OrchestratorError::SessionTerminatedByOperator {
                session_id: session_id.to_string(),
            });
        }

        let lane = runtime.lane(platform);
        let _guard = lane.lock().await;

        // Re-read under the lane lock; a terminate may have won the race.
        self.live_session(session_id).await?;
        let row = self.live_platform(session_id, platform).await?;
        let next_expected = row.completed_batches;
        let index = progress.batch_index;

        if index < next_expected {
            debug!("Batch {} of {}/{} already applied", index, session_id, platform);
            return Ok(BatchOutcome::Duplicate);
        }

        if index > next_expected {
            let ahead = index - next_expected;
            if ahead > self.settings.max_batches_ahead {
                return Err(OrchestratorError::Validation(format!(
                    "batch {} of {}/{} is {} ahead of batch {}; at most {} may wait",
                    index,
                    session_id,
                    platform,
                    ahead,
                    next_expected,
                    self.settings.max_batches_ahead
                )));
            }

            let now = self.clock.now();
            if !self
                .sessions
                .park_batch(session_id, platform, &progress, now)
                .await?
            {
                return Ok(BatchOutcome::Duplicate);
            }
            self.sessions.touch_session(session_id, now).await?;
            debug!(
                "Holding batch {} of {}/{} until {} arrives",
                index, session_id, platform, next_expected
            );

            // Another process may have closed the gap while this batch was
            // being parked.
            let applied = self.drain(session_id, platform, None, &runtime).await?;
            if applied > 0 {
                return Ok(BatchOutcome::Applied {
                    applied_batches: applied,
                });
            }
            let waiting_for = self.live_platform(session_id, platform).await?.completed_batches;
            return Ok(BatchOutcome::Buffered { waiting_for });
        }

        match self
            .drain(session_id, platform, Some(progress), &runtime)
            .await?
        {
            0 => Ok(BatchOutcome::Duplicate),
            applied => Ok(BatchOutcome::Applied {
                applied_batches: applied,
            }),
        }
    }

    /// Apply `first`, or the held batch the platform expects next, then
    /// every held batch that directly follows. Returns how many applied.
    async fn drain(
        &self,
        session_id: &str,
        platform: Platform,
        first: Option<BatchProgress>,
        runtime: &SessionRuntime,
    ) -> Result<u32> {
        let row = self.live_platform(session_id, platform).await?;
        let mut next_expected = row.completed_batches;
        let mut jobs_before = row.jobs_found;

        let mut pending = match first {
            Some(batch) => Some(batch),
            None => {
                self.sessions
                    .take_parked_batch(session_id, platform, next_expected)
                    .await?
            }
        };

        let mut applied = 0;
        while let Some(batch) = pending.take() {
            let found = batch.records.len() as u64;
            match self
                .apply_batch(session_id, platform, &batch, jobs_before)
                .await?
            {
                BatchApply::Applied => {
                    applied += 1;
                    jobs_before += found;
                    next_expected += 1;
                }
                BatchApply::AlreadyApplied => break,
                BatchApply::OutOfOrder { expected } => {
                    debug!(
                        "Batch {} of {}/{} overtaken, store expects {}",
                        batch.batch_index, session_id, platform, expected
                    );
                    self.sessions
                        .park_batch(session_id, platform, &batch, self.clock.now())
                        .await?;
                    break;
                }
            }

            if runtime.cancel.is_cancelled() {
                break;
            }
            pending = self
                .sessions
                .take_parked_batch(session_id, platform, next_expected)
                .await?;
        }
        Ok(applied)
    }

    async fn apply_batch(
        &self,
        session_id: &str,
        platform: Platform,
        batch: &BatchProgress,
        jobs_before: u64,
    ) -> Result<BatchApply> {
        let mut logs = Vec::with_capacity(batch.records.len());

        for (offset, record) in batch.records.iter().enumerate() {
            let now = self.clock.now();
            let outcome = self
                .dedup
                .process(platform, session_id, record, self.postings.as_ref(), now)
                .await;

            let status = match &outcome.verdict {
                Verdict::Import => JobLogStatus::Imported,
                Verdict::Skip { .. } => JobLogStatus::Skipped,
                Verdict::Error { .. } => JobLogStatus::Error,
            };

            logs.push(SessionJobLog {
                session_id: session_id.to_string(),
                platform_name: platform,
                batch_index: batch.batch_index,
                job_index: jobs_before + offset as u64,
                status,
                skip_reason: outcome.verdict.skip_reason(),
                duplicate_job_id: outcome.duplicate_job_id().map(str::to_string),
                imported_job_id: outcome.imported_job_id.clone(),
                external_job_id: record.external_job_id.clone(),
                title: record.title.clone(),
                company: record.company.clone(),
                error_message: outcome.error_message().map(str::to_string),
                created_at: now,
            });
        }

        let application = BatchApplication {
            key: BatchKey {
                session_id: session_id.to_string(),
                platform,
                batch_index: batch.batch_index,
            },
            total_batches_hint: batch.total_batches,
            logs,
            applied_at: self.clock.now(),
        };

        let applied = self.sessions.apply_batch(&application).await?;
        if applied == BatchApply::Applied {
            let counts = application.counts();
            info!(
                "Applied batch {} of {}/{}: {} found, {} imported, {} skipped",
                batch.batch_index,
                session_id,
                platform,
                counts.found,
                counts.imported,
                counts.skipped
            );
        }
        Ok(applied)
    }

    /// A worker finished a platform. Releases its credential and resolves
    /// the session once every platform is terminal.
    pub async fn complete_platform(
        &self,
        session_id: &str,
        platform: Platform,
        outcome: PlatformOutcome,
        credential_outcome: CredentialOutcome,
    ) -> Result<SessionDetail> {
        self.live_session(session_id).await?;
        let runtime = self.runtime(session_id);
        let lane = runtime.lane(platform);
        let guard = lane.lock().await;

        self.live_session(session_id).await?;
        let row = self.live_platform(session_id, platform).await?;

        let (status, error_message) = match outcome {
            PlatformOutcome::Completed => (PlatformStatus::Completed, None),
            PlatformOutcome::Failed => {
                let message = match (&credential_outcome, &row.credential_id) {
                    (CredentialOutcome::Failure { message }, Some(credential_id)) => {
                        OrchestratorError::PlatformAuthFailure {
                            platform,
                            credential_id: credential_id.clone(),
                            message: message
                                .clone()
                                .unwrap_or_else(|| "no reason given".to_string()),
                        }
                        .to_string()
                    }
                    _ => format!("{} worker reported failure", platform),
                };
                (PlatformStatus::Failed, Some(message))
            }
        };

        let finished = self
            .sessions
            .finish_platform(&PlatformFinish {
                session_id: session_id.to_string(),
                platform,
                status,
                error_message,
                at: self.clock.now(),
            })
            .await?;
        if !finished {
            return Err(OrchestratorError::invalid_transition(
                "platform",
                row.status,
                status,
            ));
        }
        info!("Platform {} of session {} is {}", platform, session_id, status);

        let dropped = self
            .sessions
            .discard_parked_batches(session_id, Some(platform))
            .await?;
        if dropped > 0 {
            warn!(
                "Platform {} of session {} finished with {} batch(es) still waiting",
                platform, session_id, dropped
            );
        }

        if let Some(credential_id) = &row.credential_id {
            if let Err(e) = self
                .pool
                .release(credential_id, session_id, credential_outcome)
                .await
            {
                warn!(
                    "Could not release credential {} for session {}: {}",
                    credential_id, session_id, e
                );
            }
        }
        drop(guard);

        self.resolve_if_done(session_id).await?;
        self.get_session(session_id).await
    }

    /// Operator stop: cancel workers, drain in-flight batches, release
    /// credentials and hand the entry back to the queue.
    pub async fn terminate_session(&self, session_id: &str) -> Result<TerminationReport> {
        let session = self.live_session(session_id).await?;
        self.terminate(session, Termination::Operator).await
    }

    async fn terminate(
        &self,
        session: ScrapeSession,
        reason: Termination,
    ) -> Result<TerminationReport> {
        let session_id = session.session_id.as_str();
        let runtime = self.runtime(session_id);
        runtime.cancel.cancel();

        // Holding every lane waits out batches that are mid-application.
        let mut platforms: Vec<Platform> = self
            .sessions
            .platform_statuses(session_id)
            .await?
            .into_iter()
            .map(|row| row.platform_name)
            .collect();
        platforms.sort();
        let lanes: Vec<_> = platforms.iter().map(|p| runtime.lane(*p)).collect();
        let mut guards = Vec::with_capacity(lanes.len());
        for lane in &lanes {
            guards.push(lane.lock().await);
        }

        let now = self.clock.now();
        let terminated = self
            .sessions
            .finish_session(
                session_id,
                SessionStatus::Terminated,
                Some(reason.message()),
                now,
            )
            .await?;
        if !terminated {
            let current = self.fetch_session(session_id).await?;
            return Err(OrchestratorError::invalid_transition(
                "session",
                current.status,
                SessionStatus::Terminated,
            ));
        }

        for row in self.sessions.platform_statuses(session_id).await? {
            if row.status.is_terminal() {
                continue;
            }
            self.sessions
                .finish_platform(&PlatformFinish {
                    session_id: session_id.to_string(),
                    platform: row.platform_name,
                    status: reason.platform_status(),
                    error_message: Some(reason.message().to_string()),
                    at: now,
                })
                .await?;
        }
        let dropped = self.sessions.discard_parked_batches(session_id, None).await?;
        if dropped > 0 {
            debug!("Dropped {} held batch(es) of session {}", dropped, session_id);
        }
        drop(guards);

        self.release_leases(session_id, reason.message()).await;
        let role_returned_to_queue = self.hand_back(&session.role_location_queue_id).await;
        self.forget(session_id);

        let message = match (reason, role_returned_to_queue) {
            (Termination::Operator, true) => "Session terminated; role returned to the queue",
            (Termination::Operator, false) => "Session terminated; role could not be requeued",
            (Termination::Timeout, true) => "Session timed out; role returned to the queue",
            (Termination::Timeout, false) => "Session timed out; role could not be requeued",
        };
        info!("Session {}: {}", session_id, message);

        Ok(TerminationReport {
            session_id: session_id.to_string(),
            status: SessionStatus::Terminated,
            role_id: session.role_id.clone(),
            role_returned_to_queue,
            message: message.to_string(),
        })
    }

    /// Terminate every in-progress session idle for longer than the
    /// progress timeout. Returns how many were terminated.
    pub async fn sweep_timeouts(&self) -> Result<usize> {
        let now = self.clock.now();
        let timeout = self.settings.progress_timeout();
        let live = self
            .sessions
            .list_sessions(&SessionFilter {
                status: Some(SessionStatus::InProgress),
                ..Default::default()
            })
            .await?;

        let mut terminated = 0;
        for session in live {
            if now - session.last_progress_at < timeout {
                continue;
            }

            let timeout_error = OrchestratorError::PlatformTimeout {
                session_id: session.session_id.clone(),
                seconds: self.settings.progress_timeout_secs,
            };
            warn!("{}", timeout_error);

            let session_id = session.session_id.clone();
            match self.terminate(session, Termination::Timeout).await {
                Ok(_) => terminated += 1,
                Err(OrchestratorError::InvalidTransition { .. }) => {
                    debug!("Session {} resolved before the timeout sweep", session_id);
                }
                Err(e) => error!("Failed to time out session {}: {}", session_id, e),
            }
        }
        Ok(terminated)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionDetail> {
        let session = self.fetch_session(session_id).await?;
        let platform_statuses = self.sessions.platform_statuses(session_id).await?;
        Ok(SessionDetail {
            session,
            platform_statuses,
        })
    }

    pub async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<ScrapeSession>> {
        self.sessions.list_sessions(filter).await
    }

    pub async fn session_jobs(
        &self,
        session_id: &str,
        filter: &JobLogFilter,
        page: Page,
    ) -> Result<SessionJobs> {
        self.fetch_session(session_id).await?;
        let jobs = self.sessions.job_logs(session_id, filter, page).await?;
        let summary = self.sessions.job_log_summary(session_id).await?;
        Ok(SessionJobs {
            session_id: session_id.to_string(),
            jobs,
            summary,
        })
    }

    pub async fn stats(&self) -> Result<DashboardStats> {
        DashboardStats::collect(self, self.clock.now()).await
    }

    /// Token a worker polls to stop cooperatively
    pub async fn cancellation_token(&self, session_id: &str) -> Result<CancellationToken> {
        self.live_session(session_id).await?;
        Ok(self.runtime(session_id).cancel.clone())
    }

    /// Run the cooldown and timeout sweeps until `shutdown` fires
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        pool_settings: &PoolSettings,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let cooldown_every = pool_settings.cooldown_sweep_interval();
        let timeout_every = self.settings.timeout_sweep_interval();

        tokio::spawn(async move {
            let mut cooldowns = tokio::time::interval(cooldown_every.max(Duration::from_secs(1)));
            let mut timeouts = tokio::time::interval(timeout_every.max(Duration::from_secs(1)));

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Maintenance loop shutting down");
                        break;
                    }
                    _ = cooldowns.tick() => {
                        if let Err(e) = orchestrator.pool.sweep_cooldowns().await {
                            warn!("Cooldown sweep failed: {}", e);
                        }
                    }
                    _ = timeouts.tick() => {
                        if let Err(e) = orchestrator.sweep_timeouts().await {
                            warn!("Timeout sweep failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Resolve the session when all of its platforms are terminal
    async fn resolve_if_done(&self, session_id: &str) -> Result<()> {
        let rows = self.sessions.platform_statuses(session_id).await?;
        if rows.iter().any(|row| !row.status.is_terminal()) {
            return Ok(());
        }

        let session = self.fetch_session(session_id).await?;
        let succeeded = rows
            .iter()
            .any(|row| row.status == PlatformStatus::Completed);
        let (status, error_message) = if succeeded {
            (SessionStatus::Completed, None)
        } else {
            (SessionStatus::Failed, Some("all platforms failed"))
        };

        let resolved = self
            .sessions
            .finish_session(session_id, status, error_message, self.clock.now())
            .await?;
        if !resolved {
            return Ok(());
        }
        self.forget(session_id);

        if succeeded {
            info!(
                "Session {} completed: {} imported, {} skipped",
                session_id, session.jobs_imported, session.jobs_skipped
            );
            if let Err(e) = self
                .queue
                .mark_completed(&session.role_location_queue_id, session.jobs_imported)
                .await
            {
                warn!(
                    "Could not mark queue entry {} completed: {}",
                    session.role_location_queue_id, e
                );
            }
        } else {
            warn!("Session {} failed on every platform", session_id);
            self.release_leases(session_id, "session failed").await;
            self.hand_back(&session.role_location_queue_id).await;
        }
        Ok(())
    }

    async fn release_leases(&self, session_id: &str, reason: &str) {
        let leased = match self.pool.leased_by(session_id).await {
            Ok(leased) => leased,
            Err(e) => {
                error!("Could not list credentials of session {}: {}", session_id, e);
                return;
            }
        };
        for credential in leased {
            if let Err(e) = self
                .pool
                .release(&credential.id, session_id, CredentialOutcome::failure(reason))
                .await
            {
                warn!("Could not release credential {}: {}", credential.id, e);
            }
        }
    }

    /// Return a queue entry to `approved`, logging rather than failing
    async fn hand_back(&self, entry_id: &str) -> bool {
        match self.queue.return_to_queue(entry_id).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Could not return queue entry {} to the queue: {}", entry_id, e);
                false
            }
        }
    }

    async fn fetch_session(&self, session_id: &str) -> Result<ScrapeSession> {
        self.sessions
            .get_session(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("session", session_id))
    }

    async fn live_session(&self, session_id: &str) -> Result<ScrapeSession> {
        let session = self.fetch_session(session_id).await?;
        if session.status.is_terminal() {
            return Err(OrchestratorError::invalid_transition(
                "session",
                session.status,
                "updated",
            ));
        }
        Ok(session)
    }

    async fn live_platform(
        &self,
        session_id: &str,
        platform: Platform,
    ) -> Result<SessionPlatformStatus> {
        let row = self
            .sessions
            .platform_statuses(session_id)
            .await?
            .into_iter()
            .find(|row| row.platform_name == platform)
            .ok_or_else(|| {
                OrchestratorError::not_found("session platform", format!("{}/{}", session_id, platform))
            })?;
        if row.status.is_terminal() {
            return Err(OrchestratorError::invalid_transition(
                "platform",
                row.status,
                "updated",
            ));
        }
        Ok(row)
    }

    fn runtime(&self, session_id: &str) -> Arc<SessionRuntime> {
        let mut runtimes = self.runtimes.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(runtimes.entry(session_id.to_string()).or_default())
    }

    fn forget(&self, session_id: &str) {
        let mut runtimes = self.runtimes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(runtime) = runtimes.remove(session_id) {
            runtime.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::OrchestratorConfig;
    use crate::credentials::CredentialStatus;
    use crate::dedup::SkipReason;
    use crate::test_support::{job, Harness};
    use chrono::Duration as ChronoDuration;
    use tokio_test::assert_err;

    fn batch(index: u32, records: Vec<crate::dedup::JobRecord>) -> BatchProgress {
        BatchProgress {
            batch_index: index,
            total_batches: None,
            records,
        }
    }

    #[tokio::test]
    async fn test_partial_platform_failure_still_completes() {
        let h = Harness::new(&[Platform::Linkedin, Platform::Glassdoor]);
        let linkedin = h.add_credential(Platform::Linkedin).await;
        let entry = h.approved_entry("role-1", "Austin").await;

        let detail = h.orchestrator.dispatch_next().await.unwrap().unwrap();
        let id = detail.session.session_id.clone();
        assert_eq!(detail.session.status, SessionStatus::InProgress);
        assert_eq!(detail.session.platforms_failed, 1);

        let glassdoor = detail
            .platform_statuses
            .iter()
            .find(|row| row.platform_name == Platform::Glassdoor)
            .unwrap();
        assert_eq!(glassdoor.status, PlatformStatus::Failed);
        assert!(glassdoor.error_message.as_deref().unwrap().contains("glassdoor"));

        h.orchestrator
            .record_batch_progress(&id, Platform::Linkedin, batch(0, vec![job("1", "Engineer")]))
            .await
            .unwrap();
        let detail = h
            .orchestrator
            .complete_platform(&id, Platform::Linkedin, PlatformOutcome::Completed, CredentialOutcome::Success)
            .await
            .unwrap();

        assert_eq!(detail.session.status, SessionStatus::Completed);
        assert_eq!(detail.session.platforms_completed, 1);
        assert_eq!(detail.session.platforms_failed, 1);
        assert!(detail.session.completed_at.is_some());

        let credential = h.pool.get(&linkedin.id).await.unwrap();
        assert_eq!(credential.status, CredentialStatus::Available);
        assert_eq!(credential.success_count, 1);

        let entry = h.queue.get(&entry.id).await.unwrap();
        assert_eq!(entry.queue_status, QueueStatus::Completed);
        assert_eq!(entry.total_jobs_scraped, 1);
    }

    #[tokio::test]
    async fn test_no_credentials_fails_session_and_requeues() {
        let h = Harness::new(&[Platform::Linkedin]);
        let entry = h.approved_entry("role-1", "Austin").await;

        let detail = h.orchestrator.dispatch_next().await.unwrap().unwrap();
        assert_eq!(detail.session.status, SessionStatus::Failed);
        assert_eq!(detail.session.platforms_failed, 1);
        assert_eq!(
            h.queue.get(&entry.id).await.unwrap().queue_status,
            QueueStatus::Approved
        );
    }

    #[tokio::test]
    async fn test_terminate_releases_and_requeues() {
        let h = Harness::new(&[Platform::Linkedin]);
        let credential = h.add_credential(Platform::Linkedin).await;
        let entry = h.approved_entry("role-1", "Austin").await;
        let detail = h.orchestrator.dispatch_next().await.unwrap().unwrap();
        let id = detail.session.session_id.clone();
        let token = h.orchestrator.cancellation_token(&id).await.unwrap();

        let report = h.orchestrator.terminate_session(&id).await.unwrap();
        assert_eq!(report.status, SessionStatus::Terminated);
        assert_eq!(report.role_id, "role-1");
        assert!(report.role_returned_to_queue);
        assert!(token.is_cancelled());

        let credential = h.pool.get(&credential.id).await.unwrap();
        assert_eq!(credential.status, CredentialStatus::Cooldown);
        assert!(credential.assigned_to_session_id.is_none());

        assert_eq!(
            h.queue.get(&entry.id).await.unwrap().queue_status,
            QueueStatus::Approved
        );

        let detail = h.orchestrator.get_session(&id).await.unwrap();
        assert_eq!(detail.session.status, SessionStatus::Terminated);
        assert_eq!(detail.platform_statuses[0].status, PlatformStatus::Skipped);
        assert_eq!(detail.session.platforms_failed, 0);

        // Terminal sessions reject further events.
        assert_err!(h.orchestrator.terminate_session(&id).await);
        assert_err!(
            h.orchestrator
                .record_batch_progress(&id, Platform::Linkedin, batch(0, vec![]))
                .await
        );
    }

    #[tokio::test]
    async fn test_replayed_batch_changes_nothing() {
        let h = Harness::new(&[Platform::Linkedin]);
        h.add_credential(Platform::Linkedin).await;
        h.approved_entry("role-1", "Austin").await;
        let id = h.dispatch().await;

        let records = vec![job("1", "Engineer"), job("2", "Designer")];
        let first = h
            .orchestrator
            .record_batch_progress(&id, Platform::Linkedin, batch(0, records.clone()))
            .await
            .unwrap();
        assert_eq!(first, BatchOutcome::Applied { applied_batches: 1 });
        let before = h.orchestrator.get_session(&id).await.unwrap();

        let replay = h
            .orchestrator
            .record_batch_progress(&id, Platform::Linkedin, batch(0, records))
            .await
            .unwrap();
        assert_eq!(replay, BatchOutcome::Duplicate);
        let after = h.orchestrator.get_session(&id).await.unwrap();
        assert_eq!(before.session, after.session);
        assert_eq!(before.platform_statuses, after.platform_statuses);
    }

    #[tokio::test]
    async fn test_out_of_order_batches_are_buffered() {
        let h = Harness::new(&[Platform::Linkedin]);
        h.add_credential(Platform::Linkedin).await;
        h.approved_entry("role-1", "Austin").await;
        let id = h.dispatch().await;

        let early = h
            .orchestrator
            .record_batch_progress(
                &id,
                Platform::Linkedin,
                BatchProgress {
                    batch_index: 1,
                    total_batches: Some(2),
                    records: vec![job("b", "Second")],
                },
            )
            .await
            .unwrap();
        assert_eq!(early, BatchOutcome::Buffered { waiting_for: 0 });
        assert_eq!(
            h.orchestrator.get_session(&id).await.unwrap().session.completed_batches,
            0
        );

        let gap_closed = h
            .orchestrator
            .record_batch_progress(&id, Platform::Linkedin, batch(0, vec![job("a", "First")]))
            .await
            .unwrap();
        assert_eq!(gap_closed, BatchOutcome::Applied { applied_batches: 2 });

        let detail = h.orchestrator.get_session(&id).await.unwrap();
        let row = &detail.platform_statuses[0];
        assert_eq!(row.completed_batches, 2);
        assert_eq!(row.total_batches, 2);
        assert_eq!(row.status, PlatformStatus::InProgress);

        let jobs = h
            .orchestrator
            .session_jobs(&id, &JobLogFilter::default(), Page::default())
            .await
            .unwrap();
        let indexes: Vec<_> = jobs.jobs.items.iter().map(|l| (l.batch_index, l.job_index)).collect();
        assert_eq!(indexes, vec![(0, 0), (1, 1)]);
    }

    #[tokio::test]
    async fn test_held_batch_survives_across_orchestrators() {
        let h = Harness::new(&[Platform::Linkedin]);
        h.add_credential(Platform::Linkedin).await;
        h.approved_entry("role-1", "Austin").await;
        let id = h.dispatch().await;
        let other = h.peer();

        let early = other
            .orchestrator
            .record_batch_progress(&id, Platform::Linkedin, batch(1, vec![job("b", "Second")]))
            .await
            .unwrap();
        assert_eq!(early, BatchOutcome::Buffered { waiting_for: 0 });

        // The predecessor lands on a different orchestrator, which still
        // finds and applies the held batch.
        let gap_closed = h
            .orchestrator
            .record_batch_progress(&id, Platform::Linkedin, batch(0, vec![job("a", "First")]))
            .await
            .unwrap();
        assert_eq!(gap_closed, BatchOutcome::Applied { applied_batches: 2 });

        let detail = h.orchestrator.get_session(&id).await.unwrap();
        assert_eq!(detail.session.completed_batches, 2);
        assert_eq!(detail.session.jobs_imported, 2);

        let replay = other
            .orchestrator
            .record_batch_progress(&id, Platform::Linkedin, batch(1, vec![job("b", "Second")]))
            .await
            .unwrap();
        assert_eq!(replay, BatchOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_batches_too_far_ahead_are_rejected() {
        let mut config = OrchestratorConfig::default();
        config.sessions.platforms = vec![Platform::Linkedin];
        config.sessions.max_batches_ahead = 2;
        let h = Harness::with_config(config);
        h.add_credential(Platform::Linkedin).await;
        h.approved_entry("role-1", "Austin").await;
        let id = h.dispatch().await;

        let held = h
            .orchestrator
            .record_batch_progress(&id, Platform::Linkedin, batch(2, vec![]))
            .await
            .unwrap();
        assert_eq!(held, BatchOutcome::Buffered { waiting_for: 0 });

        let err = h
            .orchestrator
            .record_batch_progress(&id, Platform::Linkedin, batch(3, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));

        // Once the window moves the same index is accepted.
        h.orchestrator
            .record_batch_progress(&id, Platform::Linkedin, batch(0, vec![]))
            .await
            .unwrap();
        let held = h
            .orchestrator
            .record_batch_progress(&id, Platform::Linkedin, batch(3, vec![]))
            .await
            .unwrap();
        assert_eq!(held, BatchOutcome::Buffered { waiting_for: 1 });

        let applied = h
            .orchestrator
            .record_batch_progress(&id, Platform::Linkedin, batch(1, vec![]))
            .await
            .unwrap();
        assert_eq!(applied, BatchOutcome::Applied { applied_batches: 3 });
    }

    #[tokio::test]
    async fn test_operator_credential_actions_keep_leases_exclusive() {
        let h = Harness::new(&[Platform::Linkedin]);
        let credential = h.add_credential(Platform::Linkedin).await;
        h.approved_entry("role-1", "Austin").await;
        h.approved_entry("role-2", "Austin").await;
        h.approved_entry("role-3", "Austin").await;
        let first = h.dispatch().await;

        // Pulled and put back while the first session still runs.
        h.pool.disable(&credential.id).await.unwrap();
        h.pool.enable(&credential.id).await.unwrap();
        let second = h.dispatch().await;
        let held = h.pool.get(&credential.id).await.unwrap();
        assert_eq!(held.assigned_to_session_id.as_deref(), Some(second.as_str()));

        let detail = h
            .orchestrator
            .complete_platform(&first, Platform::Linkedin, PlatformOutcome::Completed, CredentialOutcome::Success)
            .await
            .unwrap();
        assert_eq!(detail.session.status, SessionStatus::Completed);

        let held = h.pool.get(&credential.id).await.unwrap();
        assert_eq!(held.status, CredentialStatus::InUse);
        assert_eq!(held.assigned_to_session_id.as_deref(), Some(second.as_str()));
        assert_eq!(held.success_count, 0);

        // Nothing is free for the third entry while the second holds it.
        let third = h.orchestrator.dispatch_next().await.unwrap().unwrap();
        assert_eq!(third.session.status, SessionStatus::Failed);

        // A reset mid-session hands it over again; the old holder's
        // failure report must not touch the new lease.
        h.pool.reset(&credential.id).await.unwrap();
        let fourth = h.dispatch().await;
        h.orchestrator
            .complete_platform(
                &second,
                Platform::Linkedin,
                PlatformOutcome::Failed,
                CredentialOutcome::failure("login wall"),
            )
            .await
            .unwrap();

        let held = h.pool.get(&credential.id).await.unwrap();
        assert_eq!(held.status, CredentialStatus::InUse);
        assert_eq!(held.assigned_to_session_id.as_deref(), Some(fourth.as_str()));
        assert_eq!(held.failure_count, 0);
        assert!(held.is_consistent());
    }

    #[tokio::test]
    async fn test_processing_entry_cannot_be_approved_again() {
        let h = Harness::new(&[Platform::Linkedin]);
        h.add_credential(Platform::Linkedin).await;
        h.add_credential(Platform::Linkedin).await;
        let entry = h.approved_entry("role-1", "Austin").await;
        let id = h.dispatch().await;

        assert!(matches!(
            h.queue.approve(&entry.id).await.unwrap_err(),
            OrchestratorError::InvalidTransition { .. }
        ));
        let approved = h
            .queue
            .bulk_approve(Some(std::slice::from_ref(&entry.id)))
            .await
            .unwrap();
        assert!(approved.is_empty());
        assert!(h.orchestrator.dispatch_next().await.unwrap().is_none());

        let live = h
            .orchestrator
            .list_sessions(&SessionFilter {
                status: Some(SessionStatus::InProgress),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(live.len(), 1);

        // Handing back after termination is still allowed.
        h.orchestrator.terminate_session(&id).await.unwrap();
        assert_eq!(
            h.queue.get(&entry.id).await.unwrap().queue_status,
            QueueStatus::Approved
        );
    }

    #[tokio::test]
    async fn test_batch_counters_and_summary() {
        let h = Harness::new(&[Platform::Linkedin]);
        h.add_credential(Platform::Linkedin).await;
        h.approved_entry("role-1", "Austin").await;
        let id = h.dispatch().await;

        let mut missing = job("3", "No Company");
        missing.company = None;
        let records = vec![job("1", "Engineer"), job("1", "Engineer"), missing];
        h.orchestrator
            .record_batch_progress(&id, Platform::Linkedin, batch(0, records))
            .await
            .unwrap();

        let detail = h.orchestrator.get_session(&id).await.unwrap();
        assert_eq!(detail.session.jobs_found, 3);
        assert_eq!(detail.session.jobs_imported, 1);
        assert_eq!(detail.session.jobs_skipped, 2);

        let jobs = h
            .orchestrator
            .session_jobs(
                &id,
                &JobLogFilter {
                    status: Some(JobLogStatus::Skipped),
                    ..Default::default()
                },
                Page::default(),
            )
            .await
            .unwrap();
        assert_eq!(jobs.jobs.total, 2);
        assert_eq!(jobs.summary.total, 3);
        assert_eq!(jobs.summary.skip_reasons[&SkipReason::DuplicatePlatformId], 1);
        assert_eq!(jobs.summary.skip_reasons[&SkipReason::MissingRequired], 1);
        assert_eq!(jobs.summary.skip_reasons[&SkipReason::Error], 0);
    }

    #[tokio::test]
    async fn test_timeout_sweep_fails_open_platforms() {
        let h = Harness::new(&[Platform::Linkedin, Platform::Techfetch]);
        let credential = h.add_credential(Platform::Linkedin).await;
        h.add_credential(Platform::Techfetch).await;
        let entry = h.approved_entry("role-1", "Austin").await;
        let id = h.dispatch().await;

        h.orchestrator
            .complete_platform(&id, Platform::Techfetch, PlatformOutcome::Completed, CredentialOutcome::Success)
            .await
            .unwrap();

        h.clock.advance(ChronoDuration::minutes(29));
        assert_eq!(h.orchestrator.sweep_timeouts().await.unwrap(), 0);

        h.clock.advance(ChronoDuration::minutes(2));
        assert_eq!(h.orchestrator.sweep_timeouts().await.unwrap(), 1);

        let detail = h.orchestrator.get_session(&id).await.unwrap();
        assert_eq!(detail.session.status, SessionStatus::Terminated);
        assert_eq!(detail.session.error_message.as_deref(), Some("timeout"));
        assert_eq!(detail.session.platforms_completed, 1);
        assert_eq!(detail.session.platforms_failed, 1);

        assert_eq!(
            h.pool.get(&credential.id).await.unwrap().status,
            CredentialStatus::Cooldown
        );
        assert_eq!(
            h.queue.get(&entry.id).await.unwrap().queue_status,
            QueueStatus::Approved
        );
    }

    #[tokio::test]
    async fn test_failed_platforms_fail_session() {
        let h = Harness::new(&[Platform::Linkedin]);
        let credential = h.add_credential(Platform::Linkedin).await;
        let entry = h.approved_entry("role-1", "Austin").await;
        let id = h.dispatch().await;

        let detail = h
            .orchestrator
            .complete_platform(
                &id,
                Platform::Linkedin,
                PlatformOutcome::Failed,
                CredentialOutcome::failure("login wall"),
            )
            .await
            .unwrap();
        assert_eq!(detail.session.status, SessionStatus::Failed);
        assert!(detail.platform_statuses[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("login wall"));

        let credential = h.pool.get(&credential.id).await.unwrap();
        assert_eq!(credential.status, CredentialStatus::Cooldown);
        assert_eq!(credential.failure_count, 1);
        assert_eq!(
            h.queue.get(&entry.id).await.unwrap().queue_status,
            QueueStatus::Approved
        );

        assert_err!(
            h.orchestrator
                .complete_platform(&id, Platform::Linkedin, PlatformOutcome::Completed, CredentialOutcome::Success)
                .await
        );
    }

    #[tokio::test]
    async fn test_create_session_requires_processing_entry() {
        let h = Harness::new(&[Platform::Linkedin]);
        h.add_credential(Platform::Linkedin).await;
        let entry = h.approved_entry("role-1", "Austin").await;
        assert!(matches!(
            h.orchestrator.create_session(&entry).await.unwrap_err(),
            OrchestratorError::InvalidTransition { .. }
        ));
        assert!(h.orchestrator.dispatch_next().await.unwrap().is_some());
        assert!(h.orchestrator.dispatch_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_sessions_get_distinct_credentials() {
        let h = Harness::new(&[Platform::Linkedin]);
        h.add_credential(Platform::Linkedin).await;
        h.add_credential(Platform::Linkedin).await;
        for n in 0..3 {
            h.approved_entry(&format!("role-{}", n), "Austin").await;
        }

        let runs = join_all((0..3).map(|_| h.orchestrator.dispatch_next())).await;
        let mut in_progress = 0;
        let mut failed = 0;
        for run in runs {
            match run.unwrap().unwrap().session.status {
                SessionStatus::InProgress => in_progress += 1,
                SessionStatus::Failed => failed += 1,
                other => panic!("unexpected status {}", other),
            }
        }
        assert_eq!(in_progress, 2);
        assert_eq!(failed, 1);

        for credential in h.pool.list(&Default::default()).await.unwrap() {
            assert!(credential.is_consistent());
            assert_eq!(credential.status, CredentialStatus::InUse);
        }
    }
}
