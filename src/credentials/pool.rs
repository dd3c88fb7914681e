use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cli::config::PoolSettings;
use crate::credentials::model::{
    CredentialFilter, CredentialSecret, CredentialStatus, PlatformHealth, ScraperCredential,
};
use crate::credentials::policy::{CooldownPolicy, FailureDisposition};
use crate::error::{OrchestratorError, Result};
use crate::platform::Platform;
use crate::storage::CredentialStore;
use crate::utils::Clock;

/// How the work done with a credential ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialOutcome {
    Success,
    Failure { message: Option<String> },
}

impl CredentialOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        CredentialOutcome::Failure {
            message: Some(message.into()),
        }
    }
}

/// Owns the lifecycle of per-platform login credentials.
///
/// Every state change is a compare-and-swap on the credential's version, so
/// several orchestrator processes can share one store without a global lock.
pub struct CredentialPool {
    store: Arc<dyn CredentialStore>,
    policy: Arc<dyn CooldownPolicy>,
    clock: Arc<dyn Clock>,
    settings: PoolSettings,
}

impl CredentialPool {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        policy: Arc<dyn CooldownPolicy>,
        clock: Arc<dyn Clock>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            store,
            policy,
            clock,
            settings,
        }
    }

    /// Register a new credential in the `available` state
    pub async fn create(
        &self,
        platform: Platform,
        name: &str,
        secret: CredentialSecret,
    ) -> Result<ScraperCredential> {
        validate_secret(&secret)?;
        let name = name.trim();
        let name = if name.is_empty() {
            secret
                .display_identity()
                .unwrap_or_else(|| format!("{} credential", platform))
        } else {
            name.to_string()
        };

        let credential = ScraperCredential::new(
            Uuid::new_v4().to_string(),
            platform,
            name,
            secret,
            self.clock.now(),
        );
        self.store.insert_credential(&credential).await?;

        info!(
            "Created {} credential {} ({})",
            platform,
            credential.id,
            credential.secret.kind()
        );
        Ok(credential)
    }

    pub async fn get(&self, id: &str) -> Result<ScraperCredential> {
        self.store
            .get_credential(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("credential", id))
    }

    pub async fn list(&self, filter: &CredentialFilter) -> Result<Vec<ScraperCredential>> {
        let mut credentials = self.store.list_credentials(filter).await?;
        credentials.sort_by(|a, b| (a.platform, a.created_at).cmp(&(b.platform, b.created_at)));
        Ok(credentials)
    }

    /// Credentials currently leased to a session
    pub async fn leased_by(&self, session_id: &str) -> Result<Vec<ScraperCredential>> {
        self.store
            .list_credentials(&CredentialFilter {
                status: Some(CredentialStatus::InUse),
                assigned_to_session_id: Some(session_id.to_string()),
                ..Default::default()
            })
            .await
    }

    /// Lease an available credential of `platform` to `session_id`.
    ///
    /// Polls while the platform is exhausted, up to the configured wait
    /// timeout, then returns `CredentialExhausted`. Exhaustion never writes.
    pub async fn acquire(&self, platform: Platform, session_id: &str) -> Result<ScraperCredential> {
        let deadline = Instant::now() + self.settings.acquire_wait_timeout();

        loop {
            match self.try_acquire(platform, session_id).await {
                Err(OrchestratorError::CredentialExhausted { .. })
                    if Instant::now() + self.settings.acquire_poll_interval() <= deadline =>
                {
                    debug!("No {} credential available yet, waiting", platform);
                    sleep(self.settings.acquire_poll_interval()).await;
                }
                other => return other,
            }
        }
    }

    async fn try_acquire(&self, platform: Platform, session_id: &str) -> Result<ScraperCredential> {
        let mut last_conflict = None;

        for attempt in 0..=self.settings.max_cas_retries {
            let mut candidates = self
                .store
                .list_credentials(&CredentialFilter {
                    platform: Some(platform),
                    status: Some(CredentialStatus::Available),
                    ..Default::default()
                })
                .await?;

            if candidates.is_empty() {
                return Err(OrchestratorError::CredentialExhausted { platform });
            }

            candidates.sort_by(|a, b| {
                (a.idle_since(), a.created_at, &a.id).cmp(&(b.idle_since(), b.created_at, &b.id))
            });

            let now = self.clock.now();
            for candidate in candidates {
                let mut next = candidate.clone();
                next.status = CredentialStatus::InUse;
                next.assigned_to_session_id = Some(session_id.to_string());
                next.assigned_at = Some(now);
                next.cooldown_until = None;
                stamp(&mut next, candidate.version, now);

                if self
                    .store
                    .compare_and_swap_credential(candidate.version, &next)
                    .await?
                {
                    info!(
                        "Leased {} credential {} to session {}",
                        platform, next.id, session_id
                    );
                    return Ok(next);
                }

                debug!(
                    "Lost race for credential {} (attempt {}), trying next",
                    candidate.id, attempt
                );
                last_conflict = Some(candidate.id);
            }
        }

        Err(OrchestratorError::CredentialLocked {
            id: last_conflict.unwrap_or_default(),
        })
    }

    /// Return a credential leased to `session_id` and record how the work
    /// went. A credential now held by another session is left untouched.
    pub async fn release(
        &self,
        id: &str,
        session_id: &str,
        outcome: CredentialOutcome,
    ) -> Result<ScraperCredential> {
        let policy = Arc::clone(&self.policy);

        let released = self
            .transition(id, |current, now| {
                check_lease(current, session_id, "released")?;

                let mut next = current.clone();
                next.clear_assignment();
                next.last_used_at = Some(now);

                match &outcome {
                    CredentialOutcome::Success => {
                        next.status = CredentialStatus::Available;
                        next.success_count += 1;
                        next.last_success_at = Some(now);
                    }
                    CredentialOutcome::Failure { message } => {
                        next.failure_count += 1;
                        next.last_failure_at = Some(now);
                        next.last_failure_message = message.clone();

                        match policy.on_failure(next.failure_count) {
                            FailureDisposition::Cooldown(backoff) => {
                                next.status = CredentialStatus::Cooldown;
                                next.cooldown_until = Some(now + backoff);
                            }
                            FailureDisposition::Disable => {
                                next.status = CredentialStatus::Disabled;
                                next.cooldown_until = None;
                            }
                            FailureDisposition::Fail => {
                                next.status = CredentialStatus::Failed;
                                next.cooldown_until = None;
                            }
                        }
                    }
                }
                Ok(next)
            })
            .await?;

        match released.status {
            CredentialStatus::Available => debug!("Credential {} released", id),
            status => warn!(
                "Credential {} released after failure #{}: now {}",
                id, released.failure_count, status
            ),
        }
        Ok(released)
    }

    /// Put a leased credential back without counting a success or failure.
    /// Used when a lease was taken for a session that could not be recorded.
    pub async fn relinquish(&self, id: &str, session_id: &str) -> Result<ScraperCredential> {
        self.transition(id, |current, _now| {
            check_lease(current, session_id, CredentialStatus::Available)?;
            let mut next = current.clone();
            next.status = CredentialStatus::Available;
            next.clear_assignment();
            Ok(next)
        })
        .await
    }

    /// Operator action: clear failures and make the credential available
    pub async fn reset(&self, id: &str) -> Result<ScraperCredential> {
        let credential = self
            .transition(id, |current, _now| {
                let mut next = current.clone();
                next.status = CredentialStatus::Available;
                next.failure_count = 0;
                next.last_failure_at = None;
                next.last_failure_message = None;
                next.cooldown_until = None;
                next.clear_assignment();
                Ok(next)
            })
            .await?;
        info!("Credential {} reset", id);
        Ok(credential)
    }

    /// Operator action: make the credential available, keeping its history
    pub async fn enable(&self, id: &str) -> Result<ScraperCredential> {
        let credential = self
            .transition(id, |current, _now| {
                let mut next = current.clone();
                next.status = CredentialStatus::Available;
                next.cooldown_until = None;
                next.clear_assignment();
                Ok(next)
            })
            .await?;
        info!("Credential {} enabled", id);
        Ok(credential)
    }

    /// Operator action: take the credential out of rotation
    pub async fn disable(&self, id: &str) -> Result<ScraperCredential> {
        let credential = self
            .transition(id, |current, _now| {
                let mut next = current.clone();
                next.status = CredentialStatus::Disabled;
                next.cooldown_until = None;
                next.clear_assignment();
                Ok(next)
            })
            .await?;
        info!("Credential {} disabled", id);
        Ok(credential)
    }

    /// Remove a credential that no session holds
    pub async fn delete(&self, id: &str) -> Result<()> {
        for _ in 0..=self.settings.max_cas_retries {
            let current = self.get(id).await?;
            if current.status == CredentialStatus::InUse {
                return Err(OrchestratorError::invalid_transition(
                    "credential",
                    current.status,
                    "deleted",
                ));
            }
            if self.store.delete_credential(id, current.version).await? {
                info!("Credential {} deleted", id);
                return Ok(());
            }
        }
        Err(OrchestratorError::CredentialLocked { id: id.to_string() })
    }

    /// Move every cooldown credential whose window has passed back to
    /// `available`. Returns how many were revived.
    pub async fn sweep_cooldowns(&self) -> Result<usize> {
        let cooling = self
            .store
            .list_credentials(&CredentialFilter {
                status: Some(CredentialStatus::Cooldown),
                ..Default::default()
            })
            .await?;

        let now = self.clock.now();
        let mut revived = 0;

        for credential in cooling {
            if !cooldown_elapsed(&credential, now) {
                continue;
            }

            let result = self
                .transition(&credential.id, |current, now| {
                    if current.status != CredentialStatus::Cooldown || !cooldown_elapsed(current, now)
                    {
                        return Err(OrchestratorError::invalid_transition(
                            "credential",
                            current.status,
                            CredentialStatus::Available,
                        ));
                    }
                    let mut next = current.clone();
                    next.status = CredentialStatus::Available;
                    next.cooldown_until = None;
                    Ok(next)
                })
                .await;

            match result {
                Ok(_) => {
                    debug!("Credential {} back from cooldown", credential.id);
                    revived += 1;
                }
                Err(OrchestratorError::InvalidTransition { .. }) => {
                    debug!("Credential {} changed during sweep, skipping", credential.id);
                }
                Err(e) => return Err(e),
            }
        }

        if revived > 0 {
            info!("Cooldown sweep revived {} credential(s)", revived);
        }
        Ok(revived)
    }

    /// Status counts per platform, every configured platform included
    pub async fn health(&self) -> Result<Vec<PlatformHealth>> {
        let credentials = self.store.list_credentials(&CredentialFilter::default()).await?;

        let mut by_platform: BTreeMap<Platform, PlatformHealth> = Platform::ALL
            .iter()
            .map(|p| {
                (
                    *p,
                    PlatformHealth {
                        platform: Some(*p),
                        ..Default::default()
                    },
                )
            })
            .collect();

        for credential in &credentials {
            by_platform
                .entry(credential.platform)
                .or_default()
                .record(credential.status);
        }

        Ok(by_platform.into_values().collect())
    }

    /// Read-modify-CAS loop shared by every single-credential transition.
    async fn transition<F>(&self, id: &str, mut apply: F) -> Result<ScraperCredential>
    where
        F: FnMut(&ScraperCredential, DateTime<Utc>) -> Result<ScraperCredential>,
    {
        for _ in 0..=self.settings.max_cas_retries {
            let current = self.get(id).await?;
            let now = self.clock.now();
            let mut next = apply(&current, now)?;
            stamp(&mut next, current.version, now);

            if self
                .store
                .compare_and_swap_credential(current.version, &next)
                .await?
            {
                return Ok(next);
            }
            debug!("Version conflict on credential {}, retrying", id);
        }

        Err(OrchestratorError::CredentialLocked { id: id.to_string() })
    }
}

/// The credential must still be leased to `session_id`
fn check_lease(current: &ScraperCredential, session_id: &str, to: impl ToString) -> Result<()> {
    if current.status != CredentialStatus::InUse {
        return Err(OrchestratorError::invalid_transition(
            "credential",
            current.status,
            to,
        ));
    }
    if current.assigned_to_session_id.as_deref() != Some(session_id) {
        return Err(OrchestratorError::CredentialLocked {
            id: current.id.clone(),
        });
    }
    Ok(())
}

fn stamp(next: &mut ScraperCredential, current_version: u64, now: DateTime<Utc>) {
    next.version = current_version + 1;
    next.updated_at = now;
}

fn cooldown_elapsed(credential: &ScraperCredential, now: DateTime<Utc>) -> bool {
    credential.cooldown_until.map_or(true, |until| until <= now)
}

fn validate_secret(secret: &CredentialSecret) -> Result<()> {
    match secret {
        CredentialSecret::Email { email, password } => {
            if !email.contains('@') || email.trim().len() < 3 {
                return Err(OrchestratorError::Validation(format!(
                    "'{}' is not an email address",
                    email
                )));
            }
            if password.is_empty() {
                return Err(OrchestratorError::Validation(
                    "password must not be empty".to_string(),
                ));
            }
        }
        CredentialSecret::Json { payload } => {
            if !payload.as_object().map_or(false, |o| !o.is_empty()) {
                return Err(OrchestratorError::Validation(
                    "JSON credential payload must be a non-empty object".to_string(),
                ));
            }
        }
    }
    Ok(())
}
