use anyhow::{bail, Context, Result};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api;
use crate::app::AppContext;
use crate::cli::config::{OrchestratorConfig, StorageBackend};
use crate::cli::{CredentialCommand, QueueCommand, SessionCommand};
use crate::credentials::{CredentialFilter, CredentialSecret};
use crate::queue::QueueFilter;
use crate::session::SessionFilter;
use crate::storage::Page;

/// Build the core against the configured backend
async fn connect(config: OrchestratorConfig) -> Result<AppContext> {
    if config.storage.backend == StorageBackend::Memory {
        warn!("Storage backend is memory; changes made by this command are not kept");
    }
    AppContext::from_config(config)
        .await
        .context("Failed to initialize the orchestrator")
}

/// Serve the API and run the background sweeps until Ctrl-C
pub async fn serve(mut config: OrchestratorConfig, bind: Option<String>) -> Result<()> {
    // Override configuration with command line parameters if provided
    if let Some(bind) = bind {
        config.api.bind_address = bind;
    }
    if config.api.auth_token.is_none() {
        warn!("api.auth_token is not set; the API accepts unauthenticated requests");
    }

    // Initialize the core against the configured backend
    let ctx = AppContext::from_config(config)
        .await
        .context("Failed to initialize the orchestrator")?;

    // Start the cooldown and timeout sweeps
    let shutdown = CancellationToken::new();
    let maintenance = ctx
        .orchestrator
        .spawn_maintenance(&ctx.config.pool, shutdown.clone());

    // Stop everything on Ctrl-C
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                signal.cancel();
            }
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    // Serve until shutdown, then wait for the sweeps to finish
    let served = api::serve(ctx, shutdown.clone()).await;
    shutdown.cancel();
    maintenance.await.context("Maintenance task panicked")?;
    served.context("API server failed")?;

    info!("Orchestrator stopped");
    Ok(())
}

/// Manage scraper credentials
pub async fn credentials(config: OrchestratorConfig, action: CredentialCommand) -> Result<()> {
    let ctx = connect(config).await?;
    let pool = &ctx.pool;

    match action {
        CredentialCommand::List { platform, status } => {
            let filter = CredentialFilter {
                platform,
                status,
                ..Default::default()
            };
            let credentials = pool.list(&filter).await?;
            if credentials.is_empty() {
                println!("No credentials found");
            }
            for c in credentials {
                println!(
                    "{}  {:<10} {:<10} {:<30} failures={} successes={}{}",
                    c.id,
                    c.platform,
                    c.status,
                    c.name,
                    c.failure_count,
                    c.success_count,
                    c.assigned_to_session_id
                        .as_deref()
                        .map(|s| format!(" session={}", s))
                        .unwrap_or_default()
                );
            }
        }
        CredentialCommand::Add {
            platform,
            name,
            email,
            password,
            json,
        } => {
            // Exactly one kind of secret must be given
            let secret = match (email, password, json) {
                (Some(email), Some(password), None) => CredentialSecret::Email { email, password },
                (None, None, Some(json)) => CredentialSecret::Json {
                    payload: serde_json::from_str(&json).context("--json is not valid JSON")?,
                },
                _ => bail!("Provide either --email with --password, or --json"),
            };
            let credential = pool.create(platform, &name, secret).await?;
            println!("Created credential {} ({})", credential.id, credential.name);
        }
        CredentialCommand::Enable { id } => {
            let c = pool.enable(&id).await?;
            println!("Credential {} is {}", c.id, c.status);
        }
        CredentialCommand::Disable { id } => {
            let c = pool.disable(&id).await?;
            println!("Credential {} is {}", c.id, c.status);
        }
        CredentialCommand::Reset { id } => {
            let c = pool.reset(&id).await?;
            println!("Credential {} is {}", c.id, c.status);
        }
        CredentialCommand::Delete { id } => {
            pool.delete(&id).await?;
            println!("Deleted credential {}", id);
        }
    }

    Ok(())
}

/// Manage the role/location queue
pub async fn queue(config: OrchestratorConfig, action: QueueCommand) -> Result<()> {
    let ctx = connect(config).await?;
    let queue = &ctx.queue;

    match action {
        QueueCommand::List {
            status,
            search,
            page,
            page_size,
        } => {
            let page = queue
                .list(&QueueFilter { status, search }, Page::new(Some(page), Some(page_size)))
                .await?;
            println!(
                "Showing {} of {} entries (page {})",
                page.items.len(),
                page.total,
                page.page
            );
            for e in page.items {
                println!(
                    "{}  {:<10} {:<8} {:<24} {:<24} candidates={} scraped={}",
                    e.id,
                    e.queue_status,
                    e.priority,
                    e.global_role_id,
                    e.location,
                    e.candidate_count,
                    e.total_jobs_scraped
                );
            }
        }
        QueueCommand::Add {
            role,
            location,
            priority,
        } => {
            let mut entry = queue.enqueue(&role, &location).await?;

            // New entries start at normal priority
            if let Some(priority) = priority {
                entry = queue.update_priority(&entry.id, priority).await?;
            }
            println!(
                "Queued {} for {} in {} ({}, {})",
                entry.id, entry.global_role_id, entry.location, entry.queue_status, entry.priority
            );
        }
        QueueCommand::Approve { ids, all } => {
            if !all && ids.is_empty() {
                bail!("Give entry ids to approve, or --all");
            }
            let approved = if all {
                queue.bulk_approve(None).await?
            } else {
                queue.bulk_approve(Some(ids.as_slice())).await?
            };
            println!("Approved {} entries", approved.len());
        }
        QueueCommand::Reject { id } => {
            let entry = queue.reject(&id).await?;
            println!("Entry {} is {}", entry.id, entry.queue_status);
        }
        QueueCommand::Priority { id, priority } => {
            let entry = queue.update_priority(&id, priority).await?;
            println!("Entry {} now has priority {}", entry.id, entry.priority);
        }
    }

    Ok(())
}

/// Inspect and stop scrape sessions
pub async fn sessions(config: OrchestratorConfig, action: SessionCommand) -> Result<()> {
    let ctx = connect(config).await?;
    let orchestrator = &ctx.orchestrator;

    match action {
        SessionCommand::List { status, limit } => {
            let sessions = orchestrator
                .list_sessions(&SessionFilter {
                    status,
                    limit: Some(limit),
                    ..Default::default()
                })
                .await?;
            for s in sessions {
                println!(
                    "{}  {:<11} {:<24} {:<20} platforms={}/{} imported={} skipped={} started={}",
                    s.session_id,
                    s.status,
                    s.role_id,
                    s.location,
                    s.platforms_completed,
                    s.platforms_total,
                    s.jobs_imported,
                    s.jobs_skipped,
                    s.started_at
                );
            }
        }
        SessionCommand::Show { id } => {
            let detail = orchestrator.get_session(&id).await?;

            // Display session information
            let s = &detail.session;
            println!("Session: {}", s.session_id);
            println!("Role: {} in {}", s.role_id, s.location);
            println!("Status: {}", s.status);
            println!(
                "Jobs: {} found, {} imported, {} skipped",
                s.jobs_found, s.jobs_imported, s.jobs_skipped
            );
            println!("Batches: {}/{}", s.completed_batches, s.total_batches);
            if let Some(message) = &s.error_message {
                println!("Error: {}", message);
            }
            // One line per platform
            println!("Platforms:");
            for p in &detail.platform_statuses {
                println!(
                    "  - {:<10} {:<11} batches={}/{} imported={}{}",
                    p.platform_name,
                    p.status,
                    p.completed_batches,
                    p.total_batches,
                    p.jobs_imported,
                    p.error_message
                        .as_deref()
                        .map(|m| format!(" error=\"{}\"", m))
                        .unwrap_or_default()
                );
            }
        }
        SessionCommand::Terminate { id } => {
            let report = orchestrator.terminate_session(&id).await?;
            println!("{}", report.message);
        }
    }

    Ok(())
}

/// Print where the configuration lives, or all of it
pub fn show_config(config: &OrchestratorConfig, path: Option<&Path>, show: bool) -> Result<()> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(OrchestratorConfig::default_path);

    if show {
        // Never print the API token
        let mut redacted = config.clone();
        if redacted.api.auth_token.is_some() {
            redacted.api.auth_token = Some("<redacted>".to_string());
        }
        println!("# {}", path.display());
        print!(
            "{}",
            serde_yaml::to_string(&redacted).context("Failed to serialize configuration")?
        );
    } else {
        println!("{}", path.display());
    }

    Ok(())
}
