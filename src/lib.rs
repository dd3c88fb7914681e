//! Scraper fleet orchestration: a pool of per-platform login credentials, a
//! prioritized (role, location) backlog, multi-platform session tracking and
//! per-record job deduplication.

pub mod api;
pub mod app;
pub mod cli;
pub mod credentials;
pub mod dedup;
pub mod error;
pub mod platform;
pub mod queue;
pub mod session;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export common types
pub use app::AppContext;
pub use credentials::{CredentialOutcome, CredentialPool, ScraperCredential};
pub use dedup::{DedupEngine, JobPosting, JobRecord};
pub use error::{OrchestratorError, Result};
pub use platform::Platform;
pub use queue::{RoleLocationQueue, RoleLocationQueueEntry};
pub use session::{ScrapeSession, SessionOrchestrator};
