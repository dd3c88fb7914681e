pub mod model;
pub mod orchestrator;
pub mod stats;

// Re-export common types
pub use model::{
    BatchApplication, BatchApply, BatchCounts, BatchKey, BatchOutcome, BatchProgress,
    JobLogFilter, JobLogStatus, JobLogSummary, PlatformFinish, PlatformOutcome, PlatformStatus,
    ScrapeSession, SessionDetail, SessionFilter, SessionJobLog, SessionJobs,
    SessionPlatformStatus, SessionStatus, TerminationReport,
};
pub use orchestrator::SessionOrchestrator;
pub use stats::{DashboardStats, WindowStats};
