pub mod engine;
pub mod model;
pub mod normalize;
pub mod rules;

pub use engine::DedupEngine;
pub use model::{JobPosting, JobRecord, RecordOutcome, SkipReason, Verdict};
pub use rules::{Candidate, DedupRule};
