use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cli::config::DedupSettings;
use crate::dedup::model::{JobPosting, JobRecord, RecordOutcome, SkipReason, Verdict};
use crate::dedup::rules::{
    Candidate, DedupRule, DescriptionSimilarityRule, PlatformIdRule, RequiredFieldsRule,
    TitleCompanyLocationRule,
};
use crate::error::{OrchestratorError, Result};
use crate::platform::Platform;
use crate::storage::{PostingInsert, PostingStore};

/// Decides for every scraped record whether it is new, a duplicate, or
/// malformed. Holds no state besides its rule chain.
pub struct DedupEngine {
    rules: Vec<Box<dyn DedupRule>>,
}

impl DedupEngine {
    /// The standard chain: platform id, title/company/location,
    /// title/company/description, required fields.
    pub fn new(settings: &DedupSettings) -> Self {
        Self::with_rules(vec![
            Box::new(PlatformIdRule),
            Box::new(TitleCompanyLocationRule),
            Box::new(DescriptionSimilarityRule::new(
                settings.description_similarity_threshold,
            )),
            Box::new(RequiredFieldsRule),
        ])
    }

    pub fn with_rules(rules: Vec<Box<dyn DedupRule>>) -> Self {
        Self { rules }
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    /// Run the chain; the first rule that returns a verdict wins.
    pub async fn classify(
        &self,
        platform: Platform,
        record: &JobRecord,
        store: &dyn PostingStore,
    ) -> Result<Verdict> {
        let candidate = Candidate::new(platform, record);

        for rule in &self.rules {
            let verdict = rule.evaluate(&candidate, store).await.map_err(|e| {
                OrchestratorError::DedupClassification(format!("{} rule: {}", rule.name(), e))
            })?;
            if let Some(verdict) = verdict {
                return Ok(verdict);
            }
        }

        Ok(Verdict::Import)
    }

    /// Classify a record and persist it when it is new. Never fails: any
    /// error becomes an `Error` verdict so the rest of the batch proceeds.
    pub async fn process(
        &self,
        platform: Platform,
        session_id: &str,
        record: &JobRecord,
        store: &dyn PostingStore,
        now: DateTime<Utc>,
    ) -> RecordOutcome {
        let result = match self.classify(platform, record, store).await {
            Ok(Verdict::Import) => self.import(platform, session_id, record, store, now).await,
            Ok(verdict) => Ok(RecordOutcome {
                verdict,
                imported_job_id: None,
            }),
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) => {
                debug!(
                    "{} record {:?}: {:?}",
                    platform, record.external_job_id, outcome.verdict
                );
                outcome
            }
            Err(e) => {
                warn!(
                    "Failed to process {} record {:?}: {}",
                    platform, record.external_job_id, e
                );
                RecordOutcome {
                    verdict: Verdict::Error {
                        message: e.to_string(),
                    },
                    imported_job_id: None,
                }
            }
        }
    }

    async fn import(
        &self,
        platform: Platform,
        session_id: &str,
        record: &JobRecord,
        store: &dyn PostingStore,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome> {
        let candidate = Candidate::new(platform, record);
        let posting = build_posting(&candidate, session_id, now)?;

        match store.insert_posting(&posting).await? {
            PostingInsert::Inserted => Ok(RecordOutcome {
                verdict: Verdict::Import,
                imported_job_id: Some(posting.id),
            }),
            PostingInsert::Conflict { existing_id } => {
                debug!(
                    "Lost import race for {} job {:?} to {}",
                    platform, posting.external_job_id, existing_id
                );
                Ok(RecordOutcome {
                    verdict: Verdict::skip(SkipReason::DuplicatePlatformId, Some(existing_id)),
                    imported_job_id: None,
                })
            }
        }
    }
}

fn build_posting(candidate: &Candidate<'_>, session_id: &str, now: DateTime<Utc>) -> Result<JobPosting> {
    let record = candidate.record;
    let (Some(title), Some(company), Some(job_url)) = (
        record.title.as_deref(),
        record.company.as_deref(),
        candidate.job_url.as_deref(),
    ) else {
        return Err(OrchestratorError::DedupClassification(
            "record reached import without title, company and job_url".to_string(),
        ));
    };

    let trimmed = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    Ok(JobPosting {
        id: Uuid::new_v4().to_string(),
        platform: candidate.platform,
        external_job_id: candidate.external_job_id.clone(),
        title: title.trim().to_string(),
        company: company.trim().to_string(),
        location: trimmed(&record.location),
        description: trimmed(&record.description),
        job_url: job_url.to_string(),
        normalized_title: candidate.title.clone().unwrap_or_default(),
        normalized_company: candidate.company.clone().unwrap_or_default(),
        normalized_location: candidate.location_key().to_string(),
        session_id: session_id.to_string(),
        created_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, MockPostingStore};

    fn engine() -> DedupEngine {
        DedupEngine::new(&DedupSettings::default())
    }

    fn record(external_id: &str, title: &str) -> JobRecord {
        JobRecord {
            external_job_id: Some(external_id.to_string()),
            title: Some(title.to_string()),
            company: Some("Acme".to_string()),
            location: Some("Remote".to_string()),
            description: Some("Ship things".to_string()),
            job_url: Some(format!("https://jobs.example.com/{}", external_id)),
        }
    }

    fn existing(id: &str) -> JobPosting {
        JobPosting {
            id: id.to_string(),
            platform: Platform::Linkedin,
            external_job_id: Some("1".to_string()),
            title: "Engineer".to_string(),
            company: "Acme".to_string(),
            location: Some("Remote".to_string()),
            description: None,
            job_url: "https://jobs.example.com/1".to_string(),
            normalized_title: "engineer".to_string(),
            normalized_company: "acme".to_string(),
            normalized_location: "remote".to_string(),
            session_id: "seed".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_default_chain_order() {
        assert_eq!(
            engine().rule_names(),
            vec![
                "platform_id",
                "title_company_location",
                "title_company_description",
                "required_fields"
            ]
        );
    }

    #[tokio::test]
    async fn test_platform_id_wins_over_title_match() {
        let mut store = MockPostingStore::new();
        store
            .expect_find_by_platform_id()
            .returning(|_, _| Ok(Some(existing("by-id"))));
        store
            .expect_find_by_title_company_location()
            .never();

        let verdict = engine()
            .classify(Platform::Linkedin, &record("1", "Engineer"), &store)
            .await
            .unwrap();
        assert_eq!(
            verdict,
            Verdict::skip(SkipReason::DuplicatePlatformId, Some("by-id".into()))
        );
    }

    #[tokio::test]
    async fn test_store_failure_is_isolated_per_record() {
        let mut store = MockPostingStore::new();
        store.expect_find_by_platform_id().returning(|_, id| {
            if id == "bad" {
                Err(OrchestratorError::Storage("connection reset".into()))
            } else {
                Ok(None)
            }
        });
        store
            .expect_find_by_title_company_location()
            .returning(|_, _, _| Ok(None));
        store.expect_find_by_title_company().returning(|_, _| Ok(vec![]));
        store
            .expect_insert_posting()
            .times(1)
            .returning(|_| Ok(PostingInsert::Inserted));

        let engine = engine();
        let now = Utc::now();

        let failed = engine
            .process(Platform::Glassdoor, "s1", &record("bad", "Engineer"), &store, now)
            .await;
        assert_eq!(failed.verdict.skip_reason(), Some(SkipReason::Error));
        assert!(failed.error_message().unwrap().contains("connection reset"));
        assert!(failed.imported_job_id.is_none());

        let imported = engine
            .process(Platform::Glassdoor, "s1", &record("good", "Engineer"), &store, now)
            .await;
        assert_eq!(imported.verdict, Verdict::Import);
        assert!(imported.imported_job_id.is_some());
    }

    #[tokio::test]
    async fn test_import_conflict_becomes_platform_duplicate() {
        let mut store = MockPostingStore::new();
        store.expect_find_by_platform_id().returning(|_, _| Ok(None));
        store
            .expect_find_by_title_company_location()
            .returning(|_, _, _| Ok(None));
        store.expect_find_by_title_company().returning(|_, _| Ok(vec![]));
        store.expect_insert_posting().returning(|_| {
            Ok(PostingInsert::Conflict {
                existing_id: "winner".into(),
            })
        });

        let outcome = engine()
            .process(Platform::Linkedin, "s1", &record("7", "Engineer"), &store, Utc::now())
            .await;
        assert_eq!(outcome.duplicate_job_id(), Some("winner"));
        assert_eq!(outcome.verdict.skip_reason(), Some(SkipReason::DuplicatePlatformId));
        assert!(outcome.imported_job_id.is_none());
    }

    #[tokio::test]
    async fn test_import_then_duplicate_against_memory_store() {
        let store = MemoryStorage::new();
        let engine = engine();
        let now = Utc::now();

        let first = engine
            .process(Platform::Techfetch, "s1", &record("42", "Rust Engineer"), &store, now)
            .await;
        let posting_id = first.imported_job_id.clone().unwrap();

        // Same id on the same platform.
        let again = engine
            .process(Platform::Techfetch, "s2", &record("42", "Rust Engineer"), &store, now)
            .await;
        assert_eq!(again.duplicate_job_id(), Some(posting_id.as_str()));
        assert_eq!(again.verdict.skip_reason(), Some(SkipReason::DuplicatePlatformId));

        // Same role reposted elsewhere under another id.
        let cross = engine
            .process(Platform::Linkedin, "s2", &record("li-9", "RUST engineer!"), &store, now)
            .await;
        assert_eq!(
            cross.verdict.skip_reason(),
            Some(SkipReason::DuplicateTitleCompanyLocation)
        );

        // Missing company never imports.
        let mut partial = record("43", "Another Role");
        partial.company = None;
        let skipped = engine
            .process(Platform::Techfetch, "s2", &partial, &store, now)
            .await;
        assert_eq!(skipped.verdict.skip_reason(), Some(SkipReason::MissingRequired));
    }
}
