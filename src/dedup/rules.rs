use async_trait::async_trait;
use tracing::debug;

use crate::dedup::model::{JobRecord, SkipReason, Verdict};
use crate::dedup::normalize::{canonicalize_url, description_similarity, normalize_field};
use crate::error::Result;
use crate::platform::Platform;
use crate::storage::PostingStore;

/// A record under classification together with its normalized keys.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub platform: Platform,
    pub record: &'a JobRecord,

    pub external_job_id: Option<String>,
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub job_url: Option<String>,
}

impl<'a> Candidate<'a> {
    pub fn new(platform: Platform, record: &'a JobRecord) -> Self {
        Self {
            platform,
            record,
            external_job_id: record
                .external_job_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            title: normalize_field(record.title.as_deref()),
            company: normalize_field(record.company.as_deref()),
            location: normalize_field(record.location.as_deref()),
            description: normalize_field(record.description.as_deref()),
            job_url: record
                .job_url
                .as_deref()
                .map(canonicalize_url)
                .filter(|url| !url.is_empty()),
        }
    }

    /// Location key used for exact matching; missing locations match each other
    pub fn location_key(&self) -> &str {
        self.location.as_deref().unwrap_or_default()
    }
}

/// One step of the duplicate-detection chain. Returning `Some` ends the chain.
#[async_trait]
pub trait DedupRule: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evaluate(
        &self,
        candidate: &Candidate<'_>,
        store: &dyn PostingStore,
    ) -> Result<Option<Verdict>>;
}

/// Same platform already has this external job id.
pub struct PlatformIdRule;

#[async_trait]
impl DedupRule for PlatformIdRule {
    fn name(&self) -> &'static str {
        "platform_id"
    }

    async fn evaluate(
        &self,
        candidate: &Candidate<'_>,
        store: &dyn PostingStore,
    ) -> Result<Option<Verdict>> {
        let Some(external_id) = candidate.external_job_id.as_deref() else {
            return Ok(None);
        };

        Ok(store
            .find_by_platform_id(candidate.platform, external_id)
            .await?
            .map(|existing| Verdict::skip(SkipReason::DuplicatePlatformId, Some(existing.id))))
    }
}

/// Normalized title, company and location all match an existing posting.
pub struct TitleCompanyLocationRule;

#[async_trait]
impl DedupRule for TitleCompanyLocationRule {
    fn name(&self) -> &'static str {
        "title_company_location"
    }

    async fn evaluate(
        &self,
        candidate: &Candidate<'_>,
        store: &dyn PostingStore,
    ) -> Result<Option<Verdict>> {
        let (Some(title), Some(company)) = (&candidate.title, &candidate.company) else {
            return Ok(None);
        };

        Ok(store
            .find_by_title_company_location(title, company, candidate.location_key())
            .await?
            .map(|existing| {
                Verdict::skip(SkipReason::DuplicateTitleCompanyLocation, Some(existing.id))
            }))
    }
}

/// Same title and company, and a description at least `threshold` similar.
pub struct DescriptionSimilarityRule {
    threshold: f64,
}

impl DescriptionSimilarityRule {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

#[async_trait]
impl DedupRule for DescriptionSimilarityRule {
    fn name(&self) -> &'static str {
        "title_company_description"
    }

    async fn evaluate(
        &self,
        candidate: &Candidate<'_>,
        store: &dyn PostingStore,
    ) -> Result<Option<Verdict>> {
        let (Some(title), Some(company), Some(description)) =
            (&candidate.title, &candidate.company, &candidate.description)
        else {
            return Ok(None);
        };

        let mut best: Option<(f64, String)> = None;
        for existing in store.find_by_title_company(title, company).await? {
            let Some(theirs) = normalize_field(existing.description.as_deref()) else {
                continue;
            };
            let score = description_similarity(description, &theirs);
            if score >= self.threshold && best.as_ref().map_or(true, |(b, _)| score > *b) {
                best = Some((score, existing.id));
            }
        }

        Ok(best.map(|(score, id)| {
            debug!("Description matches posting {} (similarity {:.3})", id, score);
            Verdict::skip(SkipReason::DuplicateTitleCompanyDescription, Some(id))
        }))
    }
}

/// Title, company and job URL must all be present.
pub struct RequiredFieldsRule;

#[async_trait]
impl DedupRule for RequiredFieldsRule {
    fn name(&self) -> &'static str {
        "required_fields"
    }

    async fn evaluate(
        &self,
        candidate: &Candidate<'_>,
        _store: &dyn PostingStore,
    ) -> Result<Option<Verdict>> {
        let missing = candidate.title.is_none()
            || candidate.company.is_none()
            || candidate.job_url.is_none();
        Ok(missing.then(|| Verdict::skip(SkipReason::MissingRequired, None)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::JobPosting;
    use crate::storage::{MemoryStorage, PostingStore};
    use chrono::Utc;

    const RUST_ROLE: &str = "Build and operate our streaming data platform in Rust. You will own ingestion services and on-call rotation.";
    const RUST_ROLE_REWORDED: &str = "Build and operate our streaming data platform in Rust. You will own ingestion services and the on-call rotation.";
    const MOBILE_ROLE: &str = "Lead our mobile team shipping the iOS and Android apps used by millions of riders.";

    fn record(title: &str, company: &str, location: Option<&str>, description: Option<&str>) -> JobRecord {
        JobRecord {
            external_job_id: None,
            title: Some(title.to_string()),
            company: Some(company.to_string()),
            location: location.map(str::to_string),
            description: description.map(str::to_string),
            job_url: Some("https://jobs.example.com/1".to_string()),
        }
    }

    async fn seeded(record: &JobRecord, platform: Platform, id: &str) -> MemoryStorage {
        let store = MemoryStorage::new();
        let candidate = Candidate::new(platform, record);
        let posting = JobPosting {
            id: id.to_string(),
            platform,
            external_job_id: candidate.external_job_id.clone(),
            title: record.title.clone().unwrap_or_default(),
            company: record.company.clone().unwrap_or_default(),
            location: record.location.clone(),
            description: record.description.clone(),
            job_url: candidate.job_url.clone().unwrap_or_default(),
            normalized_title: candidate.title.clone().unwrap_or_default(),
            normalized_company: candidate.company.clone().unwrap_or_default(),
            normalized_location: candidate.location_key().to_string(),
            session_id: "seed".to_string(),
            created_at: Utc::now(),
        };
        store.insert_posting(&posting).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_platform_id_rule_is_per_platform() {
        let mut existing = record("Engineer", "Acme", None, None);
        existing.external_job_id = Some("123".to_string());
        let store = seeded(&existing, Platform::Linkedin, "p1").await;

        let mut incoming = record("Other", "Else", None, None);
        incoming.external_job_id = Some(" 123 ".to_string());

        let verdict = PlatformIdRule
            .evaluate(&Candidate::new(Platform::Linkedin, &incoming), &store)
            .await
            .unwrap();
        assert_eq!(
            verdict,
            Some(Verdict::skip(SkipReason::DuplicatePlatformId, Some("p1".into())))
        );

        let verdict = PlatformIdRule
            .evaluate(&Candidate::new(Platform::Glassdoor, &incoming), &store)
            .await
            .unwrap();
        assert_eq!(verdict, None);
    }

    #[tokio::test]
    async fn test_title_company_location_uses_normalized_keys() {
        let existing = record("Senior Engineer", "Acme Inc.", Some("Austin, TX"), None);
        let store = seeded(&existing, Platform::Glassdoor, "p1").await;

        let incoming = record("senior   engineer", "ACME INC", Some("austin tx"), None);
        let verdict = TitleCompanyLocationRule
            .evaluate(&Candidate::new(Platform::Linkedin, &incoming), &store)
            .await
            .unwrap();
        assert_eq!(verdict.and_then(|v| v.skip_reason()), Some(SkipReason::DuplicateTitleCompanyLocation));

        let elsewhere = record("Senior Engineer", "Acme Inc.", Some("Denver, CO"), None);
        let verdict = TitleCompanyLocationRule
            .evaluate(&Candidate::new(Platform::Linkedin, &elsewhere), &store)
            .await
            .unwrap();
        assert_eq!(verdict, None);
    }

    #[tokio::test]
    async fn test_description_similarity_threshold() {
        let existing = record("Data Engineer", "Acme", Some("Austin"), Some(RUST_ROLE));
        let store = seeded(&existing, Platform::Techfetch, "p1").await;
        let rule = DescriptionSimilarityRule::new(0.9);

        let reworded = record("Data Engineer", "Acme", Some("Remote"), Some(RUST_ROLE_REWORDED));
        let verdict = rule
            .evaluate(&Candidate::new(Platform::Linkedin, &reworded), &store)
            .await
            .unwrap();
        assert_eq!(
            verdict,
            Some(Verdict::skip(
                SkipReason::DuplicateTitleCompanyDescription,
                Some("p1".into())
            ))
        );

        let different = record("Data Engineer", "Acme", Some("Remote"), Some(MOBILE_ROLE));
        let verdict = rule
            .evaluate(&Candidate::new(Platform::Linkedin, &different), &store)
            .await
            .unwrap();
        assert_eq!(verdict, None);

        let no_description = record("Data Engineer", "Acme", Some("Remote"), None);
        let verdict = rule
            .evaluate(&Candidate::new(Platform::Linkedin, &no_description), &store)
            .await
            .unwrap();
        assert_eq!(verdict, None);
    }

    #[tokio::test]
    async fn test_required_fields() {
        let store = MemoryStorage::new();
        let mut incoming = record("Engineer", "Acme", None, None);
        assert_eq!(
            RequiredFieldsRule
                .evaluate(&Candidate::new(Platform::Linkedin, &incoming), &store)
                .await
                .unwrap(),
            None
        );

        incoming.job_url = None;
        assert_eq!(
            RequiredFieldsRule
                .evaluate(&Candidate::new(Platform::Linkedin, &incoming), &store)
                .await
                .unwrap(),
            Some(Verdict::skip(SkipReason::MissingRequired, None))
        );

        let blank_title = record(" -- ", "Acme", None, None);
        assert!(RequiredFieldsRule
            .evaluate(&Candidate::new(Platform::Linkedin, &blank_title), &store)
            .await
            .unwrap()
            .is_some());
    }
}
