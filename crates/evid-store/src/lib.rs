//! Refresh-job tracking and claim-set version storage.
//!
//! Two write domains share the canonical key as their join point: the
//! [`RefreshTracker`] owns refresh-job rows, the [`VersionStore`] owns
//! claim-set versions and their claims. The worker orchestration loop
//! is the only caller expected to use both. An in-memory backend backs
//! tests and local experimentation; [`SqliteStore`] provides durable
//! persistence.

use async_trait::async_trait;
use chrono::Utc;
use evid_canonical::{canonical_claim_hash, claim_group_id, claim_set_slug, CanonicalKey};
use evid_types::{
    aggregate_candidates, CandidateClaim, Claim, ClaimSetVersion, DrugLink, DrugLinkKind,
    EvidenceBundle, FeedbackAggregate, RefreshJob, RefreshOutcome, RefreshStage, RefreshStatus,
    StalenessThresholds, StatusTransitionError, VersionStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tokio::sync::{Notify, RwLock};

mod sqlite;

pub use sqlite::SqliteStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("refresh job {0} not found")]
    JobNotFound(i64),
    #[error("claim set version '{0}' not found")]
    VersionNotFound(String),
    #[error(transparent)]
    Transition(#[from] StatusTransitionError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(
        "active version for '{key}' moved from {expected:?} to {found} since the run started"
    )]
    SupersededBasis {
        key: String,
        expected: Option<i64>,
        found: i64,
    },
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single structural or statistical problem found in a bundle.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ValidationIssue {
    #[error("bundle contains no claims")]
    EmptyBundle,
    #[error("claim '{claim_id}' has an empty summary")]
    EmptySummary { claim_id: String },
    #[error("claim '{claim_id}' references no drugs")]
    NoDrugs { claim_id: String },
    #[error("claim '{claim_id}' has no supporting evidence")]
    NoEvidence { claim_id: String },
    #[error(
        "claim count {found} is outside the plausible band [{min}, {max}] \
         derived from the prior active version"
    )]
    ClaimCountOutOfBand { found: usize, min: usize, max: usize },
    #[error(
        "distinct drug count {found} is outside the plausible band [{min}, {max}] \
         derived from the prior active version"
    )]
    DrugCountOutOfBand { found: usize, min: usize, max: usize },
}

/// Bundle rejected before any write happened; the prior active version
/// is untouched.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("evidence bundle failed validation: {}", issues.iter().map(|issue| issue.to_string()).collect::<Vec<_>>().join("; "))]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

/// Tolerance band for statistical validation against the prior active
/// version, expressed as ratios of the prior counts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationBand {
    pub min_ratio: f64,
    pub max_ratio: f64,
}

impl Default for ValidationBand {
    fn default() -> Self {
        Self {
            min_ratio: 0.2,
            max_ratio: 5.0,
        }
    }
}

/// Counts from the prior active version used by statistical validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorStats {
    pub claim_count: usize,
    pub drug_count: usize,
}

/// Validates an already-aggregated candidate set. Pure; performs no
/// writes on failure so callers can reject without cleanup.
pub fn validate_candidates(
    candidates: &[CandidateClaim],
    prior: Option<PriorStats>,
    band: &ValidationBand,
) -> Result<(), ValidationError> {
    let mut issues = Vec::new();

    // An empty version must never be committed, even as the first one.
    if candidates.is_empty() {
        issues.push(ValidationIssue::EmptyBundle);
    }

    for candidate in candidates {
        if candidate.summary.trim().is_empty() {
            issues.push(ValidationIssue::EmptySummary {
                claim_id: candidate.claim_id.clone(),
            });
        }
        if candidate.drugs.iter().all(|drug| drug.trim().is_empty()) {
            issues.push(ValidationIssue::NoDrugs {
                claim_id: candidate.claim_id.clone(),
            });
        }
        if candidate.evidence.is_empty() {
            issues.push(ValidationIssue::NoEvidence {
                claim_id: candidate.claim_id.clone(),
            });
        }
    }

    if let Some(prior) = prior {
        let claim_band = ratio_band(prior.claim_count, band);
        let claim_count = candidates.len();
        if claim_count < claim_band.0 || claim_count > claim_band.1 {
            issues.push(ValidationIssue::ClaimCountOutOfBand {
                found: claim_count,
                min: claim_band.0,
                max: claim_band.1,
            });
        }

        let drug_band = ratio_band(prior.drug_count, band);
        let drug_count = distinct_drug_count(candidates);
        if drug_count < drug_band.0 || drug_count > drug_band.1 {
            issues.push(ValidationIssue::DrugCountOutOfBand {
                found: drug_count,
                min: drug_band.0,
                max: drug_band.1,
            });
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { issues })
    }
}

fn ratio_band(prior_count: usize, band: &ValidationBand) -> (usize, usize) {
    let prior = prior_count as f64;
    let min = (prior * band.min_ratio).floor().max(1.0) as usize;
    let max = (prior * band.max_ratio).ceil().max(1.0) as usize;
    (min, max)
}

fn distinct_drug_count(candidates: &[CandidateClaim]) -> usize {
    candidates
        .iter()
        .flat_map(|candidate| candidate.drugs.iter())
        .map(|drug| drug.trim().to_lowercase())
        .filter(|drug| !drug.is_empty())
        .collect::<std::collections::BTreeSet<_>>()
        .len()
}

/// Request to guarantee exactly one in-flight refresh job for a key.
#[derive(Debug, Clone)]
pub struct EnsureJobRequest {
    pub key: CanonicalKey,
    pub condition_label: String,
    pub mesh_terms: Vec<String>,
    pub thresholds: StalenessThresholds,
}

/// Result of [`RefreshTracker::ensure_job`]: the authoritative job for
/// the key, plus whether this call created it.
#[derive(Debug, Clone)]
pub struct EnsuredJob {
    pub job: RefreshJob,
    pub created: bool,
}

/// Guard carried by worker commits: the active version the run observed
/// when it started. Commit refuses to promote over anything newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasisGuard {
    pub active_version_id: Option<i64>,
}

/// Input to [`VersionStore::commit`].
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub key: CanonicalKey,
    pub condition_label: String,
    pub bundle: EvidenceBundle,
    pub pipeline_config_id: Option<String>,
    pub model_id: Option<String>,
    pub source_job_id: Option<i64>,
    /// `None` skips the late-completion guard (direct commits).
    pub basis: Option<BasisGuard>,
}

/// Exclusive owner of refresh-job rows.
#[async_trait]
pub trait RefreshTracker: Send + Sync {
    /// Returns the in-flight job for the key, creating one in `queued`
    /// if none exists. A stalled in-flight job is superseded in place
    /// (marked failed, kept as history) and a fresh attempt created.
    /// Atomic against concurrent callers racing on the same key.
    async fn ensure_job(&self, request: EnsureJobRequest) -> StoreResult<EnsuredJob>;

    /// Atomically dequeues the oldest queued job and moves it to
    /// `running` with a first heartbeat stamp.
    async fn claim_next_queued(&self, worker_id: &str) -> StoreResult<Option<RefreshJob>>;

    /// Stamps progress. No-op when the job is already terminal.
    async fn advance(
        &self,
        job_id: i64,
        stage: RefreshStage,
        detail: Option<&str>,
    ) -> StoreResult<()>;

    /// Heartbeat-only stamp for long pipeline stages.
    async fn heartbeat(&self, job_id: i64) -> StoreResult<()>;

    /// Records exactly one terminal outcome. No-op when the job was
    /// already terminated (for example superseded while stalled).
    async fn complete(
        &self,
        job_id: i64,
        outcome: RefreshOutcome,
        result_version_id: Option<i64>,
        error_message: Option<String>,
    ) -> StoreResult<()>;

    async fn get_job(&self, job_id: i64) -> StoreResult<Option<RefreshJob>>;

    /// Most recent job for a key, in-flight or finished.
    async fn latest_job_for_key(&self, key: &CanonicalKey) -> StoreResult<Option<RefreshJob>>;
}

/// Exclusive owner of claim-set versions and their claims.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Commits a bundle as a new immutable version: validate, insert
    /// draft with the next version number, derive claim identities,
    /// carry feedback forward, then atomically supersede the prior
    /// active version and activate the new one. All-or-nothing.
    async fn commit(&self, new_version: NewVersion) -> StoreResult<ClaimSetVersion>;

    async fn active_version(&self, key: &CanonicalKey) -> StoreResult<Option<ClaimSetVersion>>;

    async fn get_version(&self, version_id: i64) -> StoreResult<Option<ClaimSetVersion>>;

    /// Resolves a numeric id or a human-readable slug alias. A slug
    /// resolves to the currently active version carrying it.
    async fn find_version(&self, version_ref: &str) -> StoreResult<Option<ClaimSetVersion>>;

    async fn claims_for_version(&self, version_id: i64) -> StoreResult<Vec<Claim>>;

    /// All versions for a key, newest first.
    async fn version_history(&self, key: &CanonicalKey) -> StoreResult<Vec<ClaimSetVersion>>;
}

/// Vote direction for claim feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackVote {
    Up,
    Down,
}

/// Feedback aggregates keyed by claim group id, shared across all
/// versions of a key. Mutated independently of refresh runs; version
/// commits only read.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    async fn get_aggregate(&self, group_id: &str) -> StoreResult<FeedbackAggregate>;

    async fn record_vote(&self, group_id: &str, vote: FeedbackVote)
        -> StoreResult<FeedbackAggregate>;
}

/// Turns a raw bundle into insert-ready claims: aggregate duplicates,
/// validate, then derive content hashes and stable group ids.
fn prepare_claims(
    key: &CanonicalKey,
    bundle: EvidenceBundle,
    prior: Option<PriorStats>,
    band: &ValidationBand,
) -> Result<Vec<PreparedClaim>, ValidationError> {
    let candidates = aggregate_candidates(bundle.claims);
    validate_candidates(&candidates, prior, band)?;

    Ok(candidates
        .into_iter()
        .map(|candidate| {
            let canonical_hash = canonical_claim_hash(&candidate);
            let group_id = claim_group_id(key, &canonical_hash);
            let drug_links = build_drug_links(&candidate);
            PreparedClaim {
                candidate,
                canonical_hash,
                group_id,
                drug_links,
            }
        })
        .collect())
}

fn build_drug_links(candidate: &CandidateClaim) -> Vec<DrugLink> {
    let mut links = Vec::new();
    for drug in &candidate.drugs {
        links.push(DrugLink {
            term: drug.clone(),
            kind: DrugLinkKind::Drug,
        });
    }
    for class in &candidate.drug_classes {
        links.push(DrugLink {
            term: class.clone(),
            kind: DrugLinkKind::DrugClass,
        });
    }
    links
}

#[derive(Debug, Clone)]
struct PreparedClaim {
    candidate: CandidateClaim,
    canonical_hash: String,
    group_id: String,
    drug_links: Vec<DrugLink>,
}

/// In-memory backend for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<StoreInner>,
    notify: Notify,
    band: ValidationBand,
}

#[derive(Debug, Default)]
struct StoreInner {
    next_job_id: i64,
    jobs: HashMap<i64, RefreshJob>,
    queue: VecDeque<i64>,
    next_version_id: i64,
    versions: HashMap<i64, ClaimSetVersion>,
    version_ids_by_key: HashMap<String, Vec<i64>>,
    next_claim_id: i64,
    claims_by_version: HashMap<i64, Vec<Claim>>,
    feedback: HashMap<String, FeedbackAggregate>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validation_band(band: ValidationBand) -> Self {
        Self {
            band,
            ..Self::default()
        }
    }

    /// Wakes when new queued work may be available.
    pub async fn queue_changed(&self) {
        self.notify.notified().await;
    }

    /// Test support: rewrites a stored version's `created_at` so tests
    /// can age a claim set past its TTL without sleeping.
    pub async fn set_version_created_at(&self, version_id: i64, created_at: chrono::DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        if let Some(version) = inner.versions.get_mut(&version_id) {
            version.created_at = created_at;
        }
    }
}

impl StoreInner {
    fn in_flight_job_for_key(&self, key: &str) -> Option<i64> {
        self.jobs
            .values()
            .filter(|job| job.key == key && job.status.is_in_flight())
            .map(|job| job.id)
            .max()
    }

    fn active_version_for_key(&self, key: &str) -> Option<&ClaimSetVersion> {
        self.version_ids_by_key
            .get(key)?
            .iter()
            .filter_map(|id| self.versions.get(id))
            .find(|version| version.status == VersionStatus::Active)
    }

    fn prior_stats(&self, key: &str) -> Option<PriorStats> {
        let active = self.active_version_for_key(key)?;
        let claims = self.claims_by_version.get(&active.id)?;
        let drug_count = claims
            .iter()
            .flat_map(|claim| claim.drugs.iter())
            .map(|drug| drug.trim().to_lowercase())
            .filter(|drug| !drug.is_empty())
            .collect::<std::collections::BTreeSet<_>>()
            .len();
        Some(PriorStats {
            claim_count: claims.len(),
            drug_count,
        })
    }
}

#[async_trait]
impl RefreshTracker for InMemoryStore {
    async fn ensure_job(&self, request: EnsureJobRequest) -> StoreResult<EnsuredJob> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        if let Some(existing_id) = inner.in_flight_job_for_key(request.key.as_str()) {
            if let Some(existing) = inner.jobs.get(&existing_id).cloned() {
                if !existing.is_stalled(now, &request.thresholds) {
                    return Ok(EnsuredJob {
                        job: existing,
                        created: false,
                    });
                }
            }

            // Stalled attempt: supersede in place, keep the row as
            // history, and fall through to create a fresh job.
            if let Some(job) = inner.jobs.get_mut(&existing_id) {
                job.status.ensure_transition(RefreshStatus::Failed)?;
                job.status = RefreshStatus::Failed;
                job.error_message = Some("superseded by a newer refresh attempt".to_string());
                job.finished_at = Some(now);
            }
            inner.queue.retain(|queued_id| *queued_id != existing_id);
        }

        inner.next_job_id += 1;
        let job = RefreshJob {
            id: inner.next_job_id,
            key: request.key.to_string(),
            condition_label: request.condition_label,
            mesh_terms: request.mesh_terms,
            status: RefreshStatus::Queued,
            stage: None,
            stage_detail: None,
            error_message: None,
            worker_id: None,
            started_at: now,
            heartbeat_at: now,
            finished_at: None,
            result_version_id: None,
        };
        inner.queue.push_back(job.id);
        inner.jobs.insert(job.id, job.clone());
        drop(inner);
        self.notify.notify_waiters();

        Ok(EnsuredJob { job, created: true })
    }

    async fn claim_next_queued(&self, worker_id: &str) -> StoreResult<Option<RefreshJob>> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();

        while let Some(job_id) = inner.queue.pop_front() {
            let Some(job) = inner.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.status != RefreshStatus::Queued {
                continue;
            }

            job.status.ensure_transition(RefreshStatus::Running)?;
            job.status = RefreshStatus::Running;
            job.worker_id = Some(worker_id.to_string());
            job.heartbeat_at = now;
            return Ok(Some(job.clone()));
        }

        Ok(None)
    }

    async fn advance(
        &self,
        job_id: i64,
        stage: RefreshStage,
        detail: Option<&str>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            return Ok(());
        }

        if job.status == RefreshStatus::Queued {
            job.status.ensure_transition(RefreshStatus::Running)?;
            job.status = RefreshStatus::Running;
        }
        job.stage = Some(stage);
        job.stage_detail = detail.map(str::to_string);
        job.heartbeat_at = Utc::now();
        Ok(())
    }

    async fn heartbeat(&self, job_id: i64) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        if !job.status.is_terminal() {
            job.heartbeat_at = Utc::now();
        }
        Ok(())
    }

    async fn complete(
        &self,
        job_id: i64,
        outcome: RefreshOutcome,
        result_version_id: Option<i64>,
        error_message: Option<String>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            // A late completer whose slot was superseded must not
            // overwrite the recorded outcome.
            return Ok(());
        }

        let next = outcome.as_status();
        job.status.ensure_transition(next)?;
        let now = Utc::now();
        job.status = next;
        job.error_message = error_message;
        job.result_version_id = result_version_id;
        job.heartbeat_at = now;
        job.finished_at = Some(now);
        Ok(())
    }

    async fn get_job(&self, job_id: i64) -> StoreResult<Option<RefreshJob>> {
        let inner = self.inner.read().await;
        Ok(inner.jobs.get(&job_id).cloned())
    }

    async fn latest_job_for_key(&self, key: &CanonicalKey) -> StoreResult<Option<RefreshJob>> {
        let inner = self.inner.read().await;
        Ok(inner
            .jobs
            .values()
            .filter(|job| job.key == key.as_str())
            .max_by_key(|job| job.id)
            .cloned())
    }
}

#[async_trait]
impl VersionStore for InMemoryStore {
    async fn commit(&self, new_version: NewVersion) -> StoreResult<ClaimSetVersion> {
        let mut inner = self.inner.write().await;
        let key_str = new_version.key.to_string();
        let now = Utc::now();

        let active = inner.active_version_for_key(&key_str).cloned();
        if let Some(basis) = new_version.basis {
            let current_active_id = active.as_ref().map(|version| version.id);
            if current_active_id != basis.active_version_id {
                return Err(StoreError::SupersededBasis {
                    key: key_str,
                    expected: basis.active_version_id,
                    found: current_active_id.unwrap_or_default(),
                });
            }
        }

        let prior = inner.prior_stats(&key_str);
        let prepared = prepare_claims(&new_version.key, new_version.bundle, prior, &self.band)?;

        let next_number = inner
            .version_ids_by_key
            .get(&key_str)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.versions.get(id))
                    .map(|version| version.version_number)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
            + 1;

        inner.next_version_id += 1;
        let version_id = inner.next_version_id;
        let version = ClaimSetVersion {
            id: version_id,
            key: key_str.clone(),
            version_number: next_number,
            status: VersionStatus::Active,
            condition_label: new_version.condition_label.clone(),
            slug: claim_set_slug(&new_version.condition_label, &key_str),
            created_at: now,
            pipeline_config_id: new_version.pipeline_config_id,
            model_id: new_version.model_id,
            source_job_id: new_version.source_job_id,
        };

        let mut claims = Vec::with_capacity(prepared.len());
        for item in prepared {
            inner.next_claim_id += 1;
            let feedback = inner
                .feedback
                .get(&item.group_id)
                .copied()
                .unwrap_or_default();
            claims.push(Claim {
                id: inner.next_claim_id,
                version_id,
                claim_id: item.candidate.claim_id,
                classification: item.candidate.classification,
                confidence: item.candidate.confidence,
                summary: item.candidate.summary,
                canonical_hash: item.canonical_hash,
                claim_group_id: item.group_id,
                drugs: item.candidate.drugs,
                drug_classes: item.candidate.drug_classes,
                source_claim_ids: item.candidate.source_claim_ids,
                votes_up: feedback.up,
                votes_down: feedback.down,
                evidence: item
                    .candidate
                    .evidence
                    .into_iter()
                    .map(|mut evidence| {
                        evidence.citation_url = evidence.resolved_citation_url();
                        evidence
                    })
                    .collect(),
                drug_links: item.drug_links,
            });
        }

        if let Some(previous) = active {
            previous
                .status
                .ensure_transition(VersionStatus::Superseded)?;
            if let Some(stored) = inner.versions.get_mut(&previous.id) {
                stored.status = VersionStatus::Superseded;
            }
        }

        inner.versions.insert(version_id, version.clone());
        inner
            .version_ids_by_key
            .entry(key_str)
            .or_default()
            .push(version_id);
        inner.claims_by_version.insert(version_id, claims);

        Ok(version)
    }

    async fn active_version(&self, key: &CanonicalKey) -> StoreResult<Option<ClaimSetVersion>> {
        let inner = self.inner.read().await;
        Ok(inner.active_version_for_key(key.as_str()).cloned())
    }

    async fn get_version(&self, version_id: i64) -> StoreResult<Option<ClaimSetVersion>> {
        let inner = self.inner.read().await;
        Ok(inner.versions.get(&version_id).cloned())
    }

    async fn find_version(&self, version_ref: &str) -> StoreResult<Option<ClaimSetVersion>> {
        if let Ok(version_id) = version_ref.parse::<i64>() {
            return self.get_version(version_id).await;
        }

        let inner = self.inner.read().await;
        Ok(inner
            .versions
            .values()
            .find(|version| version.status == VersionStatus::Active && version.slug == version_ref)
            .cloned())
    }

    async fn claims_for_version(&self, version_id: i64) -> StoreResult<Vec<Claim>> {
        let inner = self.inner.read().await;
        Ok(inner
            .claims_by_version
            .get(&version_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn version_history(&self, key: &CanonicalKey) -> StoreResult<Vec<ClaimSetVersion>> {
        let inner = self.inner.read().await;
        let mut versions: Vec<ClaimSetVersion> = inner
            .version_ids_by_key
            .get(key.as_str())
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.versions.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        versions.sort_by_key(|version| std::cmp::Reverse(version.version_number));
        Ok(versions)
    }
}

#[async_trait]
impl FeedbackStore for InMemoryStore {
    async fn get_aggregate(&self, group_id: &str) -> StoreResult<FeedbackAggregate> {
        let inner = self.inner.read().await;
        Ok(inner.feedback.get(group_id).copied().unwrap_or_default())
    }

    async fn record_vote(
        &self,
        group_id: &str,
        vote: FeedbackVote,
    ) -> StoreResult<FeedbackAggregate> {
        let mut inner = self.inner.write().await;
        let aggregate = inner.feedback.entry(group_id.to_string()).or_default();
        match vote {
            FeedbackVote::Up => aggregate.up += 1,
            FeedbackVote::Down => aggregate.down += 1,
        }
        Ok(*aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evid_types::{Classification, ClaimEvidence, Confidence};
    use std::sync::Arc;

    fn key() -> CanonicalKey {
        CanonicalKey::from_signature("anesthesia|king denborough")
    }

    fn ensure_request() -> EnsureJobRequest {
        EnsureJobRequest {
            key: key(),
            condition_label: "King Denborough".to_string(),
            mesh_terms: vec!["King Denborough".to_string(), "Anesthesia".to_string()],
            thresholds: StalenessThresholds::default(),
        }
    }

    fn candidate(claim_id: &str, drug: &str, summary: &str) -> CandidateClaim {
        CandidateClaim {
            claim_id: claim_id.to_string(),
            classification: Classification::Risk,
            confidence: Confidence::Medium,
            summary: summary.to_string(),
            drugs: vec![drug.to_string()],
            drug_classes: Vec::new(),
            source_claim_ids: Vec::new(),
            evidence: vec![ClaimEvidence {
                snippet_id: format!("snippet-{claim_id}"),
                pmid: "11111".to_string(),
                article_title: Some("Case report".to_string()),
                citation_url: None,
                key_points: Vec::new(),
                notes: None,
            }],
        }
    }

    fn bundle() -> EvidenceBundle {
        EvidenceBundle {
            claims: vec![
                candidate("c-1", "Succinylcholine", "Avoid depolarizing agents."),
                candidate("c-2", "Dantrolene", "Keep dantrolene available."),
            ],
        }
    }

    fn new_version(bundle: EvidenceBundle) -> NewVersion {
        NewVersion {
            key: key(),
            condition_label: "King Denborough".to_string(),
            bundle,
            pipeline_config_id: Some("snippet-v2".to_string()),
            model_id: Some("summarizer-1".to_string()),
            source_job_id: None,
            basis: None,
        }
    }

    #[tokio::test]
    async fn ensure_job_attaches_to_existing_in_flight_job() {
        let store = InMemoryStore::new();
        let first = store.ensure_job(ensure_request()).await.expect("ensure");
        assert!(first.created);

        let second = store.ensure_job(ensure_request()).await.expect("ensure");
        assert!(!second.created);
        assert_eq!(first.job.id, second.job.id);
    }

    #[tokio::test]
    async fn concurrent_ensure_job_creates_exactly_one_job() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.ensure_job(ensure_request()).await.expect("ensure")
            }));
        }

        let mut created = 0;
        let mut job_ids = std::collections::BTreeSet::new();
        for handle in handles {
            let ensured = handle.await.expect("join");
            if ensured.created {
                created += 1;
            }
            job_ids.insert(ensured.job.id);
        }
        assert_eq!(created, 1);
        assert_eq!(job_ids.len(), 1);
    }

    #[tokio::test]
    async fn stalled_job_is_superseded_and_kept_as_history() {
        let store = InMemoryStore::new();
        let first = store.ensure_job(ensure_request()).await.expect("ensure");

        {
            let mut inner = store.inner.write().await;
            let job = inner.jobs.get_mut(&first.job.id).expect("job");
            job.started_at = Utc::now() - chrono::Duration::seconds(120);
        }

        let second = store.ensure_job(ensure_request()).await.expect("ensure");
        assert!(second.created);
        assert_ne!(first.job.id, second.job.id);

        let superseded = store
            .get_job(first.job.id)
            .await
            .expect("get")
            .expect("job kept");
        assert_eq!(superseded.status, RefreshStatus::Failed);
        assert!(superseded.error_message.is_some());
    }

    #[tokio::test]
    async fn claim_next_queued_transitions_to_running() {
        let store = InMemoryStore::new();
        store.ensure_job(ensure_request()).await.expect("ensure");

        let claimed = store
            .claim_next_queued("worker-1")
            .await
            .expect("claim")
            .expect("job");
        assert_eq!(claimed.status, RefreshStatus::Running);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));

        assert!(store
            .claim_next_queued("worker-2")
            .await
            .expect("claim")
            .is_none());
    }

    #[tokio::test]
    async fn advance_is_a_no_op_on_terminal_jobs() {
        let store = InMemoryStore::new();
        let ensured = store.ensure_job(ensure_request()).await.expect("ensure");
        store
            .claim_next_queued("worker-1")
            .await
            .expect("claim")
            .expect("job");
        store
            .complete(ensured.job.id, RefreshOutcome::Failed, None, None)
            .await
            .expect("complete");

        store
            .advance(ensured.job.id, RefreshStage::Persisting, None)
            .await
            .expect("advance");
        let job = store
            .get_job(ensured.job.id)
            .await
            .expect("get")
            .expect("job");
        assert_eq!(job.status, RefreshStatus::Failed);
        assert_eq!(job.stage, None);
    }

    #[tokio::test]
    async fn complete_after_supersession_does_not_clobber() {
        let store = InMemoryStore::new();
        let first = store.ensure_job(ensure_request()).await.expect("ensure");
        {
            let mut inner = store.inner.write().await;
            let job = inner.jobs.get_mut(&first.job.id).expect("job");
            job.started_at = Utc::now() - chrono::Duration::seconds(120);
        }
        store.ensure_job(ensure_request()).await.expect("ensure");

        // The original (now superseded) job finishes late.
        store
            .complete(first.job.id, RefreshOutcome::Completed, Some(7), None)
            .await
            .expect("complete");

        let job = store
            .get_job(first.job.id)
            .await
            .expect("get")
            .expect("job");
        assert_eq!(job.status, RefreshStatus::Failed);
        assert_eq!(job.result_version_id, None);
    }

    #[tokio::test]
    async fn commit_activates_and_supersedes_in_order() {
        let store = InMemoryStore::new();
        let first = store.commit(new_version(bundle())).await.expect("commit");
        assert_eq!(first.version_number, 1);
        assert_eq!(first.status, VersionStatus::Active);

        let second = store.commit(new_version(bundle())).await.expect("commit");
        assert_eq!(second.version_number, 2);

        let history = store.version_history(&key()).await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, VersionStatus::Active);
        assert_eq!(history[1].status, VersionStatus::Superseded);

        let active = store
            .active_version(&key())
            .await
            .expect("active")
            .expect("some");
        assert_eq!(active.id, second.id);
    }

    #[tokio::test]
    async fn double_commit_preserves_group_ids() {
        let store = InMemoryStore::new();
        let first = store.commit(new_version(bundle())).await.expect("commit");
        let second = store.commit(new_version(bundle())).await.expect("commit");

        let first_claims = store.claims_for_version(first.id).await.expect("claims");
        let second_claims = store.claims_for_version(second.id).await.expect("claims");
        assert_eq!(first_claims.len(), second_claims.len());

        let first_groups: std::collections::BTreeSet<_> = first_claims
            .iter()
            .map(|claim| claim.claim_group_id.clone())
            .collect();
        let second_groups: std::collections::BTreeSet<_> = second_claims
            .iter()
            .map(|claim| claim.claim_group_id.clone())
            .collect();
        assert_eq!(first_groups, second_groups);
        assert_eq!(first_groups.len(), first_claims.len());
    }

    #[tokio::test]
    async fn validation_failure_leaves_prior_active_untouched() {
        let store = InMemoryStore::new();
        let first = store.commit(new_version(bundle())).await.expect("commit");

        let mut bad = bundle();
        bad.claims[0].evidence.clear();
        let err = store.commit(new_version(bad)).await.expect_err("rejected");
        match err {
            StoreError::Validation(validation) => {
                assert!(validation
                    .issues
                    .iter()
                    .any(|issue| matches!(issue, ValidationIssue::NoEvidence { .. })));
            }
            other => panic!("unexpected error: {other}"),
        }

        let active = store
            .active_version(&key())
            .await
            .expect("active")
            .expect("still active");
        assert_eq!(active.id, first.id);
        assert_eq!(
            store.claims_for_version(first.id).await.expect("claims").len(),
            2
        );
    }

    #[tokio::test]
    async fn empty_bundle_never_becomes_an_active_version() {
        let store = InMemoryStore::new();

        let err = store
            .commit(new_version(EvidenceBundle::default()))
            .await
            .expect_err("rejected");
        match err {
            StoreError::Validation(validation) => {
                assert!(validation
                    .issues
                    .iter()
                    .any(|issue| matches!(issue, ValidationIssue::EmptyBundle)));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(store.active_version(&key()).await.expect("active").is_none());
        assert!(store.version_history(&key()).await.expect("history").is_empty());
    }

    #[tokio::test]
    async fn statistical_validation_catches_regressions() {
        let store = InMemoryStore::new();
        let mut big = EvidenceBundle::default();
        for index in 0..10 {
            big.claims.push(candidate(
                &format!("c-{index}"),
                &format!("Drug-{index}"),
                &format!("Summary {index}."),
            ));
        }
        store.commit(new_version(big)).await.expect("commit");

        let tiny = EvidenceBundle {
            claims: vec![candidate("c-only", "Drug-0", "Summary.")],
        };
        let err = store.commit(new_version(tiny)).await.expect_err("rejected");
        match err {
            StoreError::Validation(validation) => {
                assert!(validation
                    .issues
                    .iter()
                    .any(|issue| matches!(issue, ValidationIssue::ClaimCountOutOfBand { .. })));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn basis_guard_rejects_commits_over_newer_versions() {
        let store = InMemoryStore::new();
        let first = store.commit(new_version(bundle())).await.expect("commit");

        // A slow run that started before `first` landed still believes
        // there is no active version.
        let mut late = new_version(bundle());
        late.basis = Some(BasisGuard {
            active_version_id: None,
        });
        let err = store.commit(late).await.expect_err("guarded");
        assert!(matches!(err, StoreError::SupersededBasis { .. }));

        // A run based on the current active version commits fine.
        let mut current = new_version(bundle());
        current.basis = Some(BasisGuard {
            active_version_id: Some(first.id),
        });
        let second = store.commit(current).await.expect("commit");
        assert_eq!(second.version_number, 2);
    }

    #[tokio::test]
    async fn feedback_carries_forward_across_versions() {
        let store = InMemoryStore::new();
        let first = store.commit(new_version(bundle())).await.expect("commit");
        let claims = store.claims_for_version(first.id).await.expect("claims");
        let group_id = claims[0].claim_group_id.clone();

        store
            .record_vote(&group_id, FeedbackVote::Up)
            .await
            .expect("vote");
        store
            .record_vote(&group_id, FeedbackVote::Up)
            .await
            .expect("vote");
        store
            .record_vote(&group_id, FeedbackVote::Down)
            .await
            .expect("vote");

        let second = store.commit(new_version(bundle())).await.expect("commit");
        let second_claims = store.claims_for_version(second.id).await.expect("claims");
        let carried = second_claims
            .iter()
            .find(|claim| claim.claim_group_id == group_id)
            .expect("same group present");
        assert_eq!(carried.votes_up, 2);
        assert_eq!(carried.votes_down, 1);
    }

    #[tokio::test]
    async fn find_version_resolves_ids_and_slugs() {
        let store = InMemoryStore::new();
        let version = store.commit(new_version(bundle())).await.expect("commit");

        let by_id = store
            .find_version(&version.id.to_string())
            .await
            .expect("find")
            .expect("some");
        assert_eq!(by_id.id, version.id);

        let by_slug = store
            .find_version(&version.slug)
            .await
            .expect("find")
            .expect("some");
        assert_eq!(by_slug.id, version.id);

        assert!(store
            .find_version("no-such-ref")
            .await
            .expect("find")
            .is_none());
    }

    #[test]
    fn structural_validation_reports_every_issue() {
        let broken = vec![CandidateClaim {
            claim_id: "c-broken".to_string(),
            classification: Classification::Safety,
            confidence: Confidence::Low,
            summary: "  ".to_string(),
            drugs: Vec::new(),
            drug_classes: Vec::new(),
            source_claim_ids: Vec::new(),
            evidence: Vec::new(),
        }];

        let err = validate_candidates(&broken, None, &ValidationBand::default())
            .expect_err("rejected");
        assert_eq!(err.issues.len(), 3);
    }
}
