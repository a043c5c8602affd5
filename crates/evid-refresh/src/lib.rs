//! Freshness classification and the request-path resolve service.
//!
//! The resolve path only reads storage and, when needed, atomically
//! ensures a refresh job exists; it never waits on pipeline work.
//! Background execution lives in [`worker`].

use chrono::{DateTime, Duration, Utc};
use evid_canonical::CanonicalKey;
use evid_pipeline::{Resolution, ResolutionError, TermResolver};
use evid_store::{
    EnsureJobRequest, FeedbackStore, FeedbackVote, RefreshTracker, StoreError, VersionStore,
};
use evid_types::{
    Claim, ClaimSetVersion, FeedbackAggregate, RefreshJob, RefreshStage, RefreshStatus,
    StalenessThresholds,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub mod worker;

pub use worker::{Worker, WorkerConfig};

/// Errors surfaced by the resolve service.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Classification of the cached state for a key against its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Freshness {
    Fresh,
    Stale,
    Missing,
}

/// Pure read-time classification; never mutates job state.
pub fn classify_freshness(
    active_created_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Freshness {
    match active_created_at {
        None => Freshness::Missing,
        Some(created_at) if now - created_at > ttl => Freshness::Stale,
        Some(_) => Freshness::Fresh,
    }
}

/// Tunables for the resolve path.
#[derive(Debug, Clone, Copy)]
pub struct RefreshConfig {
    /// Age beyond which an active version is stale.
    pub ttl: Duration,
    pub thresholds: StalenessThresholds,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::days(7),
            thresholds: StalenessThresholds::default(),
        }
    }
}

/// A committed version together with its claims.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaimSetView {
    pub version: ClaimSetVersion,
    pub claims: Vec<Claim>,
}

/// Result of a resolve call. `job` is present whenever work continues
/// asynchronously; callers poll job status until terminal.
#[derive(Debug, Clone, Serialize)]
pub struct ResolveOutcome {
    pub resolution: Resolution,
    pub key: CanonicalKey,
    pub freshness: Freshness,
    pub claim_set: Option<ClaimSetView>,
    pub job: Option<RefreshJob>,
    pub job_created: bool,
}

/// Condition snapshot echoed back on status polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionSnapshot {
    pub condition_label: String,
    pub normalized_condition: String,
    pub mesh_terms: Vec<String>,
}

/// Always-well-formed status object for polling, even for jobs whose
/// worker has silently died.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: i64,
    pub key: String,
    pub status: RefreshStatus,
    pub stage: Option<RefreshStage>,
    pub stage_detail: Option<String>,
    pub error_message: Option<String>,
    pub can_retry: bool,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub resolution: ResolutionSnapshot,
    pub claim_set_id: Option<i64>,
    pub claim_set_slug: Option<String>,
    pub claim_set_version: Option<i64>,
}

/// Request-path orchestration: canonicalize, classify freshness, serve
/// cached versions, and ensure at most one refresh job per key.
pub struct RefreshService {
    resolver: Arc<dyn TermResolver>,
    tracker: Arc<dyn RefreshTracker>,
    versions: Arc<dyn VersionStore>,
    feedback: Arc<dyn FeedbackStore>,
    config: RefreshConfig,
}

impl RefreshService {
    pub fn new(
        resolver: Arc<dyn TermResolver>,
        tracker: Arc<dyn RefreshTracker>,
        versions: Arc<dyn VersionStore>,
        feedback: Arc<dyn FeedbackStore>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            resolver,
            tracker,
            versions,
            feedback,
            config,
        }
    }

    /// Resolves a condition and applies the freshness combination rule:
    /// fresh serves the cache, stale serves the cache and revalidates
    /// in the background, missing enqueues and returns a job handle.
    pub async fn resolve(&self, condition: &str) -> Result<ResolveOutcome, RefreshError> {
        let resolution = self.resolver.resolve_terms(condition).await?;
        let key = resolution.canonical_key();
        let now = Utc::now();

        let active = self.versions.active_version(&key).await?;
        let freshness = classify_freshness(
            active.as_ref().map(|version| version.created_at),
            now,
            self.config.ttl,
        );

        let claim_set = match &active {
            None => None,
            Some(version) => {
                let claims = self.versions.claims_for_version(version.id).await?;
                Some(ClaimSetView {
                    version: version.clone(),
                    claims,
                })
            }
        };

        let (job, job_created) = match freshness {
            Freshness::Fresh => {
                // Attach to an in-flight job if one happens to exist,
                // but never start new work for a fresh key.
                let latest = self.tracker.latest_job_for_key(&key).await?;
                let attached = latest.filter(|job| {
                    job.status.is_in_flight() && !job.is_stalled(now, &self.config.thresholds)
                });
                (attached, false)
            }
            Freshness::Stale | Freshness::Missing => {
                let ensured = self
                    .tracker
                    .ensure_job(EnsureJobRequest {
                        key: key.clone(),
                        condition_label: resolution.canonical_label.clone(),
                        mesh_terms: resolution.mesh_terms.clone(),
                        thresholds: self.config.thresholds,
                    })
                    .await?;
                if ensured.created {
                    tracing::info!(
                        key = %key,
                        job_id = ensured.job.id,
                        freshness = ?freshness,
                        "queued background refresh"
                    );
                }
                (Some(ensured.job), ensured.created)
            }
        };

        Ok(ResolveOutcome {
            resolution,
            key,
            freshness,
            claim_set,
            job,
            job_created,
        })
    }

    /// Status view for a key signature or a claim-set reference. `None`
    /// means the key was never seen, which is distinct from `failed`.
    pub async fn job_status(&self, reference: &str) -> Result<Option<JobStatusView>, RefreshError> {
        let direct_key = CanonicalKey::from_signature(reference);
        let mut job = self.tracker.latest_job_for_key(&direct_key).await?;

        if job.is_none() {
            if let Some(version) = self.versions.find_version(reference).await? {
                let version_key = CanonicalKey::from_signature(version.key.clone());
                job = self.tracker.latest_job_for_key(&version_key).await?;
            }
        }

        let Some(job) = job else {
            return Ok(None);
        };

        let key = CanonicalKey::from_signature(job.key.clone());
        let active = self.versions.active_version(&key).await?;
        let now = Utc::now();

        let mesh_terms = if job.mesh_terms.is_empty() {
            key.display_terms()
        } else {
            job.mesh_terms.clone()
        };

        Ok(Some(JobStatusView {
            job_id: job.id,
            key: job.key.clone(),
            status: job.status,
            stage: job.stage,
            stage_detail: job.stage_detail.clone(),
            error_message: job.error_message.clone(),
            can_retry: job.can_retry(now, &self.config.thresholds),
            started_at: job.started_at,
            heartbeat_at: job.heartbeat_at,
            finished_at: job.finished_at,
            resolution: ResolutionSnapshot {
                condition_label: job.condition_label.clone(),
                normalized_condition: key.to_string().replace('|', " "),
                mesh_terms,
            },
            claim_set_id: active.as_ref().map(|version| version.id),
            claim_set_slug: active.as_ref().map(|version| version.slug.clone()),
            claim_set_version: active.as_ref().map(|version| version.version_number),
        }))
    }

    /// Loads a committed claim set by numeric id or slug alias.
    pub async fn get_claim_set(
        &self,
        reference: &str,
    ) -> Result<Option<ClaimSetView>, RefreshError> {
        let Some(version) = self.versions.find_version(reference).await? else {
            return Ok(None);
        };
        let claims = self.versions.claims_for_version(version.id).await?;
        Ok(Some(ClaimSetView { version, claims }))
    }

    /// Records a feedback vote against a stable claim group.
    pub async fn record_feedback(
        &self,
        group_id: &str,
        vote: FeedbackVote,
    ) -> Result<FeedbackAggregate, RefreshError> {
        Ok(self.feedback.record_vote(group_id, vote).await?)
    }
}
