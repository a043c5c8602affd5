//! Shared data types for the evid claim refresh and versioning engine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Error returned when a status transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusTransitionError {
    #[error("invalid {kind} transition: {from} -> {to}")]
    Invalid {
        kind: &'static str,
        from: String,
        to: String,
    },
}

/// Lifecycle state for a claim refresh job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    NoBatches,
    NoResponses,
    Skipped,
}

impl RefreshStatus {
    /// Returns true when this status can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Failed)
                | (Self::Queued, Self::Skipped)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::NoBatches)
                | (Self::Running, Self::NoResponses)
                | (Self::Running, Self::Skipped)
        )
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        Err(StatusTransitionError::Invalid {
            kind: "refresh_status",
            from: self.as_str().to_string(),
            to: next.as_str().to_string(),
        })
    }

    /// Returns true when no further execution is expected.
    pub fn is_terminal(self) -> bool {
        !self.is_in_flight()
    }

    /// Returns true for statuses that occupy the per-key in-flight slot.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Wire representation, matching the serde rename.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::NoBatches => "no-batches",
            Self::NoResponses => "no-responses",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "no-batches" => Some(Self::NoBatches),
            "no-responses" => Some(Self::NoResponses),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for RefreshStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome reported by a worker when a refresh run finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshOutcome {
    Completed,
    Failed,
    /// The pipeline produced no candidate batches to summarize.
    NoBatches,
    /// Batches existed but the summarization step returned nothing.
    NoResponses,
    /// The run determined mid-flight that its work was already done.
    Skipped,
}

impl RefreshOutcome {
    pub fn as_status(self) -> RefreshStatus {
        match self {
            Self::Completed => RefreshStatus::Completed,
            Self::Failed => RefreshStatus::Failed,
            Self::NoBatches => RefreshStatus::NoBatches,
            Self::NoResponses => RefreshStatus::NoResponses,
            Self::Skipped => RefreshStatus::Skipped,
        }
    }
}

/// Coarse progress marker stamped by the worker as a run advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshStage {
    ResolvingTerms,
    CollectingArticles,
    BuildingBatches,
    InvokingLlm,
    Persisting,
}

impl RefreshStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResolvingTerms => "resolving-terms",
            Self::CollectingArticles => "collecting-articles",
            Self::BuildingBatches => "building-batches",
            Self::InvokingLlm => "invoking-llm",
            Self::Persisting => "persisting",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "resolving-terms" => Some(Self::ResolvingTerms),
            "collecting-articles" => Some(Self::CollectingArticles),
            "building-batches" => Some(Self::BuildingBatches),
            "invoking-llm" => Some(Self::InvokingLlm),
            "persisting" => Some(Self::Persisting),
            _ => None,
        }
    }
}

impl fmt::Display for RefreshStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness thresholds used to classify in-flight jobs as abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalenessThresholds {
    /// Max heartbeat age for a running job before it counts as stalled.
    pub running_stale: Duration,
    /// Max queue age for a queued job before it counts as stalled.
    pub queued_stale: Duration,
}

impl Default for StalenessThresholds {
    fn default() -> Self {
        Self {
            running_stale: Duration::seconds(300),
            queued_stale: Duration::seconds(60),
        }
    }
}

/// One refresh attempt for a canonical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshJob {
    pub id: i64,
    pub key: String,
    pub condition_label: String,
    pub mesh_terms: Vec<String>,
    pub status: RefreshStatus,
    pub stage: Option<RefreshStage>,
    pub stage_detail: Option<String>,
    pub error_message: Option<String>,
    pub worker_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result_version_id: Option<i64>,
}

impl RefreshJob {
    /// Lazily evaluated liveness check; never mutates stored state.
    pub fn is_stalled(&self, now: DateTime<Utc>, thresholds: &StalenessThresholds) -> bool {
        match self.status {
            RefreshStatus::Running => now - self.heartbeat_at > thresholds.running_stale,
            RefreshStatus::Queued => now - self.started_at > thresholds.queued_stale,
            _ => false,
        }
    }

    /// Whether a new attempt for this key is currently permitted.
    pub fn can_retry(&self, now: DateTime<Utc>, thresholds: &StalenessThresholds) -> bool {
        match self.status {
            RefreshStatus::Failed | RefreshStatus::NoBatches | RefreshStatus::NoResponses => true,
            RefreshStatus::Queued | RefreshStatus::Running => self.is_stalled(now, thresholds),
            RefreshStatus::Completed | RefreshStatus::Skipped => false,
        }
    }
}

/// Lifecycle state for a committed claim-set snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionStatus {
    Draft,
    Active,
    Superseded,
    Failed,
}

impl VersionStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Self::Draft, Self::Active)
                | (Self::Draft, Self::Failed)
                | (Self::Active, Self::Superseded)
        )
    }

    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        Err(StatusTransitionError::Invalid {
            kind: "version_status",
            from: self.as_str().to_string(),
            to: next.as_str().to_string(),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Superseded => "superseded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "superseded" => Some(Self::Superseded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable committed snapshot of claims for a canonical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimSetVersion {
    pub id: i64,
    pub key: String,
    pub version_number: i64,
    pub status: VersionStatus,
    pub condition_label: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
    pub pipeline_config_id: Option<String>,
    pub model_id: Option<String>,
    pub source_job_id: Option<i64>,
}

/// Risk-or-safety classification attached to every claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Risk,
    Safety,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Risk => "risk",
            Self::Safety => "safety",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "risk" => Some(Self::Risk),
            "safety" => Some(Self::Safety),
            _ => None,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summarization confidence, ordered low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One evidence reference supporting a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimEvidence {
    pub snippet_id: String,
    pub pmid: String,
    pub article_title: Option<String>,
    pub citation_url: Option<String>,
    #[serde(default)]
    pub key_points: Vec<String>,
    pub notes: Option<String>,
}

impl ClaimEvidence {
    /// Fills in the default PubMed citation URL when none was supplied.
    pub fn resolved_citation_url(&self) -> Option<String> {
        if let Some(url) = &self.citation_url {
            return Some(url.clone());
        }
        if self.pmid.is_empty() {
            return None;
        }
        Some(format!("https://pubmed.ncbi.nlm.nih.gov/{}/", self.pmid))
    }
}

/// Kind discriminator for drug-link rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DrugLinkKind {
    Drug,
    DrugClass,
}

impl DrugLinkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Drug => "drug",
            Self::DrugClass => "drug-class",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "drug" => Some(Self::Drug),
            "drug-class" => Some(Self::DrugClass),
            _ => None,
        }
    }
}

/// Link from a claim to a drug term or drug class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrugLink {
    pub term: String,
    pub kind: DrugLinkKind,
}

/// One stored claim row belonging to a claim-set version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: i64,
    pub version_id: i64,
    /// Source identifier reported by the summarization step.
    pub claim_id: String,
    pub classification: Classification,
    pub confidence: Confidence,
    pub summary: String,
    /// Content identity; unique within one version.
    pub canonical_hash: String,
    /// Cross-version identity; stable for the logically same claim.
    pub claim_group_id: String,
    pub drugs: Vec<String>,
    pub drug_classes: Vec<String>,
    pub source_claim_ids: Vec<String>,
    /// Denormalized feedback counters copied forward at commit time.
    pub votes_up: i64,
    pub votes_down: i64,
    pub evidence: Vec<ClaimEvidence>,
    pub drug_links: Vec<DrugLink>,
}

/// Candidate claim produced by the evidence pipeline, prior to commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateClaim {
    pub claim_id: String,
    pub classification: Classification,
    pub confidence: Confidence,
    pub summary: String,
    pub drugs: Vec<String>,
    #[serde(default)]
    pub drug_classes: Vec<String>,
    #[serde(default)]
    pub source_claim_ids: Vec<String>,
    pub evidence: Vec<ClaimEvidence>,
}

/// Validated, scored output of the evidence pipeline for one key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub claims: Vec<CandidateClaim>,
}

impl EvidenceBundle {
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Distinct drug terms across all candidate claims, case-folded.
    pub fn distinct_drug_count(&self) -> usize {
        self.claims
            .iter()
            .flat_map(|claim| claim.drugs.iter())
            .map(|drug| drug.trim().to_lowercase())
            .filter(|drug| !drug.is_empty())
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// Vote counts keyed by the stable cross-version claim group id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeedbackAggregate {
    pub up: i64,
    pub down: i64,
}

/// Deduplicates terms while preserving first-seen casing and order.
pub fn unique_terms<I, S>(terms: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for term in terms {
        let cleaned = term.as_ref().trim();
        if cleaned.is_empty() {
            continue;
        }
        if seen.insert(cleaned.to_lowercase()) {
            out.push(cleaned.to_string());
        }
    }
    out
}

fn merge_key(claim: &CandidateClaim) -> String {
    let drugs = claim
        .drugs
        .iter()
        .map(|term| term.trim().to_lowercase())
        .filter(|term| !term.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join(",");
    let classes = claim
        .drug_classes
        .iter()
        .map(|term| term.trim().to_lowercase())
        .filter(|term| !term.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join(",");
    format!("{}|{}|{}", claim.classification, drugs, classes)
}

/// Merges candidate claims that describe the same drug/classification
/// pairing. The highest-confidence candidate supplies the summary and
/// primary claim id; evidence and source ids are unioned in first-seen
/// order.
pub fn aggregate_candidates(candidates: Vec<CandidateClaim>) -> Vec<CandidateClaim> {
    let mut order = Vec::new();
    let mut merged: std::collections::HashMap<String, CandidateClaim> =
        std::collections::HashMap::new();

    for candidate in candidates {
        let mut candidate = candidate;
        candidate.drugs = unique_terms(&candidate.drugs);
        candidate.drug_classes = unique_terms(&candidate.drug_classes);
        if candidate.source_claim_ids.is_empty() {
            candidate.source_claim_ids = vec![candidate.claim_id.clone()];
        }

        let key = merge_key(&candidate);
        match merged.get_mut(&key) {
            None => {
                order.push(key.clone());
                merged.insert(key, candidate);
            }
            Some(existing) => {
                if candidate.confidence > existing.confidence {
                    existing.claim_id = candidate.claim_id.clone();
                    existing.summary = candidate.summary.clone();
                    existing.confidence = candidate.confidence;
                }
                for source_id in candidate.source_claim_ids {
                    if !existing.source_claim_ids.contains(&source_id) {
                        existing.source_claim_ids.push(source_id);
                    }
                }
                for evidence in candidate.evidence {
                    if !existing
                        .evidence
                        .iter()
                        .any(|have| have.snippet_id == evidence.snippet_id)
                    {
                        existing.evidence.push(evidence);
                    }
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .collect()
}
