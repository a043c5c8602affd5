//! Contracts for the external collaborators the refresh engine calls:
//! condition-to-MeSH resolution and the evidence pipeline that turns
//! literature into candidate claims. Production implementations live
//! outside this repository; the fixtures here back tests and local
//! one-shot runs.

use async_trait::async_trait;
use evid_canonical::{normalize_condition, CanonicalKey};
use evid_types::EvidenceBundle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Successful condition resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub normalized_condition: String,
    pub canonical_label: String,
    pub mesh_terms: Vec<String>,
}

impl Resolution {
    pub fn canonical_key(&self) -> CanonicalKey {
        if self.mesh_terms.is_empty() {
            CanonicalKey::from_condition(&self.normalized_condition)
        } else {
            CanonicalKey::from_mesh_terms(&self.mesh_terms)
        }
    }
}

/// Condition could not be matched; user-correctable.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ResolutionError {
    #[error("no MeSH terms matched '{normalized_condition}'")]
    Unresolved {
        normalized_condition: String,
        suggestions: Vec<String>,
    },
    #[error("term resolution service unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Maps free-text conditions to canonical MeSH terms.
#[async_trait]
pub trait TermResolver: Send + Sync {
    async fn resolve_terms(&self, condition: &str) -> Result<Resolution, ResolutionError>;
}

/// Stage at which a pipeline run broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineStage {
    Retrieval,
    Tagging,
    Summarization,
}

/// Upstream retrieval/summarization failure; retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("evidence pipeline failed during {stage:?}: {reason}")]
pub struct PipelineFailure {
    pub stage: PipelineStage,
    pub reason: String,
}

/// Outcome of a pipeline run that did not fail outright.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutput {
    Bundle(EvidenceBundle),
    /// No candidate batches could be built from the literature.
    NoBatches,
    /// Batches existed but summarization returned nothing usable.
    NoResponses,
}

/// Internal pipeline phase reported while a bundle is being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundleStage {
    CollectingArticles,
    BuildingBatches,
    InvokingLlm,
}

/// Progress marker emitted by a running pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub stage: BundleStage,
    pub detail: Option<String>,
}

impl ProgressEvent {
    pub fn new(stage: BundleStage, detail: impl Into<Option<String>>) -> Self {
        Self {
            stage,
            detail: detail.into(),
        }
    }
}

/// Channel end handed to a pipeline run for progress reporting. Sends
/// are best-effort; a dropped receiver never fails the run.
pub type ProgressSender = tokio::sync::mpsc::UnboundedSender<ProgressEvent>;

/// Produces a validated, scored evidence bundle for a canonical key.
#[async_trait]
pub trait EvidencePipeline: Send + Sync {
    async fn build_bundle(
        &self,
        key: &CanonicalKey,
        mesh_terms: &[String],
        progress: ProgressSender,
    ) -> Result<PipelineOutput, PipelineFailure>;
}

/// Table-driven resolver for tests and local runs. Unknown conditions
/// come back `Unresolved` with prefix-matched suggestions.
#[derive(Debug, Default)]
pub struct StaticTermResolver {
    entries: HashMap<String, Resolution>,
}

impl StaticTermResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(
        mut self,
        condition: &str,
        canonical_label: &str,
        mesh_terms: &[&str],
    ) -> Self {
        let normalized = normalize_condition(condition);
        self.entries.insert(
            normalized.clone(),
            Resolution {
                normalized_condition: normalized,
                canonical_label: canonical_label.to_string(),
                mesh_terms: mesh_terms.iter().map(|term| term.to_string()).collect(),
            },
        );
        self
    }
}

#[async_trait]
impl TermResolver for StaticTermResolver {
    async fn resolve_terms(&self, condition: &str) -> Result<Resolution, ResolutionError> {
        let normalized = normalize_condition(condition);
        if let Some(resolution) = self.entries.get(&normalized) {
            return Ok(resolution.clone());
        }

        let prefix: String = normalized.chars().take(4).collect();
        let mut suggestions: Vec<String> = self
            .entries
            .values()
            .filter(|entry| !prefix.is_empty() && entry.normalized_condition.starts_with(&prefix))
            .map(|entry| entry.canonical_label.clone())
            .collect();
        suggestions.sort();
        suggestions.dedup();

        Err(ResolutionError::Unresolved {
            normalized_condition: normalized,
            suggestions,
        })
    }
}

/// Scripted pipeline for tests: each call for a key pops the next
/// scripted outcome, repeating the last one once the script runs out.
pub struct FixtureEvidencePipeline {
    scripts: Mutex<HashMap<String, Vec<Result<PipelineOutput, PipelineFailure>>>>,
    latency: Option<Duration>,
}

impl FixtureEvidencePipeline {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn script(
        self,
        key: &CanonicalKey,
        outcomes: Vec<Result<PipelineOutput, PipelineFailure>>,
    ) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(key.to_string(), outcomes);
        }
        self
    }

    pub fn bundle_for(self, key: &CanonicalKey, bundle: EvidenceBundle) -> Self {
        self.script(key, vec![Ok(PipelineOutput::Bundle(bundle))])
    }

    fn next_outcome(&self, key: &str) -> Result<PipelineOutput, PipelineFailure> {
        let mut scripts = match self.scripts.lock() {
            Ok(scripts) => scripts,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(outcomes) = scripts.get_mut(key) else {
            return Ok(PipelineOutput::NoBatches);
        };
        if outcomes.len() > 1 {
            return outcomes.remove(0);
        }
        outcomes
            .first()
            .cloned()
            .unwrap_or(Ok(PipelineOutput::NoBatches))
    }
}

impl Default for FixtureEvidencePipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EvidencePipeline for FixtureEvidencePipeline {
    async fn build_bundle(
        &self,
        key: &CanonicalKey,
        mesh_terms: &[String],
        progress: ProgressSender,
    ) -> Result<PipelineOutput, PipelineFailure> {
        let _ = progress.send(ProgressEvent::new(
            BundleStage::CollectingArticles,
            Some(format!("{} mesh terms", mesh_terms.len())),
        ));
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let outcome = self.next_outcome(key.as_str());
        if matches!(outcome, Ok(PipelineOutput::Bundle(_) | PipelineOutput::NoResponses)) {
            let _ = progress.send(ProgressEvent::new(BundleStage::BuildingBatches, None));
            let _ = progress.send(ProgressEvent::new(BundleStage::InvokingLlm, None));
        }
        outcome
    }
}
