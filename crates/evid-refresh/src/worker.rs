//! Background worker: claims queued refresh jobs, drives the evidence
//! pipeline, and commits the result as a new claim-set version.
//!
//! The worker is the only component that touches both write domains of
//! the store. Every run re-reads the active version before starting and
//! records it as the commit basis, so a run that was superseded while
//! stalled can finish without clobbering newer data.

use anyhow::Result;
use evid_canonical::CanonicalKey;
use evid_pipeline::{BundleStage, EvidencePipeline, PipelineOutput};
use evid_store::{BasisGuard, NewVersion, RefreshTracker, StoreError, VersionStore};
use evid_types::{EvidenceBundle, RefreshJob, RefreshOutcome, RefreshStage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Tunables for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// How often to look for queued work.
    pub poll_interval: Duration,
    /// How often a claimed job is heartbeated while the pipeline runs.
    /// Must be well under the running-staleness threshold.
    pub heartbeat_interval: Duration,
    /// Stamped onto committed versions for provenance.
    pub pipeline_config_id: Option<String>,
    pub model_id: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", std::process::id()),
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(30),
            pipeline_config_id: None,
            model_id: None,
        }
    }
}

/// Single-flight job executor. Multiple workers may run concurrently;
/// `claim_next_queued` hands each job to exactly one of them.
pub struct Worker {
    tracker: Arc<dyn RefreshTracker>,
    versions: Arc<dyn VersionStore>,
    pipeline: Arc<dyn EvidencePipeline>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        tracker: Arc<dyn RefreshTracker>,
        versions: Arc<dyn VersionStore>,
        pipeline: Arc<dyn EvidencePipeline>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            tracker,
            versions,
            pipeline,
            config,
        }
    }

    /// Runs the worker loop until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = poll.tick() => {
                    // Drain the queue before sleeping again.
                    loop {
                        let claimed = match self
                            .tracker
                            .claim_next_queued(&self.config.worker_id)
                            .await
                        {
                            Ok(claimed) => claimed,
                            Err(error) => {
                                tracing::error!(error = %error, "could not claim queued work");
                                break;
                            }
                        };
                        let Some(job) = claimed else {
                            break;
                        };
                        let job_id = job.id;
                        if let Err(error) = self.process(job).await {
                            tracing::error!(
                                job_id,
                                error = %error,
                                "refresh run aborted, recording failure"
                            );
                            if let Err(complete_error) = self
                                .tracker
                                .complete(
                                    job_id,
                                    RefreshOutcome::Failed,
                                    None,
                                    Some(error.to_string()),
                                )
                                .await
                            {
                                tracing::error!(
                                    job_id,
                                    error = %complete_error,
                                    "failure outcome could not be recorded"
                                );
                            }
                        }
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Executes one claimed job through to a terminal status. Pipeline
    /// and validation failures terminate the job as `failed` here;
    /// storage errors bubble to the loop, which records the failure on
    /// the job and keeps draining.
    async fn process(&self, job: RefreshJob) -> Result<()> {
        let key = CanonicalKey::from_signature(job.key.clone());

        let active = self.versions.active_version(&key).await?;
        if let Some(active) = &active {
            // Another run already refreshed this key after we were
            // enqueued; there is nothing left to do.
            if active.created_at >= job.started_at {
                tracing::info!(
                    job_id = job.id,
                    key = %key,
                    version_id = active.id,
                    "claim set already refreshed since enqueue, skipping"
                );
                self.tracker
                    .complete(job.id, RefreshOutcome::Skipped, Some(active.id), None)
                    .await?;
                return Ok(());
            }
        }
        let basis = BasisGuard {
            active_version_id: active.as_ref().map(|version| version.id),
        };

        self.tracker
            .advance(job.id, RefreshStage::CollectingArticles, None)
            .await?;

        let (heartbeat_stop_tx, mut heartbeat_stop_rx) = watch::channel(false);
        let heartbeat_tracker = self.tracker.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_job_id = job.id;
        let heartbeat_task = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_interval);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        heartbeat_tracker.heartbeat(heartbeat_job_id).await?;
                    }
                    changed = heartbeat_stop_rx.changed() => {
                        if changed.is_err() || *heartbeat_stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            Ok::<(), StoreError>(())
        });

        // Pipeline progress events land on the job row as stage stamps.
        let (progress_tx, mut progress_rx) =
            tokio::sync::mpsc::unbounded_channel::<evid_pipeline::ProgressEvent>();
        let progress_tracker = self.tracker.clone();
        let progress_job_id = job.id;
        let progress_task = tokio::spawn(async move {
            while let Some(event) = progress_rx.recv().await {
                progress_tracker
                    .advance(
                        progress_job_id,
                        stage_for(event.stage),
                        event.detail.as_deref(),
                    )
                    .await?;
            }
            Ok::<(), StoreError>(())
        });

        let pipeline_result = self
            .pipeline
            .build_bundle(&key, &job.mesh_terms, progress_tx)
            .await;

        let _ = heartbeat_stop_tx.send(true);
        heartbeat_task.await??;
        progress_task.await??;

        match pipeline_result {
            Err(failure) => {
                tracing::warn!(job_id = job.id, key = %key, error = %failure, "pipeline run failed");
                self.tracker
                    .complete(
                        job.id,
                        RefreshOutcome::Failed,
                        None,
                        Some(failure.to_string()),
                    )
                    .await?;
            }
            Ok(PipelineOutput::NoBatches) => {
                self.tracker
                    .complete(job.id, RefreshOutcome::NoBatches, None, None)
                    .await?;
            }
            Ok(PipelineOutput::NoResponses) => {
                self.tracker
                    .complete(job.id, RefreshOutcome::NoResponses, None, None)
                    .await?;
            }
            // A bundle with no claims must never become the served
            // answer; treat it like an empty pipeline result.
            Ok(PipelineOutput::Bundle(bundle)) if bundle.claims.is_empty() => {
                self.tracker
                    .complete(job.id, RefreshOutcome::NoResponses, None, None)
                    .await?;
            }
            Ok(PipelineOutput::Bundle(bundle)) => {
                self.tracker
                    .advance(job.id, RefreshStage::Persisting, None)
                    .await?;
                self.commit_bundle(&job, key, bundle, basis).await?;
            }
        }

        Ok(())
    }

    async fn commit_bundle(
        &self,
        job: &RefreshJob,
        key: CanonicalKey,
        bundle: EvidenceBundle,
        basis: BasisGuard,
    ) -> Result<()> {
        let commit = self
            .versions
            .commit(NewVersion {
                key: key.clone(),
                condition_label: job.condition_label.clone(),
                bundle,
                pipeline_config_id: self.config.pipeline_config_id.clone(),
                model_id: self.config.model_id.clone(),
                source_job_id: Some(job.id),
                basis: Some(basis),
            })
            .await;

        match commit {
            Ok(version) => {
                tracing::info!(
                    job_id = job.id,
                    key = %key,
                    version_id = version.id,
                    version_number = version.version_number,
                    "committed refreshed claim set"
                );
                self.tracker
                    .complete(job.id, RefreshOutcome::Completed, Some(version.id), None)
                    .await?;
            }
            Err(err @ StoreError::SupersededBasis { .. }) => {
                tracing::info!(job_id = job.id, key = %key, "commit basis superseded, skipping");
                self.tracker
                    .complete(job.id, RefreshOutcome::Skipped, None, Some(err.to_string()))
                    .await?;
            }
            Err(StoreError::Validation(error)) => {
                tracing::warn!(job_id = job.id, key = %key, error = %error, "bundle rejected");
                self.tracker
                    .complete(
                        job.id,
                        RefreshOutcome::Failed,
                        None,
                        Some(error.to_string()),
                    )
                    .await?;
            }
            Err(other) => return Err(other.into()),
        }

        Ok(())
    }
}

fn stage_for(stage: BundleStage) -> RefreshStage {
    match stage {
        BundleStage::CollectingArticles => RefreshStage::CollectingArticles,
        BundleStage::BuildingBatches => RefreshStage::BuildingBatches,
        BundleStage::InvokingLlm => RefreshStage::InvokingLlm,
    }
}
