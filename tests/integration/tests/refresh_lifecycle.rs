//! End-to-end refresh scenarios over the SQLite backend: resolve,
//! background refresh, stale-while-revalidate, retries, and feedback
//! carry-forward across versions.

use chrono::{Duration, Utc};
use evid_canonical::CanonicalKey;
use evid_pipeline::{
    FixtureEvidencePipeline, PipelineFailure, PipelineOutput, PipelineStage, StaticTermResolver,
    TermResolver,
};
use evid_refresh::{Freshness, RefreshConfig, RefreshService, Worker, WorkerConfig};
use evid_store::{
    FeedbackVote, NewVersion, RefreshTracker, SqliteStore, VersionStore,
};
use evid_types::{
    CandidateClaim, Classification, ClaimEvidence, Confidence, EvidenceBundle, RefreshJob,
    RefreshStatus, StalenessThresholds, VersionStatus,
};
use std::sync::Arc;
use tokio::sync::watch;

const CONDITION: &str = "Brugada Syndrome";

fn key() -> CanonicalKey {
    CanonicalKey::from_mesh_terms(&["Brugada Syndrome".to_string()])
}

fn resolver() -> Arc<dyn TermResolver> {
    Arc::new(StaticTermResolver::new().with_entry(
        CONDITION,
        "Brugada Syndrome",
        &["Brugada Syndrome"],
    ))
}

fn bundle() -> EvidenceBundle {
    EvidenceBundle {
        claims: vec![
            CandidateClaim {
                claim_id: "c-1".to_string(),
                classification: Classification::Risk,
                confidence: Confidence::High,
                summary: "Class I antiarrhythmics can unmask the type 1 ECG pattern.".to_string(),
                drugs: vec!["Flecainide".to_string(), "Ajmaline".to_string()],
                drug_classes: vec!["Class I antiarrhythmics".to_string()],
                source_claim_ids: Vec::new(),
                evidence: vec![ClaimEvidence {
                    snippet_id: "s-1".to_string(),
                    pmid: "31000001".to_string(),
                    article_title: Some("Drug challenge in Brugada syndrome".to_string()),
                    citation_url: None,
                    key_points: vec!["Provocation testing context only.".to_string()],
                    notes: None,
                }],
            },
            CandidateClaim {
                claim_id: "c-2".to_string(),
                classification: Classification::Safety,
                confidence: Confidence::Medium,
                summary: "Isoproterenol is used to suppress electrical storm.".to_string(),
                drugs: vec!["Isoproterenol".to_string()],
                drug_classes: Vec::new(),
                source_claim_ids: Vec::new(),
                evidence: vec![ClaimEvidence {
                    snippet_id: "s-2".to_string(),
                    pmid: "31000002".to_string(),
                    article_title: None,
                    citation_url: None,
                    key_points: Vec::new(),
                    notes: None,
                }],
            },
        ],
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<SqliteStore>,
    service: Arc<RefreshService>,
}

fn harness(ttl: Duration) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(SqliteStore::new(dir.path().join("evid.db")).expect("open store"));
    let service = Arc::new(RefreshService::new(
        resolver(),
        store.clone(),
        store.clone(),
        store.clone(),
        RefreshConfig {
            ttl,
            thresholds: StalenessThresholds::default(),
        },
    ));
    Harness {
        _dir: dir,
        store,
        service,
    }
}

fn spawn_worker(
    store: &Arc<SqliteStore>,
    pipeline: FixtureEvidencePipeline,
) -> (watch::Sender<bool>, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let worker = Worker::new(
        store.clone(),
        store.clone(),
        Arc::new(pipeline),
        WorkerConfig {
            worker_id: "itest-worker".to_string(),
            poll_interval: std::time::Duration::from_millis(10),
            heartbeat_interval: std::time::Duration::from_millis(25),
            pipeline_config_id: Some("itest-pipeline".to_string()),
            model_id: None,
        },
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });
    (shutdown_tx, handle)
}

async fn wait_terminal(store: &SqliteStore, job_id: i64) -> RefreshJob {
    for _ in 0..400 {
        let job = store
            .get_job(job_id)
            .await
            .expect("get job")
            .expect("job exists");
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("job {job_id} never reached a terminal status");
}

#[tokio::test]
async fn missing_key_refreshes_end_to_end() {
    let harness = harness(Duration::days(7));

    let outcome = harness.service.resolve(CONDITION).await.expect("resolve");
    assert_eq!(outcome.freshness, Freshness::Missing);
    assert!(outcome.claim_set.is_none());
    let job = outcome.job.expect("queued job");
    assert_eq!(job.status, RefreshStatus::Queued);

    let (shutdown_tx, handle) =
        spawn_worker(&harness.store, FixtureEvidencePipeline::new().bundle_for(&key(), bundle()));
    let finished = wait_terminal(&harness.store, job.id).await;
    let _ = shutdown_tx.send(true);
    handle.await.expect("join").expect("run");

    assert_eq!(finished.status, RefreshStatus::Completed);
    let version_id = finished.result_version_id.expect("version id");

    // The status poll view carries the claim-set reference.
    let view = harness
        .service
        .job_status(key().as_str())
        .await
        .expect("status")
        .expect("known key");
    assert_eq!(view.status, RefreshStatus::Completed);
    assert_eq!(view.claim_set_id, Some(version_id));
    assert!(!view.can_retry);

    let claim_set = harness
        .service
        .get_claim_set(&version_id.to_string())
        .await
        .expect("lookup")
        .expect("claim set");
    assert_eq!(claim_set.version.status, VersionStatus::Active);
    assert_eq!(claim_set.version.version_number, 1);
    assert_eq!(claim_set.version.pipeline_config_id.as_deref(), Some("itest-pipeline"));
    assert_eq!(claim_set.claims.len(), 2);

    // Claim identity and citation fallback are derived at commit time.
    for claim in &claim_set.claims {
        assert!(claim.claim_group_id.starts_with("grp-"));
        assert_eq!(claim.canonical_hash.len(), 64);
    }
    let risk_claim = claim_set
        .claims
        .iter()
        .find(|claim| claim.classification == Classification::Risk)
        .expect("risk claim");
    assert_eq!(
        risk_claim.evidence[0].citation_url.as_deref(),
        Some("https://pubmed.ncbi.nlm.nih.gov/31000001/")
    );

    // The slug alias resolves to the same set.
    let by_slug = harness
        .service
        .get_claim_set(&claim_set.version.slug)
        .await
        .expect("lookup")
        .expect("claim set by slug");
    assert_eq!(by_slug.version.id, version_id);
}

#[tokio::test]
async fn fresh_key_serves_cache_without_enqueueing() {
    let harness = harness(Duration::days(7));
    harness
        .store
        .commit(NewVersion {
            key: key(),
            condition_label: "Brugada Syndrome".to_string(),
            bundle: bundle(),
            pipeline_config_id: None,
            model_id: None,
            source_job_id: None,
            basis: None,
        })
        .await
        .expect("commit");

    let outcome = harness.service.resolve(CONDITION).await.expect("resolve");
    assert_eq!(outcome.freshness, Freshness::Fresh);
    assert!(outcome.job.is_none());
    assert_eq!(outcome.claim_set.expect("cached").claims.len(), 2);

    assert!(harness
        .store
        .latest_job_for_key(&key())
        .await
        .expect("lookup")
        .is_none());
}

#[tokio::test]
async fn stale_key_serves_old_claims_while_revalidating() {
    // Zero TTL makes any committed version immediately stale.
    let harness = harness(Duration::zero());
    let first = harness
        .store
        .commit(NewVersion {
            key: key(),
            condition_label: "Brugada Syndrome".to_string(),
            bundle: bundle(),
            pipeline_config_id: None,
            model_id: None,
            source_job_id: None,
            basis: None,
        })
        .await
        .expect("commit");
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let outcome = harness.service.resolve(CONDITION).await.expect("resolve");
    assert_eq!(outcome.freshness, Freshness::Stale);
    // Stale still serves the previous claims immediately.
    assert_eq!(outcome.claim_set.expect("stale cache").version.id, first.id);
    let job = outcome.job.expect("revalidation job");
    assert!(outcome.job_created);

    // A second resolve attaches to the same in-flight job.
    let attached = harness.service.resolve(CONDITION).await.expect("resolve");
    assert_eq!(attached.job.expect("attached").id, job.id);
    assert!(!attached.job_created);

    let (shutdown_tx, handle) =
        spawn_worker(&harness.store, FixtureEvidencePipeline::new().bundle_for(&key(), bundle()));
    let finished = wait_terminal(&harness.store, job.id).await;
    let _ = shutdown_tx.send(true);
    handle.await.expect("join").expect("run");

    assert_eq!(finished.status, RefreshStatus::Completed);
    let second_id = finished.result_version_id.expect("new version");
    assert_ne!(second_id, first.id);

    let history = harness
        .store
        .version_history(&key())
        .await
        .expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, second_id);
    assert_eq!(history[0].status, VersionStatus::Active);
    assert_eq!(history[0].version_number, 2);
    assert_eq!(history[1].id, first.id);
    assert_eq!(history[1].status, VersionStatus::Superseded);
}

#[tokio::test]
async fn concurrent_resolves_share_a_single_job() {
    let harness = harness(Duration::days(7));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let service = harness.service.clone();
        tasks.push(tokio::spawn(
            async move { service.resolve(CONDITION).await },
        ));
    }

    let mut job_ids = Vec::new();
    let mut created = 0;
    for task in tasks {
        let outcome = task.await.expect("join").expect("resolve");
        job_ids.push(outcome.job.expect("job").id);
        if outcome.job_created {
            created += 1;
        }
    }

    assert_eq!(created, 1, "exactly one resolve should create the job");
    let first = job_ids[0];
    assert!(job_ids.iter().all(|id| *id == first));
}

#[tokio::test]
async fn failed_runs_are_retryable_and_eventually_succeed() {
    let harness = harness(Duration::days(7));

    let outcome = harness.service.resolve(CONDITION).await.expect("resolve");
    let first_job = outcome.job.expect("job");

    let pipeline = FixtureEvidencePipeline::new().script(
        &key(),
        vec![
            Err(PipelineFailure {
                stage: PipelineStage::Retrieval,
                reason: "pubmed unavailable".to_string(),
            }),
            Ok(PipelineOutput::Bundle(bundle())),
        ],
    );
    let (shutdown_tx, handle) = spawn_worker(&harness.store, pipeline);

    let failed = wait_terminal(&harness.store, first_job.id).await;
    assert_eq!(failed.status, RefreshStatus::Failed);
    assert!(failed.can_retry(Utc::now(), &StalenessThresholds::default()));
    let view = harness
        .service
        .job_status(key().as_str())
        .await
        .expect("status")
        .expect("known");
    assert!(view.can_retry);
    assert!(view
        .error_message
        .as_deref()
        .expect("error message")
        .contains("pubmed unavailable"));

    // Retry: the key is still missing, so resolve queues a new attempt
    // and the scripted pipeline now succeeds.
    let retry = harness.service.resolve(CONDITION).await.expect("resolve");
    let second_job = retry.job.expect("retry job");
    assert_ne!(second_job.id, first_job.id);

    let finished = wait_terminal(&harness.store, second_job.id).await;
    let _ = shutdown_tx.send(true);
    handle.await.expect("join").expect("run");

    assert_eq!(finished.status, RefreshStatus::Completed);
    assert!(finished.result_version_id.is_some());
}

#[tokio::test]
async fn feedback_survives_refresh_and_group_ids_stay_stable() {
    let harness = harness(Duration::days(7));

    let first = harness
        .store
        .commit(NewVersion {
            key: key(),
            condition_label: "Brugada Syndrome".to_string(),
            bundle: bundle(),
            pipeline_config_id: None,
            model_id: None,
            source_job_id: None,
            basis: None,
        })
        .await
        .expect("commit");

    let first_claims = harness
        .store
        .claims_for_version(first.id)
        .await
        .expect("claims");
    let group_id = first_claims[0].claim_group_id.clone();

    harness
        .service
        .record_feedback(&group_id, FeedbackVote::Up)
        .await
        .expect("vote");
    harness
        .service
        .record_feedback(&group_id, FeedbackVote::Up)
        .await
        .expect("vote");
    harness
        .service
        .record_feedback(&group_id, FeedbackVote::Down)
        .await
        .expect("vote");

    // A later refresh of the same evidence keeps the group identity and
    // carries the aggregate onto the new version's claims.
    let second = harness
        .store
        .commit(NewVersion {
            key: key(),
            condition_label: "Brugada Syndrome".to_string(),
            bundle: bundle(),
            pipeline_config_id: None,
            model_id: None,
            source_job_id: None,
            basis: None,
        })
        .await
        .expect("commit");
    let second_claims = harness
        .store
        .claims_for_version(second.id)
        .await
        .expect("claims");

    let carried = second_claims
        .iter()
        .find(|claim| claim.claim_group_id == group_id)
        .expect("same group id across versions");
    assert_eq!(carried.votes_up, 2);
    assert_eq!(carried.votes_down, 1);

    // Unvoted groups stay at zero.
    let other = second_claims
        .iter()
        .find(|claim| claim.claim_group_id != group_id)
        .expect("other claim");
    assert_eq!(other.votes_up, 0);
    assert_eq!(other.votes_down, 0);
}
