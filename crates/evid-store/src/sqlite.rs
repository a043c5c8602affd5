//! SQLite-backed store with durable persistence.

use crate::{
    prepare_claims, BasisGuard, EnsureJobRequest, EnsuredJob, FeedbackStore, FeedbackVote,
    NewVersion, PriorStats, RefreshTracker, StoreError, StoreResult, ValidationBand, VersionStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evid_canonical::{claim_set_slug, CanonicalKey};
use evid_types::{
    Claim, ClaimEvidence, ClaimSetVersion, Classification, Confidence, DrugLink, DrugLinkKind,
    FeedbackAggregate, RefreshJob, RefreshOutcome, RefreshStage, RefreshStatus, VersionStatus,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Notify;

/// Durable store backend. Connections are opened per call; the schema
/// is created on construction.
#[derive(Debug)]
pub struct SqliteStore {
    db_path: PathBuf,
    band: ValidationBand,
    notify: Notify,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::with_validation_band(path, ValidationBand::default())
    }

    pub fn with_validation_band(
        path: impl AsRef<Path>,
        band: ValidationBand,
    ) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self {
            db_path,
            band,
            notify: Notify::new(),
        };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    /// Wakes when new queued work may be available.
    pub async fn queue_changed(&self) {
        self.notify.notified().await;
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS refresh_jobs (
                job_id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                condition_label TEXT NOT NULL,
                mesh_terms_json TEXT NOT NULL,
                status TEXT NOT NULL,
                stage TEXT NULL,
                stage_detail TEXT NULL,
                error_message TEXT NULL,
                worker_id TEXT NULL,
                started_at TEXT NOT NULL,
                heartbeat_at TEXT NOT NULL,
                finished_at TEXT NULL,
                result_version_id INTEGER NULL
            );

            CREATE INDEX IF NOT EXISTS idx_refresh_jobs_key_status
                ON refresh_jobs (key, status);

            CREATE UNIQUE INDEX IF NOT EXISTS idx_refresh_jobs_in_flight
                ON refresh_jobs (key) WHERE status IN ('queued', 'running');

            CREATE TABLE IF NOT EXISTS claim_set_versions (
                version_id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                version_number INTEGER NOT NULL,
                status TEXT NOT NULL,
                condition_label TEXT NOT NULL,
                slug TEXT NOT NULL,
                created_at TEXT NOT NULL,
                pipeline_config_id TEXT NULL,
                model_id TEXT NULL,
                source_job_id INTEGER NULL,
                claim_count INTEGER NOT NULL,
                drug_count INTEGER NOT NULL,
                UNIQUE (key, version_number)
            );

            CREATE INDEX IF NOT EXISTS idx_versions_key_status
                ON claim_set_versions (key, status);
            CREATE INDEX IF NOT EXISTS idx_versions_slug
                ON claim_set_versions (slug);

            CREATE TABLE IF NOT EXISTS claims (
                claim_row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                version_id INTEGER NOT NULL,
                claim_id TEXT NOT NULL,
                classification TEXT NOT NULL,
                confidence TEXT NOT NULL,
                summary TEXT NOT NULL,
                canonical_hash TEXT NOT NULL,
                claim_group_id TEXT NOT NULL,
                drugs_json TEXT NOT NULL,
                drug_classes_json TEXT NOT NULL,
                source_claim_ids_json TEXT NOT NULL,
                votes_up INTEGER NOT NULL,
                votes_down INTEGER NOT NULL,
                UNIQUE (version_id, canonical_hash),
                FOREIGN KEY(version_id)
                    REFERENCES claim_set_versions(version_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_claims_group ON claims (claim_group_id);

            CREATE TABLE IF NOT EXISTS claim_evidence (
                evidence_id INTEGER PRIMARY KEY AUTOINCREMENT,
                claim_row_id INTEGER NOT NULL,
                snippet_id TEXT NOT NULL,
                pmid TEXT NOT NULL,
                article_title TEXT NULL,
                citation_url TEXT NULL,
                key_points_json TEXT NOT NULL,
                notes TEXT NULL,
                FOREIGN KEY(claim_row_id)
                    REFERENCES claims(claim_row_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_evidence_claim ON claim_evidence (claim_row_id);

            CREATE TABLE IF NOT EXISTS claim_drug_links (
                link_id INTEGER PRIMARY KEY AUTOINCREMENT,
                claim_row_id INTEGER NOT NULL,
                term TEXT NOT NULL,
                kind TEXT NOT NULL,
                UNIQUE (claim_row_id, term, kind),
                FOREIGN KEY(claim_row_id)
                    REFERENCES claims(claim_row_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS claim_feedback (
                claim_group_id TEXT PRIMARY KEY,
                votes_up INTEGER NOT NULL DEFAULT 0,
                votes_down INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn option_timestamp_from_db(value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value.as_deref().map(timestamp_from_db).transpose()
}

fn refresh_status_from_db(value: &str) -> StoreResult<RefreshStatus> {
    RefreshStatus::parse(value).ok_or(StoreError::InvalidPersistedValue {
        field: "refresh_jobs.status",
        value: value.to_string(),
    })
}

fn version_status_from_db(value: &str) -> StoreResult<VersionStatus> {
    VersionStatus::parse(value).ok_or(StoreError::InvalidPersistedValue {
        field: "claim_set_versions.status",
        value: value.to_string(),
    })
}

struct JobRow {
    job_id: i64,
    key: String,
    condition_label: String,
    mesh_terms_json: String,
    status: String,
    stage: Option<String>,
    stage_detail: Option<String>,
    error_message: Option<String>,
    worker_id: Option<String>,
    started_at: String,
    heartbeat_at: String,
    finished_at: Option<String>,
    result_version_id: Option<i64>,
}

const JOB_COLUMNS: &str = "job_id, key, condition_label, mesh_terms_json, status, stage, \
     stage_detail, error_message, worker_id, started_at, heartbeat_at, finished_at, \
     result_version_id";

fn job_row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        job_id: row.get(0)?,
        key: row.get(1)?,
        condition_label: row.get(2)?,
        mesh_terms_json: row.get(3)?,
        status: row.get(4)?,
        stage: row.get(5)?,
        stage_detail: row.get(6)?,
        error_message: row.get(7)?,
        worker_id: row.get(8)?,
        started_at: row.get(9)?,
        heartbeat_at: row.get(10)?,
        finished_at: row.get(11)?,
        result_version_id: row.get(12)?,
    })
}

fn job_from_row(row: JobRow) -> StoreResult<RefreshJob> {
    let stage = match row.stage.as_deref() {
        None => None,
        Some(value) => Some(RefreshStage::parse(value).ok_or(
            StoreError::InvalidPersistedValue {
                field: "refresh_jobs.stage",
                value: value.to_string(),
            },
        )?),
    };
    Ok(RefreshJob {
        id: row.job_id,
        key: row.key,
        condition_label: row.condition_label,
        mesh_terms: serde_json::from_str(&row.mesh_terms_json)?,
        status: refresh_status_from_db(&row.status)?,
        stage,
        stage_detail: row.stage_detail,
        error_message: row.error_message,
        worker_id: row.worker_id,
        started_at: timestamp_from_db(&row.started_at)?,
        heartbeat_at: timestamp_from_db(&row.heartbeat_at)?,
        finished_at: option_timestamp_from_db(row.finished_at)?,
        result_version_id: row.result_version_id,
    })
}

struct VersionRow {
    version_id: i64,
    key: String,
    version_number: i64,
    status: String,
    condition_label: String,
    slug: String,
    created_at: String,
    pipeline_config_id: Option<String>,
    model_id: Option<String>,
    source_job_id: Option<i64>,
}

const VERSION_COLUMNS: &str = "version_id, key, version_number, status, condition_label, slug, \
     created_at, pipeline_config_id, model_id, source_job_id";

fn version_row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionRow> {
    Ok(VersionRow {
        version_id: row.get(0)?,
        key: row.get(1)?,
        version_number: row.get(2)?,
        status: row.get(3)?,
        condition_label: row.get(4)?,
        slug: row.get(5)?,
        created_at: row.get(6)?,
        pipeline_config_id: row.get(7)?,
        model_id: row.get(8)?,
        source_job_id: row.get(9)?,
    })
}

fn version_from_row(row: VersionRow) -> StoreResult<ClaimSetVersion> {
    Ok(ClaimSetVersion {
        id: row.version_id,
        key: row.key,
        version_number: row.version_number,
        status: version_status_from_db(&row.status)?,
        condition_label: row.condition_label,
        slug: row.slug,
        created_at: timestamp_from_db(&row.created_at)?,
        pipeline_config_id: row.pipeline_config_id,
        model_id: row.model_id,
        source_job_id: row.source_job_id,
    })
}

fn load_job(transaction: &Transaction<'_>, job_id: i64) -> StoreResult<Option<RefreshJob>> {
    let row = transaction
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM refresh_jobs WHERE job_id = ?1"),
            params![job_id],
            job_row_from_sql,
        )
        .optional()?;
    row.map(job_from_row).transpose()
}

fn active_version_row(
    transaction: &Transaction<'_>,
    key: &str,
) -> StoreResult<Option<ClaimSetVersion>> {
    let row = transaction
        .query_row(
            &format!(
                "SELECT {VERSION_COLUMNS} FROM claim_set_versions \
                 WHERE key = ?1 AND status = 'active' \
                 ORDER BY version_number DESC LIMIT 1"
            ),
            params![key],
            version_row_from_sql,
        )
        .optional()?;
    row.map(version_from_row).transpose()
}

#[async_trait]
impl RefreshTracker for SqliteStore {
    async fn ensure_job(&self, request: EnsureJobRequest) -> StoreResult<EnsuredJob> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let existing = transaction
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM refresh_jobs \
                     WHERE key = ?1 AND status IN ('queued', 'running') \
                     ORDER BY job_id DESC LIMIT 1"
                ),
                params![request.key.as_str()],
                job_row_from_sql,
            )
            .optional()?;

        if let Some(row) = existing {
            let job = job_from_row(row)?;
            if !job.is_stalled(now, &request.thresholds) {
                transaction.commit()?;
                return Ok(EnsuredJob {
                    job,
                    created: false,
                });
            }

            // Stalled attempt: mark failed in place so the partial
            // unique index frees the in-flight slot; the row stays as
            // history.
            job.status.ensure_transition(RefreshStatus::Failed)?;
            transaction.execute(
                "UPDATE refresh_jobs SET status = 'failed', \
                 error_message = 'superseded by a newer refresh attempt', \
                 finished_at = ?2 WHERE job_id = ?1",
                params![job.id, timestamp_to_db(now)],
            )?;
        }

        transaction.execute(
            r#"
            INSERT INTO refresh_jobs (
                key, condition_label, mesh_terms_json, status,
                started_at, heartbeat_at
            ) VALUES (?1, ?2, ?3, 'queued', ?4, ?4)
            "#,
            params![
                request.key.as_str(),
                request.condition_label,
                serde_json::to_string(&request.mesh_terms)?,
                timestamp_to_db(now),
            ],
        )?;
        let job_id = transaction.last_insert_rowid();
        let job = load_job(&transaction, job_id)?.ok_or(StoreError::JobNotFound(job_id))?;
        transaction.commit()?;

        self.notify.notify_waiters();
        Ok(EnsuredJob { job, created: true })
    }

    async fn claim_next_queued(&self, worker_id: &str) -> StoreResult<Option<RefreshJob>> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let queued = transaction
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM refresh_jobs \
                     WHERE status = 'queued' ORDER BY job_id LIMIT 1"
                ),
                [],
                job_row_from_sql,
            )
            .optional()?;
        let Some(row) = queued else {
            transaction.commit()?;
            return Ok(None);
        };
        let job = job_from_row(row)?;
        job.status.ensure_transition(RefreshStatus::Running)?;

        let now = Utc::now();
        transaction.execute(
            "UPDATE refresh_jobs SET status = 'running', worker_id = ?2, heartbeat_at = ?3 \
             WHERE job_id = ?1",
            params![job.id, worker_id, timestamp_to_db(now)],
        )?;
        let claimed = load_job(&transaction, job.id)?.ok_or(StoreError::JobNotFound(job.id))?;
        transaction.commit()?;
        Ok(Some(claimed))
    }

    async fn advance(
        &self,
        job_id: i64,
        stage: RefreshStage,
        detail: Option<&str>,
    ) -> StoreResult<()> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = load_job(&transaction, job_id)?.ok_or(StoreError::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            transaction.commit()?;
            return Ok(());
        }
        if job.status == RefreshStatus::Queued {
            job.status.ensure_transition(RefreshStatus::Running)?;
        }

        transaction.execute(
            "UPDATE refresh_jobs SET status = 'running', stage = ?2, stage_detail = ?3, \
             heartbeat_at = ?4 WHERE job_id = ?1",
            params![
                job_id,
                stage.as_str(),
                detail,
                timestamp_to_db(Utc::now()),
            ],
        )?;
        transaction.commit()?;
        Ok(())
    }

    async fn heartbeat(&self, job_id: i64) -> StoreResult<()> {
        let connection = self.open_connection()?;
        let updated = connection.execute(
            "UPDATE refresh_jobs SET heartbeat_at = ?2 \
             WHERE job_id = ?1 AND status IN ('queued', 'running')",
            params![job_id, timestamp_to_db(Utc::now())],
        )?;
        if updated == 0 {
            // Either terminal (ignore) or missing (report).
            let exists: Option<i64> = connection
                .query_row(
                    "SELECT 1 FROM refresh_jobs WHERE job_id = ?1",
                    params![job_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::JobNotFound(job_id));
            }
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
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = load_job(&transaction, job_id)?.ok_or(StoreError::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            transaction.commit()?;
            return Ok(());
        }
        let next = outcome.as_status();
        job.status.ensure_transition(next)?;

        let now = timestamp_to_db(Utc::now());
        transaction.execute(
            "UPDATE refresh_jobs SET status = ?2, error_message = ?3, \
             result_version_id = ?4, heartbeat_at = ?5, finished_at = ?5 \
             WHERE job_id = ?1",
            params![job_id, next.as_str(), error_message, result_version_id, now],
        )?;
        transaction.commit()?;
        Ok(())
    }

    async fn get_job(&self, job_id: i64) -> StoreResult<Option<RefreshJob>> {
        let connection = self.open_connection()?;
        let row = connection
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM refresh_jobs WHERE job_id = ?1"),
                params![job_id],
                job_row_from_sql,
            )
            .optional()?;
        row.map(job_from_row).transpose()
    }

    async fn latest_job_for_key(&self, key: &CanonicalKey) -> StoreResult<Option<RefreshJob>> {
        let connection = self.open_connection()?;
        let row = connection
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM refresh_jobs \
                     WHERE key = ?1 ORDER BY job_id DESC LIMIT 1"
                ),
                params![key.as_str()],
                job_row_from_sql,
            )
            .optional()?;
        row.map(job_from_row).transpose()
    }
}

#[async_trait]
impl VersionStore for SqliteStore {
    async fn commit(&self, new_version: NewVersion) -> StoreResult<ClaimSetVersion> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let key_str = new_version.key.to_string();
        let now = Utc::now();

        let active = active_version_row(&transaction, &key_str)?;
        check_basis(&key_str, new_version.basis, active.as_ref())?;

        let prior = match &active {
            None => None,
            Some(version) => {
                let (claim_count, drug_count): (i64, i64) = transaction.query_row(
                    "SELECT claim_count, drug_count FROM claim_set_versions \
                     WHERE version_id = ?1",
                    params![version.id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Some(PriorStats {
                    claim_count: claim_count as usize,
                    drug_count: drug_count as usize,
                })
            }
        };

        // Validation happens before any write; a rejected bundle never
        // touches the prior active version.
        let prepared = prepare_claims(&new_version.key, new_version.bundle, prior, &self.band)?;
        let claim_count = prepared.len();
        let drug_count = crate::distinct_drug_count(
            &prepared
                .iter()
                .map(|item| item.candidate.clone())
                .collect::<Vec<_>>(),
        );

        let next_number: i64 = transaction.query_row(
            "SELECT COALESCE(MAX(version_number), 0) + 1 FROM claim_set_versions \
             WHERE key = ?1",
            params![key_str],
            |row| row.get(0),
        )?;

        transaction.execute(
            r#"
            INSERT INTO claim_set_versions (
                key, version_number, status, condition_label, slug, created_at,
                pipeline_config_id, model_id, source_job_id, claim_count, drug_count
            ) VALUES (?1, ?2, 'draft', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                key_str,
                next_number,
                new_version.condition_label,
                claim_set_slug(&new_version.condition_label, &key_str),
                timestamp_to_db(now),
                new_version.pipeline_config_id,
                new_version.model_id,
                new_version.source_job_id,
                claim_count as i64,
                drug_count as i64,
            ],
        )?;
        let version_id = transaction.last_insert_rowid();

        for item in &prepared {
            let feedback = feedback_aggregate(&transaction, &item.group_id)?;
            transaction.execute(
                r#"
                INSERT INTO claims (
                    version_id, claim_id, classification, confidence, summary,
                    canonical_hash, claim_group_id, drugs_json, drug_classes_json,
                    source_claim_ids_json, votes_up, votes_down
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                params![
                    version_id,
                    item.candidate.claim_id,
                    item.candidate.classification.as_str(),
                    item.candidate.confidence.as_str(),
                    item.candidate.summary,
                    item.canonical_hash,
                    item.group_id,
                    serde_json::to_string(&item.candidate.drugs)?,
                    serde_json::to_string(&item.candidate.drug_classes)?,
                    serde_json::to_string(&item.candidate.source_claim_ids)?,
                    feedback.up,
                    feedback.down,
                ],
            )?;
            let claim_row_id = transaction.last_insert_rowid();

            for evidence in &item.candidate.evidence {
                transaction.execute(
                    r#"
                    INSERT INTO claim_evidence (
                        claim_row_id, snippet_id, pmid, article_title,
                        citation_url, key_points_json, notes
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    params![
                        claim_row_id,
                        evidence.snippet_id,
                        evidence.pmid,
                        evidence.article_title,
                        evidence.resolved_citation_url(),
                        serde_json::to_string(&evidence.key_points)?,
                        evidence.notes,
                    ],
                )?;
            }

            for link in &item.drug_links {
                transaction.execute(
                    "INSERT OR IGNORE INTO claim_drug_links (claim_row_id, term, kind) \
                     VALUES (?1, ?2, ?3)",
                    params![claim_row_id, link.term, link.kind.as_str()],
                )?;
            }
        }

        // Supersession and activation happen together; the transaction
        // guarantees no window with zero or two active versions.
        if let Some(previous) = &active {
            previous
                .status
                .ensure_transition(VersionStatus::Superseded)?;
            transaction.execute(
                "UPDATE claim_set_versions SET status = 'superseded' WHERE version_id = ?1",
                params![previous.id],
            )?;
        }
        transaction.execute(
            "UPDATE claim_set_versions SET status = 'active' WHERE version_id = ?1",
            params![version_id],
        )?;

        let row = transaction.query_row(
            &format!("SELECT {VERSION_COLUMNS} FROM claim_set_versions WHERE version_id = ?1"),
            params![version_id],
            version_row_from_sql,
        )?;
        let version = version_from_row(row)?;
        transaction.commit()?;
        Ok(version)
    }

    async fn active_version(&self, key: &CanonicalKey) -> StoreResult<Option<ClaimSetVersion>> {
        let connection = self.open_connection()?;
        let row = connection
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM claim_set_versions \
                     WHERE key = ?1 AND status = 'active' \
                     ORDER BY version_number DESC LIMIT 1"
                ),
                params![key.as_str()],
                version_row_from_sql,
            )
            .optional()?;
        row.map(version_from_row).transpose()
    }

    async fn get_version(&self, version_id: i64) -> StoreResult<Option<ClaimSetVersion>> {
        let connection = self.open_connection()?;
        let row = connection
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM claim_set_versions WHERE version_id = ?1"
                ),
                params![version_id],
                version_row_from_sql,
            )
            .optional()?;
        row.map(version_from_row).transpose()
    }

    async fn find_version(&self, version_ref: &str) -> StoreResult<Option<ClaimSetVersion>> {
        if let Ok(version_id) = version_ref.parse::<i64>() {
            return self.get_version(version_id).await;
        }

        let connection = self.open_connection()?;
        let row = connection
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM claim_set_versions \
                     WHERE slug = ?1 AND status = 'active' \
                     ORDER BY version_number DESC LIMIT 1"
                ),
                params![version_ref],
                version_row_from_sql,
            )
            .optional()?;
        row.map(version_from_row).transpose()
    }

    async fn claims_for_version(&self, version_id: i64) -> StoreResult<Vec<Claim>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            "SELECT claim_row_id, claim_id, classification, confidence, summary, \
             canonical_hash, claim_group_id, drugs_json, drug_classes_json, \
             source_claim_ids_json, votes_up, votes_down \
             FROM claims WHERE version_id = ?1 ORDER BY claim_row_id",
        )?;
        let rows = statement.query_map(params![version_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, i64>(10)?,
                row.get::<_, i64>(11)?,
            ))
        })?;

        let mut claims = Vec::new();
        for row in rows {
            let (
                claim_row_id,
                claim_id,
                classification,
                confidence,
                summary,
                canonical_hash,
                claim_group_id,
                drugs_json,
                drug_classes_json,
                source_claim_ids_json,
                votes_up,
                votes_down,
            ) = row?;

            let classification = Classification::parse(&classification).ok_or(
                StoreError::InvalidPersistedValue {
                    field: "claims.classification",
                    value: classification.clone(),
                },
            )?;
            let confidence =
                Confidence::parse(&confidence).ok_or(StoreError::InvalidPersistedValue {
                    field: "claims.confidence",
                    value: confidence.clone(),
                })?;

            claims.push(Claim {
                id: claim_row_id,
                version_id,
                claim_id,
                classification,
                confidence,
                summary,
                canonical_hash,
                claim_group_id,
                drugs: serde_json::from_str(&drugs_json)?,
                drug_classes: serde_json::from_str(&drug_classes_json)?,
                source_claim_ids: serde_json::from_str(&source_claim_ids_json)?,
                votes_up,
                votes_down,
                evidence: load_evidence(&connection, claim_row_id)?,
                drug_links: load_drug_links(&connection, claim_row_id)?,
            });
        }
        Ok(claims)
    }

    async fn version_history(&self, key: &CanonicalKey) -> StoreResult<Vec<ClaimSetVersion>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM claim_set_versions \
             WHERE key = ?1 ORDER BY version_number DESC"
        ))?;
        let rows = statement.query_map(params![key.as_str()], version_row_from_sql)?;

        let mut versions = Vec::new();
        for row in rows {
            versions.push(version_from_row(row?)?);
        }
        Ok(versions)
    }
}

fn check_basis(
    key: &str,
    basis: Option<BasisGuard>,
    active: Option<&ClaimSetVersion>,
) -> StoreResult<()> {
    let Some(guard) = basis else {
        return Ok(());
    };
    let current = active.map(|version| version.id);
    if current != guard.active_version_id {
        return Err(StoreError::SupersededBasis {
            key: key.to_string(),
            expected: guard.active_version_id,
            found: current.unwrap_or_default(),
        });
    }
    Ok(())
}

fn feedback_aggregate(
    transaction: &Transaction<'_>,
    group_id: &str,
) -> StoreResult<FeedbackAggregate> {
    let row = transaction
        .query_row(
            "SELECT votes_up, votes_down FROM claim_feedback WHERE claim_group_id = ?1",
            params![group_id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;
    Ok(row
        .map(|(up, down)| FeedbackAggregate { up, down })
        .unwrap_or_default())
}

fn load_evidence(connection: &Connection, claim_row_id: i64) -> StoreResult<Vec<ClaimEvidence>> {
    let mut statement = connection.prepare(
        "SELECT snippet_id, pmid, article_title, citation_url, key_points_json, notes \
         FROM claim_evidence WHERE claim_row_id = ?1 ORDER BY evidence_id",
    )?;
    let rows = statement.query_map(params![claim_row_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;

    let mut evidence = Vec::new();
    for row in rows {
        let (snippet_id, pmid, article_title, citation_url, key_points_json, notes) = row?;
        evidence.push(ClaimEvidence {
            snippet_id,
            pmid,
            article_title,
            citation_url,
            key_points: serde_json::from_str(&key_points_json)?,
            notes,
        });
    }
    Ok(evidence)
}

fn load_drug_links(connection: &Connection, claim_row_id: i64) -> StoreResult<Vec<DrugLink>> {
    let mut statement = connection.prepare(
        "SELECT term, kind FROM claim_drug_links WHERE claim_row_id = ?1 ORDER BY link_id",
    )?;
    let rows = statement.query_map(params![claim_row_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut links = Vec::new();
    for row in rows {
        let (term, kind) = row?;
        let kind = DrugLinkKind::parse(&kind).ok_or(StoreError::InvalidPersistedValue {
            field: "claim_drug_links.kind",
            value: kind.clone(),
        })?;
        links.push(DrugLink { term, kind });
    }
    Ok(links)
}

#[async_trait]
impl FeedbackStore for SqliteStore {
    async fn get_aggregate(&self, group_id: &str) -> StoreResult<FeedbackAggregate> {
        let connection = self.open_connection()?;
        let row = connection
            .query_row(
                "SELECT votes_up, votes_down FROM claim_feedback WHERE claim_group_id = ?1",
                params![group_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(row
            .map(|(up, down)| FeedbackAggregate { up, down })
            .unwrap_or_default())
    }

    async fn record_vote(
        &self,
        group_id: &str,
        vote: FeedbackVote,
    ) -> StoreResult<FeedbackAggregate> {
        let (up_delta, down_delta) = match vote {
            FeedbackVote::Up => (1, 0),
            FeedbackVote::Down => (0, 1),
        };

        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        transaction.execute(
            r#"
            INSERT INTO claim_feedback (claim_group_id, votes_up, votes_down, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(claim_group_id) DO UPDATE SET
                votes_up = votes_up + ?2,
                votes_down = votes_down + ?3,
                updated_at = ?4
            "#,
            params![group_id, up_delta, down_delta, timestamp_to_db(Utc::now())],
        )?;
        let aggregate = transaction.query_row(
            "SELECT votes_up, votes_down FROM claim_feedback WHERE claim_group_id = ?1",
            params![group_id],
            |row| {
                Ok(FeedbackAggregate {
                    up: row.get(0)?,
                    down: row.get(1)?,
                })
            },
        )?;
        transaction.commit()?;
        Ok(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EnsureJobRequest, NewVersion};
    use evid_types::{
        CandidateClaim, Classification, Confidence, EvidenceBundle, StalenessThresholds,
    };
    use tempfile::tempdir;

    fn key() -> CanonicalKey {
        CanonicalKey::from_signature("anesthesia|malignant hyperthermia")
    }

    fn ensure_request() -> EnsureJobRequest {
        EnsureJobRequest {
            key: key(),
            condition_label: "Malignant Hyperthermia".to_string(),
            mesh_terms: vec![
                "Malignant Hyperthermia".to_string(),
                "Anesthesia".to_string(),
            ],
            thresholds: StalenessThresholds::default(),
        }
    }

    fn bundle() -> EvidenceBundle {
        EvidenceBundle {
            claims: vec![CandidateClaim {
                claim_id: "c-1".to_string(),
                classification: Classification::Risk,
                confidence: Confidence::High,
                summary: "Volatile anesthetics can trigger crises.".to_string(),
                drugs: vec!["Sevoflurane".to_string()],
                drug_classes: vec!["volatile anesthetics".to_string()],
                source_claim_ids: Vec::new(),
                evidence: vec![evid_types::ClaimEvidence {
                    snippet_id: "s-1".to_string(),
                    pmid: "22222".to_string(),
                    article_title: Some("Review".to_string()),
                    citation_url: None,
                    key_points: vec!["avoid volatile agents".to_string()],
                    notes: None,
                }],
            }],
        }
    }

    fn new_version() -> NewVersion {
        NewVersion {
            key: key(),
            condition_label: "Malignant Hyperthermia".to_string(),
            bundle: bundle(),
            pipeline_config_id: None,
            model_id: None,
            source_job_id: None,
            basis: None,
        }
    }

    #[tokio::test]
    async fn job_lifecycle_survives_round_trip() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("evid.db")).expect("store");

        let ensured = store.ensure_job(ensure_request()).await.expect("ensure");
        assert!(ensured.created);
        assert_eq!(ensured.job.status, RefreshStatus::Queued);

        let again = store.ensure_job(ensure_request()).await.expect("ensure");
        assert!(!again.created);
        assert_eq!(again.job.id, ensured.job.id);

        let claimed = store
            .claim_next_queued("worker-1")
            .await
            .expect("claim")
            .expect("job");
        assert_eq!(claimed.id, ensured.job.id);
        assert_eq!(claimed.status, RefreshStatus::Running);

        store
            .advance(claimed.id, RefreshStage::InvokingLlm, Some("batch 2/4"))
            .await
            .expect("advance");
        let job = store
            .get_job(claimed.id)
            .await
            .expect("get")
            .expect("job");
        assert_eq!(job.stage, Some(RefreshStage::InvokingLlm));
        assert_eq!(job.stage_detail.as_deref(), Some("batch 2/4"));

        store
            .complete(claimed.id, RefreshOutcome::NoResponses, None, None)
            .await
            .expect("complete");
        let job = store
            .get_job(claimed.id)
            .await
            .expect("get")
            .expect("job");
        assert_eq!(job.status, RefreshStatus::NoResponses);
        assert!(job.finished_at.is_some());

        // Terminal jobs free the in-flight slot.
        let fresh = store.ensure_job(ensure_request()).await.expect("ensure");
        assert!(fresh.created);
        assert_ne!(fresh.job.id, ensured.job.id);
    }

    #[tokio::test]
    async fn commit_persists_claims_evidence_and_links() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("evid.db")).expect("store");

        let version = store.commit(new_version()).await.expect("commit");
        assert_eq!(version.version_number, 1);
        assert_eq!(version.status, VersionStatus::Active);

        let claims = store.claims_for_version(version.id).await.expect("claims");
        assert_eq!(claims.len(), 1);
        let claim = &claims[0];
        assert_eq!(claim.classification, Classification::Risk);
        assert_eq!(claim.evidence.len(), 1);
        assert_eq!(
            claim.evidence[0].citation_url.as_deref(),
            Some("https://pubmed.ncbi.nlm.nih.gov/22222/")
        );
        assert_eq!(claim.drug_links.len(), 2);
        assert!(claim.claim_group_id.starts_with("grp-"));
    }

    #[tokio::test]
    async fn recommit_supersedes_and_reuses_group_ids() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("evid.db")).expect("store");

        let first = store.commit(new_version()).await.expect("commit");
        let second = store.commit(new_version()).await.expect("commit");
        assert_eq!(second.version_number, 2);

        let history = store.version_history(&key()).await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, VersionStatus::Active);
        assert_eq!(history[1].status, VersionStatus::Superseded);

        let first_claims = store.claims_for_version(first.id).await.expect("claims");
        let second_claims = store.claims_for_version(second.id).await.expect("claims");
        assert_eq!(
            first_claims[0].claim_group_id,
            second_claims[0].claim_group_id
        );
    }

    #[tokio::test]
    async fn feedback_votes_survive_recommit() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("evid.db")).expect("store");

        let first = store.commit(new_version()).await.expect("commit");
        let group_id = store.claims_for_version(first.id).await.expect("claims")[0]
            .claim_group_id
            .clone();

        let aggregate = store
            .record_vote(&group_id, FeedbackVote::Up)
            .await
            .expect("vote");
        assert_eq!(aggregate.up, 1);

        let second = store.commit(new_version()).await.expect("commit");
        let carried = store.claims_for_version(second.id).await.expect("claims");
        assert_eq!(carried[0].votes_up, 1);
        assert_eq!(carried[0].votes_down, 0);
    }

    #[tokio::test]
    async fn basis_guard_blocks_late_commit() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("evid.db")).expect("store");

        store.commit(new_version()).await.expect("commit");

        let mut late = new_version();
        late.basis = Some(BasisGuard {
            active_version_id: None,
        });
        let err = store.commit(late).await.expect_err("guarded");
        assert!(matches!(err, StoreError::SupersededBasis { .. }));
    }

    #[tokio::test]
    async fn find_version_by_slug_returns_active() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("evid.db")).expect("store");

        store.commit(new_version()).await.expect("commit");
        let second = store.commit(new_version()).await.expect("commit");

        let found = store
            .find_version(&second.slug)
            .await
            .expect("find")
            .expect("some");
        assert_eq!(found.id, second.id);
    }
}
