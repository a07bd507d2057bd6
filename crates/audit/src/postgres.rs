//! PostgreSQL audit store (requires the `audit-postgres` feature).
//!
//! Runtime queries against the `audit_records` table; the schema is ensured
//! at connect time. The table is append-only by construction — the store
//! exposes no update or delete paths.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

use guardian_core::types::{ReasonCode, Severity};

use crate::error::AuditError;
use crate::record::{AuditDecision, AuditRecord, AuditStage, AuditStatus};
use crate::AuditStore;

const ENSURE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit_records (
    audit_id    TEXT PRIMARY KEY,
    lineage_id  TEXT NOT NULL,
    request_id  TEXT NOT NULL,
    trace_id    TEXT NOT NULL,
    subject_id  TEXT NOT NULL,
    stage       TEXT NOT NULL,
    decision    TEXT NOT NULL,
    reason_code TEXT,
    rule_ids    TEXT[] NOT NULL DEFAULT '{}',
    severity    TEXT,
    status      TEXT NOT NULL,
    reviewer_id TEXT,
    notes       TEXT,
    created_ts  TIMESTAMPTZ NOT NULL,
    updated_ts  TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS audit_records_lineage_idx ON audit_records (lineage_id, created_ts);
CREATE INDEX IF NOT EXISTS audit_records_subject_idx ON audit_records (subject_id, created_ts);
"#;

const INSERT_RECORD: &str = r#"
INSERT INTO audit_records (
    audit_id, lineage_id, request_id, trace_id, subject_id,
    stage, decision, reason_code, rule_ids, severity,
    status, reviewer_id, notes, created_ts, updated_ts
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
"#;

/// Durable audit ledger over PostgreSQL.
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    /// Connect to `DATABASE_URL` and ensure the schema exists.
    pub async fn connect(url: &str) -> Result<Self, AuditError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        sqlx::raw_sql(ENSURE_SCHEMA).execute(&pool).await?;
        info!("audit ledger connected");
        Ok(Self { pool })
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<AuditRecord, AuditError> {
        let stage: String = row.try_get("stage")?;
        let decision: String = row.try_get("decision")?;
        let status: String = row.try_get("status")?;
        let reason_code: Option<String> = row.try_get("reason_code")?;
        let severity: Option<String> = row.try_get("severity")?;

        Ok(AuditRecord {
            audit_id: row.try_get("audit_id")?,
            lineage_id: row.try_get("lineage_id")?,
            request_id: row.try_get("request_id")?,
            trace_id: row.try_get("trace_id")?,
            subject_id: row.try_get("subject_id")?,
            stage: AuditStage::parse(&stage)
                .ok_or_else(|| AuditError::Backend(format!("unknown stage '{}'", stage)))?,
            decision: AuditDecision::parse(&decision)
                .ok_or_else(|| AuditError::Backend(format!("unknown decision '{}'", decision)))?,
            reason_code: reason_code
                .as_deref()
                .map(|s| {
                    serde_json::from_value::<ReasonCode>(serde_json::Value::String(s.to_string()))
                        .map_err(|_| AuditError::Backend(format!("unknown reason code '{}'", s)))
                })
                .transpose()?,
            rule_ids: row.try_get("rule_ids")?,
            severity: severity
                .as_deref()
                .map(|s| {
                    serde_json::from_value::<Severity>(serde_json::Value::String(s.to_string()))
                        .map_err(|_| AuditError::Backend(format!("unknown severity '{}'", s)))
                })
                .transpose()?,
            status: AuditStatus::parse(&status)
                .ok_or_else(|| AuditError::Backend(format!("unknown status '{}'", status)))?,
            reviewer_id: row.try_get("reviewer_id")?,
            notes: row.try_get("notes")?,
            created_ts: row.try_get("created_ts")?,
            updated_ts: row.try_get("updated_ts")?,
        })
    }

    async fn insert_with<'e, E>(executor: E, record: &AuditRecord) -> Result<(), AuditError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let reason_code = record
            .reason_code
            .map(|c| c.as_str().to_string());
        let severity = record.severity.map(|s| s.to_string());
        sqlx::query(INSERT_RECORD)
            .bind(&record.audit_id)
            .bind(&record.lineage_id)
            .bind(&record.request_id)
            .bind(&record.trace_id)
            .bind(&record.subject_id)
            .bind(record.stage.as_str())
            .bind(record.decision.as_str())
            .bind(reason_code)
            .bind(&record.rule_ids)
            .bind(severity)
            .bind(record.status.as_str())
            .bind(&record.reviewer_id)
            .bind(&record.notes)
            .bind(record.created_ts)
            .bind(record.updated_ts)
            .execute(executor)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError> {
        Self::insert_with(&self.pool, &record).await
    }

    async fn append_all(&self, records: Vec<AuditRecord>) -> Result<(), AuditError> {
        let mut tx = self.pool.begin().await?;
        for record in &records {
            Self::insert_with(&mut *tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn read_by_lineage(&self, lineage_id: &str) -> Result<Vec<AuditRecord>, AuditError> {
        let rows = sqlx::query(
            "SELECT * FROM audit_records WHERE lineage_id = $1 ORDER BY created_ts ASC",
        )
        .bind(lineage_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn recent_for_subject(
        &self,
        subject_id: &str,
        window: Duration,
        stage: Option<AuditStage>,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let cutoff: DateTime<Utc> =
            Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
        let rows = match stage {
            Some(stage) => {
                sqlx::query(
                    "SELECT * FROM audit_records \
                     WHERE subject_id = $1 AND created_ts >= $2 AND stage = $3 \
                     ORDER BY created_ts DESC",
                )
                .bind(subject_id)
                .bind(cutoff)
                .bind(stage.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM audit_records \
                     WHERE subject_id = $1 AND created_ts >= $2 \
                     ORDER BY created_ts DESC",
                )
                .bind(subject_id)
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn ping(&self) -> Result<(), AuditError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
