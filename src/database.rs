#[cfg(feature = "database")]
use async_trait::async_trait;
#[cfg(feature = "database")]
use chrono::{DateTime, TimeZone, Utc};
#[cfg(feature = "database")]
use sqlx::{
    migrate::MigrateDatabase, sqlite::SqlitePoolOptions, sqlite::SqliteRow, Row, SqlitePool,
};
#[cfg(feature = "database")]
use std::path::PathBuf;
#[cfg(feature = "database")]
use tracing::info;

#[cfg(feature = "database")]
use crate::config::DatabaseConfig;
#[cfg(feature = "database")]
use crate::submission::errors::StoreError;
#[cfg(feature = "database")]
use crate::submission::traits::{CertificateStore, LeaseOutcome, QueueStats, SubmissionStore};
#[cfg(feature = "database")]
use crate::submission::types::*;

#[cfg(feature = "database")]
const RECORD_COLUMNS: &str = "id, invoice_id, tenant_id, status, document, signed_document, \
     certificate_id, signed_at, submitted_at, accepted_at, rejected_at, rejection_reason, cycle, \
     preparation_failures, last_error, next_retry_at, lease_holder, lease_expires_at, version, \
     created_at, updated_at";

#[cfg(feature = "database")]
const ATTEMPT_COLUMNS: &str = "id, record_id, tenant_id, initiator_id, ordinal, cycle, submitted_at, \
     status, retry_count, next_retry_at, receipt_number, upload_id, error_message, response, \
     idempotency_key, completed_at";

#[cfg(feature = "database")]
fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[cfg(feature = "database")]
fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

#[cfg(feature = "database")]
fn opt_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(millis)
}

#[cfg(feature = "database")]
fn from_millis(value: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(value)
        .single()
        .ok_or_else(|| StoreError::Backend(format!("invalid timestamp: {value}")))
}

#[cfg(feature = "database")]
fn opt_from_millis(value: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(from_millis).transpose()
}

#[cfg(feature = "database")]
fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name).map_err(backend)
}

#[cfg(feature = "database")]
fn record_from_row(row: &SqliteRow) -> Result<InvoiceSubmissionRecord, StoreError> {
    let status: String = column(row, "status")?;
    let lease_holder: Option<String> = column(row, "lease_holder")?;
    let lease_expires_at = opt_from_millis(column(row, "lease_expires_at")?)?;

    Ok(InvoiceSubmissionRecord {
        id: column::<i64>(row, "id")? as RecordId,
        invoice_id: column::<i64>(row, "invoice_id")? as InvoiceId,
        tenant_id: column::<i64>(row, "tenant_id")? as TenantId,
        status: status
            .parse()
            .map_err(|e: ParseStatusError| StoreError::Backend(e.to_string()))?,
        document: column(row, "document")?,
        signed_document: column(row, "signed_document")?,
        certificate_id: column::<Option<i64>>(row, "certificate_id")?.map(|id| id as CertificateId),
        signed_at: opt_from_millis(column(row, "signed_at")?)?,
        submitted_at: opt_from_millis(column(row, "submitted_at")?)?,
        accepted_at: opt_from_millis(column(row, "accepted_at")?)?,
        rejected_at: opt_from_millis(column(row, "rejected_at")?)?,
        rejection_reason: column(row, "rejection_reason")?,
        cycle: column::<i64>(row, "cycle")? as u32,
        preparation_failures: column::<i64>(row, "preparation_failures")? as u32,
        last_error: column(row, "last_error")?,
        next_retry_at: opt_from_millis(column(row, "next_retry_at")?)?,
        lease: match (lease_holder, lease_expires_at) {
            (Some(holder), Some(expires_at)) => Some(Lease { holder, expires_at }),
            _ => None,
        },
        version: column::<i64>(row, "version")? as u64,
        created_at: from_millis(column(row, "created_at")?)?,
        updated_at: from_millis(column(row, "updated_at")?)?,
    })
}

#[cfg(feature = "database")]
fn attempt_from_row(row: &SqliteRow) -> Result<SubmissionAttempt, StoreError> {
    let status: String = column(row, "status")?;
    let response: String = column(row, "response")?;

    Ok(SubmissionAttempt {
        id: column::<i64>(row, "id")? as AttemptId,
        record_id: column::<i64>(row, "record_id")? as RecordId,
        tenant_id: column::<i64>(row, "tenant_id")? as TenantId,
        initiator_id: column::<Option<i64>>(row, "initiator_id")?.map(|id| id as UserId),
        ordinal: column::<i64>(row, "ordinal")? as u32,
        cycle: column::<i64>(row, "cycle")? as u32,
        submitted_at: from_millis(column(row, "submitted_at")?)?,
        status: status
            .parse()
            .map_err(|e: ParseStatusError| StoreError::Backend(e.to_string()))?,
        retry_count: column::<i64>(row, "retry_count")? as u32,
        next_retry_at: opt_from_millis(column(row, "next_retry_at")?)?,
        receipt_number: column(row, "receipt_number")?,
        upload_id: column(row, "upload_id")?,
        error_message: column(row, "error_message")?,
        response: serde_json::from_str(&response)
            .map_err(|e| StoreError::Backend(format!("invalid response payload: {e}")))?,
        idempotency_key: column(row, "idempotency_key")?,
        completed_at: opt_from_millis(column(row, "completed_at")?)?,
    })
}

#[cfg(feature = "database")]
fn certificate_from_row(row: &SqliteRow) -> Result<SigningCertificate, StoreError> {
    Ok(SigningCertificate {
        id: column::<i64>(row, "id")? as CertificateId,
        tenant_id: column::<i64>(row, "tenant_id")? as TenantId,
        name: column(row, "name")?,
        certificate_path: PathBuf::from(column::<String>(row, "certificate_path")?),
        valid_from: opt_from_millis(column(row, "valid_from")?)?,
        valid_to: from_millis(column(row, "valid_to")?)?,
        is_active: column(row, "is_active")?,
        last_used_at: opt_from_millis(column(row, "last_used_at")?)?,
    })
}

#[cfg(feature = "database")]
/// SQLite-backed submission and certificate store
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[cfg(feature = "database")]
impl SqliteStore {
    /// Open the database, creating it if needed, and run migrations when enabled
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let in_memory = config.url.contains(":memory:");
        if !in_memory && !sqlx::Sqlite::database_exists(&config.url).await? {
            info!("Creating database at {}", config.url);
            sqlx::Sqlite::create_database(&config.url).await?;
        }

        // Every connection to an in-memory database is a separate database,
        // so keep exactly one alive for the pool's lifetime.
        let options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };
        let pool = options.connect(&config.url).await?;

        if config.auto_migrate {
            info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Database migrations completed");
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new record as-is
    pub async fn insert_record(&self, record: &InvoiceSubmissionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO einvoice_records (
                id, invoice_id, tenant_id, status, document, signed_document, certificate_id,
                signed_at, submitted_at, accepted_at, rejected_at, rejection_reason, cycle,
                preparation_failures, last_error, next_retry_at, lease_holder, lease_expires_at,
                version, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
            "#,
        )
        .bind(record.id as i64)
        .bind(record.invoice_id as i64)
        .bind(record.tenant_id as i64)
        .bind(record.status.as_str())
        .bind(&record.document)
        .bind(&record.signed_document)
        .bind(record.certificate_id.map(|id| id as i64))
        .bind(opt_millis(record.signed_at))
        .bind(opt_millis(record.submitted_at))
        .bind(opt_millis(record.accepted_at))
        .bind(opt_millis(record.rejected_at))
        .bind(&record.rejection_reason)
        .bind(record.cycle as i64)
        .bind(record.preparation_failures as i64)
        .bind(&record.last_error)
        .bind(opt_millis(record.next_retry_at))
        .bind(record.lease.as_ref().map(|lease| lease.holder.clone()))
        .bind(record.lease.as_ref().map(|lease| millis(lease.expires_at)))
        .bind(record.version as i64)
        .bind(millis(record.created_at))
        .bind(millis(record.updated_at))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    pub async fn insert_certificate(&self, certificate: &SigningCertificate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO einvoice_certificates (
                id, tenant_id, name, certificate_path, valid_from, valid_to, is_active, last_used_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(certificate.id as i64)
        .bind(certificate.tenant_id as i64)
        .bind(&certificate.name)
        .bind(certificate.certificate_path.to_string_lossy().to_string())
        .bind(opt_millis(certificate.valid_from))
        .bind(millis(certificate.valid_to))
        .bind(certificate.is_active)
        .bind(opt_millis(certificate.last_used_at))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    /// Close database connections gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl SubmissionStore for SqliteStore {
    async fn load_record(&self, id: RecordId) -> Result<Option<InvoiceSubmissionRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {RECORD_COLUMNS} FROM einvoice_records WHERE id = ?1"))
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn acquire_lease(
        &self,
        id: RecordId,
        holder: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<LeaseOutcome, StoreError> {
        let claimed = sqlx::query(
            r#"
            UPDATE einvoice_records
            SET lease_holder = ?1, lease_expires_at = ?2, version = version + 1
            WHERE id = ?3
              AND (lease_holder IS NULL OR lease_holder = ?1 OR lease_expires_at <= ?4)
            "#,
        )
        .bind(holder)
        .bind(millis(now + ttl))
        .bind(id as i64)
        .bind(millis(now))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        let Some(record) = self.load_record(id).await? else {
            return Ok(LeaseOutcome::NotFound);
        };
        if claimed.rows_affected() == 1 {
            return Ok(LeaseOutcome::Acquired(record));
        }
        match record.lease {
            Some(lease) => Ok(LeaseOutcome::Held(lease)),
            // Released between the claim and the read.
            None => Err(StoreError::Conflict {
                record_id: id,
                expected: record.version,
                found: record.version,
            }),
        }
    }

    async fn release_lease(&self, id: RecordId, holder: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE einvoice_records
            SET lease_holder = NULL, lease_expires_at = NULL, version = version + 1
            WHERE id = ?1 AND lease_holder = ?2
            "#,
        )
        .bind(id as i64)
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn update_record(
        &self,
        record: &InvoiceSubmissionRecord,
    ) -> Result<InvoiceSubmissionRecord, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE einvoice_records SET
                status = ?1, document = ?2, signed_document = ?3, certificate_id = ?4,
                signed_at = ?5, submitted_at = ?6, accepted_at = ?7, rejected_at = ?8,
                rejection_reason = ?9, cycle = ?10, preparation_failures = ?11, last_error = ?12,
                next_retry_at = ?13, lease_holder = ?14, lease_expires_at = ?15,
                updated_at = ?16, version = version + 1
            WHERE id = ?17 AND version = ?18
            "#,
        )
        .bind(record.status.as_str())
        .bind(&record.document)
        .bind(&record.signed_document)
        .bind(record.certificate_id.map(|id| id as i64))
        .bind(opt_millis(record.signed_at))
        .bind(opt_millis(record.submitted_at))
        .bind(opt_millis(record.accepted_at))
        .bind(opt_millis(record.rejected_at))
        .bind(&record.rejection_reason)
        .bind(record.cycle as i64)
        .bind(record.preparation_failures as i64)
        .bind(&record.last_error)
        .bind(opt_millis(record.next_retry_at))
        .bind(record.lease.as_ref().map(|lease| lease.holder.clone()))
        .bind(record.lease.as_ref().map(|lease| millis(lease.expires_at)))
        .bind(millis(record.updated_at))
        .bind(record.id as i64)
        .bind(record.version as i64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return match self.load_record(record.id).await? {
                None => Err(StoreError::RecordNotFound(record.id)),
                Some(current) => Err(StoreError::Conflict {
                    record_id: record.id,
                    expected: record.version,
                    found: current.version,
                }),
            };
        }

        let mut stored = record.clone();
        stored.version += 1;
        Ok(stored)
    }

    async fn list_attempts(&self, record_id: RecordId) -> Result<Vec<SubmissionAttempt>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM einvoice_submissions WHERE record_id = ?1 ORDER BY id ASC"
        ))
        .bind(record_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn insert_attempt(&self, attempt: NewAttempt) -> Result<SubmissionAttempt, StoreError> {
        let draft = SubmissionAttempt::from_new(0, attempt);
        let result = sqlx::query(
            r#"
            INSERT INTO einvoice_submissions (
                record_id, tenant_id, initiator_id, ordinal, cycle, submitted_at, status,
                retry_count, response, idempotency_key
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(draft.record_id as i64)
        .bind(draft.tenant_id as i64)
        .bind(draft.initiator_id.map(|id| id as i64))
        .bind(draft.ordinal as i64)
        .bind(draft.cycle as i64)
        .bind(millis(draft.submitted_at))
        .bind(draft.status.as_str())
        .bind(draft.retry_count as i64)
        .bind(draft.response.to_string())
        .bind(&draft.idempotency_key)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            let unique = e
                .as_database_error()
                .is_some_and(|db| db.is_unique_violation());
            if unique {
                StoreError::DuplicateIdempotencyKey(draft.idempotency_key.clone())
            } else {
                backend(e)
            }
        })?;

        Ok(SubmissionAttempt {
            id: result.last_insert_rowid() as AttemptId,
            ..draft
        })
    }

    async fn update_attempt(&self, attempt: &SubmissionAttempt) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE einvoice_submissions SET
                status = ?1, next_retry_at = ?2, receipt_number = ?3, upload_id = ?4,
                error_message = ?5, response = ?6, completed_at = ?7
            WHERE id = ?8 AND status NOT IN ('ACCEPTED', 'REJECTED')
            "#,
        )
        .bind(attempt.status.as_str())
        .bind(opt_millis(attempt.next_retry_at))
        .bind(&attempt.receipt_number)
        .bind(&attempt.upload_id)
        .bind(&attempt.error_message)
        .bind(attempt.response.to_string())
        .bind(opt_millis(attempt.completed_at))
        .bind(attempt.id as i64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM einvoice_submissions WHERE id = ?1")
                .bind(attempt.id as i64)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?
                .is_some();
            return Err(if exists {
                StoreError::ImmutableAttempt(attempt.id)
            } else {
                StoreError::AttemptNotFound(attempt.id)
            });
        }
        Ok(())
    }

    async fn records_due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RecordId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM einvoice_records
            WHERE status NOT IN ('ACCEPTED', 'REJECTED')
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= ?1
            ORDER BY next_retry_at ASC, id ASC
            LIMIT ?2
            "#,
        )
        .bind(millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter()
            .map(|row| column::<i64>(row, "id").map(|id| id as RecordId))
            .collect()
    }

    async fn queue_stats(
        &self,
        tenant_id: Option<TenantId>,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<QueueStats, StoreError> {
        let tenant = tenant_id.map(|id| id as i64);
        let counts = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'PENDING' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN status = 'ERROR' THEN 1 ELSE 0 END), 0) AS error
            FROM einvoice_submissions
            WHERE (?1 IS NULL OR tenant_id = ?1)
            "#,
        )
        .bind(tenant)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;

        let latest = sqlx::query(
            r#"
            SELECT s.* FROM einvoice_submissions s
            JOIN einvoice_records r ON r.id = s.record_id
            WHERE s.id = (SELECT MAX(id) FROM einvoice_submissions WHERE record_id = s.record_id)
              AND s.status = 'ERROR'
              AND r.status NOT IN ('ACCEPTED', 'REJECTED', 'FAILED')
              AND (?1 IS NULL OR s.tenant_id = ?1)
            "#,
        )
        .bind(tenant)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut ready_for_retry = 0;
        for row in &latest {
            if attempt_from_row(row)?.is_ready_for_retry(now, max_attempts) {
                ready_for_retry += 1;
            }
        }

        Ok(QueueStats {
            pending: column::<i64>(&counts, "pending")? as usize,
            error: column::<i64>(&counts, "error")? as usize,
            ready_for_retry,
        })
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl CertificateStore for SqliteStore {
    async fn find_certificate(&self, id: CertificateId) -> Result<Option<SigningCertificate>, StoreError> {
        let row = sqlx::query("SELECT * FROM einvoice_certificates WHERE id = ?1")
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(certificate_from_row).transpose()
    }

    async fn certificates_for_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<SigningCertificate>, StoreError> {
        let rows = sqlx::query("SELECT * FROM einvoice_certificates WHERE tenant_id = ?1 ORDER BY id ASC")
            .bind(tenant_id as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(certificate_from_row).collect()
    }

    async fn touch_certificate(&self, id: CertificateId, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE einvoice_certificates SET last_used_at = ?1 WHERE id = ?2")
            .bind(millis(at))
            .bind(id as i64)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}
