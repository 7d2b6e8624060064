//! PostgreSQL backend for the compliance store.
//!
//! Tables are created by the embedded migrations (`migrations/`). The audit
//! trail stays in its JSONL file; only settings, queue and certificates
//! live here.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use fsk_compliance::ComplianceStore;
use fsk_schemas::{Certificate, CertificateFormat, ComplianceSettings, PendingTransmission, Receipt};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub const ENV_DB_URL: &str = "FSK_DATABASE_URL";

/// Connect to Postgres using FSK_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await
        .context("failed to connect to Postgres")
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_queue_table: bool,
    /// Rows in `transmission_queue`; `None` before migration.
    pub queue_depth: Option<i64>,
}

/// Connectivity, schema presence and queue depth.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = 'transmission_queue'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    let queue_depth = if exists {
        let (n,): (i64,) = sqlx::query_as("select count(*)::bigint from transmission_queue")
            .fetch_one(pool)
            .await
            .context("status queue depth query failed")?;
        Some(n)
    } else {
        None
    };

    Ok(DbStatus {
        ok: one == 1,
        has_queue_table: exists,
        queue_depth,
    })
}

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn pending_from_row(row: &PgRow) -> Result<PendingTransmission> {
    let Json(payload): Json<Receipt> = row.try_get("payload")?;
    let attempts: i32 = row.try_get("attempt_count")?;
    Ok(PendingTransmission {
        receipt_id: row.try_get("receipt_id")?,
        order_id: row.try_get("order_id")?,
        payload,
        enqueued_at: row.try_get("enqueued_at")?,
        attempt_count: u32::try_from(attempts).context("negative attempt_count")?,
        last_attempt_at: row.try_get::<Option<DateTime<Utc>>, _>("last_attempt_at")?,
    })
}

fn certificate_from_row(row: &PgRow) -> Result<Certificate> {
    let format: String = row.try_get("format")?;
    let format = match format.as_str() {
        "p12" => CertificateFormat::P12,
        "pfx" => CertificateFormat::Pfx,
        other => return Err(anyhow!("unknown certificate format in db: {other}")),
    };
    let size: i64 = row.try_get("size_bytes")?;
    Ok(Certificate {
        certificate_id: row.try_get("certificate_id")?,
        filename: row.try_get("filename")?,
        format,
        uploaded_at: row.try_get("uploaded_at")?,
        active: row.try_get("active")?,
        fingerprint: row.try_get("fingerprint")?,
        size_bytes: u64::try_from(size).context("negative size_bytes")?,
    })
}

fn attempts_i32(item: &PendingTransmission) -> Result<i32> {
    i32::try_from(item.attempt_count).context("attempt_count out of range")
}

#[async_trait::async_trait]
impl ComplianceStore for PgStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn load_settings(&self) -> Result<Option<ComplianceSettings>> {
        let row = sqlx::query("select settings from compliance_settings where id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("load_settings failed")?;
        match row {
            Some(r) => {
                let Json(s): Json<ComplianceSettings> = r.try_get("settings")?;
                Ok(Some(s))
            }
            None => Ok(None),
        }
    }

    async fn save_settings(&self, settings: &ComplianceSettings) -> Result<()> {
        sqlx::query(
            r#"
            insert into compliance_settings (id, settings, updated_at)
            values (1, $1, now())
            on conflict (id) do update
              set settings = excluded.settings, updated_at = excluded.updated_at
            "#,
        )
        .bind(Json(settings))
        .execute(&self.pool)
        .await
        .context("save_settings failed")?;
        Ok(())
    }

    async fn load_queue(&self) -> Result<Vec<PendingTransmission>> {
        let rows = sqlx::query(
            r#"
            select receipt_id, order_id, payload, enqueued_at, attempt_count, last_attempt_at
            from transmission_queue
            order by seq asc
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_queue failed")?;
        rows.iter().map(pending_from_row).collect()
    }

    async fn insert_pending(&self, item: &PendingTransmission) -> Result<()> {
        sqlx::query(
            r#"
            insert into transmission_queue (
              receipt_id, order_id, payload, enqueued_at, attempt_count, last_attempt_at
            ) values ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(item.receipt_id)
        .bind(&item.order_id)
        .bind(Json(&item.payload))
        .bind(item.enqueued_at)
        .bind(attempts_i32(item)?)
        .bind(item.last_attempt_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("insert_pending failed for receipt {}", item.receipt_id))?;
        Ok(())
    }

    async fn update_pending(&self, item: &PendingTransmission) -> Result<()> {
        let res = sqlx::query(
            r#"
            update transmission_queue
               set attempt_count = $2, last_attempt_at = $3
             where receipt_id = $1
            "#,
        )
        .bind(item.receipt_id)
        .bind(attempts_i32(item)?)
        .bind(item.last_attempt_at)
        .execute(&self.pool)
        .await
        .context("update_pending failed")?;
        if res.rows_affected() != 1 {
            return Err(anyhow!("QUEUE_MISSING: receipt {} not stored", item.receipt_id));
        }
        Ok(())
    }

    async fn remove_pending(&self, receipt_id: Uuid) -> Result<()> {
        sqlx::query("delete from transmission_queue where receipt_id = $1")
            .bind(receipt_id)
            .execute(&self.pool)
            .await
            .context("remove_pending failed")?;
        Ok(())
    }

    async fn load_certificates(&self) -> Result<Vec<Certificate>> {
        let rows = sqlx::query(
            r#"
            select certificate_id, filename, format, uploaded_at, active, fingerprint, size_bytes
            from certificates
            order by uploaded_at asc, certificate_id asc
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_certificates failed")?;
        rows.iter().map(certificate_from_row).collect()
    }

    async fn replace_certificates(&self, certs: &[Certificate]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin tx failed")?;

        sqlx::query("delete from certificates")
            .execute(&mut *tx)
            .await
            .context("clear certificates failed")?;

        for c in certs {
            let size = i64::try_from(c.size_bytes).context("size_bytes out of range")?;
            sqlx::query(
                r#"
                insert into certificates (
                  certificate_id, filename, format, uploaded_at, active, fingerprint, size_bytes
                ) values ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(c.certificate_id)
            .bind(&c.filename)
            .bind(c.format.extension())
            .bind(c.uploaded_at)
            .bind(c.active)
            .bind(&c.fingerprint)
            .bind(size)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("insert certificate {} failed", c.certificate_id))?;
        }

        tx.commit().await.context("commit certificates failed")?;
        Ok(())
    }

    async fn write_certificate_blob(&self, cert: &Certificate, bytes: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            insert into certificate_blobs (certificate_id, bytes)
            values ($1, $2)
            on conflict (certificate_id) do update set bytes = excluded.bytes
            "#,
        )
        .bind(cert.certificate_id)
        .bind(bytes)
        .execute(&self.pool)
        .await
        .context("write_certificate_blob failed")?;
        Ok(())
    }
}
