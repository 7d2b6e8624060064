//! Build a `ComplianceService` from the typed service config.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fsk_audit::AuditLog;
use fsk_authority::{AuthorityTransport, HttpAuthority, PaperAuthority};
use fsk_compliance::{ComplianceService, ComplianceStore, FileStore, ServiceDeps};
use fsk_config::{AuthoritySecrets, ServiceConfig, StoreKind};
use tracing::warn;

pub async fn open_store(cfg: &ServiceConfig) -> Result<Arc<dyn ComplianceStore>> {
    Ok(match cfg.store {
        StoreKind::File => Arc::new(FileStore::open(&cfg.data_dir)?),
        StoreKind::Postgres => {
            let pool = fsk_db::connect_from_env().await?;
            fsk_db::migrate(&pool).await?;
            Arc::new(fsk_db::PgStore::new(pool))
        }
    })
}

pub fn open_transport(cfg: &ServiceConfig) -> Result<Arc<dyn AuthorityTransport>> {
    match &cfg.authority.base_url {
        Some(url) => {
            let t = HttpAuthority::new(url.clone(), Duration::from_secs(cfg.authority.timeout_secs))
                .context("authority transport init failed")?;
            Ok(Arc::new(t))
        }
        None => {
            warn!("authority.base_url not set; using the paper authority (nothing leaves this host)");
            Ok(Arc::new(PaperAuthority::new()))
        }
    }
}

pub async fn open_service(cfg: &ServiceConfig, secrets: AuthoritySecrets) -> Result<ComplianceService> {
    let store = open_store(cfg).await?;
    let transport = open_transport(cfg)?;
    let audit = Arc::new(
        AuditLog::open(cfg.audit_log_path())
            .with_context(|| format!("open audit log {:?}", cfg.audit_log_path()))?,
    );
    ComplianceService::open(ServiceDeps {
        store,
        transport,
        audit,
        timezone: cfg.timezone()?,
        secrets,
    })
    .await
}
