//! PgStore round trips against a real database.
//!
//! DB-backed tests, skipped if FSK_DATABASE_URL is not set. Each test uses
//! its own receipt/certificate ids, but certificate and settings tests reset
//! their tables; do not point this at a production database.

use chrono::Utc;
use fsk_compliance::ComplianceStore;
use fsk_db::PgStore;
use fsk_schemas::{
    Certificate, CertificateFormat, CompletedOrder, ComplianceSettings, PendingTransmission,
    Receipt,
};
use uuid::Uuid;

async fn store() -> anyhow::Result<Option<PgStore>> {
    let url = match std::env::var(fsk_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: FSK_DATABASE_URL not set");
            return Ok(None);
        }
    };
    let pool = fsk_db::connect(&url).await?;
    fsk_db::migrate(&pool).await?;
    Ok(Some(PgStore::new(pool)))
}

fn pending(order_id: &str) -> PendingTransmission {
    let r = Receipt::from_order(&CompletedOrder {
        order_id: order_id.to_string(),
        table: None,
        lines: vec![],
        completed_at: Utc::now(),
    }).unwrap();
    PendingTransmission::new(r, Utc::now())
}

fn cert(active: bool) -> Certificate {
    Certificate {
        certificate_id: Uuid::new_v4(),
        filename: "c.p12".to_string(),
        format: CertificateFormat::P12,
        uploaded_at: Utc::now(),
        active,
        fingerprint: "ab".repeat(32),
        size_bytes: 3,
    }
}

#[tokio::test]
async fn migrate_is_idempotent_and_status_sees_queue_table() -> anyhow::Result<()> {
    let Some(s) = store().await? else {
        return Ok(());
    };
    fsk_db::migrate(s.pool()).await?;
    let st = fsk_db::status(s.pool()).await?;
    assert!(st.ok);
    assert!(st.has_queue_table);
    assert!(st.queue_depth.is_some());
    Ok(())
}

#[tokio::test]
async fn queue_round_trip_preserves_fifo_and_attempts() -> anyhow::Result<()> {
    let Some(s) = store().await? else {
        return Ok(());
    };
    let tag = Uuid::new_v4();
    let a = pending(&format!("{tag}-a"));
    let b = pending(&format!("{tag}-b"));
    s.insert_pending(&a).await?;
    s.insert_pending(&b).await?;
    assert!(s.insert_pending(&a).await.is_err(), "receipt_id is unique");

    let mut bumped = a.clone();
    bumped.attempt_count = 1;
    bumped.last_attempt_at = Some(Utc::now());
    s.update_pending(&bumped).await?;

    let mine: Vec<PendingTransmission> = s
        .load_queue()
        .await?
        .into_iter()
        .filter(|p| p.order_id.starts_with(&tag.to_string()))
        .collect();
    assert_eq!(mine.len(), 2);
    assert_eq!(mine[0].receipt_id, a.receipt_id);
    assert_eq!(mine[0].attempt_count, 1);
    assert_eq!(mine[0].payload, a.payload);
    assert_eq!(mine[1].receipt_id, b.receipt_id);

    s.remove_pending(a.receipt_id).await?;
    s.remove_pending(b.receipt_id).await?;
    assert!(s.update_pending(&bumped).await.is_err());
    Ok(())
}

#[tokio::test]
async fn settings_and_certificates_round_trip() -> anyhow::Result<()> {
    let Some(s) = store().await? else {
        return Ok(());
    };
    let settings = ComplianceSettings {
        enabled: true,
        participant_id: "ATU1".to_string(),
        pin: "4711".into(),
        ..Default::default()
    };
    s.save_settings(&settings).await?;
    assert_eq!(s.load_settings().await?, Some(settings));

    let old = cert(false);
    let new = cert(true);
    s.write_certificate_blob(&new, b"abc").await?;
    s.replace_certificates(&[old.clone(), new.clone()]).await?;
    let loaded = s.load_certificates().await?;
    assert_eq!(loaded.iter().filter(|c| c.active).count(), 1);
    assert!(loaded.iter().any(|c| c.certificate_id == new.certificate_id && c.active));

    // Two active rows violate the partial unique index and roll back.
    let mut bad = cert(true);
    bad.uploaded_at = Utc::now();
    assert!(s.replace_certificates(&[new.clone(), bad]).await.is_err());
    assert_eq!(s.load_certificates().await?.len(), 2);
    Ok(())
}
