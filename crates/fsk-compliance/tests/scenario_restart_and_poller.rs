//! Lifecycle: restart from disk, business-day rollover, background poller.
//!
//! GREEN when:
//! - Settings, queue, certificates and the daily counter survive a restart;
//!   link state does not (a new connection test is required).
//! - Day rollover resets the daily counter and nothing else.
//! - The poller only drains in auto_drain mode, only when enabled and
//!   connected, and stops on shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fsk_audit::{AuditAction, AuditLog};
use fsk_authority::PaperAuthority;
use fsk_compliance::{
    ComplianceError, ComplianceService, FileStore, MemoryStore, ServiceDeps, TickOutcome,
};
use fsk_config::{AuthoritySecrets, PollConfig, PollMode};
use fsk_schemas::{CompletedOrder, SettingsPatch};

async fn open_file_service(data: &Path, paper: Arc<PaperAuthority>) -> ComplianceService {
    ComplianceService::open(ServiceDeps {
        store: Arc::new(FileStore::open(data).unwrap()),
        transport: paper,
        audit: Arc::new(AuditLog::open(data.join("audit.jsonl")).unwrap()),
        timezone: chrono_tz::Europe::Vienna,
        secrets: AuthoritySecrets::default(),
    })
    .await
    .unwrap()
}

async fn configure(svc: &ComplianceService) {
    svc.update_settings(SettingsPatch {
        enabled: Some(true),
        participant_id: Some("ATU1".to_string()),
        user_id: Some("u".to_string()),
        ..Default::default()
    })
    .await
    .unwrap();
    svc.upload_certificate("c.p12", b"c").await.unwrap();
}

fn order(id: &str) -> CompletedOrder {
    CompletedOrder {
        order_id: id.to_string(),
        table: None,
        lines: vec![],
        completed_at: Utc::now(),
    }
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let paper = Arc::new(PaperAuthority::new());

    {
        let svc = open_file_service(&data, paper.clone()).await;
        configure(&svc).await;
        svc.test_connection().await.unwrap();
        for id in ["o1", "o2", "o3"] {
            svc.on_order_completed(order(id)).await.unwrap();
        }
        paper.fail_order("o3");
        let r = svc.transmit_now().await.unwrap();
        assert_eq!(r.transmitted_count, 2);
    }

    let svc = open_file_service(&data, paper.clone()).await;
    assert_eq!(svc.settings().participant_id, "ATU1");
    assert!(svc.active_certificate().await.is_some());

    let status = svc.status().await;
    assert_eq!(status.pending_count, 1);
    assert_eq!(status.transmitted_today_count, 2);
    assert!(status.last_transmitted_at.is_some());
    assert!(!status.connected, "link state is not persisted");

    let pending = svc.pending().await;
    assert_eq!(pending[0].order_id, "o3");
    assert_eq!(pending[0].attempt_count, 1);
    assert_eq!(svc.audit_log("o1").last().unwrap().action, AuditAction::Transmitted);

    assert!(matches!(
        svc.transmit_now().await,
        Err(ComplianceError::Link(_))
    ));
    paper.clear_failures();
    svc.test_connection().await.unwrap();
    assert_eq!(svc.transmit_now().await.unwrap().transmitted_count, 1);
    assert_eq!(svc.status().await.transmitted_today_count, 3);
}

#[tokio::test]
async fn rollover_resets_daily_counter_only() {
    let dir = tempfile::tempdir().unwrap();
    let paper = Arc::new(PaperAuthority::new());
    let svc = open_file_service(dir.path(), paper).await;
    configure(&svc).await;
    svc.test_connection().await.unwrap();
    svc.on_order_completed(order("o1")).await.unwrap();
    svc.on_order_completed(order("o2")).await.unwrap();
    svc.transmit_now().await.unwrap();

    let status_rx = svc.subscribe_status();
    assert_eq!(status_rx.borrow().transmitted_today_count, 2);
    let last_sent = status_rx.borrow().last_transmitted_at;

    let tomorrow = Utc::now() + chrono::Duration::days(1);
    svc.refresh_at(tomorrow).await;

    let rolled = status_rx.borrow().clone();
    assert_eq!(rolled.transmitted_today_count, 0);
    assert_eq!(
        rolled.business_day,
        tomorrow.with_timezone(&chrono_tz::Europe::Vienna).date_naive()
    );
    assert_eq!(rolled.last_transmitted_at, last_sent);
    assert!(rolled.connected);
}

#[tokio::test]
async fn poll_tick_respects_enabled_and_mode() {
    let dir = tempfile::tempdir().unwrap();
    let paper = Arc::new(PaperAuthority::new());
    let svc = ComplianceService::open(ServiceDeps {
        store: Arc::new(MemoryStore::new()),
        transport: paper.clone(),
        audit: Arc::new(AuditLog::open(dir.path().join("audit.jsonl")).unwrap()),
        timezone: chrono_tz::Europe::Vienna,
        secrets: AuthoritySecrets::default(),
    })
    .await
    .unwrap();

    svc.on_order_completed(order("o1")).await.unwrap();
    assert_eq!(svc.poll_tick(PollMode::AutoDrain).await, TickOutcome::Disabled);

    configure(&svc).await;
    // Enabled but never tested: auto_drain only refreshes.
    assert_eq!(svc.poll_tick(PollMode::AutoDrain).await, TickOutcome::Refreshed);

    svc.test_connection().await.unwrap();
    assert_eq!(svc.poll_tick(PollMode::StatusOnly).await, TickOutcome::Refreshed);
    assert_eq!(svc.pending().await.len(), 1);
    assert!(paper.submissions().is_empty());

    match svc.poll_tick(PollMode::AutoDrain).await {
        TickOutcome::Drained(r) => assert_eq!(r.transmitted_count, 1),
        other => panic!("expected drain, got {other:?}"),
    }
    let attempt = svc
        .audit_log("o1")
        .into_iter()
        .find(|e| e.action == AuditAction::TransmitAttempt)
        .unwrap();
    assert_eq!(attempt.actor, fsk_audit::Actor::Poller);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_poller_drains_and_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let paper = Arc::new(PaperAuthority::new());
    let svc = Arc::new(open_file_service(dir.path(), paper.clone()).await);
    configure(&svc).await;
    svc.test_connection().await.unwrap();
    svc.on_order_completed(order("o1")).await.unwrap();

    let poller = svc.start_poller(&PollConfig {
        interval_secs: 1,
        mode: PollMode::AutoDrain,
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !svc.pending().await.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "poller never drained");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(paper.accepted_count(), 1);

    poller.shutdown().await;

    svc.on_order_completed(order("o2")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(svc.pending().await.len(), 1, "stopped poller sends nothing");
}
