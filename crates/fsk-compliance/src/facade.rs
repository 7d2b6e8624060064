//! `ComplianceService`: the single entry point for the Orders hook, the
//! settings UI and the daemon.
//!
//! At most one of {test, transmit, upload, export} runs at a time; an
//! overlapping call gets `Busy` immediately. Poller ticks take the same
//! guard and skip when it is held. Order completion does not take it:
//! intake must never be refused because an operator is exporting.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use fsk_audit::{Actor, AuditAction, AuditEntry, AuditLog};
use fsk_authority::AuthorityTransport;
use fsk_config::{business_day, AuthoritySecrets, PollConfig, PollMode};
use fsk_schemas::{
    Certificate, CompletedOrder, ComplianceSettings, ConnectionStatus, DrainReport,
    ExportReceipt, PendingTransmission, Receipt, SettingsPatch,
};
use serde_json::json;
use tokio::sync::{oneshot, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::certificate::CertificateManager;
use crate::error::ComplianceError;
use crate::export::DepExporter;
use crate::monitor::ConnectionMonitor;
use crate::queue::TransmissionQueue;
use crate::settings::SettingsStore;
use crate::store::ComplianceStore;
use crate::worker::{DrainRequest, TransmissionWorker};

/// Collaborators the service is built from.
pub struct ServiceDeps {
    pub store: Arc<dyn ComplianceStore>,
    pub transport: Arc<dyn AuthorityTransport>,
    pub audit: Arc<AuditLog>,
    pub timezone: Tz,
    pub secrets: AuthoritySecrets,
}

pub struct ComplianceService {
    settings: SettingsStore,
    certificates: CertificateManager,
    monitor: ConnectionMonitor,
    queue: Arc<TransmissionQueue>,
    worker: TransmissionWorker,
    exporter: DepExporter,
    audit: Arc<AuditLog>,
    status: RwLock<ConnectionStatus>,
    status_tx: watch::Sender<ConnectionStatus>,
    busy: Mutex<()>,
    intake: Mutex<()>,
    timezone: Tz,
    store_kind: &'static str,
}

impl ComplianceService {
    /// Load persisted state and rebuild the status counters.
    ///
    /// `transmitted_today_count` and `last_transmitted_at` come from the
    /// `transmitted` entries in the audit log; `pending_count` from the queue.
    pub async fn open(deps: ServiceDeps) -> anyhow::Result<Self> {
        let ServiceDeps {
            store,
            transport,
            audit,
            timezone,
            secrets,
        } = deps;

        let settings = SettingsStore::load(store.clone(), secrets).await?;
        let certificates = CertificateManager::load(store.clone(), audit.clone()).await?;
        let queue = Arc::new(TransmissionQueue::load(store.clone(), audit.clone()).await?);

        let status = rebuild_status(&audit.entries(), timezone, Utc::now(), queue.len().await);
        let (status_tx, _rx) = watch::channel(status.clone());

        info!(
            store = store.kind(),
            transport = transport.name(),
            pending = status.pending_count,
            transmitted_today = status.transmitted_today_count,
            audit_entries = audit.len(),
            "compliance service opened"
        );

        Ok(Self {
            settings,
            certificates,
            monitor: ConnectionMonitor::new(transport.clone()),
            worker: TransmissionWorker::new(queue.clone(), audit.clone(), transport),
            exporter: DepExporter::new(audit.clone()),
            queue,
            audit,
            status: RwLock::new(status),
            status_tx,
            busy: Mutex::new(()),
            intake: Mutex::new(()),
            timezone,
            store_kind: store.kind(),
        })
    }

    // -----------------------------------------------------------------------
    // Guards + status plumbing
    // -----------------------------------------------------------------------

    fn try_busy(&self) -> Result<MutexGuard<'_, ()>, ComplianceError> {
        self.busy
            .try_lock()
            .map_err(|_| ComplianceError::Busy("another compliance operation is in progress"))
    }

    fn update_status(&self, f: impl FnOnce(&mut ConnectionStatus)) {
        let snapshot = {
            let mut st = self.status.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut st);
            st.clone()
        };
        self.status_tx.send_replace(snapshot);
    }

    fn status_snapshot(&self) -> ConnectionStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Changes to the connection status, for push consumers (SSE).
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn store_kind(&self) -> &'static str {
        self.store_kind
    }

    pub fn transport_name(&self) -> &'static str {
        self.monitor.transport_name()
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub async fn update_settings(
        &self,
        patch: SettingsPatch,
    ) -> Result<ComplianceSettings, ComplianceError> {
        Ok(self.settings.update(patch).await?)
    }

    /// Stored settings. Secrets included; API layers must redact.
    pub fn settings(&self) -> ComplianceSettings {
        self.settings.current()
    }

    // -----------------------------------------------------------------------
    // Busy-guarded operations
    // -----------------------------------------------------------------------

    pub async fn test_connection(&self) -> Result<ConnectionStatus, ComplianceError> {
        let _busy = self.try_busy()?;
        let settings = self.settings.effective();

        let res = self.monitor.test(&settings).await;
        match &res {
            Ok(()) => self.update_status(|s| s.mark_link(true, Utc::now())),
            Err(ComplianceError::Link(_)) => self.update_status(|s| s.mark_link(false, Utc::now())),
            Err(_) => {}
        }
        res?;
        Ok(self.status().await)
    }

    pub async fn transmit_now(&self) -> Result<DrainReport, ComplianceError> {
        let _busy = self.try_busy()?;
        self.run_drain(Actor::Operator).await
    }

    pub async fn upload_certificate(
        &self,
        filename: &str,
        bytes: &[u8],
    ) -> Result<Certificate, ComplianceError> {
        let _busy = self.try_busy()?;
        self.certificates
            .upload(filename, bytes, Actor::Operator)
            .await
    }

    pub async fn export_dep(&self) -> Result<ExportReceipt, ComplianceError> {
        let _busy = self.try_busy()?;
        let settings = self.settings.current();
        self.exporter
            .export(
                &settings,
                self.queue.snapshot().await,
                self.certificates.list().await,
                Actor::Operator,
            )
            .await
    }

    /// Drain with the caller already holding the busy guard.
    async fn run_drain(&self, actor: Actor) -> Result<DrainReport, ComplianceError> {
        let settings = self.settings.effective();
        let active = self.certificates.active().await;
        let connected = self.status_snapshot().connected;
        let tz = self.timezone;

        let outcome = self
            .worker
            .drain(
                DrainRequest {
                    connected,
                    settings: &settings,
                    active_certificate: active.as_ref(),
                    actor,
                },
                |at| {
                    self.update_status(|s| {
                        s.record_transmitted(business_day(tz, at));
                        s.last_transmitted_at = Some(at);
                    })
                },
            )
            .await?;

        self.update_status(|s| s.pending_count = outcome.pending);

        Ok(DrainReport {
            transmitted_count: outcome.transmitted,
            failed_count: outcome.failed,
            pending_count: outcome.pending,
        })
    }

    // -----------------------------------------------------------------------
    // Order intake
    // -----------------------------------------------------------------------

    /// Hook for the Orders collaborator.
    ///
    /// Builds the receipt, records `created` and enqueues it. Returns `None`
    /// when the order is already queued or already transmitted. An order whose
    /// total overflows is rejected before anything is recorded.
    pub async fn on_order_completed(
        &self,
        order: CompletedOrder,
    ) -> Result<Option<PendingTransmission>, ComplianceError> {
        if order.order_id.trim().is_empty() {
            return Err(ComplianceError::Configuration(
                "completed order has an empty order_id".to_string(),
            ));
        }

        let receipt = Receipt::from_order(&order).ok_or_else(|| {
            ComplianceError::Configuration(format!(
                "order {} total exceeds the representable amount",
                order.order_id
            ))
        })?;

        let _intake = self.intake.lock().await;
        let prior = self.audit.entries_for(&order.order_id);
        let has = |action: AuditAction| prior.iter().any(|e| e.action == action);

        if self.queue.contains(receipt.receipt_id).await || has(AuditAction::Transmitted) {
            debug!(order_id = %order.order_id, "order already handed over; ignoring");
            return Ok(None);
        }
        if let Some(reason) = self.audit.halt_reason() {
            return Err(ComplianceError::Storage(format!("audit log halted: {reason}")));
        }

        // A retry after a failed enqueue already has its `created` entry.
        if !has(AuditAction::Created) {
            self.audit.append(
                &order.order_id,
                AuditAction::Created,
                Actor::Orders,
                json!({
                    "receipt_id": receipt.receipt_id,
                    "table": receipt.table,
                    "line_count": receipt.lines.len(),
                    "total_cents": receipt.total_cents,
                    "completed_at": receipt.completed_at,
                }),
            )?;
        }

        let queued = self.queue.enqueue(receipt, Actor::Orders).await?;
        let pending = self.queue.len().await as u64;
        self.update_status(|s| s.pending_count = pending);
        Ok(queued)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Status with `pending_count` taken from the live queue and the daily
    /// counter rolled to today.
    pub async fn status(&self) -> ConnectionStatus {
        let mut s = self.status_snapshot();
        s.roll_to(business_day(self.timezone, Utc::now()));
        s.pending_count = self.queue.len().await as u64;
        s
    }

    pub fn audit_log(&self, order_id: &str) -> Vec<AuditEntry> {
        self.audit.entries_for(order_id)
    }

    pub async fn pending(&self) -> Vec<PendingTransmission> {
        self.queue.snapshot().await
    }

    pub async fn certificates(&self) -> Vec<Certificate> {
        self.certificates.list().await
    }

    pub async fn active_certificate(&self) -> Option<Certificate> {
        self.certificates.active().await
    }

    pub fn audit_halt_reason(&self) -> Option<String> {
        self.audit.halt_reason()
    }

    /// Re-open the audit log after a storage outage.
    pub fn recover_audit(&self) -> Result<(), ComplianceError> {
        self.audit.recover()?;
        info!(entries = self.audit.len(), "audit log recovered");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Poller
    // -----------------------------------------------------------------------

    /// Roll the business day to the one containing `now` and re-read the
    /// queue length.
    pub async fn refresh_at(&self, now: DateTime<Utc>) {
        let day = business_day(self.timezone, now);
        let pending = self.queue.len().await as u64;
        self.update_status(|s| {
            if s.roll_to(day) {
                info!(business_day = %day, "business day rolled over; daily counter reset");
            }
            s.pending_count = pending;
        });
    }

    /// One poller tick. Never returns an error; drain failures are logged.
    pub async fn poll_tick(&self, mode: PollMode) -> TickOutcome {
        if !self.settings.current().enabled {
            return TickOutcome::Disabled;
        }
        let Ok(_busy) = self.try_busy() else {
            debug!("poller tick skipped; operation in progress");
            return TickOutcome::Busy;
        };

        self.refresh_at(Utc::now()).await;
        if mode == PollMode::StatusOnly || !self.status_snapshot().connected {
            return TickOutcome::Refreshed;
        }
        if self.queue.is_empty().await {
            return TickOutcome::Refreshed;
        }

        match self.run_drain(Actor::Poller).await {
            Ok(report) => {
                info!(
                    transmitted = report.transmitted_count,
                    failed = report.failed_count,
                    pending = report.pending_count,
                    "poller drain finished"
                );
                TickOutcome::Drained(report)
            }
            Err(e) => {
                warn!(error = %e, "poller drain failed");
                TickOutcome::DrainFailed(e)
            }
        }
    }

    /// Spawn the background poller. Stop it with [`PollerHandle::shutdown`].
    pub fn start_poller(self: &Arc<Self>, config: &PollConfig) -> PollerHandle {
        let service = Arc::clone(self);
        let period = Duration::from_secs(config.interval_secs.max(1));
        let mode = config.mode;
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_secs = period.as_secs(), ?mode, "compliance poller started");
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        service.poll_tick(mode).await;
                    }
                }
            }
            info!("compliance poller stopped");
        });

        PollerHandle {
            stop: Some(stop_tx),
            join,
        }
    }
}

/// What a poller tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Disabled,
    Busy,
    Refreshed,
    Drained(DrainReport),
    DrainFailed(ComplianceError),
}

/// Owner of the background poller task.
pub struct PollerHandle {
    stop: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl PollerHandle {
    /// Stop the poller and wait for it to exit. A tick in progress finishes
    /// first.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.join).await {
            warn!(error = %e, "compliance poller task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

fn rebuild_status(
    entries: &[AuditEntry],
    tz: Tz,
    now: DateTime<Utc>,
    pending: usize,
) -> ConnectionStatus {
    let today = business_day(tz, now);
    let mut status = ConnectionStatus::new(today);
    for e in entries.iter().filter(|e| e.action == AuditAction::Transmitted) {
        status.last_transmitted_at = Some(e.ts_utc);
        if business_day(tz, e.ts_utc) == today {
            status.transmitted_today_count += 1;
        }
    }
    status.pending_count = pending as u64;
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn entry(action: AuditAction, ts: DateTime<Utc>) -> AuditEntry {
        AuditEntry {
            entry_id: Uuid::new_v4(),
            seq: 0,
            order_id: "o".to_string(),
            ts_utc: ts,
            action,
            details: json!({}),
            actor: Actor::Operator,
            hash_prev: None,
            hash_self: None,
        }
    }

    #[test]
    fn rebuild_counts_only_todays_transmissions() {
        let tz: Tz = "Europe/Vienna".parse().unwrap();
        let yesterday = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let today_early = Utc.with_ymd_and_hms(2026, 3, 1, 23, 30, 0).unwrap(); // 00:30 local on 2 March
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();

        let entries = vec![
            entry(AuditAction::Transmitted, yesterday),
            entry(AuditAction::TransmitFailed, today_early),
            entry(AuditAction::Transmitted, today_early),
        ];
        let s = rebuild_status(&entries, tz, now, 4);
        assert_eq!(s.transmitted_today_count, 1);
        assert_eq!(s.last_transmitted_at, Some(today_early));
        assert_eq!(s.pending_count, 4);
        assert!(!s.connected, "link state is never restored from disk");
    }
}
