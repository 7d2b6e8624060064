//! Durable FIFO of receipts awaiting transmission.
//!
//! Every mutation is persisted while the queue lock is held, so the
//! in-memory deque and the store never disagree about membership. Only
//! `enqueue` (order completion) and the worker mutate it.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fsk_audit::{Actor, AuditAction, AuditLog};
use fsk_schemas::{PendingTransmission, Receipt};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ComplianceError;
use crate::store::ComplianceStore;

pub struct TransmissionQueue {
    store: Arc<dyn ComplianceStore>,
    audit: Arc<AuditLog>,
    items: Mutex<VecDeque<PendingTransmission>>,
}

impl TransmissionQueue {
    pub async fn load(store: Arc<dyn ComplianceStore>, audit: Arc<AuditLog>) -> anyhow::Result<Self> {
        let items: VecDeque<_> = store.load_queue().await?.into();
        if !items.is_empty() {
            info!(pending = items.len(), "transmission queue restored");
        }
        Ok(Self {
            store,
            audit,
            items: Mutex::new(items),
        })
    }

    /// Append `receipt` with `attempt_count = 0` and record `queued`.
    ///
    /// Returns `None` if the receipt is already queued.
    pub async fn enqueue(
        &self,
        receipt: Receipt,
        actor: Actor,
    ) -> Result<Option<PendingTransmission>, ComplianceError> {
        let mut items = self.items.lock().await;
        if items.iter().any(|i| i.receipt_id == receipt.receipt_id) {
            debug!(receipt_id = %receipt.receipt_id, "receipt already queued");
            return Ok(None);
        }
        if let Some(reason) = self.audit.halt_reason() {
            return Err(ComplianceError::Storage(format!("audit log halted: {reason}")));
        }

        let item = PendingTransmission::new(receipt, Utc::now());
        self.store.insert_pending(&item).await?;
        items.push_back(item.clone());

        self.audit.append(
            &item.order_id,
            AuditAction::Queued,
            actor,
            json!({
                "receipt_id": item.receipt_id,
                "total_cents": item.payload.total_cents,
                "position": items.len(),
            }),
        )?;
        Ok(Some(item))
    }

    /// Current contents in FIFO order.
    pub async fn snapshot(&self) -> Vec<PendingTransmission> {
        self.items.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, receipt_id: Uuid) -> bool {
        self.items
            .lock()
            .await
            .iter()
            .any(|i| i.receipt_id == receipt_id)
    }

    /// Bump `attempt_count` and persist. `None` if the item is gone.
    pub(crate) async fn record_attempt(
        &self,
        receipt_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<PendingTransmission>, ComplianceError> {
        let mut items = self.items.lock().await;
        let Some(pos) = items.iter().position(|i| i.receipt_id == receipt_id) else {
            return Ok(None);
        };

        let mut next = items[pos].clone();
        next.attempt_count += 1;
        next.last_attempt_at = Some(at);
        self.store.update_pending(&next).await?;
        items[pos] = next.clone();
        Ok(Some(next))
    }

    /// Remove after a confirmed transmission.
    pub(crate) async fn remove(&self, receipt_id: Uuid) -> Result<bool, ComplianceError> {
        let mut items = self.items.lock().await;
        let Some(pos) = items.iter().position(|i| i.receipt_id == receipt_id) else {
            return Ok(false);
        };
        self.store.remove_pending(receipt_id).await?;
        items.remove(pos);
        Ok(true)
    }
}
