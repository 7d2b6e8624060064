//! Shared data types for the fiscal compliance pipeline.
//!
//! Everything here is plain data (`Serialize + Deserialize`). Behaviour lives
//! in `fsk-compliance`; this crate only knows how to build a receipt from a
//! completed order and how the status counters roll over.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod settings;

pub use settings::{ComplianceSettings, SecretString, SettingsPatch, SigningDevice};

/// Namespace for deterministic receipt ids (UUIDv5 over the order id).
///
/// Completing the same order twice yields the same receipt id, which is what
/// makes enqueue and authority submission idempotent.
pub const RECEIPT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_2c4e_8b3a_4f7d_9e21_5a0c_b7d4_3e19);

// ---------------------------------------------------------------------------
// Orders (input from the Orders collaborator)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub name: String,
    pub quantity: u32,
    /// Gross unit price in minor currency units.
    pub unit_price_cents: i64,
    /// VAT rate in basis points (e.g. 1000 = 10%).
    pub vat_rate_bp: u32,
}

impl OrderLine {
    /// `None` when the product does not fit in i64.
    pub fn line_total_cents(&self) -> Option<i64> {
        self.unit_price_cents.checked_mul(i64::from(self.quantity))
    }
}

/// A finalized order as handed over by the Orders collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedOrder {
    pub order_id: String,
    pub table: Option<String>,
    pub lines: Vec<OrderLine>,
    pub completed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Receipt + queue item
// ---------------------------------------------------------------------------

/// Fiscal record generated from a completed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub receipt_id: Uuid,
    pub order_id: String,
    pub table: Option<String>,
    pub lines: Vec<OrderLine>,
    pub total_cents: i64,
    pub completed_at: DateTime<Utc>,
}

impl Receipt {
    /// Build the receipt for `order`. `None` when a line total or the sum
    /// overflows i64.
    pub fn from_order(order: &CompletedOrder) -> Option<Self> {
        let total_cents = order.lines.iter().try_fold(0i64, |acc, line| {
            line.line_total_cents().and_then(|t| acc.checked_add(t))
        })?;
        Some(Self {
            receipt_id: receipt_id_for_order(&order.order_id),
            order_id: order.order_id.clone(),
            table: order.table.clone(),
            lines: order.lines.clone(),
            total_cents,
            completed_at: order.completed_at,
        })
    }
}

pub fn receipt_id_for_order(order_id: &str) -> Uuid {
    Uuid::new_v5(&RECEIPT_NAMESPACE, order_id.as_bytes())
}

/// A receipt waiting in the transmission queue.
///
/// Never mutated after creation except for the attempt bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransmission {
    pub receipt_id: Uuid,
    pub order_id: String,
    pub payload: Receipt,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl PendingTransmission {
    pub fn new(receipt: Receipt, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            receipt_id: receipt.receipt_id,
            order_id: receipt.order_id.clone(),
            payload: receipt,
            enqueued_at,
            attempt_count: 0,
            last_attempt_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Unknown,
    Connected,
    Disconnected,
}

/// Point-in-time view of the authority link and queue counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub link_state: LinkState,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub last_transmitted_at: Option<DateTime<Utc>>,
    pub transmitted_today_count: u64,
    pub pending_count: u64,
    /// Business day `transmitted_today_count` refers to.
    pub business_day: NaiveDate,
}

impl ConnectionStatus {
    pub fn new(business_day: NaiveDate) -> Self {
        Self {
            connected: false,
            link_state: LinkState::Unknown,
            last_tested_at: None,
            last_transmitted_at: None,
            transmitted_today_count: 0,
            pending_count: 0,
            business_day,
        }
    }

    /// Reset the daily counter when the business day changes.
    /// Returns `true` if a rollover happened.
    pub fn roll_to(&mut self, day: NaiveDate) -> bool {
        if day == self.business_day {
            return false;
        }
        self.business_day = day;
        self.transmitted_today_count = 0;
        true
    }

    pub fn mark_link(&mut self, connected: bool, at: DateTime<Utc>) {
        self.connected = connected;
        self.link_state = if connected {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        self.last_tested_at = Some(at);
    }

    pub fn record_transmitted(&mut self, day: NaiveDate) {
        self.roll_to(day);
        self.transmitted_today_count += 1;
    }
}

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateFormat {
    P12,
    Pfx,
}

impl CertificateFormat {
    /// Detect the container format from a file name (case-insensitive).
    pub fn from_filename(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        if lower.ends_with(".p12") && lower.len() > 4 {
            Some(Self::P12)
        } else if lower.ends_with(".pfx") && lower.len() > 4 {
            Some(Self::Pfx)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            CertificateFormat::P12 => "p12",
            CertificateFormat::Pfx => "pfx",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub certificate_id: Uuid,
    pub filename: String,
    pub format: CertificateFormat,
    pub uploaded_at: DateTime<Utc>,
    pub active: bool,
    /// sha256 hex of the container bytes.
    pub fingerprint: String,
    pub size_bytes: u64,
}

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

/// Outcome of one drain pass over the queue snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub transmitted_count: u64,
    pub failed_count: u64,
    pub pending_count: u64,
}

/// Outcome of a DEP export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportReceipt {
    pub exported_at: DateTime<Utc>,
    pub path: String,
    pub entry_count: u64,
    pub pending_count: u64,
}
