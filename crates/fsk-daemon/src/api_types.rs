//! JSON bodies of the daemon API.

use fsk_audit::AuditEntry;
use fsk_schemas::{ConnectionStatus, PendingTransmission};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub daemon_uptime_secs: u64,
    pub transport: &'static str,
    pub store: &'static str,
    pub audit_halted: bool,
    pub audit_halt_reason: Option<String>,
    pub connection: ConnectionStatus,
}

/// Body of every non-2xx response. `error` is the stable machine code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadQuery {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueResponse {
    pub pending_count: usize,
    pub pending: Vec<PendingTransmission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAuditResponse {
    pub order_id: String,
    pub entries: Vec<AuditEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAcceptedResponse {
    /// `false` when the order was already queued or transmitted.
    pub queued: bool,
    pub item: Option<PendingTransmission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverResponse {
    pub ok: bool,
    pub audit_halted: bool,
}
