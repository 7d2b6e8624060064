//! Fiscal compliance transmission pipeline.
//!
//! Completed orders become receipts, receipts wait in a durable queue, and a
//! single-flight worker signs and sends them to the tax authority. Every
//! step lands in the hash-chained audit log. [`ComplianceService`] is the
//! only entry point; everything else is exposed for tests and tooling.

pub mod certificate;
pub mod error;
pub mod export;
pub mod facade;
pub mod monitor;
pub mod queue;
pub mod settings;
pub mod store;
pub mod worker;

pub use certificate::CertificateManager;
pub use error::ComplianceError;
pub use export::{write_dep_document, DepDocument, DepExporter, DEP_FORMAT};
pub use facade::{ComplianceService, PollerHandle, ServiceDeps, TickOutcome};
pub use monitor::ConnectionMonitor;
pub use queue::TransmissionQueue;
pub use settings::SettingsStore;
pub use store::{ComplianceStore, FileStore, MemoryStore};
pub use worker::{DrainOutcome, DrainRequest, TransmissionWorker};
