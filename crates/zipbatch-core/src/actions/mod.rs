//! Built-in item actions. They only inspect the uploaded files.

pub mod audit;

pub use audit::{AuditOutcome, SidecarAudit};
