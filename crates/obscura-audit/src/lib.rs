//! obscura-audit
//!
//! Tamper-evident operation log. Every state transition, broadcast
//! submission, and alert creation appends exactly one event to a per-stream
//! BLAKE3 hash chain: `prev_hash` of each event is the recomputed id of its
//! predecessor, so any edit, drop, or reorder breaks verification.

pub mod event;
pub mod log;

pub use event::{AuditEvent, EventKind};
pub use log::{AuditLog, AuditStore};
