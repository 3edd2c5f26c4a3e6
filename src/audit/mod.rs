//! Audit trail of state-changing and MCP requests.
//!
//! The audit middleware derives an [`AuditAction`] from the route, lets the
//! request run, classifies the status into an [`AuditOutcome`] and hands the
//! resulting [`AuditLog`] to the [`AuditRecorder`]. Writing never delays or
//! alters the response.

mod event;
mod recorder;
mod store;

pub use event::{AuditAction, AuditLog, AuditOutcome, RouteAction, derive_action, extract_details};
pub use recorder::{AuditRecorder, spawn_purger};
pub use store::{AuditFilter, AuditPage, AuditSink, AuditStats, AuditStore, ExportFormat};
