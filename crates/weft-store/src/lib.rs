//! Persistence backends for graphs, runs, node runs, and idempotency keys.
//!
//! Both stores serialize every read-modify-write behind one connection
//! mutex, which is what makes idempotency acceptance linearizable per key.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::Utc;
use weft_core::types::{Run, RunStatus};

/// Apply a status change to a run. Terminal runs never change again.
pub(crate) fn apply_transition(run: &mut Run, status: RunStatus, failure_message: Option<String>) {
    if run.status.is_terminal() {
        return;
    }
    let now = Utc::now();
    run.status = status;
    if status == RunStatus::Running && run.started_at.is_none() {
        run.started_at = Some(now);
    }
    if status.is_terminal() {
        run.finished_at = Some(now);
    }
    if failure_message.is_some() {
        run.failure_message = failure_message;
    }
}
