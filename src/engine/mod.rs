mod error;
mod mutations;
mod queries;

pub use error::AllocError;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::warn;
use ulid::Ulid;

use crate::ledger::{Ledger, ReconcileReport};
use crate::model::*;
use crate::observability::{OPERATIONS_TOTAL, OPERATION_DURATION_SECONDS, RECONCILE_RUNS_TOTAL};
use crate::store::RecordStore;

/// One allocation client bound to one hostel.
///
/// Holds no locks and caches nothing between calls: every operation reads
/// the store fresh, writes, then settles the affected rooms through the
/// ledger. Any number of engines may share one store.
pub struct Engine {
    hostel: String,
    store: Arc<dyn RecordStore>,
    ledger: Ledger,
}

impl Engine {
    pub fn new(hostel: impl Into<String>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            hostel: hostel.into(),
            ledger: Ledger::new(store.clone()),
            store,
        }
    }

    pub fn hostel(&self) -> &str {
        &self.hostel
    }

    /// Change feed for this engine's hostel.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.store.subscribe_changes(&self.hostel)
    }

    /// Full reconciliation pass over this hostel.
    pub async fn reconcile(&self) -> Result<ReconcileReport, AllocError> {
        self.timed("reconcile", async {
            let report = self.ledger.reconcile_hostel(&self.hostel).await?;
            metrics::counter!(RECONCILE_RUNS_TOTAL).increment(1);
            if !report.is_clean() {
                warn!(
                    "reconcile {}: {} of {} rooms corrected, {} evicted, {} orphans cleared, {} failures",
                    self.hostel,
                    report.rooms_corrected,
                    report.rooms_checked,
                    report.evicted.len(),
                    report.orphans_cleared.len(),
                    report.failures.len()
                );
            }
            Ok::<_, AllocError>(report)
        })
        .await
    }

    pub(super) async fn room_in_hostel(&self, id: Ulid) -> Result<Room, AllocError> {
        let room = self.store.read_room(id).await?;
        if room.hostel != self.hostel {
            return Err(AllocError::NotFound(id));
        }
        Ok(room)
    }

    pub(super) async fn student_in_hostel(&self, id: Ulid) -> Result<Student, AllocError> {
        let student = self.store.read_student(id).await?;
        if student.hostel != self.hostel {
            return Err(AllocError::NotFound(id));
        }
        Ok(student)
    }

    /// Bring a room's cached occupancy back in line after a write.
    ///
    /// An over-capacity room is repaired by reconciliation. A store outage
    /// gets one retry.
    pub(super) async fn settle(&self, room_id: Ulid) -> Result<Room, AllocError> {
        match self.settle_once(room_id).await {
            Err(AllocError::StoreUnavailable(e)) => {
                warn!("settling room {room_id} failed ({e}), retrying once");
                self.settle_once(room_id).await
            }
            other => other,
        }
    }

    async fn settle_once(&self, room_id: Ulid) -> Result<Room, AllocError> {
        match self.ledger.recompute_room(room_id).await {
            Err(AllocError::InvariantViolation { assigned, capacity, .. }) => {
                warn!("room {room_id} has {assigned} assigned over capacity {capacity}, reconciling");
                Ok(self.ledger.reconcile_room(room_id).await?.room)
            }
            other => other,
        }
    }

    /// Run an operation, counting it by outcome and recording its latency.
    pub(super) async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<T, AllocError>
    where
        F: Future<Output = Result<T, AllocError>>,
    {
        let start = Instant::now();
        let result = fut.await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(OPERATIONS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
        metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op)
            .record(start.elapsed().as_secs_f64());
        result
    }
}
