//! Occupancy ledger: derives a room's cached occupancy and status from the
//! assignment relation and writes them back. Holds no state of its own.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::AllocError;
use crate::limits::*;
use crate::model::*;
use crate::store::{RecordStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Derived {
    pub occupancy: u32,
    pub status: RoomStatus,
}

/// Pure derivation of the cached fields from an assignment count.
pub fn derive(room: &Room, assigned: u32) -> Result<Derived, AllocError> {
    if assigned > room.capacity {
        return Err(AllocError::InvariantViolation {
            room: room.id,
            assigned,
            capacity: room.capacity,
        });
    }
    Ok(Derived {
        occupancy: assigned,
        status: RoomStatus::for_occupancy(assigned, room.capacity),
    })
}

/// Outcome of reconciling one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomReconciliation {
    pub room: Room,
    /// Students unassigned because they ranked past capacity.
    pub evicted: Vec<Ulid>,
    /// Whether the cached occupancy/status had drifted and was rewritten.
    pub corrected: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub rooms_checked: usize,
    pub rooms_corrected: usize,
    pub evicted: Vec<Ulid>,
    /// Students pointing at rooms that no longer exist, now unassigned.
    pub orphans_cleared: Vec<Ulid>,
    /// Rooms that could not be reconciled this pass, with the reason.
    pub failures: Vec<(Ulid, String)>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.rooms_corrected == 0
            && self.evicted.is_empty()
            && self.orphans_cleared.is_empty()
            && self.failures.is_empty()
    }
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn RecordStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Re-derive a room's occupancy and status and write them back.
    ///
    /// Always writes, even when the values are unchanged, as a compare-and-set
    /// on the revision read before counting. A lost race re-reads and retries.
    pub async fn recompute_room(&self, room_id: Ulid) -> Result<Room, AllocError> {
        for attempt in 1..=MAX_RECOMPUTE_ATTEMPTS {
            let room = self.store.read_room(room_id).await?;
            let assigned = self.store.count_assigned(room_id).await?;
            let derived = derive(&room, assigned)?;
            let patch = RoomPatch::derived(derived.occupancy, derived.status).at_revision(room.revision);
            match self.store.update_room(room_id, patch).await {
                Ok(updated) => {
                    if room.occupancy != updated.occupancy {
                        debug!(
                            "room {} occupancy {} -> {} ({})",
                            room.number, room.occupancy, updated.occupancy, updated.status
                        );
                    }
                    return Ok(updated);
                }
                Err(StoreError::Stale(_)) => {
                    debug!("recompute of room {room_id} lost a write race (attempt {attempt})");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AllocError::Conflict(room_id))
    }

    /// Repair a room unconditionally: unassign students ranked past capacity,
    /// then rewrite the cache if it drifted. Writes nothing when the room is
    /// already consistent.
    pub async fn reconcile_room(&self, room_id: Ulid) -> Result<RoomReconciliation, AllocError> {
        let mut evicted = Vec::new();
        for _ in 0..MAX_RECOMPUTE_ATTEMPTS {
            let room = self.store.read_room(room_id).await?;
            evicted.extend(self.evict_overflow(&room).await?);

            let assigned = self.store.count_assigned(room_id).await?;
            let derived = match derive(&room, assigned) {
                Ok(d) => d,
                // Someone squeezed in after the eviction pass; go again.
                Err(AllocError::InvariantViolation { .. }) => continue,
                Err(e) => return Err(e),
            };
            if evicted.is_empty()
                && room.occupancy == derived.occupancy
                && room.status == derived.status
            {
                return Ok(RoomReconciliation {
                    room,
                    evicted,
                    corrected: false,
                });
            }

            let cached = room.occupancy;
            match self.recompute_room(room_id).await {
                Ok(room) => {
                    warn!(
                        "reconciled room {}: cached occupancy {cached} -> {}, {} evicted",
                        room.number,
                        room.occupancy,
                        evicted.len()
                    );
                    metrics::counter!(crate::observability::RECONCILE_CORRECTIONS_TOTAL).increment(1);
                    return Ok(RoomReconciliation {
                        room,
                        evicted,
                        corrected: true,
                    });
                }
                Err(AllocError::InvariantViolation { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(AllocError::Conflict(room_id))
    }

    /// Unassign everyone ranked at or past capacity, lowest assignment
    /// sequence keeps the seat.
    async fn evict_overflow(&self, room: &Room) -> Result<Vec<Ulid>, AllocError> {
        let mut seated = self.store.assigned_students(room.id).await?;
        if seated.len() <= room.capacity as usize {
            return Ok(Vec::new());
        }
        seated.sort_by_key(Student::seat_key);
        let overflow = seated.split_off(room.capacity as usize);

        let mut evicted = Vec::with_capacity(overflow.len());
        for student in overflow {
            let patch = StudentPatch::unassign().expecting(Some(room.id));
            match self.store.update_student(student.id, patch).await {
                Ok(_) => {
                    warn!(
                        "evicted student {} from over-capacity room {} (capacity {})",
                        student.id, room.number, room.capacity
                    );
                    metrics::counter!(crate::observability::EVICTIONS_TOTAL).increment(1);
                    evicted.push(student.id);
                }
                // Already moved or gone: the overflow resolved itself.
                Err(StoreError::Stale(_)) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(evicted)
    }

    /// Full anti-entropy pass over one hostel. Per-room failures are collected
    /// in the report rather than aborting the pass.
    pub async fn reconcile_hostel(&self, hostel: &str) -> Result<ReconcileReport, AllocError> {
        let rooms = self.store.list_rooms(hostel).await?;
        let mut report = ReconcileReport {
            rooms_checked: rooms.len(),
            ..ReconcileReport::default()
        };

        let ids: Vec<Ulid> = rooms.iter().map(|r| r.id).collect();
        let results: Vec<(Ulid, Result<RoomReconciliation, AllocError>)> = stream::iter(ids)
            .map(|id| async move { (id, self.reconcile_room(id).await) })
            .buffer_unordered(RECONCILE_CONCURRENCY)
            .collect()
            .await;

        for (id, result) in results {
            match result {
                Ok(r) => {
                    if r.corrected {
                        report.rooms_corrected += 1;
                    }
                    report.evicted.extend(r.evicted);
                }
                // Deleted mid-pass; orphan sweep below covers its students.
                Err(AllocError::NotFound(_)) => {}
                Err(e) => report.failures.push((id, e.to_string())),
            }
        }

        let known: HashSet<Ulid> = rooms.iter().map(|r| r.id).collect();
        for student in self.store.list_students(hostel).await? {
            let Some(room_id) = student.room_id else { continue };
            if known.contains(&room_id) {
                continue;
            }
            match self.store.read_room(room_id).await {
                Ok(_) => continue, // created after the listing
                Err(StoreError::NotFound(_)) => {}
                Err(e) => {
                    report.failures.push((room_id, e.to_string()));
                    continue;
                }
            }
            let patch = StudentPatch::unassign().expecting(Some(room_id));
            match self.store.update_student(student.id, patch).await {
                Ok(_) => {
                    warn!("cleared student {} assigned to missing room {room_id}", student.id);
                    report.orphans_cleared.push(student.id);
                }
                Err(StoreError::Stale(_)) | Err(StoreError::NotFound(_)) => {}
                Err(e) => report.failures.push((student.id, e.to_string())),
            }
        }

        Ok(report)
    }
}
