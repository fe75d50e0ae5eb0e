use thiserror::Error;
use ulid::Ulid;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("room {0} is full")]
    RoomFull(Ulid),

    /// Lost a same-slot race after writing; the assignment was rolled back.
    #[error("room {room} went over capacity {capacity} under a concurrent assignment; assignment rolled back")]
    CapacityExceeded { room: Ulid, capacity: u32 },

    #[error("cannot delete room {room}: {occupancy} students still assigned")]
    RoomOccupied { room: Ulid, occupancy: u32 },

    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("room {room} has {assigned} students assigned but capacity {capacity}")]
    InvariantViolation { room: Ulid, assigned: u32, capacity: u32 },

    /// Another client changed the same record between our read and write.
    #[error("record {0} was modified concurrently")]
    Conflict(Ulid),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("student {student} was created but not assigned: {source}")]
    CreatedUnassigned {
        student: Ulid,
        #[source]
        source: Box<AllocError>,
    },

    #[error("student {student} was released from room {from} but not assigned: {source}")]
    ReassignIncomplete {
        student: Ulid,
        from: Ulid,
        #[source]
        source: Box<AllocError>,
    },

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl AllocError {
    /// Whether trying the same call again can succeed without the caller
    /// changing anything.
    pub fn is_retryable(&self) -> bool {
        match self {
            AllocError::CapacityExceeded { .. }
            | AllocError::Conflict(_)
            | AllocError::StoreUnavailable(_) => true,
            AllocError::CreatedUnassigned { source, .. }
            | AllocError::ReassignIncomplete { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AllocError::Validation(_) => "validation",
            AllocError::RoomFull(_) => "room_full",
            AllocError::CapacityExceeded { .. } => "capacity_exceeded",
            AllocError::RoomOccupied { .. } => "room_occupied",
            AllocError::NotFound(_) => "not_found",
            AllocError::InvariantViolation { .. } => "invariant_violation",
            AllocError::Conflict(_) => "conflict",
            AllocError::StoreUnavailable(_) => "store_unavailable",
            AllocError::CreatedUnassigned { .. } => "created_unassigned",
            AllocError::ReassignIncomplete { .. } => "reassign_incomplete",
            AllocError::LimitExceeded(_) => "limit_exceeded",
        }
    }
}

impl From<StoreError> for AllocError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => AllocError::NotFound(id),
            StoreError::Conflict(msg) => AllocError::Validation(msg),
            StoreError::Stale(id) => AllocError::Conflict(id),
            StoreError::Unavailable(msg) => AllocError::StoreUnavailable(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_taxonomy() {
        let id = Ulid::new();
        assert!(matches!(
            AllocError::from(StoreError::NotFound(id)),
            AllocError::NotFound(x) if x == id
        ));
        assert!(matches!(
            AllocError::from(StoreError::Conflict("dup".into())),
            AllocError::Validation(_)
        ));
        assert!(matches!(
            AllocError::from(StoreError::Stale(id)),
            AllocError::Conflict(_)
        ));
        assert!(AllocError::from(StoreError::Unavailable("down".into())).is_retryable());
    }

    #[test]
    fn retryable_follows_wrapped_cause() {
        let student = Ulid::new();
        let full = AllocError::CreatedUnassigned {
            student,
            source: Box::new(AllocError::RoomFull(Ulid::new())),
        };
        assert!(!full.is_retryable());

        let raced = AllocError::CreatedUnassigned {
            student,
            source: Box::new(AllocError::CapacityExceeded {
                room: Ulid::new(),
                capacity: 1,
            }),
        };
        assert!(raced.is_retryable());
        assert_eq!(raced.kind(), "created_unassigned");
    }
}
