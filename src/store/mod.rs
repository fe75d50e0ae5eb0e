//! Record store boundary. The allocation core only ever talks to a
//! [`RecordStore`]; it assumes per-record write serialization and nothing
//! stronger.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(Ulid),

    /// Unique constraint violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A compare-and-set precondition no longer holds.
    #[error("record {0} changed since it was read")]
    Stale(Ulid),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn read_room(&self, id: Ulid) -> Result<Room, StoreError>;
    async fn list_rooms(&self, hostel: &str) -> Result<Vec<Room>, StoreError>;
    async fn create_room(&self, room: NewRoom) -> Result<Room, StoreError>;
    async fn update_room(&self, id: Ulid, patch: RoomPatch) -> Result<Room, StoreError>;
    async fn delete_room(&self, id: Ulid) -> Result<Room, StoreError>;

    async fn read_student(&self, id: Ulid) -> Result<Student, StoreError>;
    async fn list_students(&self, hostel: &str) -> Result<Vec<Student>, StoreError>;
    async fn create_student(&self, student: NewStudent) -> Result<Student, StoreError>;
    async fn update_student(&self, id: Ulid, patch: StudentPatch) -> Result<Student, StoreError>;
    /// Delete and return the row as it was at deletion time.
    async fn delete_student(&self, id: Ulid) -> Result<Student, StoreError>;

    async fn count_assigned(&self, room_id: Ulid) -> Result<u32, StoreError>;
    /// Students whose `room_id` is `room_id`, in no particular order.
    async fn assigned_students(&self, room_id: Ulid) -> Result<Vec<Student>, StoreError>;

    /// At-least-once change feed for one hostel. Dropping the receiver
    /// unsubscribes. Events may be missed; callers must tolerate gaps.
    fn subscribe_changes(&self, hostel: &str) -> broadcast::Receiver<ChangeEvent>;
}
