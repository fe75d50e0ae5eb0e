use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Whether a room can take another student.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Available,
    Full,
}

impl RoomStatus {
    /// Status implied by an occupancy count. With occupancy within capacity
    /// this is `full` exactly at capacity.
    pub fn for_occupancy(occupancy: u32, capacity: u32) -> Self {
        if occupancy >= capacity {
            RoomStatus::Full
        } else {
            RoomStatus::Available
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoomStatus::Available => "available",
            RoomStatus::Full => "full",
        }
    }
}

impl std::fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A room record as the store holds it.
///
/// `occupancy` and `status` are a denormalized cache of the assignment
/// relation. Only the ledger writes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub hostel: String,
    pub number: String,
    pub capacity: u32,
    pub occupancy: u32,
    pub status: RoomStatus,
    /// Store-issued, bumped on every write to this record.
    pub revision: u64,
}

/// A student record as the store holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: Ulid,
    pub hostel: String,
    pub name: String,
    /// External student number or contact handle.
    pub contact: String,
    pub room_id: Option<Ulid>,
    /// Store-issued sequence of the write that set `room_id`. Orders
    /// competing assignments into the same room: lower sequence keeps the seat.
    pub assigned_seq: Option<u64>,
    pub revision: u64,
}

impl Student {
    /// Sort key for seat ranking inside a room.
    pub fn seat_key(&self) -> (u64, Ulid) {
        (self.assigned_seq.unwrap_or(u64::MAX), self.id)
    }
}

// ── Store write payloads ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRoom {
    pub id: Ulid,
    pub hostel: String,
    pub number: String,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStudent {
    pub id: Ulid,
    pub hostel: String,
    pub name: String,
    pub contact: String,
    pub room_id: Option<Ulid>,
}

/// Write to the derived room fields. With `expect_revision` set the write only
/// lands if nobody else wrote the room since it was read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPatch {
    pub occupancy: Option<u32>,
    pub status: Option<RoomStatus>,
    pub expect_revision: Option<u64>,
}

impl RoomPatch {
    pub fn derived(occupancy: u32, status: RoomStatus) -> Self {
        Self {
            occupancy: Some(occupancy),
            status: Some(status),
            expect_revision: None,
        }
    }

    pub fn at_revision(mut self, revision: u64) -> Self {
        self.expect_revision = Some(revision);
        self
    }
}

/// Write to a student. `room_id: Some(None)` clears the assignment.
/// `expect_room` turns the write into a compare-and-set on the current room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudentPatch {
    pub name: Option<String>,
    pub contact: Option<String>,
    pub room_id: Option<Option<Ulid>>,
    pub expect_room: Option<Option<Ulid>>,
}

impl StudentPatch {
    pub fn assign(room_id: Ulid) -> Self {
        Self {
            room_id: Some(Some(room_id)),
            ..Self::default()
        }
    }

    pub fn unassign() -> Self {
        Self {
            room_id: Some(None),
            ..Self::default()
        }
    }

    pub fn expecting(mut self, room_id: Option<Ulid>) -> Self {
        self.expect_room = Some(room_id);
        self
    }
}

// ── Change notifications ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    Room,
    Student,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Store-agnostic change payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub hostel: String,
    pub table: Table,
    pub kind: ChangeKind,
    pub id: Ulid,
}

// ── Durable record format ────────────────────────────────────────

/// One journal record. Flat, carries full row images so replay is a
/// newest-revision-wins merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEntry {
    RoomPut(Room),
    RoomDeleted { id: Ulid, revision: u64 },
    StudentPut(Student),
    StudentDeleted { id: Ulid, revision: u64 },
}

impl JournalEntry {
    pub fn revision(&self) -> u64 {
        match self {
            JournalEntry::RoomPut(r) => r.revision,
            JournalEntry::StudentPut(s) => s.revision,
            JournalEntry::RoomDeleted { revision, .. }
            | JournalEntry::StudentDeleted { revision, .. } => *revision,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// A student seated in a room, both as read after the room settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub student: Student,
    pub room: Room,
}

/// Derived occupancy of one room, counted from the assignment relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomOccupancy {
    pub room_id: Ulid,
    pub number: String,
    pub capacity: u32,
    pub occupancy: u32,
    pub status: RoomStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentView {
    pub id: Ulid,
    pub name: String,
    pub contact: String,
    pub room_id: Option<Ulid>,
    pub room_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostelSummary {
    pub rooms: usize,
    pub full_rooms: usize,
    pub students: usize,
    pub unassigned_students: usize,
    pub total_capacity: u64,
    pub total_occupancy: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(seq: Option<u64>) -> Student {
        Student {
            id: Ulid::new(),
            hostel: "h".into(),
            name: "n".into(),
            contact: "c".into(),
            room_id: None,
            assigned_seq: seq,
            revision: 1,
        }
    }

    #[test]
    fn status_full_only_at_capacity() {
        assert_eq!(RoomStatus::for_occupancy(0, 2), RoomStatus::Available);
        assert_eq!(RoomStatus::for_occupancy(1, 2), RoomStatus::Available);
        assert_eq!(RoomStatus::for_occupancy(2, 2), RoomStatus::Full);
    }

    #[test]
    fn status_display_matches_wire_names() {
        assert_eq!(RoomStatus::Available.to_string(), "available");
        assert_eq!(RoomStatus::Full.to_string(), "full");
        assert_eq!(serde_json::to_string(&RoomStatus::Full).unwrap(), "\"full\"");
    }

    #[test]
    fn seat_key_orders_by_sequence_then_id() {
        let early = student(Some(3));
        let late = student(Some(9));
        let unstamped = student(None);
        let mut all = vec![unstamped.clone(), late.clone(), early.clone()];
        all.sort_by_key(Student::seat_key);
        assert_eq!(all[0].id, early.id);
        assert_eq!(all[1].id, late.id);
        assert_eq!(all[2].id, unstamped.id);
    }

    #[test]
    fn patch_builders() {
        let rid = Ulid::new();
        let p = StudentPatch::assign(rid).expecting(None);
        assert_eq!(p.room_id, Some(Some(rid)));
        assert_eq!(p.expect_room, Some(None));

        let p = StudentPatch::unassign();
        assert_eq!(p.room_id, Some(None));
        assert_eq!(p.expect_room, None);

        let p = RoomPatch::derived(2, RoomStatus::Full).at_revision(7);
        assert_eq!(p.occupancy, Some(2));
        assert_eq!(p.expect_revision, Some(7));
    }

    #[test]
    fn journal_entry_bincode_roundtrip() {
        let entry = JournalEntry::RoomPut(Room {
            id: Ulid::new(),
            hostel: "north".into(),
            number: "101".into(),
            capacity: 2,
            occupancy: 1,
            status: RoomStatus::Available,
            revision: 4,
        });
        let bytes = bincode::serialize(&entry).unwrap();
        let decoded: JournalEntry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(entry, decoded);
        assert_eq!(decoded.revision(), 4);
    }
}
