use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};
use ulid::Ulid;

use crate::journal::{Journal, JournalWriter};
use crate::model::*;
use crate::notify::NotifyHub;

use super::{RecordStore, StoreError};

/// In-process record store with optional journal durability.
///
/// Writes are serialized store-wide (each call is atomic on its record) but
/// nothing spans two calls, which is exactly the guarantee the allocation
/// engine is written against.
pub struct MemoryStore {
    rooms: DashMap<Ulid, Room>,
    students: DashMap<Ulid, Student>,
    /// (hostel, room number) → room id
    room_numbers: DashMap<(String, String), Ulid>,
    /// Source of record revisions and assignment sequence numbers.
    seq: AtomicU64,
    write_lock: Mutex<()>,
    notify: NotifyHub,
    journal: Option<JournalWriter>,
    compact_threshold: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Volatile store. Nothing survives the process.
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            students: DashMap::new(),
            room_numbers: DashMap::new(),
            seq: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            notify: NotifyHub::new(),
            journal: None,
            compact_threshold: u64::MAX,
        }
    }

    /// Replay the journal at `path` and keep appending to it. Must run inside
    /// a tokio runtime.
    pub fn open(path: &Path, compact_threshold: u64) -> std::io::Result<Self> {
        let (journal, recovered) = Journal::open(path)?;
        let replayed = recovered.entries.len();
        let discarded = recovered.discarded();
        let mut store = Self::new();
        store.restore(recovered.entries);
        store.journal = Some(JournalWriter::spawn(journal));
        store.compact_threshold = compact_threshold.max(1);
        info!(
            "journal {} replayed: {replayed} entries ({} damaged bytes dropped), {} rooms, {} students",
            path.display(),
            discarded,
            store.rooms.len(),
            store.students.len()
        );
        Ok(store)
    }

    /// Newest revision wins per record, deletes included, so entry order
    /// in the file does not matter.
    fn restore(&mut self, entries: Vec<JournalEntry>) {
        let mut seen: HashMap<Ulid, u64> = HashMap::new();
        let mut max_rev = 0;
        for entry in entries {
            let rev = entry.revision();
            max_rev = max_rev.max(rev);
            let id = match &entry {
                JournalEntry::RoomPut(r) => r.id,
                JournalEntry::StudentPut(s) => s.id,
                JournalEntry::RoomDeleted { id, .. } | JournalEntry::StudentDeleted { id, .. } => *id,
            };
            if seen.get(&id).is_some_and(|&last| last > rev) {
                continue;
            }
            seen.insert(id, rev);
            match entry {
                JournalEntry::RoomPut(room) => {
                    self.rooms.insert(room.id, room);
                }
                JournalEntry::RoomDeleted { id, .. } => {
                    self.rooms.remove(&id);
                }
                JournalEntry::StudentPut(student) => {
                    self.students.insert(student.id, student);
                }
                JournalEntry::StudentDeleted { id, .. } => {
                    self.students.remove(&id);
                }
            }
        }
        for room in self.rooms.iter() {
            self.room_numbers
                .insert((room.hostel.clone(), room.number.clone()), room.id);
        }
        self.seq.store(max_rev, Ordering::SeqCst);
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// All hostels that own at least one record.
    pub fn hostels(&self) -> Vec<String> {
        let mut hostels: Vec<String> = self
            .rooms
            .iter()
            .map(|r| r.hostel.clone())
            .chain(self.students.iter().map(|s| s.hostel.clone()))
            .collect();
        hostels.sort();
        hostels.dedup();
        hostels
    }

    async fn persist(&self, entry: JournalEntry) -> Result<(), StoreError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        journal
            .append(entry)
            .await
            .map_err(|e| StoreError::Unavailable(format!("journal append: {e}")))
    }

    /// Rewrite the journal as a snapshot once enough appends piled up.
    /// Runs after the write is applied, still under the write lock.
    async fn maybe_compact(&self) {
        let Some(journal) = &self.journal else {
            return;
        };
        if journal.appends_since_compact().await < self.compact_threshold {
            return;
        }
        let snapshot = self.snapshot();
        let len = snapshot.len();
        match journal.compact(snapshot).await {
            Ok(()) => debug!("journal compacted to {len} entries"),
            Err(e) => tracing::warn!("journal compaction failed: {e}"),
        }
    }

    fn snapshot(&self) -> Vec<JournalEntry> {
        self.rooms
            .iter()
            .map(|r| JournalEntry::RoomPut(r.value().clone()))
            .chain(
                self.students
                    .iter()
                    .map(|s| JournalEntry::StudentPut(s.value().clone())),
            )
            .collect()
    }

    fn emit(&self, hostel: &str, table: Table, kind: ChangeKind, id: Ulid) {
        self.notify.send(ChangeEvent {
            hostel: hostel.to_string(),
            table,
            kind,
            id,
        });
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn read_room(&self, id: Ulid) -> Result<Room, StoreError> {
        self.rooms
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_rooms(&self, hostel: &str) -> Result<Vec<Room>, StoreError> {
        Ok(self
            .rooms
            .iter()
            .filter(|r| r.hostel == hostel)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn create_room(&self, new: NewRoom) -> Result<Room, StoreError> {
        let _w = self.write_lock.lock().await;
        let key = (new.hostel.clone(), new.number.clone());
        if self.room_numbers.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "room number {} already exists in {}",
                new.number, new.hostel
            )));
        }
        if self.rooms.contains_key(&new.id) {
            return Err(StoreError::Conflict(format!("room id {} already exists", new.id)));
        }

        let room = Room {
            id: new.id,
            hostel: new.hostel,
            number: new.number,
            capacity: new.capacity,
            occupancy: 0,
            status: RoomStatus::Available,
            revision: self.next_seq(),
        };
        self.persist(JournalEntry::RoomPut(room.clone())).await?;
        self.room_numbers.insert(key, room.id);
        self.rooms.insert(room.id, room.clone());
        self.emit(&room.hostel, Table::Room, ChangeKind::Insert, room.id);
        self.maybe_compact().await;
        Ok(room)
    }

    async fn update_room(&self, id: Ulid, patch: RoomPatch) -> Result<Room, StoreError> {
        let _w = self.write_lock.lock().await;
        let mut room = self.read_room(id).await?;
        if patch.expect_revision.is_some_and(|rev| rev != room.revision) {
            return Err(StoreError::Stale(id));
        }
        if let Some(occupancy) = patch.occupancy {
            room.occupancy = occupancy;
        }
        if let Some(status) = patch.status {
            room.status = status;
        }
        room.revision = self.next_seq();

        self.persist(JournalEntry::RoomPut(room.clone())).await?;
        self.rooms.insert(id, room.clone());
        self.emit(&room.hostel, Table::Room, ChangeKind::Update, id);
        self.maybe_compact().await;
        Ok(room)
    }

    async fn delete_room(&self, id: Ulid) -> Result<Room, StoreError> {
        let _w = self.write_lock.lock().await;
        let room = self.read_room(id).await?;
        let revision = self.next_seq();
        self.persist(JournalEntry::RoomDeleted { id, revision }).await?;
        self.rooms.remove(&id);
        self.room_numbers
            .remove(&(room.hostel.clone(), room.number.clone()));
        self.emit(&room.hostel, Table::Room, ChangeKind::Delete, id);
        self.maybe_compact().await;
        Ok(room)
    }

    async fn read_student(&self, id: Ulid) -> Result<Student, StoreError> {
        self.students
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_students(&self, hostel: &str) -> Result<Vec<Student>, StoreError> {
        Ok(self
            .students
            .iter()
            .filter(|s| s.hostel == hostel)
            .map(|s| s.value().clone())
            .collect())
    }

    async fn create_student(&self, new: NewStudent) -> Result<Student, StoreError> {
        let _w = self.write_lock.lock().await;
        if self.students.contains_key(&new.id) {
            return Err(StoreError::Conflict(format!("student id {} already exists", new.id)));
        }
        let revision = self.next_seq();
        let student = Student {
            id: new.id,
            hostel: new.hostel,
            name: new.name,
            contact: new.contact,
            room_id: new.room_id,
            assigned_seq: new.room_id.map(|_| revision),
            revision,
        };
        self.persist(JournalEntry::StudentPut(student.clone())).await?;
        self.students.insert(student.id, student.clone());
        self.emit(&student.hostel, Table::Student, ChangeKind::Insert, student.id);
        self.maybe_compact().await;
        Ok(student)
    }

    async fn update_student(&self, id: Ulid, patch: StudentPatch) -> Result<Student, StoreError> {
        let _w = self.write_lock.lock().await;
        let mut student = self.read_student(id).await?;
        if patch.expect_room.is_some_and(|room| room != student.room_id) {
            return Err(StoreError::Stale(id));
        }
        let revision = self.next_seq();
        if let Some(name) = patch.name {
            student.name = name;
        }
        if let Some(contact) = patch.contact {
            student.contact = contact;
        }
        if let Some(room_id) = patch.room_id
            && room_id != student.room_id
        {
            student.room_id = room_id;
            student.assigned_seq = room_id.map(|_| revision);
        }
        student.revision = revision;

        self.persist(JournalEntry::StudentPut(student.clone())).await?;
        self.students.insert(id, student.clone());
        self.emit(&student.hostel, Table::Student, ChangeKind::Update, id);
        self.maybe_compact().await;
        Ok(student)
    }

    async fn delete_student(&self, id: Ulid) -> Result<Student, StoreError> {
        let _w = self.write_lock.lock().await;
        let student = self.read_student(id).await?;
        let revision = self.next_seq();
        self.persist(JournalEntry::StudentDeleted { id, revision }).await?;
        self.students.remove(&id);
        self.emit(&student.hostel, Table::Student, ChangeKind::Delete, id);
        self.maybe_compact().await;
        Ok(student)
    }

    async fn count_assigned(&self, room_id: Ulid) -> Result<u32, StoreError> {
        Ok(self
            .students
            .iter()
            .filter(|s| s.room_id == Some(room_id))
            .count() as u32)
    }

    async fn assigned_students(&self, room_id: Ulid) -> Result<Vec<Student>, StoreError> {
        Ok(self
            .students
            .iter()
            .filter(|s| s.room_id == Some(room_id))
            .map(|s| s.value().clone())
            .collect())
    }

    fn subscribe_changes(&self, hostel: &str) -> broadcast::Receiver<ChangeEvent> {
        self.notify.subscribe(hostel)
    }
}
