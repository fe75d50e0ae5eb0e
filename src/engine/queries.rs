use std::collections::HashMap;

use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::observability::VIEW_DRIFT_TOTAL;

use super::{AllocError, Engine};

impl Engine {
    pub async fn get_room(&self, id: Ulid) -> Result<Room, AllocError> {
        self.room_in_hostel(id).await
    }

    pub async fn get_student(&self, id: Ulid) -> Result<Student, AllocError> {
        self.student_in_hostel(id).await
    }

    pub async fn find_room_by_number(&self, number: &str) -> Result<Option<Room>, AllocError> {
        let number = number.trim();
        Ok(self
            .store
            .list_rooms(&self.hostel)
            .await?
            .into_iter()
            .find(|r| r.number == number))
    }

    /// Occupancy of every room in the hostel, ordered by room number.
    ///
    /// Counted from the assignment relation, not read from the cached
    /// column, so a room that has drifted still shows its true occupancy.
    pub async fn room_occupancy_view(&self) -> Result<Vec<RoomOccupancy>, AllocError> {
        let rooms = self.store.list_rooms(&self.hostel).await?;
        let students = self.store.list_students(&self.hostel).await?;
        Ok(occupancy_view(rooms, &students))
    }

    /// Rooms with at least one free seat, ordered by room number.
    pub async fn available_rooms(&self) -> Result<Vec<RoomOccupancy>, AllocError> {
        let mut view = self.room_occupancy_view().await?;
        view.retain(|r| r.occupancy < r.capacity);
        Ok(view)
    }

    /// Students ordered by name, each with the number of the room they are in.
    pub async fn list_students(&self) -> Result<Vec<StudentView>, AllocError> {
        let numbers: HashMap<Ulid, String> = self
            .store
            .list_rooms(&self.hostel)
            .await?
            .into_iter()
            .map(|r| (r.id, r.number))
            .collect();
        let mut students: Vec<StudentView> = self
            .store
            .list_students(&self.hostel)
            .await?
            .into_iter()
            .map(|s| StudentView {
                room_number: s.room_id.and_then(|id| numbers.get(&id).cloned()),
                id: s.id,
                name: s.name,
                contact: s.contact,
                room_id: s.room_id,
            })
            .collect();
        students.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(students)
    }

    pub async fn summary(&self) -> Result<HostelSummary, AllocError> {
        let rooms = self.store.list_rooms(&self.hostel).await?;
        let students = self.store.list_students(&self.hostel).await?;
        let view = occupancy_view(rooms, &students);
        Ok(HostelSummary {
            rooms: view.len(),
            full_rooms: view.iter().filter(|r| r.status == RoomStatus::Full).count(),
            students: students.len(),
            unassigned_students: students.iter().filter(|s| s.room_id.is_none()).count(),
            total_capacity: view.iter().map(|r| r.capacity as u64).sum(),
            total_occupancy: view.iter().map(|r| r.occupancy as u64).sum(),
        })
    }
}

fn occupancy_view(rooms: Vec<Room>, students: &[Student]) -> Vec<RoomOccupancy> {
    let mut counts: HashMap<Ulid, u32> = HashMap::new();
    for room_id in students.iter().filter_map(|s| s.room_id) {
        *counts.entry(room_id).or_default() += 1;
    }

    let mut view: Vec<RoomOccupancy> = rooms
        .into_iter()
        .map(|room| {
            let occupancy = counts.get(&room.id).copied().unwrap_or(0);
            if occupancy != room.occupancy {
                debug!(
                    "room {} caches occupancy {} but has {occupancy} assigned",
                    room.number, room.occupancy
                );
                metrics::counter!(VIEW_DRIFT_TOTAL).increment(1);
            }
            RoomOccupancy {
                room_id: room.id,
                status: RoomStatus::for_occupancy(occupancy, room.capacity),
                number: room.number,
                capacity: room.capacity,
                occupancy,
            }
        })
        .collect();
    view.sort_by(|a, b| a.number.cmp(&b.number));
    view
}
