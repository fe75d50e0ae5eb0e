use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{CAPACITY_RACES_TOTAL, COMPENSATIONS_TOTAL};
use crate::store::StoreError;

use super::{AllocError, Engine};

fn required(field: &str, value: &str, max_len: usize, too_long: &'static str) -> Result<String, AllocError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AllocError::Validation(format!("{field} is required")));
    }
    if value.len() > max_len {
        return Err(AllocError::LimitExceeded(too_long));
    }
    Ok(value.to_string())
}

impl Engine {
    pub async fn create_room(&self, number: &str, capacity: u32) -> Result<Room, AllocError> {
        self.timed("create_room", async {
            let number = required("room number", number, MAX_ROOM_NUMBER_LEN, "room number too long")?;
            if capacity == 0 {
                return Err(AllocError::Validation("capacity must be at least 1".into()));
            }
            if capacity > MAX_ROOM_CAPACITY {
                return Err(AllocError::LimitExceeded("room capacity too large"));
            }
            if self.store.list_rooms(&self.hostel).await?.len() >= MAX_ROOMS_PER_HOSTEL {
                return Err(AllocError::LimitExceeded("too many rooms in hostel"));
            }

            let room = self
                .store
                .create_room(NewRoom {
                    id: Ulid::new(),
                    hostel: self.hostel.clone(),
                    number,
                    capacity,
                })
                .await?;
            info!("room {} created in {} (capacity {capacity})", room.number, self.hostel);
            Ok(room)
        })
        .await
    }

    /// Create a student, then seat them if a room is given. If seating fails
    /// the student still exists, unassigned, and the error says so.
    pub async fn create_student(
        &self,
        name: &str,
        contact: &str,
        room_id: Option<Ulid>,
    ) -> Result<Student, AllocError> {
        self.timed("create_student", async {
            let name = required("name", name, MAX_NAME_LEN, "student name too long")?;
            let contact = required("contact", contact, MAX_CONTACT_LEN, "contact too long")?;
            if self.store.list_students(&self.hostel).await?.len() >= MAX_STUDENTS_PER_HOSTEL {
                return Err(AllocError::LimitExceeded("too many students in hostel"));
            }

            let student = self
                .store
                .create_student(NewStudent {
                    id: Ulid::new(),
                    hostel: self.hostel.clone(),
                    name,
                    contact,
                    room_id: None,
                })
                .await?;
            info!("student {} created in {}", student.id, self.hostel);

            let Some(room_id) = room_id else {
                return Ok(student);
            };
            match self.seat(student.id, room_id).await {
                Ok(assignment) => Ok(assignment.student),
                Err(e) => {
                    warn!("student {} created but not seated in room {room_id}: {e}", student.id);
                    Err(AllocError::CreatedUnassigned {
                        student: student.id,
                        source: Box::new(e),
                    })
                }
            }
        })
        .await
    }

    /// Seat an unassigned student. Assigning a student to the room they are
    /// already in is a no-op; a student seated elsewhere must be reassigned.
    ///
    /// A retryable error can follow a seat that already committed (the final
    /// re-read failed). Retrying is safe: it finds the student seated and
    /// returns the assignment.
    pub async fn assign(&self, student_id: Ulid, room_id: Ulid) -> Result<Assignment, AllocError> {
        self.timed("assign", async {
            let student = self.student_in_hostel(student_id).await?;
            match student.room_id {
                Some(current) if current == room_id => {
                    let room = self.room_in_hostel(room_id).await?;
                    return Ok(Assignment { student, room });
                }
                Some(current) => {
                    return Err(AllocError::Validation(format!(
                        "student {student_id} is already in room {current}; reassign instead"
                    )));
                }
                None => {}
            }
            self.seat(student_id, room_id).await
        })
        .await
    }

    /// Move a student to another room: release, settle the old room, then
    /// seat. A failure after the release leaves the student unassigned and
    /// is reported as `ReassignIncomplete`.
    pub async fn reassign(&self, student_id: Ulid, room_id: Ulid) -> Result<Assignment, AllocError> {
        self.timed("reassign", async {
            let student = self.student_in_hostel(student_id).await?;
            let target = self.room_in_hostel(room_id).await?;
            if student.room_id == Some(room_id) {
                return Ok(Assignment { student, room: target });
            }
            // Fail early, before touching the current seat.
            if self.store.count_assigned(room_id).await? >= target.capacity {
                return Err(AllocError::RoomFull(room_id));
            }

            let Some(from) = self.unseat(&student).await? else {
                return self.seat(student_id, room_id).await;
            };
            let incomplete = |e: AllocError| {
                warn!("student {student_id} released from room {from} but not moved to {room_id}: {e}");
                AllocError::ReassignIncomplete {
                    student: student_id,
                    from,
                    source: Box::new(e),
                }
            };
            match self.settle(from).await {
                Ok(_) | Err(AllocError::NotFound(_)) => {}
                Err(e) => return Err(incomplete(e)),
            }
            self.seat(student_id, room_id).await.map_err(incomplete)
        })
        .await
    }

    /// Clear a student's assignment. Returns the settled room they left, or
    /// `None` if they had none.
    pub async fn deallocate(&self, student_id: Ulid) -> Result<Option<Room>, AllocError> {
        self.timed("deallocate", async {
            let student = self.student_in_hostel(student_id).await?;
            let Some(room_id) = self.unseat(&student).await? else {
                return Ok(None);
            };
            match self.settle(room_id).await {
                Ok(room) => Ok(Some(room)),
                Err(AllocError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    pub async fn delete_student(&self, student_id: Ulid) -> Result<Student, AllocError> {
        self.timed("delete_student", async {
            self.student_in_hostel(student_id).await?;
            // The deleted row names the room as of deletion, not as of our read.
            let deleted = self.store.delete_student(student_id).await?;
            if let Some(room_id) = deleted.room_id {
                match self.settle(room_id).await {
                    Ok(_) | Err(AllocError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            info!("student {student_id} deleted from {}", self.hostel);
            Ok(deleted)
        })
        .await
    }

    /// Delete an empty room. Never cascades to students.
    pub async fn delete_room(&self, room_id: Ulid) -> Result<Room, AllocError> {
        self.timed("delete_room", async {
            self.room_in_hostel(room_id).await?;
            let assigned = self.store.count_assigned(room_id).await?;
            if assigned > 0 {
                return Err(AllocError::RoomOccupied {
                    room: room_id,
                    occupancy: assigned,
                });
            }

            let deleted = self.store.delete_room(room_id).await?;
            let stranded = self.store.assigned_students(room_id).await?;
            if stranded.is_empty() {
                info!("room {} deleted from {}", deleted.number, self.hostel);
                return Ok(deleted);
            }

            // An assignment landed between the check and the delete.
            warn!(
                "room {} deleted with {} students assigned, restoring it",
                deleted.number,
                stranded.len()
            );
            let restore = NewRoom {
                id: deleted.id,
                hostel: deleted.hostel.clone(),
                number: deleted.number.clone(),
                capacity: deleted.capacity,
            };
            match self.store.create_room(restore).await {
                Ok(_) => {
                    metrics::counter!(COMPENSATIONS_TOTAL).increment(1);
                    let restored = self.settle(room_id).await?;
                    Err(AllocError::RoomOccupied {
                        room: room_id,
                        occupancy: restored.occupancy,
                    })
                }
                Err(e) => {
                    warn!(
                        "room {} cannot be restored ({e}), releasing {} stranded students",
                        deleted.number,
                        stranded.len()
                    );
                    for student in stranded {
                        let patch = StudentPatch::unassign().expecting(Some(room_id));
                        match self.store.update_student(student.id, patch).await {
                            Ok(_) => metrics::counter!(COMPENSATIONS_TOTAL).increment(1),
                            Err(StoreError::Stale(_)) | Err(StoreError::NotFound(_)) => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                    Ok(deleted)
                }
            }
        })
        .await
    }

    /// Write the assignment, then check it held.
    ///
    /// The pre-check rejects a full room without writing. After the write the
    /// room's assigned students are ranked by assignment sequence; a student
    /// ranked past capacity lost a concurrent race and is rolled back.
    pub(super) async fn seat(&self, student_id: Ulid, room_id: Ulid) -> Result<Assignment, AllocError> {
        let room = self.room_in_hostel(room_id).await?;
        if self.store.count_assigned(room_id).await? >= room.capacity {
            return Err(AllocError::RoomFull(room_id));
        }

        let patch = StudentPatch::assign(room_id).expecting(None);
        let written = match self.store.update_student(student_id, patch).await {
            Ok(s) => s,
            Err(StoreError::Stale(_)) => return Err(AllocError::Conflict(student_id)),
            Err(e) => return Err(e.into()),
        };
        debug!(
            "student {student_id} written into room {} at seq {:?}",
            room.number, written.assigned_seq
        );

        let mut seated = match self.store.assigned_students(room_id).await {
            Ok(seated) => seated,
            Err(e) => {
                self.roll_back_seat(student_id, room_id).await;
                return Err(e.into());
            }
        };
        seated.sort_by_key(Student::seat_key);
        match seated.iter().position(|s| s.id == student_id) {
            Some(rank) if rank < room.capacity as usize => {}
            Some(_) => {
                warn!("student {student_id} lost the race for room {}, rolling back", room.number);
                metrics::counter!(CAPACITY_RACES_TOTAL).increment(1);
                self.roll_back_seat(student_id, room_id).await;
                return Err(AllocError::CapacityExceeded {
                    room: room_id,
                    capacity: room.capacity,
                });
            }
            None => return Err(self.displaced(student_id, &room).await),
        }

        let settled = match self.settle(room_id).await {
            Ok(settled) => settled,
            Err(e) => {
                self.roll_back_seat(student_id, room_id).await;
                return Err(e);
            }
        };

        // A reconcile pass may have evicted us between ranking and settling.
        let student = self.store.read_student(student_id).await?;
        if student.room_id != Some(room_id) {
            return Err(self.displaced(student_id, &room).await);
        }
        Ok(Assignment {
            student,
            room: settled,
        })
    }

    /// Error for a student who vanished from the room after we seated them.
    async fn displaced(&self, student_id: Ulid, room: &Room) -> AllocError {
        match self.store.read_student(student_id).await {
            Ok(s) if s.room_id.is_none() => AllocError::CapacityExceeded {
                room: room.id,
                capacity: room.capacity,
            },
            Ok(_) => AllocError::Conflict(student_id),
            Err(e) => e.into(),
        }
    }

    /// Undo our own assignment write. Only clears the seat if the student is
    /// still in `room_id`. Failures are logged; reconciliation repairs them.
    async fn roll_back_seat(&self, student_id: Ulid, room_id: Ulid) {
        let patch = StudentPatch::unassign().expecting(Some(room_id));
        let mut result = self.store.update_student(student_id, patch.clone()).await;
        if matches!(result, Err(StoreError::Unavailable(_))) {
            result = self.store.update_student(student_id, patch).await;
        }
        match result {
            Ok(_) => {
                metrics::counter!(COMPENSATIONS_TOTAL).increment(1);
                warn!("rolled back assignment of student {student_id} to room {room_id}");
            }
            Err(StoreError::Stale(_)) | Err(StoreError::NotFound(_)) => {
                debug!("student {student_id} already left room {room_id}");
            }
            Err(e) => error!("rollback of student {student_id} from room {room_id} failed: {e}"),
        }
        match self.settle(room_id).await {
            Ok(_) | Err(AllocError::NotFound(_)) => {}
            Err(e) => warn!("room {room_id} not settled after rollback: {e}"),
        }
    }

    /// Clear the student's seat with a compare-and-set on the room we read.
    /// Returns the room they left.
    async fn unseat(&self, student: &Student) -> Result<Option<Ulid>, AllocError> {
        let Some(room_id) = student.room_id else {
            return Ok(None);
        };
        let patch = StudentPatch::unassign().expecting(Some(room_id));
        match self.store.update_student(student.id, patch).await {
            Ok(_) => Ok(Some(room_id)),
            Err(StoreError::Stale(_)) => Err(AllocError::Conflict(student.id)),
            Err(e) => Err(e.into()),
        }
    }
}
