use std::collections::HashMap;

use tracing::info;

use super::types::{ConnId, Occupant, Outbound, RelayError, Role, Room, RoomId};

/// Process-wide room state: `RoomId → Room` plus the occupancy and routing
/// operations that mutate it.
///
/// Rooms are created lazily on first admission and removed as soon as the
/// last occupant departs, so an entry exists iff the room has a teacher or
/// at least one student. The registry does no I/O of its own; delivery goes
/// through each occupant's outbound channel and is fire-and-forget.
#[derive(Debug, Default)]
pub(crate) struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the room for `id`, inserting an empty one if absent.
    fn get_or_create(&mut self, id: &RoomId) -> &mut Room {
        self.rooms.entry(id.clone()).or_default()
    }

    /// Deletes the entry for `id` if its room has no occupants. Idempotent.
    fn remove_if_empty(&mut self, id: &RoomId) {
        if self.rooms.get(id).is_some_and(Room::is_empty) {
            self.rooms.remove(id);
            info!("Room {} removed (empty)", id);
        }
    }

    /// Binds `occupant` into `room` under `role`.
    ///
    /// A teacher binds the teacher slot; if the slot is already taken the
    /// newcomer is rejected with `TeacherSeatTaken` and the registry is left
    /// exactly as found. A student is appended to the student list.
    pub fn admit(
        &mut self,
        room_id: &RoomId,
        role: Role,
        occupant: Occupant,
    ) -> Result<(), RelayError> {
        let conn_id = occupant.id;
        let room = self.get_or_create(room_id);

        match role {
            Role::Teacher => {
                if room.teacher.is_some() {
                    // Rejection must not leave a freshly created empty entry
                    // behind; a taken seat implies the room already existed,
                    // but the check keeps the exists-iff-occupied invariant
                    // local to this method.
                    self.remove_if_empty(room_id);
                    return Err(RelayError::TeacherSeatTaken);
                }
                room.teacher = Some(occupant);
            }
            Role::Student => {
                room.students.push(occupant);
            }
        }

        info!("{} {} joined room {}", role, conn_id, room_id);
        Ok(())
    }

    /// Routes one inbound payload according to the sender's role.
    ///
    /// Teacher → every student whose channel is still open. Student → the
    /// teacher, if present and open. Misses are silent: a closed target is
    /// skipped and pruned later by its own close event, and a message into a
    /// teacherless room is dropped.
    pub fn forward(&self, room_id: &RoomId, _sender: ConnId, role: Role, payload: Outbound) {
        let Some(room) = self.rooms.get(room_id) else {
            return;
        };

        match role {
            Role::Teacher => {
                for student in &room.students {
                    let _ = student.tx.send(payload.clone());
                }
            }
            Role::Student => {
                if let Some(teacher) = &room.teacher {
                    let _ = teacher.tx.send(payload);
                }
            }
        }
    }

    /// Removes `conn_id` from `room` (by identity, under its admitted role)
    /// and reclaims the room if that left it empty.
    pub fn depart(&mut self, room_id: &RoomId, conn_id: ConnId, role: Role) {
        if let Some(room) = self.rooms.get_mut(room_id) {
            match role {
                Role::Teacher => {
                    if room.teacher.as_ref().is_some_and(|t| t.id == conn_id) {
                        room.teacher = None;
                    }
                }
                Role::Student => {
                    room.students.retain(|s| s.id != conn_id);
                }
            }

            info!("{} {} left room {}", role, conn_id, room_id);
            self.remove_if_empty(room_id);
        }
    }

    #[cfg(test)]
    fn contains_room(&self, id: &RoomId) -> bool {
        self.rooms.contains_key(id)
    }

    #[cfg(test)]
    fn occupancy(&self, id: &RoomId) -> (bool, usize) {
        self.rooms
            .get(id)
            .map_or((false, 0), |r| (r.teacher.is_some(), r.students.len()))
    }
}
