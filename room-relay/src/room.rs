//! Named broadcast groups.
//!
//! Rooms are created lazily and never destroyed. Only authenticated members
//! receive room traffic. Broadcasts iterate a snapshot of the member set and
//! apply removals of saturated members afterwards.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::{
    message::Envelope,
    session::{SessionId, SessionTable},
};

#[derive(Debug)]
pub struct Room {
    name: String,
    members: BTreeSet<SessionId>,
}

impl Room {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.members.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.members.len()
    }

    fn snapshot(&self) -> Vec<SessionId> {
        self.members.iter().copied().collect()
    }
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: BTreeMap<String, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn get_or_create(&mut self, name: &str) -> &mut Room {
        self.rooms.entry(name.to_string()).or_insert_with(|| {
            info!(room = name, "room created");
            Room::new(name)
        })
    }

    pub fn get(&self, name: &str) -> Option<&Room> {
        self.rooms.get(name)
    }

    /// Room names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.rooms.values().map(|room| room.name().to_string()).collect()
    }

    pub fn is_member(&self, name: &str, id: SessionId) -> bool {
        self.rooms.get(name).is_some_and(|room| room.contains(id))
    }

    /// Usernames of a room's members, sorted.
    pub fn member_names(&self, name: &str, sessions: &SessionTable) -> Vec<String> {
        let Some(room) = self.rooms.get(name) else {
            return Vec::new();
        };
        let mut names: Vec<String> = room
            .members
            .iter()
            .filter_map(|id| sessions.username(*id))
            .map(str::to_string)
            .collect();
        names.sort();
        names
    }

    /// Adds `id` to the room (creating it if needed), points the session at
    /// it, and tells every other authenticated member.
    pub fn join(&mut self, sessions: &mut SessionTable, id: SessionId, name: &str) {
        let room = self.get_or_create(name);
        room.members.insert(id);
        let others: Vec<SessionId> = room.snapshot().into_iter().filter(|m| *m != id).collect();

        let Some(session) = sessions.get_mut(id) else {
            return;
        };
        session.set_current_room(name);
        let username = session.username().to_string();
        info!(session = id, user = %username, room = name, "joined room");

        let notice = Envelope::room_notice(name, format!("{username} has joined the room"));
        self.notify_members(sessions, name, &others, &notice);
    }

    /// Removes `id` and tells the remaining authenticated members.
    ///
    /// Returns `false` without notifying anyone if `id` was not a member.
    pub fn leave(&mut self, sessions: &mut SessionTable, id: SessionId, name: &str) -> bool {
        let Some(room) = self.rooms.get_mut(name) else {
            return false;
        };
        if !room.members.remove(&id) {
            return false;
        }
        if room.is_empty() {
            debug!(room = name, "room is now empty");
        }
        let remaining = room.snapshot();

        let username = sessions.username(id).unwrap_or_default().to_string();
        info!(session = id, user = %username, room = name, "left room");

        let notice = Envelope::room_notice(name, format!("{username} has left the room"));
        self.notify_members(sessions, name, &remaining, &notice);
        true
    }

    /// Delivers `envelope` to every authenticated member of `name`.
    ///
    /// Members whose queues are saturated are removed from the room once the
    /// iteration is over and their ids are returned.
    pub fn broadcast(
        &mut self,
        sessions: &mut SessionTable,
        name: &str,
        envelope: &Envelope,
    ) -> Vec<SessionId> {
        let Some(room) = self.rooms.get(name) else {
            debug!(room = name, "broadcast to unknown room dropped");
            return Vec::new();
        };
        let members = room.snapshot();
        debug!(room = name, members = members.len(), "room broadcast");

        let dropped = self.notify_members(sessions, name, &members, envelope);
        for id in &dropped {
            self.leave(sessions, *id, name);
        }
        dropped
    }

    fn notify_members(
        &self,
        sessions: &mut SessionTable,
        name: &str,
        members: &[SessionId],
        envelope: &Envelope,
    ) -> Vec<SessionId> {
        let mut dropped = Vec::new();
        for id in members {
            let Some(session) = sessions.get(*id) else {
                continue;
            };
            if !session.is_authenticated() || session.is_unresponsive() {
                continue;
            }
            if !sessions.deliver(*id, envelope.clone()) {
                debug!(session = id, room = name, "member saturated during room delivery");
                dropped.push(*id);
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{attach, drain_contents};

    #[test]
    fn get_or_create_is_idempotent() {
        let mut rooms = RoomRegistry::new();
        rooms.get_or_create("general");
        rooms.get_or_create("general");
        rooms.get_or_create("dev");

        assert_eq!(rooms.names(), vec!["dev".to_string(), "general".to_string()]);
    }

    #[test]
    fn join_notifies_others_but_not_the_joiner() {
        let mut sessions = SessionTable::new();
        let mut rooms = RoomRegistry::new();
        let mut alice = attach(&mut sessions, 1, 8, Some("alice"));
        let mut bob = attach(&mut sessions, 2, 8, Some("bob"));

        rooms.join(&mut sessions, 1, "general");
        rooms.join(&mut sessions, 2, "general");

        assert_eq!(drain_contents(&mut alice), vec!["bob has joined the room"]);
        assert!(drain_contents(&mut bob).is_empty());
        assert_eq!(rooms.member_names("general", &sessions), vec!["alice", "bob"]);
    }

    #[test]
    fn leave_of_non_member_is_a_no_op() {
        let mut sessions = SessionTable::new();
        let mut rooms = RoomRegistry::new();
        let mut alice = attach(&mut sessions, 1, 8, Some("alice"));
        let _bob = attach(&mut sessions, 2, 8, Some("bob"));
        rooms.join(&mut sessions, 1, "general");

        assert!(!rooms.leave(&mut sessions, 2, "general"));
        assert!(!rooms.leave(&mut sessions, 2, "nowhere"));
        assert!(drain_contents(&mut alice).is_empty());
    }

    #[test]
    fn leave_notifies_remaining_members() {
        let mut sessions = SessionTable::new();
        let mut rooms = RoomRegistry::new();
        let mut alice = attach(&mut sessions, 1, 8, Some("alice"));
        let _bob = attach(&mut sessions, 2, 8, Some("bob"));
        rooms.join(&mut sessions, 1, "general");
        rooms.join(&mut sessions, 2, "general");
        drain_contents(&mut alice);

        assert!(rooms.leave(&mut sessions, 2, "general"));
        assert_eq!(drain_contents(&mut alice), vec!["bob has left the room"]);
        assert!(rooms.get("general").is_some_and(|room| room.contains(1) && !room.contains(2)));
    }

    #[test]
    fn broadcast_skips_anonymous_members() {
        let mut sessions = SessionTable::new();
        let mut rooms = RoomRegistry::new();
        let mut alice = attach(&mut sessions, 1, 8, Some("alice"));
        let mut anon = attach(&mut sessions, 2, 8, None);
        rooms.join(&mut sessions, 2, "general");
        rooms.join(&mut sessions, 1, "general");

        let dropped = rooms.broadcast(&mut sessions, "general", &Envelope::chat("alice", "general", "hi"));

        assert!(dropped.is_empty());
        assert_eq!(drain_contents(&mut alice), vec!["hi"]);
        assert!(drain_contents(&mut anon).is_empty());
    }

    #[test]
    fn saturated_member_is_dropped_and_others_still_receive() {
        let mut sessions = SessionTable::new();
        let mut rooms = RoomRegistry::new();
        let mut receivers = Vec::new();
        for (id, name) in [(1, "alice"), (2, "bob"), (3, "carol"), (4, "dave")] {
            let capacity = if id == 2 { 1 } else { 16 };
            receivers.push(attach(&mut sessions, id, capacity, Some(name)));
        }
        // Bob joins last so his single slot stays free until the backlog below.
        for id in [1, 3, 4, 2] {
            rooms.join(&mut sessions, id, "general");
        }
        for rx in &mut receivers {
            drain_contents(rx);
        }
        // Fill bob's single slot.
        assert!(sessions.notify(2, "backlog"));

        let dropped = rooms.broadcast(&mut sessions, "general", &Envelope::chat("alice", "general", "hello"));

        assert_eq!(dropped, vec![2]);
        assert_eq!(sessions.take_unresponsive(), vec![2]);
        assert!(!rooms.is_member("general", 2));
        assert_eq!(rooms.get("general").map(Room::len), Some(3));
        for (index, rx) in receivers.iter_mut().enumerate() {
            let contents = drain_contents(rx);
            if index == 1 {
                assert_eq!(contents, vec!["backlog"]);
            } else {
                assert_eq!(contents, vec!["hello", "bob has left the room"]);
            }
        }
    }

    #[test]
    fn membership_stays_exclusive_across_moves() {
        let mut sessions = SessionTable::new();
        let mut rooms = RoomRegistry::new();
        let _alice = attach(&mut sessions, 1, 64, Some("alice"));

        for target in ["general", "dev", "ops", "general", "dev"] {
            let current = sessions.get(1).map(|s| s.current_room().to_string()).unwrap_or_default();
            rooms.leave(&mut sessions, 1, &current);
            rooms.join(&mut sessions, 1, target);

            let memberships = rooms
                .names()
                .iter()
                .filter(|name| rooms.is_member(name, 1))
                .count();
            assert_eq!(memberships, 1);
            assert_eq!(sessions.get(1).map(|s| s.current_room()), Some(target));
        }
    }
}
