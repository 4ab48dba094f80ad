use std::collections::{HashMap, HashSet};

use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::LobbyError;

/// Reserved room id for the always-present pre-game lobby.
pub const LOBBY_ROOM_ID: &str = "lobby";

const ROOM_ID_LEN: usize = 4;
const DEFAULT_MAX_PLAYERS: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    pub host: String,
    pub name: String,
    pub max_players: u32,
    pub is_started: bool,
    pub guest_invite_enabled: bool,
}

/// One game room. Membership uses a single role-tagged model; connection
/// handles live in the presence registry, not here, so a re-login never
/// strands a room with a dead handle.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub settings: RoomSettings,
    pub invited: HashSet<String>,
    pub members: HashMap<String, Role>,
}

impl Room {
    fn new(id: String, creator: &str) -> Self {
        let mut members = HashMap::new();
        members.insert(creator.to_string(), Role::Host);
        Room {
            id,
            settings: RoomSettings {
                host: creator.to_string(),
                name: format!("{creator}'s Game"),
                max_players: DEFAULT_MAX_PLAYERS,
                is_started: false,
                guest_invite_enabled: false,
            },
            invited: HashSet::new(),
            members,
        }
    }

    fn is_host(&self, username: &str) -> bool {
        self.settings.host == username
    }

    fn may_invite(&self, username: &str) -> bool {
        self.is_host(username)
            || (self.members.contains_key(username) && self.settings.guest_invite_enabled)
    }
}

pub struct JoinOutcome {
    /// False on a repeat join (reconnect without leave); the caller must not
    /// re-announce in that case.
    pub first_join: bool,
}

pub struct JoinRequest {
    pub invited: bool,
    pub host: String,
    pub room_name: String,
}

/// All active rooms, keyed by id. Every mutation happens in one pass under
/// the write lock, so invite consumption and membership insertion are atomic
/// per room even with handlers running on separate tasks.
#[derive(Default)]
pub struct RoomStore {
    rooms: RwLock<HashMap<String, Room>>,
}

fn require_host(room: &Room, username: &str) -> Result<(), LobbyError> {
    if room.is_host(username) {
        Ok(())
    } else {
        Err(LobbyError::NotHost {
            user: username.to_string(),
            room: room.id.clone(),
        })
    }
}

fn generate_room_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ROOM_ID_LEN)
        .map(char::from)
        .collect()
}

impl RoomStore {
    pub fn new() -> Self {
        RoomStore::default()
    }

    /// Creates a room with `creator` as Host, auto-joined. The generated id
    /// is checked against live rooms; a collision means regenerate, never an
    /// error.
    pub async fn create_room(&self, creator: &str) -> Room {
        let mut rooms = self.rooms.write().await;
        let id = loop {
            let candidate = generate_room_id();
            if !rooms.contains_key(&candidate) && candidate != LOBBY_ROOM_ID {
                break candidate;
            }
        };
        let room = Room::new(id.clone(), creator);
        rooms.insert(id, room.clone());
        room
    }

    pub async fn get(&self, room_id: &str) -> Option<Room> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).cloned()
    }

    pub async fn list(&self) -> HashMap<String, Room> {
        let rooms = self.rooms.read().await;
        rooms.clone()
    }

    pub async fn members(&self, room_id: &str) -> Result<HashMap<String, Role>, LobbyError> {
        let rooms = self.rooms.read().await;
        rooms
            .get(room_id)
            .map(|room| room.members.clone())
            .ok_or_else(|| LobbyError::RoomNotFound(room_id.to_string()))
    }

    /// Host-only rename; absence is surfaced to the requester, never ignored.
    pub async fn rename(&self, room_id: &str, new_name: &str, by: &str) -> Result<(), LobbyError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| LobbyError::RoomNotFound(room_id.to_string()))?;
        require_host(room, by)?;
        room.settings.name = new_name.to_string();
        Ok(())
    }

    /// Host-only. Removes the room and hands back the former members so the
    /// caller can deliver eviction notices; nothing can observe the room
    /// between removal and notification.
    pub async fn close(&self, room_id: &str, by: &str) -> Result<Vec<String>, LobbyError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get(room_id)
            .ok_or_else(|| LobbyError::RoomNotFound(room_id.to_string()))?;
        require_host(room, by)?;
        let removed = rooms.remove(room_id);
        Ok(removed.map_or_else(Vec::new, |room| room.members.into_keys().collect()))
    }

    /// Marks `target` invited. Allowed for the Host, or for a Guest member
    /// when the Host has enabled guest invites. Returns the room name for
    /// the invitation notice. The caller checks the target is online first.
    pub async fn invite(&self, room_id: &str, target: &str, by: &str) -> Result<String, LobbyError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| LobbyError::RoomNotFound(room_id.to_string()))?;
        if !room.may_invite(by) {
            return Err(LobbyError::InviteForbidden(by.to_string()));
        }
        room.invited.insert(target.to_string());
        Ok(room.settings.name.clone())
    }

    /// Read-only probe for a join attempt: reports whether `username` holds
    /// an invite and who to ask otherwise. Never mutates the invite list and
    /// never auto-joins.
    pub async fn request_join(
        &self,
        room_id: &str,
        username: &str,
    ) -> Result<JoinRequest, LobbyError> {
        let rooms = self.rooms.read().await;
        let room = rooms
            .get(room_id)
            .ok_or_else(|| LobbyError::RoomNotFound(room_id.to_string()))?;
        Ok(JoinRequest {
            invited: room.invited.contains(username),
            host: room.settings.host.clone(),
            room_name: room.settings.name.clone(),
        })
    }

    /// Host approval of a join request: promotes the user to invited.
    pub async fn let_user_join(
        &self,
        room_id: &str,
        username: &str,
        by: &str,
    ) -> Result<String, LobbyError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| LobbyError::RoomNotFound(room_id.to_string()))?;
        require_host(room, by)?;
        room.invited.insert(username.to_string());
        Ok(room.settings.name.clone())
    }

    /// Idempotent membership insert. Consumes any pending invite. The
    /// first-join flag is computed before the mutation so a reconnect
    /// without leave cannot trigger a duplicate announcement.
    pub async fn join(&self, room_id: &str, username: &str) -> Result<JoinOutcome, LobbyError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| LobbyError::RoomNotFound(room_id.to_string()))?;
        let first_join = !room.members.contains_key(username);
        room.invited.remove(username);
        if first_join {
            let role = if room.is_host(username) {
                Role::Host
            } else {
                Role::Guest
            };
            room.members.insert(username.to_string(), role);
        }
        Ok(JoinOutcome { first_join })
    }

    /// Removes membership; returns false if the user was not a member. The
    /// Host leaving does not reassign the role (recorded product decision).
    pub async fn leave(&self, room_id: &str, username: &str) -> Result<bool, LobbyError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| LobbyError::RoomNotFound(room_id.to_string()))?;
        Ok(room.members.remove(username).is_some())
    }

    /// Host-only eviction of a single member.
    pub async fn kick(&self, room_id: &str, target: &str, by: &str) -> Result<bool, LobbyError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| LobbyError::RoomNotFound(room_id.to_string()))?;
        require_host(room, by)?;
        Ok(room.members.remove(target).is_some())
    }

    /// Host-only; backs both startGame and endGame.
    pub async fn set_started(
        &self,
        room_id: &str,
        started: bool,
        by: &str,
    ) -> Result<(), LobbyError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| LobbyError::RoomNotFound(room_id.to_string()))?;
        require_host(room, by)?;
        room.settings.is_started = started;
        Ok(())
    }

    /// Host-only toggle for the guest-invite privilege.
    pub async fn set_guest_invite(
        &self,
        room_id: &str,
        enabled: bool,
        by: &str,
    ) -> Result<(), LobbyError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| LobbyError::RoomNotFound(room_id.to_string()))?;
        require_host(room, by)?;
        room.settings.guest_invite_enabled = enabled;
        Ok(())
    }

    /// Disconnect path: drops `username` from every room they are in and
    /// returns those room ids so the caller can announce each leave.
    pub async fn leave_all(&self, username: &str) -> Vec<String> {
        let mut rooms = self.rooms.write().await;
        let mut left = Vec::new();
        for room in rooms.values_mut() {
            if room.members.remove(username).is_some() {
                left.push(room.id.clone());
            }
        }
        left
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creator_is_host_and_sole_member() {
        let store = RoomStore::new();
        let room = store.create_room("sjur").await;
        assert_eq!(room.settings.host, "sjur");
        assert_eq!(room.settings.name, "sjur's Game");
        assert!(!room.settings.is_started);
        assert!(!room.settings.guest_invite_enabled);
        assert_eq!(room.members.len(), 1);
        assert_eq!(room.members.get("sjur"), Some(&Role::Host));
        let hosts = room
            .members
            .values()
            .filter(|role| **role == Role::Host)
            .count();
        assert_eq!(hosts, 1);
    }

    #[tokio::test]
    async fn room_ids_are_short_and_unique() {
        let store = RoomStore::new();
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let room = store.create_room("sjur").await;
            assert_eq!(room.id.len(), 4);
            assert!(room.id.chars().all(|c| c.is_ascii_alphanumeric()));
            assert!(seen.insert(room.id.clone()), "id {} reused", room.id);
        }
        assert_eq!(store.list().await.len(), 500);
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let store = RoomStore::new();
        let room = store.create_room("host").await;

        let first = store.join(&room.id, "guest").await.unwrap();
        assert!(first.first_join);
        let second = store.join(&room.id, "guest").await.unwrap();
        assert!(!second.first_join);

        let members = store.members(&room.id).await.unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members.get("guest"), Some(&Role::Guest));
    }

    #[tokio::test]
    async fn invite_is_consumed_exactly_once() {
        let store = RoomStore::new();
        let room = store.create_room("host").await;

        store.invite(&room.id, "guest", "host").await.unwrap();
        assert!(store.get(&room.id).await.unwrap().invited.contains("guest"));

        store.join(&room.id, "guest").await.unwrap();
        assert!(store.get(&room.id).await.unwrap().invited.is_empty());
    }

    #[tokio::test]
    async fn guest_invite_requires_host_permission() {
        let store = RoomStore::new();
        let room = store.create_room("host").await;
        store.join(&room.id, "guest").await.unwrap();

        let err = store.invite(&room.id, "friend", "guest").await.unwrap_err();
        assert!(matches!(err, LobbyError::InviteForbidden(_)));

        store.set_guest_invite(&room.id, true, "host").await.unwrap();
        store.invite(&room.id, "friend", "guest").await.unwrap();
        assert!(store.get(&room.id).await.unwrap().invited.contains("friend"));
    }

    #[tokio::test]
    async fn request_join_never_mutates_state() {
        let store = RoomStore::new();
        let room = store.create_room("host").await;

        let request = store.request_join(&room.id, "guest").await.unwrap();
        assert!(!request.invited);
        assert_eq!(request.host, "host");

        let snapshot = store.get(&room.id).await.unwrap();
        assert!(snapshot.invited.is_empty());
        assert!(!snapshot.members.contains_key("guest"));
    }

    #[tokio::test]
    async fn request_join_after_approval_reports_invited() {
        let store = RoomStore::new();
        let room = store.create_room("host").await;

        store.let_user_join(&room.id, "guest", "host").await.unwrap();
        let request = store.request_join(&room.id, "guest").await.unwrap();
        assert!(request.invited);
    }

    #[tokio::test]
    async fn let_user_join_rejects_non_host() {
        let store = RoomStore::new();
        let room = store.create_room("host").await;
        store.join(&room.id, "guest").await.unwrap();

        let err = store
            .let_user_join(&room.id, "friend", "guest")
            .await
            .unwrap_err();
        assert!(matches!(err, LobbyError::NotHost { .. }));
    }

    #[tokio::test]
    async fn close_removes_room_and_reports_members() {
        let store = RoomStore::new();
        let room = store.create_room("host").await;
        store.join(&room.id, "guest").await.unwrap();

        let err = store.close(&room.id, "guest").await.unwrap_err();
        assert!(matches!(err, LobbyError::NotHost { .. }));

        let mut members = store.close(&room.id, "host").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["guest".to_string(), "host".to_string()]);
        assert!(store.get(&room.id).await.is_none());
    }

    #[tokio::test]
    async fn leave_does_not_reassign_host() {
        let store = RoomStore::new();
        let room = store.create_room("host").await;
        store.join(&room.id, "guest").await.unwrap();

        assert!(store.leave(&room.id, "host").await.unwrap());
        // The room keeps its recorded host even with no Host member present.
        let snapshot = store.get(&room.id).await.unwrap();
        assert_eq!(snapshot.settings.host, "host");
        assert_eq!(snapshot.members.get("guest"), Some(&Role::Guest));
    }

    #[tokio::test]
    async fn absent_room_is_an_error_not_a_panic() {
        let store = RoomStore::new();
        assert!(matches!(
            store.join("ZZZZ", "guest").await,
            Err(LobbyError::RoomNotFound(_))
        ));
        assert!(matches!(
            store.request_join("ZZZZ", "guest").await,
            Err(LobbyError::RoomNotFound(_))
        ));
        assert!(store.get("ZZZZ").await.is_none());
    }

    #[tokio::test]
    async fn leave_all_sweeps_every_membership() {
        let store = RoomStore::new();
        let a = store.create_room("host").await;
        let b = store.create_room("other").await;
        store.join(&a.id, "guest").await.unwrap();
        store.join(&b.id, "guest").await.unwrap();

        let mut left = store.leave_all("guest").await;
        left.sort();
        let mut expected = vec![a.id.clone(), b.id.clone()];
        expected.sort();
        assert_eq!(left, expected);
        assert!(!store.members(&a.id).await.unwrap().contains_key("guest"));
    }
}
