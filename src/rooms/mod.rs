use std::sync::Arc;

use dashmap::DashMap;
use log::info;
use rand::Rng;
use thiserror::Error;

mod room;
pub mod router;

pub use room::*;

use crate::{
    config::Config,
    events::{Recipients, RoomSummary, ServerEvent},
    server::ws::{ConnectionId, Gateway},
    store::Store,
};

/// Room codes avoid I, O, 0 and 1 to reduce transcription error.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const ROOM_CODE_LENGTH: usize = 6;

/// The implicit room used when `server_mode` is off.
pub const LEGACY_ROOM_CODE: &str = "LEGACY";

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Room {0} does not exist")]
    RoomNotFound(String),
    #[error("Not currently in a room")]
    NotInRoom,
}

/// Creates, looks up and deletes rooms. In single-room mode it holds
/// exactly one implicit room.
pub struct RoomManager {
    config: Arc<Config>,
    store: Arc<Store>,
    gateway: Arc<Gateway>,
    rooms: DashMap<String, Arc<Room>>,
}

impl RoomManager {
    /// Must be called from within the runtime, since rooms spawn tickers.
    pub fn new(config: Arc<Config>, store: Arc<Store>, gateway: Arc<Gateway>) -> Arc<Self> {
        let manager = Arc::new(Self {
            config: config.clone(),
            store: store.clone(),
            gateway: gateway.clone(),
            rooms: DashMap::new(),
        });

        if !config.server_mode {
            let room = Room::new(
                LEGACY_ROOM_CODE.to_string(),
                "Sync Session".to_string(),
                false,
                config,
                store,
                gateway,
            );

            manager.rooms.insert(LEGACY_ROOM_CODE.to_string(), room);
        }

        manager
    }

    pub fn create_room(&self, name: String, private: bool) -> Arc<Room> {
        let code = self.generate_code();

        let room = Room::new(
            code.clone(),
            name,
            private,
            self.config.clone(),
            self.store.clone(),
            self.gateway.clone(),
        );

        self.rooms.insert(code.clone(), room.clone());
        info!("Room {} created", code);
        self.store.log_event(&format!("room {} created", code));

        room
    }

    /// Looks a room up by its code, case-insensitively.
    pub fn room(&self, code: &str) -> Result<Arc<Room>, RoomError> {
        self.rooms
            .get(&code.to_uppercase())
            .map(|room| room.clone())
            .ok_or_else(|| RoomError::RoomNotFound(code.to_string()))
    }

    /// The implicit room of single-room mode.
    pub fn legacy_room(&self) -> Result<Arc<Room>, RoomError> {
        self.room(LEGACY_ROOM_CODE)
    }

    /// The room the given connection is currently a member of.
    pub fn resolve(&self, connection: ConnectionId) -> Result<Arc<Room>, RoomError> {
        let code = self
            .gateway
            .room_of(connection)
            .ok_or(RoomError::NotInRoom)?;

        self.room(&code)
    }

    /// Deletes a room: members are told, room persistence is dropped, and
    /// every member connection is closed cleanly.
    pub fn delete_room(&self, code: &str) -> Result<(), RoomError> {
        let (_, room) = self
            .rooms
            .remove(&code.to_uppercase())
            .ok_or_else(|| RoomError::RoomNotFound(code.to_string()))?;

        let members = room.member_ids();
        room.notify_deleted();

        for member in members {
            self.gateway.clear_room(member);
            self.gateway.close(member);
        }

        self.store.remove_room_admin(&room.code);
        self.store.log_event(&format!("room {} deleted", room.code));
        self.broadcast_public_rooms();

        Ok(())
    }

    /// Non-private rooms with live viewer counts.
    pub fn list_public(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<_> = self
            .rooms
            .iter()
            .filter(|entry| !entry.is_private())
            .map(|entry| entry.summary())
            .collect();

        rooms.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rooms
    }

    /// Pushes the public room list to every connection not in a room.
    pub fn broadcast_public_rooms(&self) {
        let idle = self.gateway.idle_connections();

        if idle.is_empty() {
            return;
        }

        self.gateway.broadcast(
            &Recipients::Some(idle),
            &ServerEvent::RoomsUpdated {
                rooms: self.list_public(),
            },
        );
    }

    /// Removes a dropped connection from its room, if it was in one.
    pub fn handle_disconnect(&self, connection: ConnectionId) {
        if let Ok(room) = self.resolve(connection) {
            room.leave(connection);
            self.broadcast_public_rooms();
        }
    }

    /// Tells everyone the server is going down.
    pub fn notify_shutdown(&self) {
        self.gateway.broadcast(
            &Recipients::All,
            &ServerEvent::ChatMessage {
                sender: String::new(),
                message: "Server is shutting down".to_string(),
                system: true,
            },
        );
    }

    fn generate_code(&self) -> String {
        let mut rng = rand::thread_rng();

        loop {
            let code: String = (0..ROOM_CODE_LENGTH)
                .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
                .collect();

            if !self.rooms.contains_key(&code) {
                return code;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(server_mode: bool) -> (Arc<Config>, Arc<Store>, Arc<Gateway>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server_mode = server_mode;
        config.data_dir = dir.path().to_path_buf();

        let store = Arc::new(Store::load(dir.path()).unwrap());
        // Leak the tempdir so the store outlives the test body
        std::mem::forget(dir);

        (Arc::new(config), store, Gateway::new())
    }

    #[tokio::test]
    async fn codes_use_the_safe_alphabet() {
        let (config, store, gateway) = context(true);
        let manager = RoomManager::new(config, store, gateway);

        for _ in 0..50 {
            let room = manager.create_room("Movie Night".to_string(), false);

            assert_eq!(room.code.len(), ROOM_CODE_LENGTH);
            assert!(room
                .code
                .bytes()
                .all(|byte| ROOM_CODE_ALPHABET.contains(&byte)));
            assert!(!room.code.contains(['I', 'O', '0', '1']));
        }
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let (config, store, gateway) = context(true);
        let manager = RoomManager::new(config, store, gateway);

        let room = manager.create_room("Night".to_string(), false);
        let found = manager.room(&room.code.to_lowercase()).unwrap();

        assert_eq!(found.code, room.code);
    }

    #[tokio::test]
    async fn single_room_mode_has_the_implicit_room() {
        let (config, store, gateway) = context(false);
        let manager = RoomManager::new(config, store, gateway);

        assert!(manager.legacy_room().is_ok());
        assert_eq!(manager.list_public().len(), 1);
    }

    #[tokio::test]
    async fn private_rooms_are_not_listed() {
        let (config, store, gateway) = context(true);
        let manager = RoomManager::new(config, store, gateway);

        manager.create_room("Open".to_string(), false);
        manager.create_room("Hidden".to_string(), true);

        let listed = manager.list_public();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "Open");
    }

    #[tokio::test]
    async fn deleted_rooms_disappear() {
        let (config, store, gateway) = context(true);
        let manager = RoomManager::new(config, store, gateway);

        let room = manager.create_room("Gone Soon".to_string(), false);
        let code = room.code.clone();

        manager.delete_room(&code).unwrap();

        assert!(manager.room(&code).is_err());
        assert!(manager.delete_room(&code).is_err());
    }
}
