use std::{net::IpAddr, sync::Arc};

use log::trace;
use validator::Validate;

use crate::{
    config::Config,
    events::{
        ClientCommand, ClientConfig, ControlAction, ControlPayload, InitialState, ServerEvent,
        SkipDirection,
    },
    playlist::PlaylistEntry,
    probe,
    rate_limit::{Decision, WsRateLimiter},
    rooms::{Room, RoomManager, REJECT_GRACE},
    server::ws::{ConnectionId, Gateway},
    store::Store,
    validate::{bounded_index, is_valid_filename, is_valid_time},
};

/// Everything a command handler can reach.
#[derive(Clone)]
pub struct SyncContext {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub rooms: Arc<RoomManager>,
    pub gateway: Arc<Gateway>,
    pub limiter: Arc<WsRateLimiter>,
}

/// Routes one inbound message: rate limit, admin gate, validation, then
/// dispatch. A handler failure never takes the room or the process down;
/// it becomes a structured reply instead.
pub async fn dispatch(context: &SyncContext, connection: ConnectionId, addr: IpAddr, text: &str) {
    if let Decision::Limited { retry_after } = context.limiter.check(addr) {
        context.gateway.send(
            connection,
            &ServerEvent::RateLimitError { retry_after },
        );
        return;
    }

    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(err) => {
            trace!("Dropping unparseable event from {}: {}", connection, err);
            return;
        }
    };

    if command.requires_admin() && !sender_is_admin(context, connection) {
        context.gateway.send(
            connection,
            &ServerEvent::AdminError {
                command: command.name().to_string(),
            },
        );
        return;
    }

    handle(context, connection, command).await;
}

/// The admin gate. In single-room mode without the fingerprint lock, an
/// unclaimed seat admits anyone, which matches the deliberately-open
/// legacy behavior.
fn sender_is_admin(context: &SyncContext, connection: ConnectionId) -> bool {
    let Ok(room) = context.rooms.resolve(connection) else {
        return false;
    };

    if room.is_admin(connection) {
        return true;
    }

    !context.config.server_mode
        && !context.config.admin_fingerprint_lock
        && room.admin_connection().is_none()
}

async fn handle(context: &SyncContext, connection: ConnectionId, command: ClientCommand) {
    let name = command.name();

    match command {
        ClientCommand::CreateRoom(payload) => {
            if !context.config.server_mode {
                return reject(context, connection, name, "Rooms are disabled");
            }
            if payload.validate().is_err() {
                return reject(context, connection, name, "Invalid room name or fingerprint");
            }

            if context.rooms.resolve(connection).is_ok() {
                context.rooms.handle_disconnect(connection);
                context.gateway.clear_room(connection);
            }

            let room = context.rooms.create_room(payload.name.clone(), payload.is_private);

            context.gateway.set_fingerprint(connection, &payload.fingerprint);
            context.gateway.set_room(connection, &room.code);

            room.join(connection, &payload.fingerprint, None);
            room.claim_admin(connection, &payload.fingerprint);

            context.gateway.send(
                connection,
                &ServerEvent::RoomCreated {
                    room_code: room.code.clone(),
                    room_name: payload.name,
                },
            );

            room.after_join(connection);
            context.rooms.broadcast_public_rooms();
        }

        ClientCommand::JoinRoom(payload) => {
            if payload.validate().is_err() {
                return reject(context, connection, name, "Invalid join payload");
            }

            let Ok(room) = context.rooms.room(&payload.room_code) else {
                return reject(context, connection, name, "Room not found");
            };

            context.gateway.set_fingerprint(connection, &payload.fingerprint);
            context.gateway.set_room(connection, &room.code);

            let outcome = room.join(connection, &payload.fingerprint, payload.name.as_deref());

            context.gateway.send(
                connection,
                &ServerEvent::RoomJoined {
                    room_code: room.code.clone(),
                    is_admin: outcome.is_admin,
                    viewers: outcome.viewers,
                },
            );

            room.after_join(connection);
            context.rooms.broadcast_public_rooms();
        }

        ClientCommand::LeaveRoom => {
            if let Ok(room) = context.rooms.resolve(connection) {
                room.leave(connection);
                context.gateway.clear_room(connection);
                context.rooms.broadcast_public_rooms();
            }
        }

        ClientCommand::DeleteRoom => {
            if let Ok(room) = context.rooms.resolve(connection) {
                let _ = context.rooms.delete_room(&room.code);
            }
        }

        ClientCommand::SetPlaylist(payload) => {
            let Ok(room) = context.rooms.resolve(connection) else {
                return reject(context, connection, name, "Not in a room");
            };

            if !is_valid_time(payload.start_time) {
                return reject(context, connection, name, "Invalid start time");
            }

            for entry in &payload.playlist {
                if !is_valid_filename(&entry.filename) {
                    return reject(context, connection, name, "Invalid filename in playlist");
                }
            }

            let mut videos = Vec::with_capacity(payload.playlist.len());

            for new_entry in payload.playlist {
                let mut entry = PlaylistEntry::new(new_entry.filename, new_entry.is_external);

                if !entry.is_external {
                    let path = context.config.media_dir.join(&entry.filename);
                    let probed = probe::probe_media(&path).await;

                    entry.selected_audio_track = probed
                        .tracks
                        .audio
                        .iter()
                        .find(|track| track.default)
                        .map(|track| track.index)
                        .unwrap_or(0);
                    entry.tracks = probed.tracks;
                    entry.uses_hevc = probed.uses_hevc;
                }

                videos.push(entry);
            }

            room.set_playlist(videos, payload.main_video_index, payload.start_time);
        }

        ClientCommand::Control(payload) => {
            let Ok(room) = context.rooms.resolve(connection) else {
                return reject(context, connection, name, "Not in a room");
            };

            handle_control(context, connection, &room, payload);
        }

        ClientCommand::PlaylistJump { index } => {
            let Ok(room) = context.rooms.resolve(connection) else {
                return reject(context, connection, name, "Not in a room");
            };

            let Some(index) = bounded_index(index, room.playlist_len()) else {
                return reject(context, connection, name, "Playlist index out of range");
            };

            room.playlist_jump(index);
        }

        ClientCommand::PlaylistNext => {
            let Ok(room) = context.rooms.resolve(connection) else {
                return reject(context, connection, name, "Not in a room");
            };

            if !controls_allowed(context, &room, connection) {
                return control_rejected(context, connection);
            }

            room.playlist_next();
        }

        ClientCommand::SkipToNextVideo => {
            if let Ok(room) = context.rooms.resolve(connection) {
                room.playlist_next();
            }
        }

        ClientCommand::PlaylistReorder {
            from_index,
            to_index,
        } => {
            let Ok(room) = context.rooms.resolve(connection) else {
                return reject(context, connection, name, "Not in a room");
            };

            let len = room.playlist_len();
            let (Some(from), Some(to)) = (bounded_index(from_index, len), bounded_index(to_index, len))
            else {
                return reject(context, connection, name, "Playlist index out of range");
            };

            room.playlist_reorder(from, to);
        }

        ClientCommand::TrackChange {
            video_index,
            kind,
            track_index,
        } => {
            let Ok(room) = context.rooms.resolve(connection) else {
                return reject(context, connection, name, "Not in a room");
            };

            if track_index < -1 {
                return reject(context, connection, name, "Track index out of range");
            }

            if !room.track_change(video_index, kind, track_index) {
                reject(context, connection, name, "Playlist index out of range");
            }
        }

        ClientCommand::BslAdminRegister { fingerprint } => {
            let fingerprint = fingerprint.or_else(|| context.gateway.fingerprint_of(connection));

            let Some(fingerprint) = fingerprint else {
                return reject(context, connection, name, "A fingerprint is required");
            };

            register_admin(context, connection, &fingerprint);
        }

        ClientCommand::BslCheckRequest => {
            if let Ok(room) = context.rooms.resolve(connection) {
                let client_count = room.start_bsl_check();

                context
                    .gateway
                    .send(connection, &ServerEvent::BslCheckStarted { client_count });
            }
        }

        ClientCommand::BslGetStatus => {
            if let Ok(room) = context.rooms.resolve(connection) {
                for status in room.bsl_statuses() {
                    context
                        .gateway
                        .send(connection, &ServerEvent::BslStatusUpdate(status));
                }
            }
        }

        ClientCommand::BslFolderSelected { client_name: _, files } => {
            let Ok(room) = context.rooms.resolve(connection) else {
                return reject(context, connection, name, "Not in a room");
            };

            if files.len() > 10_000 || files.iter().any(|file| file.name.len() > 255) {
                return reject(context, connection, name, "Folder report is malformed");
            }

            if let Some(result) = room.folder_selected(connection, files) {
                context.gateway.send(connection, &result);
            }
        }

        ClientCommand::BslManualMatch {
            client_connection_id,
            client_file_name,
            playlist_index,
        } => {
            let Ok(room) = context.rooms.resolve(connection) else {
                return reject(context, connection, name, "Not in a room");
            };

            if client_file_name.is_empty() || client_file_name.len() > 255 {
                return reject(context, connection, name, "Invalid client filename");
            }

            let Some(index) = bounded_index(playlist_index, room.playlist_len()) else {
                return reject(context, connection, name, "Playlist index out of range");
            };

            if room
                .manual_match(client_connection_id, &client_file_name, index)
                .is_none()
            {
                reject(context, connection, name, "Unknown client connection");
            }
        }

        ClientCommand::BslSetDrift {
            client_fingerprint,
            playlist_index,
            drift_seconds,
        } => {
            let Ok(room) = context.rooms.resolve(connection) else {
                return reject(context, connection, name, "Not in a room");
            };

            if bounded_index(playlist_index, room.playlist_len()).is_none() {
                return reject(context, connection, name, "Playlist index out of range");
            }

            room.set_drift(&client_fingerprint, playlist_index, drift_seconds);
        }

        ClientCommand::ChatMessage(payload) => {
            if !context.config.chat_enabled {
                return;
            }

            let Ok(room) = context.rooms.resolve(connection) else {
                return;
            };

            if payload.validate().is_err() {
                return reject(context, connection, name, "Message too long");
            }

            room.chat(connection, payload.sender.as_deref(), &payload.message);
        }

        ClientCommand::SetClientName { fingerprint, name: new_name } => {
            let Ok(room) = context.rooms.resolve(connection) else {
                return reject(context, connection, name, "Not in a room");
            };

            let trimmed: String = new_name.trim().chars().take(32).collect();

            if trimmed.is_empty() {
                return reject(context, connection, name, "Name must not be empty");
            }

            room.set_name_for_fingerprint(&fingerprint, &trimmed);
        }

        ClientCommand::SetClientDisplayName {
            client_connection_id,
            name: new_name,
        } => {
            let Ok(room) = context.rooms.resolve(connection) else {
                return reject(context, connection, name, "Not in a room");
            };

            let trimmed: String = new_name.trim().chars().take(32).collect();

            if trimmed.is_empty() || room.rename_member(client_connection_id, &trimmed).is_none() {
                reject(context, connection, name, "Unknown client connection");
            }
        }

        ClientCommand::GetClientList => {
            if let Ok(room) = context.rooms.resolve(connection) {
                context.gateway.send(
                    connection,
                    &ServerEvent::ClientList {
                        clients: room.client_list(),
                    },
                );
            }
        }

        ClientCommand::RequestInitialState => {
            let event = match context.rooms.resolve(connection) {
                Ok(room) => ServerEvent::InitialState(room.initial_state(connection)),
                Err(_) => ServerEvent::InitialState(InitialState {
                    playlist: Default::default(),
                    playback: crate::playback::PlaybackState::default()
                        .snapshot(std::time::Instant::now()),
                    config: ClientConfig::from_config(&context.config),
                    bsl_active: Vec::new(),
                    viewers: 0,
                    is_admin: false,
                }),
            };

            context.gateway.send(connection, &event);
        }

        ClientCommand::RequestSync => {
            if let Ok(room) = context.rooms.resolve(connection) {
                room.send_sync_to(connection);
            }
        }

        ClientCommand::ClientRegister(payload) => {
            if payload.validate().is_err() {
                return reject(context, connection, name, "Invalid registration");
            }

            context.gateway.set_fingerprint(connection, &payload.fingerprint);

            if let Some(client_name) = payload.name.as_deref() {
                context.store.set_client_name(&payload.fingerprint, client_name);
            }

            if !context.config.server_mode {
                if let Ok(room) = context.rooms.legacy_room() {
                    context.gateway.set_room(connection, &room.code);
                    room.join(connection, &payload.fingerprint, payload.name.as_deref());

                    context.gateway.send(
                        connection,
                        &ServerEvent::Config(ClientConfig::from_config(&context.config)),
                    );

                    room.after_join(connection);
                }
            } else {
                context.gateway.send(
                    connection,
                    &ServerEvent::RoomsUpdated {
                        rooms: context.rooms.list_public(),
                    },
                );
            }
        }

        ClientCommand::GetConfig => {
            context.gateway.send(
                connection,
                &ServerEvent::Config(ClientConfig::from_config(&context.config)),
            );
        }

        ClientCommand::GetRooms => {
            context.gateway.send(
                connection,
                &ServerEvent::RoomsUpdated {
                    rooms: context.rooms.list_public(),
                },
            );
        }
    }
}

/// Inline playback controls, plus the raw sync push clients send when no
/// action is present.
fn handle_control(
    context: &SyncContext,
    connection: ConnectionId,
    room: &Arc<Room>,
    payload: ControlPayload,
) {
    match payload {
        ControlPayload::Action(action) => {
            if !controls_allowed(context, room, connection) {
                return control_rejected(context, connection);
            }

            match action {
                ControlAction::Playpause { state } => room.play_pause(state),
                ControlAction::Seek { time } => {
                    if !is_valid_time(time) {
                        return reject(context, connection, "control", "Invalid seek time");
                    }

                    room.seek(time);
                }
                ControlAction::Skip { direction, seconds } => {
                    let seconds = seconds.unwrap_or(context.config.skip_seconds as f64);

                    if !is_valid_time(seconds) {
                        return reject(context, connection, "control", "Invalid skip delta");
                    }

                    let delta = match direction {
                        SkipDirection::Forward => seconds,
                        SkipDirection::Backward => -seconds,
                    };

                    room.skip(delta);
                }
                ControlAction::SelectTrack { kind, track_index } => {
                    if track_index < -1 {
                        return reject(context, connection, "control", "Track index out of range");
                    }

                    room.select_track(kind, track_index);
                }
            }
        }
        ControlPayload::Raw(push) => {
            // Ignored silently when client sync is disabled, or when
            // client controls are disabled for a non-admin sender
            if context.config.client_sync_disabled {
                return;
            }

            if context.config.client_controls_disabled && !room.is_admin(connection) {
                return;
            }

            if let Some(time) = push.current_time {
                if !is_valid_time(time) {
                    return reject(context, connection, "control", "Invalid sync time");
                }
            }

            room.client_sync(push.is_playing, push.current_time);
        }
    }
}

fn controls_allowed(context: &SyncContext, room: &Arc<Room>, connection: ConnectionId) -> bool {
    !context.config.client_controls_disabled || room.is_admin(connection)
}

fn control_rejected(context: &SyncContext, connection: ConnectionId) {
    context.gateway.send(
        connection,
        &ServerEvent::ControlRejected {
            reason: "Client controls are disabled".to_string(),
        },
    );
}

fn reject(context: &SyncContext, connection: ConnectionId, command: &str, reason: &str) {
    context.gateway.send(
        connection,
        &ServerEvent::ValidationError {
            command: command.to_string(),
            reason: reason.to_string(),
        },
    );
}

/// The admin registration flow under the fingerprint lock: the first
/// fingerprint binds, a different one is rejected and disconnected after
/// a short grace period.
fn register_admin(context: &SyncContext, connection: ConnectionId, fingerprint: &str) {
    let room = match context.rooms.resolve(connection) {
        Ok(room) => room,
        Err(_) => {
            // In single-room mode the admin may register before anything
            // else; seat them in the implicit room first.
            let Ok(room) = context.rooms.legacy_room() else {
                return reject(context, connection, "bsl-admin-register", "Not in a room");
            };

            context.gateway.set_room(connection, &room.code);
            room.join(connection, fingerprint, None);
            room.after_join(connection);
            room
        }
    };

    context.gateway.set_fingerprint(connection, fingerprint);

    if context.config.admin_fingerprint_lock {
        match context.store.admin_fingerprint() {
            Some(registered) if registered != fingerprint => {
                context.gateway.send(
                    connection,
                    &ServerEvent::AdminAuthResult {
                        success: false,
                        reason: Some("Fingerprint does not match the registered admin".to_string()),
                    },
                );

                context.gateway.close_after(connection, REJECT_GRACE);
                return;
            }
            Some(_) => {}
            None => context.store.set_admin_fingerprint(fingerprint),
        }
    }

    room.claim_admin(connection, fingerprint);

    context.gateway.send(
        connection,
        &ServerEvent::AdminAuthResult {
            success: true,
            reason: None,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::JoinMode, server::ws::Outbound};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct Peer {
        id: ConnectionId,
        addr: IpAddr,
        rx: UnboundedReceiver<Outbound>,
    }

    fn test_context(configure: impl FnOnce(&mut Config)) -> SyncContext {
        let dir = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        configure(&mut config);

        let config = Arc::new(config);
        let store = Arc::new(Store::load(dir.path()).unwrap());
        std::mem::forget(dir);

        let gateway = Gateway::new();
        let rooms = RoomManager::new(config.clone(), store.clone(), gateway.clone());

        SyncContext {
            config,
            store,
            rooms,
            gateway,
            limiter: Arc::new(WsRateLimiter::default()),
        }
    }

    fn connect(context: &SyncContext) -> Peer {
        connect_from(context, "127.0.0.1")
    }

    fn connect_from(context: &SyncContext, ip: &str) -> Peer {
        let (tx, rx) = unbounded_channel();
        let addr: SocketAddr = format!("{}:40000", ip).parse().unwrap();
        let id = context.gateway.register(addr, tx);

        Peer {
            id,
            addr: addr.ip(),
            rx,
        }
    }

    async fn send(context: &SyncContext, peer: &Peer, value: Value) {
        dispatch(context, peer.id, peer.addr, &value.to_string()).await;
    }

    fn events(peer: &mut Peer) -> Vec<Value> {
        let mut collected = Vec::new();

        while let Ok(outbound) = peer.rx.try_recv() {
            if let Outbound::Event(text) = outbound {
                collected.push(serde_json::from_str(&text).unwrap());
            }
        }

        collected
    }

    fn of_type(collected: &[Value], kind: &str) -> Vec<Value> {
        collected
            .iter()
            .filter(|event| event["type"] == kind)
            .cloned()
            .collect()
    }

    async fn create_room(context: &SyncContext, admin: &mut Peer, fingerprint: &str) -> String {
        send(
            context,
            admin,
            json!({"type": "create-room", "name": "Movie Night", "fingerprint": fingerprint}),
        )
        .await;

        let created = of_type(&events(admin), "room-created");
        created[0]["roomCode"].as_str().unwrap().to_string()
    }

    async fn set_two_entry_playlist(context: &SyncContext, admin: &Peer) {
        dispatch(
            context,
            admin.id,
            admin.addr,
            &json!({
                "type": "set-playlist",
                "playlist": [
                    {"filename": "first.mkv", "isExternal": true},
                    {"filename": "second.mkv", "isExternal": true}
                ]
            })
            .to_string(),
        )
        .await;
    }

    #[tokio::test]
    async fn late_joiner_snaps_to_the_room_clock() {
        let context = test_context(|config| config.server_mode = true);

        let mut admin = connect(&context);
        let code = create_room(&context, &mut admin, "fp-admin").await;
        set_two_entry_playlist(&context, &admin).await;

        let mut viewer_a = connect(&context);
        send(
            &context,
            &viewer_a,
            json!({"type": "join-room", "roomCode": code, "fingerprint": "fp-a"}),
        )
        .await;

        let joined = events(&mut viewer_a);
        let sync = of_type(&joined, "sync");
        assert_eq!(sync[0]["isPlaying"], false);
        assert_eq!(sync[0]["currentTime"], 0.0);

        send(
            &context,
            &admin,
            json!({"type": "control", "action": "playpause", "state": true}),
        )
        .await;
        send(
            &context,
            &admin,
            json!({"type": "control", "action": "seek", "time": 42.0}),
        )
        .await;

        let mut viewer_b = connect(&context);
        send(
            &context,
            &viewer_b,
            json!({"type": "join-room", "roomCode": code, "fingerprint": "fp-b"}),
        )
        .await;

        let collected = events(&mut viewer_b);
        let sync = of_type(&collected, "sync");
        let time = sync[0]["currentTime"].as_f64().unwrap();

        assert_eq!(sync[0]["isPlaying"], true);
        assert!(time >= 42.0 && time < 42.5, "got {}", time);
    }

    #[tokio::test]
    async fn reset_mode_rewinds_everyone_on_join() {
        let context = test_context(|config| {
            config.server_mode = true;
            config.join_mode = JoinMode::Reset;
        });

        let mut admin = connect(&context);
        let code = create_room(&context, &mut admin, "fp-admin").await;
        set_two_entry_playlist(&context, &admin).await;

        send(
            &context,
            &admin,
            json!({"type": "control", "action": "seek", "time": 30.0}),
        )
        .await;
        events(&mut admin);

        let mut viewer = connect(&context);
        send(
            &context,
            &viewer,
            json!({"type": "join-room", "roomCode": code, "fingerprint": "fp-c"}),
        )
        .await;

        let admin_sync = of_type(&events(&mut admin), "sync");
        assert!(!admin_sync.is_empty());
        assert_eq!(admin_sync.last().unwrap()["currentTime"], 0.0);

        let viewer_sync = of_type(&events(&mut viewer), "sync");
        assert_eq!(viewer_sync.last().unwrap()["currentTime"], 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn fingerprint_lock_rejects_and_disconnects() {
        let context = test_context(|config| {
            config.server_mode = false;
            config.admin_fingerprint_lock = true;
        });

        let mut first = connect(&context);
        send(
            &context,
            &first,
            json!({"type": "bsl-admin-register", "fingerprint": "fp-1"}),
        )
        .await;

        let auth = of_type(&events(&mut first), "admin-auth-result");
        assert_eq!(auth[0]["success"], true);

        let mut second = connect(&context);
        send(
            &context,
            &second,
            json!({"type": "bsl-admin-register", "fingerprint": "fp-2"}),
        )
        .await;

        let auth = of_type(&events(&mut second), "admin-auth-result");
        assert_eq!(auth[0]["success"], false);

        // the rejected connection is force-closed after the grace period
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let mut closed = false;

        while let Ok(outbound) = second.rx.try_recv() {
            if matches!(outbound, Outbound::Close) {
                closed = true;
            }
        }
        assert!(closed);

        // the seat stays with the first connection
        let room = context.rooms.legacy_room().unwrap();
        assert_eq!(room.admin_connection(), Some(first.id));
    }

    #[tokio::test]
    async fn admin_gated_commands_leave_state_unchanged() {
        let context = test_context(|config| config.server_mode = true);

        let mut admin = connect(&context);
        let code = create_room(&context, &mut admin, "fp-admin").await;
        set_two_entry_playlist(&context, &admin).await;

        let mut viewer = connect(&context);
        send(
            &context,
            &viewer,
            json!({"type": "join-room", "roomCode": code, "fingerprint": "fp-v"}),
        )
        .await;
        events(&mut viewer);

        send(
            &context,
            &viewer,
            json!({
                "type": "set-playlist",
                "playlist": [{"filename": "evil.mkv", "isExternal": true}]
            }),
        )
        .await;
        send(
            &context,
            &viewer,
            json!({"type": "playlist-reorder", "fromIndex": 0, "toIndex": 1}),
        )
        .await;

        let collected = events(&mut viewer);
        assert_eq!(of_type(&collected, "admin-error").len(), 2);

        send(&context, &viewer, json!({"type": "request-initial-state"})).await;
        let state = of_type(&events(&mut viewer), "initial-state");
        let videos = state[0]["playlist"]["videos"].as_array().unwrap();

        assert_eq!(videos.len(), 2);
        assert_eq!(videos[0]["filename"], "first.mkv");
    }

    #[tokio::test]
    async fn admin_seat_is_reclaimed_by_fingerprint() {
        let context = test_context(|config| config.server_mode = true);

        let mut admin = connect(&context);
        let code = create_room(&context, &mut admin, "fp-admin").await;

        context.rooms.handle_disconnect(admin.id);
        context.gateway.unregister(admin.id);

        let mut returned = connect(&context);
        send(
            &context,
            &returned,
            json!({"type": "join-room", "roomCode": code, "fingerprint": "fp-admin"}),
        )
        .await;

        let joined = of_type(&events(&mut returned), "room-joined");
        assert_eq!(joined[0]["isAdmin"], true);

        let mut stranger = connect(&context);
        send(
            &context,
            &stranger,
            json!({"type": "join-room", "roomCode": code, "fingerprint": "fp-other"}),
        )
        .await;

        let joined = of_type(&events(&mut stranger), "room-joined");
        assert_eq!(joined[0]["isAdmin"], false);
    }

    #[tokio::test]
    async fn drift_is_clamped_and_fanned_out() {
        let context = test_context(|config| config.server_mode = true);

        let mut admin = connect(&context);
        let code = create_room(&context, &mut admin, "fp-admin").await;
        set_two_entry_playlist(&context, &admin).await;

        let mut viewer = connect(&context);
        send(
            &context,
            &viewer,
            json!({"type": "join-room", "roomCode": code, "fingerprint": "fp-v"}),
        )
        .await;
        events(&mut viewer);

        send(
            &context,
            &admin,
            json!({
                "type": "bsl-set-drift",
                "clientFingerprint": "fp-v",
                "playlistIndex": 0,
                "driftSeconds": 75.0
            }),
        )
        .await;

        let update = of_type(&events(&mut viewer), "bsl-drift-update");
        assert_eq!(update[0]["driftValues"]["0"], 60.0);
    }

    #[tokio::test]
    async fn rate_limit_rejects_past_one_hundred() {
        let context = test_context(|config| config.server_mode = true);
        let mut peer = connect_from(&context, "203.0.113.7");

        for _ in 0..120 {
            send(&context, &peer, json!({"type": "get-config"})).await;
        }

        let collected = events(&mut peer);

        assert_eq!(of_type(&collected, "config").len(), 100);
        assert_eq!(of_type(&collected, "rate-limit-error").len(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn autoplay_defeat_sends_a_second_sync() {
        let context = test_context(|config| config.server_mode = true);

        let mut admin = connect(&context);
        create_room(&context, &mut admin, "fp-admin").await;
        set_two_entry_playlist(&context, &admin).await;
        events(&mut admin);

        tokio::time::sleep(Duration::from_millis(600)).await;

        let sync = of_type(&events(&mut admin), "sync");
        assert!(!sync.is_empty());
        assert_eq!(sync.last().unwrap()["isPlaying"], false);
    }

    #[tokio::test]
    async fn folder_reports_match_and_are_idempotent() {
        let context = test_context(|config| config.server_mode = true);

        let mut admin = connect(&context);
        let code = create_room(&context, &mut admin, "fp-admin").await;
        set_two_entry_playlist(&context, &admin).await;

        let mut viewer = connect(&context);
        send(
            &context,
            &viewer,
            json!({"type": "join-room", "roomCode": code, "fingerprint": "fp-v"}),
        )
        .await;
        events(&mut viewer);
        events(&mut admin);

        let report = json!({
            "type": "bsl-folder-selected",
            "files": [
                {"name": "First.MKV", "size": 1000},
                {"name": "unrelated.txt"}
            ]
        });

        send(&context, &viewer, report.clone()).await;
        let first = of_type(&events(&mut viewer), "bsl-match-result");

        assert_eq!(first[0]["totalMatched"], 1);
        assert_eq!(first[0]["totalPlaylist"], 2);
        assert_eq!(first[0]["matchedVideos"][0]["clientFilename"], "First.MKV");

        // the admin hears about the report
        let status = of_type(&events(&mut admin), "bsl-status-update");
        assert_eq!(status[0]["totalMatched"], 1);
        assert_eq!(status[0]["active"][0], true);
        assert_eq!(status[0]["active"][1], false);

        // reporting the same folder again yields the identical reply
        send(&context, &viewer, report).await;
        let second = of_type(&events(&mut viewer), "bsl-match-result");
        assert_eq!(first[0], second[0]);
    }

    #[tokio::test]
    async fn playlist_jump_validates_indices() {
        let context = test_context(|config| config.server_mode = true);

        let mut admin = connect(&context);
        create_room(&context, &mut admin, "fp-admin").await;
        set_two_entry_playlist(&context, &admin).await;
        events(&mut admin);

        send(&context, &admin, json!({"type": "playlist-jump", "index": 5})).await;
        let collected = events(&mut admin);

        assert_eq!(of_type(&collected, "validation-error").len(), 1);
        assert!(of_type(&collected, "playlist-position").is_empty());

        send(&context, &admin, json!({"type": "playlist-jump", "index": 1})).await;
        let collected = events(&mut admin);
        let position = of_type(&collected, "playlist-position");

        assert_eq!(position[0]["currentIndex"], 1);
    }

    #[tokio::test]
    async fn chat_is_escaped_and_rename_works() {
        let context = test_context(|config| config.server_mode = true);

        let mut admin = connect(&context);
        create_room(&context, &mut admin, "fp-admin").await;

        send(
            &context,
            &admin,
            json!({"type": "chat-message", "message": "<b>hello</b>"}),
        )
        .await;

        let chat = of_type(&events(&mut admin), "chat-message");
        assert_eq!(chat[0]["message"], "&lt;b&gt;hello&lt;/b&gt;");

        send(
            &context,
            &admin,
            json!({"type": "chat-message", "message": "/rename The Captain"}),
        )
        .await;

        let collected = events(&mut admin);
        let renamed = of_type(&collected, "name-updated");
        assert_eq!(renamed[0]["name"], "The Captain");
        assert_eq!(
            context.store.client_name("fp-admin").as_deref(),
            Some("The Captain")
        );
    }

    #[tokio::test]
    async fn disabled_client_controls_reject_non_admins() {
        let context = test_context(|config| {
            config.server_mode = true;
            config.client_controls_disabled = true;
        });

        let mut admin = connect(&context);
        let code = create_room(&context, &mut admin, "fp-admin").await;
        set_two_entry_playlist(&context, &admin).await;

        let mut viewer = connect(&context);
        send(
            &context,
            &viewer,
            json!({"type": "join-room", "roomCode": code, "fingerprint": "fp-v"}),
        )
        .await;
        events(&mut viewer);

        send(
            &context,
            &viewer,
            json!({"type": "control", "action": "playpause", "state": true}),
        )
        .await;

        let collected = events(&mut viewer);
        assert_eq!(of_type(&collected, "control-rejected").len(), 1);

        // the room is still paused
        send(&context, &viewer, json!({"type": "request-sync"})).await;
        let sync = of_type(&events(&mut viewer), "sync");
        assert_eq!(sync[0]["isPlaying"], false);
    }
}
