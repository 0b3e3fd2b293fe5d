use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    bsl::{ClientFile, MatchedVideo},
    config::{BslMode, Config, JoinMode},
    playback::PlaybackSnapshot,
    playlist::Playlist,
    server::ws::ConnectionId,
};

/// Who a server event is fanned out to.
#[derive(Debug, Clone)]
pub enum Recipients {
    All,
    Some(Vec<ConnectionId>),
}

/// Everything the server pushes over the message channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// The client-relevant slice of the server config
    Config(ClientConfig),
    /// The authoritative playback state of the sender's room
    Sync(PlaybackSnapshot),
    PlaylistUpdate {
        playlist: Playlist,
    },
    #[serde(rename_all = "camelCase")]
    PlaylistPosition {
        current_index: i32,
    },
    #[serde(rename_all = "camelCase")]
    TrackChange {
        video_index: i32,
        #[serde(rename = "trackType")]
        kind: TrackKind,
        track_index: i32,
    },
    InitialState(InitialState),
    /// Asks a member to report its local folder
    #[serde(rename_all = "camelCase")]
    BslCheckRequest {
        playlist_videos: Vec<BslVideoRef>,
    },
    #[serde(rename_all = "camelCase")]
    BslMatchResult {
        matched_videos: Vec<MatchedVideo>,
        total_matched: usize,
        total_playlist: usize,
    },
    #[serde(rename_all = "camelCase")]
    BslDriftUpdate {
        drift_values: HashMap<i32, f64>,
    },
    BslStatusUpdate(BslStatus),
    #[serde(rename_all = "camelCase")]
    BslCheckStarted {
        client_count: usize,
    },
    ClientCount {
        count: usize,
    },
    ChatMessage {
        sender: String,
        message: String,
        system: bool,
    },
    NameUpdated {
        name: String,
    },
    AdminAuthResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// An admin-gated command was sent by a non-admin connection
    AdminError {
        command: String,
    },
    #[serde(rename_all = "camelCase")]
    RateLimitError {
        retry_after: f64,
    },
    ControlRejected {
        reason: String,
    },
    ValidationError {
        command: String,
        reason: String,
    },
    ClientList {
        clients: Vec<ClientSummary>,
    },
    ViewerCount {
        count: usize,
    },
    RoomsUpdated {
        rooms: Vec<RoomSummary>,
    },
    #[serde(rename_all = "camelCase")]
    RoomDeleted {
        room_code: String,
    },
    #[serde(rename_all = "camelCase")]
    RoomCreated {
        room_code: String,
        room_name: String,
    },
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_code: String,
        is_admin: bool,
        viewers: usize,
    },
}

/// Everything a client may send over the message channel. Unknown tags
/// fail deserialization and are dropped by the router.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientCommand {
    CreateRoom(CreateRoomPayload),
    JoinRoom(JoinRoomPayload),
    LeaveRoom,
    DeleteRoom,
    SetPlaylist(SetPlaylistPayload),
    Control(ControlPayload),
    PlaylistJump {
        index: i32,
    },
    PlaylistNext,
    SkipToNextVideo,
    #[serde(rename_all = "camelCase")]
    PlaylistReorder {
        from_index: i32,
        to_index: i32,
    },
    #[serde(rename_all = "camelCase")]
    TrackChange {
        video_index: i32,
        #[serde(rename = "trackType")]
        kind: TrackKind,
        track_index: i32,
    },
    BslAdminRegister {
        #[serde(default)]
        fingerprint: Option<String>,
    },
    BslCheckRequest,
    BslGetStatus,
    #[serde(rename_all = "camelCase")]
    BslFolderSelected {
        #[serde(default)]
        client_name: Option<String>,
        files: Vec<ClientFile>,
    },
    #[serde(rename_all = "camelCase")]
    BslManualMatch {
        client_connection_id: ConnectionId,
        client_file_name: String,
        playlist_index: i32,
    },
    #[serde(rename_all = "camelCase")]
    BslSetDrift {
        client_fingerprint: String,
        playlist_index: i32,
        drift_seconds: f64,
    },
    ChatMessage(ChatPayload),
    #[serde(rename_all = "camelCase")]
    SetClientName {
        fingerprint: String,
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    SetClientDisplayName {
        client_connection_id: ConnectionId,
        name: String,
    },
    GetClientList,
    RequestInitialState,
    RequestSync,
    ClientRegister(ClientRegisterPayload),
    GetConfig,
    GetRooms,
}

impl ClientCommand {
    /// The wire name of the command, used in error replies.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateRoom(_) => "create-room",
            Self::JoinRoom(_) => "join-room",
            Self::LeaveRoom => "leave-room",
            Self::DeleteRoom => "delete-room",
            Self::SetPlaylist(_) => "set-playlist",
            Self::Control(_) => "control",
            Self::PlaylistJump { .. } => "playlist-jump",
            Self::PlaylistNext => "playlist-next",
            Self::SkipToNextVideo => "skip-to-next-video",
            Self::PlaylistReorder { .. } => "playlist-reorder",
            Self::TrackChange { .. } => "track-change",
            Self::BslAdminRegister { .. } => "bsl-admin-register",
            Self::BslCheckRequest => "bsl-check-request",
            Self::BslGetStatus => "bsl-get-status",
            Self::BslFolderSelected { .. } => "bsl-folder-selected",
            Self::BslManualMatch { .. } => "bsl-manual-match",
            Self::BslSetDrift { .. } => "bsl-set-drift",
            Self::ChatMessage(_) => "chat-message",
            Self::SetClientName { .. } => "set-client-name",
            Self::SetClientDisplayName { .. } => "set-client-display-name",
            Self::GetClientList => "get-client-list",
            Self::RequestInitialState => "request-initial-state",
            Self::RequestSync => "request-sync",
            Self::ClientRegister(_) => "client-register",
            Self::GetConfig => "get-config",
            Self::GetRooms => "get-rooms",
        }
    }

    /// Commands that require the sender to hold the room's admin seat.
    /// `create-room` and `bsl-admin-register` establish admin status and
    /// are exempt by definition.
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Self::SetPlaylist(_)
                | Self::PlaylistReorder { .. }
                | Self::PlaylistJump { .. }
                | Self::TrackChange { .. }
                | Self::SkipToNextVideo
                | Self::BslCheckRequest
                | Self::BslGetStatus
                | Self::BslManualMatch { .. }
                | Self::BslSetDrift { .. }
                | Self::SetClientName { .. }
                | Self::GetClientList
                | Self::SetClientDisplayName { .. }
                | Self::DeleteRoom
        )
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomPayload {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    #[serde(default)]
    pub is_private: bool,
    #[validate(length(min = 1, max = 128))]
    pub fingerprint: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    #[validate(length(min = 1, max = 8))]
    pub room_code: String,
    #[serde(default)]
    #[validate(length(max = 32))]
    pub name: Option<String>,
    #[validate(length(min = 1, max = 128))]
    pub fingerprint: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegisterPayload {
    #[validate(length(min = 1, max = 128))]
    pub fingerprint: String,
    #[serde(default)]
    #[validate(length(max = 32))]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPlaylistPayload {
    pub playlist: Vec<NewPlaylistEntry>,
    #[serde(default = "minus_one")]
    pub main_video_index: i32,
    #[serde(default)]
    pub start_time: f64,
}

fn minus_one() -> i32 {
    -1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPlaylistEntry {
    pub filename: String,
    #[serde(default)]
    pub is_external: bool,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    #[serde(default)]
    #[validate(length(max = 64))]
    pub sender: Option<String>,
    #[validate(length(min = 1, max = 500))]
    pub message: String,
}

/// A `control` message either carries an action, or is a raw sync push
/// from a client player.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ControlPayload {
    Action(ControlAction),
    Raw(RawSyncPush),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ControlAction {
    Playpause {
        state: bool,
    },
    Skip {
        direction: SkipDirection,
        #[serde(default)]
        seconds: Option<f64>,
    },
    Seek {
        time: f64,
    },
    #[serde(rename_all = "camelCase")]
    SelectTrack {
        #[serde(rename = "trackType")]
        kind: TrackKind,
        track_index: i32,
    },
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipDirection {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSyncPush {
    #[serde(default)]
    pub is_playing: Option<bool>,
    #[serde(default)]
    pub current_time: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Subtitle,
}

#[derive(Debug, Clone, Serialize)]
pub struct BslVideoRef {
    pub filename: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BslStatus {
    pub client_connection_id: ConnectionId,
    pub client_name: String,
    pub fingerprint: String,
    pub total_matched: usize,
    pub total_playlist: usize,
    /// Aggregated per-playlist-index activity under the configured mode
    pub active: Vec<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub connection_id: ConnectionId,
    pub fingerprint: String,
    pub name: String,
    pub connected_at: String,
    pub has_reported_folder: bool,
    pub drift: HashMap<i32, f64>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub code: String,
    pub name: String,
    pub viewers: usize,
    pub created_at: String,
}

/// The slice of [Config] that clients act on.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub volume_step: u32,
    pub skip_seconds: u32,
    pub max_volume: u32,
    pub skip_intro_seconds: u32,
    pub chat_enabled: bool,
    pub client_controls_disabled: bool,
    pub join_mode: JoinMode,
    pub bsl_s2_mode: BslMode,
    pub server_mode: bool,
}

impl ClientConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            volume_step: config.volume_step,
            skip_seconds: config.skip_seconds,
            max_volume: config.max_volume,
            skip_intro_seconds: config.skip_intro_seconds,
            chat_enabled: config.chat_enabled,
            client_controls_disabled: config.client_controls_disabled,
            join_mode: config.join_mode,
            bsl_s2_mode: config.bsl_s2_mode,
            server_mode: config.server_mode,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialState {
    pub playlist: Playlist,
    pub playback: PlaybackSnapshot,
    pub config: ClientConfig,
    pub bsl_active: Vec<bool>,
    pub viewers: usize,
    pub is_admin: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_deserialize_from_tagged_json() {
        let command: ClientCommand = serde_json::from_str(
            r#"{"type": "join-room", "roomCode": "ABC234", "fingerprint": "fp-1", "name": "Ann"}"#,
        )
        .unwrap();

        match command {
            ClientCommand::JoinRoom(payload) => {
                assert_eq!(payload.room_code, "ABC234");
                assert_eq!(payload.name.as_deref(), Some("Ann"));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn unknown_tags_fail_to_parse() {
        let result = serde_json::from_str::<ClientCommand>(r#"{"type": "warp-drive"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn control_with_action_parses_as_action() {
        let command: ClientCommand = serde_json::from_str(
            r#"{"type": "control", "action": "skip", "direction": "forward", "seconds": 10}"#,
        )
        .unwrap();

        let ClientCommand::Control(ControlPayload::Action(ControlAction::Skip {
            direction,
            seconds,
        })) = command
        else {
            panic!("expected a skip action");
        };

        assert!(matches!(direction, SkipDirection::Forward));
        assert_eq!(seconds, Some(10.0));
    }

    #[test]
    fn control_without_action_is_a_raw_push() {
        let command: ClientCommand = serde_json::from_str(
            r#"{"type": "control", "isPlaying": true, "currentTime": 12.5}"#,
        )
        .unwrap();

        let ClientCommand::Control(ControlPayload::Raw(push)) = command else {
            panic!("expected a raw sync push");
        };

        assert_eq!(push.is_playing, Some(true));
        assert_eq!(push.current_time, Some(12.5));
    }

    #[test]
    fn select_track_uses_camel_case_fields() {
        let command: ClientCommand = serde_json::from_str(
            r#"{"type": "control", "action": "selectTrack", "trackType": "subtitle", "trackIndex": -1}"#,
        )
        .unwrap();

        let ClientCommand::Control(ControlPayload::Action(ControlAction::SelectTrack {
            kind,
            track_index,
        })) = command
        else {
            panic!("expected a selectTrack action");
        };

        assert_eq!(kind, TrackKind::Subtitle);
        assert_eq!(track_index, -1);
    }

    #[test]
    fn server_events_serialize_with_kebab_tags() {
        let event = ServerEvent::RateLimitError { retry_after: 5.0 };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "rate-limit-error");
        assert_eq!(json["retryAfter"], 5.0);
    }

    #[test]
    fn admin_gate_covers_the_whitelist() {
        let gated: ClientCommand =
            serde_json::from_str(r#"{"type": "delete-room"}"#).unwrap();
        assert!(gated.requires_admin());

        let open: ClientCommand =
            serde_json::from_str(r#"{"type": "request-sync"}"#).unwrap();
        assert!(!open.requires_admin());

        let exempt: ClientCommand =
            serde_json::from_str(r#"{"type": "bsl-admin-register"}"#).unwrap();
        assert!(!exempt.requires_admin());
    }
}
