use std::{
    collections::{HashMap, HashSet},
    fs,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use log::info;
use parking_lot::Mutex;

use crate::{
    bsl::{self, ClientFile, MatchedVideo, MatcherOptions, ServerFile},
    config::{Config, JoinMode},
    events::{
        BslStatus, BslVideoRef, ClientConfig, ClientSummary, InitialState, Recipients, RoomSummary,
        ServerEvent, TrackKind,
    },
    playback::{PlaybackState, TICKER_PERIOD},
    playlist::{Playlist, PlaylistEntry},
    server::ws::{ConnectionId, Gateway},
    store::Store,
    validate::clamp_drift,
};

/// How long a rejected admin connection gets before it is closed.
pub const REJECT_GRACE: Duration = Duration::from_secs(1);

/// Delay before the second `sync` that defeats client auto-resume races
/// after a playlist is set without autoplay.
pub const AUTOPLAY_DEFEAT_DELAY: Duration = Duration::from_millis(500);

/// A member's presence in a room, looked up by connection id.
#[derive(Debug, Clone)]
pub struct Member {
    pub connection: ConnectionId,
    pub fingerprint: String,
    pub name: String,
    pub connected_at: DateTime<Utc>,
}

/// The admin seat: the fingerprint survives disconnects, the connection
/// does not.
#[derive(Debug, Default, Clone)]
pub struct AdminSeat {
    pub fingerprint: Option<String>,
    pub connection: Option<ConnectionId>,
}

/// One member's reported folder and its current matches.
#[derive(Debug, Default, Clone)]
pub struct BslReport {
    pub files: Vec<ClientFile>,
    pub matched: Vec<MatchedVideo>,
}

#[derive(Debug)]
pub struct RoomState {
    pub name: String,
    pub private: bool,
    pub created_at: DateTime<Utc>,
    pub admin: AdminSeat,
    pub members: Vec<Member>,
    pub playlist: Playlist,
    pub playback: PlaybackState,
    /// Folder reports keyed by fingerprint, surviving reconnects
    pub bsl: HashMap<String, BslReport>,
    /// Drift tables keyed by fingerprint, then playlist index
    pub drift: HashMap<String, HashMap<i32, f64>>,
}

/// A synchronized playback session. All state lives behind one mutex so
/// every mutation and its fan-out are totally ordered within the room.
pub struct Room {
    pub code: String,
    config: Arc<Config>,
    store: Arc<Store>,
    gateway: Arc<Gateway>,
    state: Mutex<RoomState>,
}

pub struct JoinOutcome {
    pub is_admin: bool,
    pub viewers: usize,
}

impl Room {
    pub fn new(
        code: String,
        name: String,
        private: bool,
        config: Arc<Config>,
        store: Arc<Store>,
        gateway: Arc<Gateway>,
    ) -> Arc<Self> {
        let room = Arc::new(Self {
            code,
            config,
            store,
            gateway,
            state: Mutex::new(RoomState {
                name,
                private,
                created_at: Utc::now(),
                admin: AdminSeat::default(),
                members: Vec::new(),
                playlist: Playlist::default(),
                playback: PlaybackState::default(),
                bsl: HashMap::new(),
                drift: HashMap::new(),
            }),
        });

        spawn_ticker(Arc::downgrade(&room));
        room
    }

    /// Keeps the virtual clock fresh. Never broadcasts.
    pub fn tick(&self) {
        self.state.lock().playback.advance(Instant::now());
    }

    pub fn summary(&self) -> RoomSummary {
        let state = self.state.lock();

        RoomSummary {
            code: self.code.clone(),
            name: state.name.clone(),
            viewers: state.members.len(),
            created_at: state.created_at.to_rfc3339(),
        }
    }

    pub fn is_private(&self) -> bool {
        self.state.lock().private
    }

    pub fn viewers(&self) -> usize {
        self.state.lock().members.len()
    }

    pub fn member_ids(&self) -> Vec<ConnectionId> {
        self.state.lock().members.iter().map(|m| m.connection).collect()
    }

    pub fn playlist_len(&self) -> usize {
        self.state.lock().playlist.len()
    }

    pub fn admin_connection(&self) -> Option<ConnectionId> {
        self.state.lock().admin.connection
    }

    pub fn is_admin(&self, connection: ConnectionId) -> bool {
        self.state.lock().admin.connection == Some(connection)
    }

    /// The fingerprint persisted for this room, falling back to the
    /// server-wide one in single-room mode.
    fn persisted_admin(&self) -> Option<String> {
        if self.config.server_mode {
            self.store.room_admin(&self.code)
        } else {
            self.store.admin_fingerprint()
        }
    }

    fn persist_admin(&self, fingerprint: &str) {
        if self.config.server_mode {
            self.store.set_room_admin(&self.code, fingerprint);
        } else {
            self.store.set_admin_fingerprint(fingerprint);
        }
    }

    /// Claims the admin seat for a connection, recording the fingerprint.
    pub fn claim_admin(&self, connection: ConnectionId, fingerprint: &str) {
        {
            let mut state = self.state.lock();
            state.admin.fingerprint = Some(fingerprint.to_string());
            state.admin.connection = Some(connection);
        }

        self.persist_admin(fingerprint);
        self.store
            .log_room_event(&self.code, &format!("admin seat claimed by {}", connection));
    }

    /// Adds a member, reclaiming the admin seat when the fingerprint
    /// matches the seated or persisted admin. Join-mode effects happen in
    /// [Room::after_join] so the caller can acknowledge first.
    pub fn join(&self, connection: ConnectionId, fingerprint: &str, name: Option<&str>) -> JoinOutcome {
        let persisted = self.persisted_admin();
        let mut state = self.state.lock();

        let display_name = name
            .map(str::to_string)
            .or_else(|| self.store.client_name(fingerprint))
            .unwrap_or_else(|| format!("Viewer {}", state.members.len() + 1));

        state.members.retain(|m| m.connection != connection);
        state.members.push(Member {
            connection,
            fingerprint: fingerprint.to_string(),
            name: display_name,
            connected_at: Utc::now(),
        });

        let seat_matches = state.admin.fingerprint.as_deref() == Some(fingerprint);
        let persisted_matches = persisted.as_deref() == Some(fingerprint);

        let is_admin = seat_matches || persisted_matches;
        if is_admin {
            state.admin.fingerprint = Some(fingerprint.to_string());
            state.admin.connection = Some(connection);
        }

        let viewers = state.members.len();
        drop(state);

        self.store
            .log_room_event(&self.code, &format!("{} joined", fingerprint));

        JoinOutcome { is_admin, viewers }
    }

    /// Applies the configured join mode for a fresh member: either the
    /// joiner snaps to the room clock, or the whole room rewinds to zero.
    pub fn after_join(&self, connection: ConnectionId) {
        let mut state = self.state.lock();
        let now = Instant::now();

        match self.config.join_mode {
            JoinMode::Sync => {
                state.playback.advance(now);
                self.gateway.send(
                    connection,
                    &ServerEvent::Sync(state.playback.snapshot(now)),
                );
            }
            JoinMode::Reset => {
                state.playback.reset(now);
                self.broadcast_sync_locked(&state, now);
            }
        }

        self.broadcast_viewer_count(&state);
    }

    /// Removes a member. The admin seat becomes vacant but keeps its
    /// fingerprint so the admin can reclaim it later.
    pub fn leave(&self, connection: ConnectionId) {
        let mut state = self.state.lock();

        let before = state.members.len();
        state.members.retain(|m| m.connection != connection);

        if state.members.len() == before {
            return;
        }

        if state.admin.connection == Some(connection) {
            state.admin.connection = None;
        }

        self.broadcast_viewer_count(&state);
    }

    /// Replaces the playlist with pre-probed entries.
    pub fn set_playlist(
        self: &Arc<Self>,
        videos: Vec<PlaylistEntry>,
        main_index: i32,
        start_time: f64,
    ) {
        let mut state = self.state.lock();
        let now = Instant::now();

        state.playlist.replace(videos, main_index, start_time);

        let autoplay = self.config.video_autoplay && !state.playlist.is_empty();
        state.playback.seek(0.0, now);
        state.playback.is_playing = autoplay;
        state.playback.last_update = now;

        self.apply_entry_selection(&mut state);

        self.broadcast_playlist_locked(&state);
        self.broadcast_sync_locked(&state, now);
        drop(state);

        if !autoplay {
            let room = Arc::downgrade(self);

            tokio::spawn(async move {
                tokio::time::sleep(AUTOPLAY_DEFEAT_DELAY).await;

                let Some(room) = room.upgrade() else { return };
                let state = room.state.lock();

                // a play command may have landed in the meantime
                if !state.playback.is_playing {
                    room.broadcast_sync_locked(&state, Instant::now());
                }
            });
        }
    }

    /// Mirrors the current entry's selected tracks into playback state.
    fn apply_entry_selection(&self, state: &mut RoomState) {
        let (audio, subtitle) = state
            .playlist
            .current()
            .map(|entry| (entry.selected_audio_track, entry.selected_subtitle_track))
            .unwrap_or((0, -1));

        state.playback.audio_track = audio;
        state.playback.subtitle_track = subtitle;
    }

    pub fn play_pause(&self, playing: bool) {
        let mut state = self.state.lock();
        let now = Instant::now();

        state.playback.set_playing(playing, now);
        self.broadcast_sync_locked(&state, now);
    }

    pub fn seek(&self, seconds: f64) {
        let mut state = self.state.lock();
        let now = Instant::now();

        state.playback.seek(seconds, now);
        self.broadcast_sync_locked(&state, now);
    }

    pub fn skip(&self, delta: f64) {
        let mut state = self.state.lock();
        let now = Instant::now();

        state.playback.skip(delta, now);
        self.broadcast_sync_locked(&state, now);
    }

    /// A raw sync push from a client player.
    pub fn client_sync(&self, is_playing: Option<bool>, current_time: Option<f64>) {
        let mut state = self.state.lock();
        let now = Instant::now();

        state.playback.advance(now);

        if let Some(playing) = is_playing {
            state.playback.is_playing = playing;
        }
        if let Some(time) = current_time {
            state.playback.current_time = time.max(0.0);
        }
        state.playback.last_update = now;

        self.broadcast_sync_locked(&state, now);
    }

    /// Moves to a playlist entry. The index must already be bound-checked.
    pub fn playlist_jump(&self, index: usize) -> bool {
        let mut state = self.state.lock();
        self.jump_locked(&mut state, index)
    }

    /// Moves to the next entry, if any.
    pub fn playlist_next(&self) -> bool {
        let mut state = self.state.lock();

        let next = state.playlist.current_index + 1;
        next >= 0 && self.jump_locked(&mut state, next as usize)
    }

    fn jump_locked(&self, state: &mut RoomState, index: usize) -> bool {
        let now = Instant::now();

        if state.playlist.jump(index).is_none() {
            return false;
        }

        state.playback.reset(now);
        self.apply_entry_selection(state);

        self.broadcast_playlist_position_locked(state);
        self.broadcast_sync_locked(state, now);

        true
    }

    pub fn playlist_reorder(&self, from: usize, to: usize) -> bool {
        let mut state = self.state.lock();

        if !state.playlist.reorder(from, to) {
            return false;
        }

        self.broadcast_playlist_locked(&state);
        true
    }

    /// Applies a track selection to the currently playing entry.
    pub fn select_track(&self, kind: TrackKind, track_index: i32) -> bool {
        let current = self.state.lock().playlist.current_index;

        current >= 0 && self.track_change(current, kind, track_index)
    }

    /// Records a per-entry track selection, mirroring it into playback
    /// state when the entry is currently playing.
    pub fn track_change(&self, video_index: i32, kind: TrackKind, track_index: i32) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();

        let Some(entry) = state.playlist.entry_mut(video_index) else {
            return false;
        };

        match kind {
            TrackKind::Audio => entry.selected_audio_track = track_index,
            TrackKind::Subtitle => entry.selected_subtitle_track = track_index,
        }

        if state.playlist.current_index == video_index {
            match kind {
                TrackKind::Audio => state.playback.audio_track = track_index,
                TrackKind::Subtitle => state.playback.subtitle_track = track_index,
            }

            state.playback.advance(now);
            self.broadcast_sync_locked(&state, now);
        }

        self.gateway.broadcast(
            &Recipients::Some(member_ids_of(&state)),
            &ServerEvent::TrackChange {
                video_index,
                kind,
                track_index,
            },
        );

        true
    }

    /// Asks every non-admin member without a folder report to pick one.
    /// Returns how many members were asked.
    pub fn start_bsl_check(&self) -> usize {
        let state = self.state.lock();

        let videos: Vec<_> = state
            .playlist
            .videos
            .iter()
            .map(|entry| BslVideoRef {
                filename: entry.filename.clone(),
            })
            .collect();

        let targets: Vec<_> = state
            .members
            .iter()
            .filter(|m| state.admin.connection != Some(m.connection))
            .filter(|m| !state.bsl.contains_key(&m.fingerprint))
            .map(|m| m.connection)
            .collect();

        for target in &targets {
            self.gateway.send(
                *target,
                &ServerEvent::BslCheckRequest {
                    playlist_videos: videos.clone(),
                },
            );
        }

        targets.len()
    }

    /// The playlist as the matcher sees it, with on-disk sizes.
    fn server_files(&self, state: &RoomState) -> Vec<ServerFile> {
        state
            .playlist
            .videos
            .iter()
            .map(|entry| ServerFile {
                filename: entry.filename.clone(),
                size: fs::metadata(self.config.media_dir.join(&entry.filename))
                    .ok()
                    .map(|meta| meta.len()),
            })
            .collect()
    }

    fn matcher_options(&self) -> MatcherOptions {
        MatcherOptions {
            advanced: self.config.bsl_advanced_match,
            threshold: self.config.bsl_advanced_match_threshold,
        }
    }

    /// Stores a folder report and recomputes its matches. Returns the echo
    /// for the reporting member.
    pub fn folder_selected(&self, connection: ConnectionId, files: Vec<ClientFile>) -> Option<ServerEvent> {
        let mut state = self.state.lock();

        let fingerprint = member_fingerprint(&state, connection)?;
        let manual = self.store.bsl_matches(&fingerprint);
        let playlist = self.server_files(&state);

        let matched = bsl::match_folder(&playlist, &files, &manual, self.matcher_options());
        let result = ServerEvent::BslMatchResult {
            matched_videos: matched.clone(),
            total_matched: matched.len(),
            total_playlist: playlist.len(),
        };

        state
            .bsl
            .insert(fingerprint.clone(), BslReport { files, matched });

        self.push_bsl_status_locked(&state, connection, &fingerprint);

        Some(result)
    }

    /// Overrides one match for a member and replays its report.
    pub fn manual_match(
        &self,
        target: ConnectionId,
        client_file: &str,
        playlist_index: usize,
    ) -> Option<ServerEvent> {
        let (fingerprint, files) = {
            let state = self.state.lock();
            let fingerprint = member_fingerprint(&state, target)?;
            let playlist_file = state
                .playlist
                .videos
                .get(playlist_index)
                .map(|entry| entry.filename.clone())?;

            self.store
                .set_bsl_match(&fingerprint, client_file, &playlist_file);

            let files = state
                .bsl
                .get(&fingerprint)
                .map(|report| report.files.clone())
                .unwrap_or_default();

            (fingerprint, files)
        };

        self.folder_selected(target, files).map(|result| {
            self.gateway.send(target, &result);
            self.store.log_room_event(
                &self.code,
                &format!("manual match for {}: {}", fingerprint, client_file),
            );
            result
        })
    }

    /// Clamps and stores a drift offset, pushing the member's new table to
    /// every connection with that fingerprint.
    pub fn set_drift(&self, fingerprint: &str, playlist_index: i32, seconds: f64) -> f64 {
        let clamped = clamp_drift(seconds);

        let (recipients, drift_values) = {
            let mut state = self.state.lock();

            let table = state.drift.entry(fingerprint.to_string()).or_default();
            table.insert(playlist_index, clamped);
            let drift_values = table.clone();

            let recipients: Vec<_> = state
                .members
                .iter()
                .filter(|m| m.fingerprint == fingerprint)
                .map(|m| m.connection)
                .collect();

            (recipients, drift_values)
        };

        for connection in recipients {
            self.gateway.send(
                connection,
                &ServerEvent::BslDriftUpdate {
                    drift_values: drift_values.clone(),
                },
            );
        }

        clamped
    }

    /// Aggregated BSL activity per playlist index under the configured mode.
    pub fn bsl_active(&self) -> Vec<bool> {
        let state = self.state.lock();
        self.bsl_active_locked(&state)
    }

    fn bsl_active_locked(&self, state: &RoomState) -> Vec<bool> {
        let reporting: Vec<HashSet<usize>> = state
            .members
            .iter()
            .filter(|m| state.admin.connection != Some(m.connection))
            .filter_map(|m| state.bsl.get(&m.fingerprint))
            .map(|report| report.matched.iter().map(|m| m.playlist_index).collect())
            .collect();

        bsl::aggregate_active(self.config.bsl_s2_mode, state.playlist.len(), &reporting)
    }

    fn push_bsl_status_locked(&self, state: &RoomState, connection: ConnectionId, fingerprint: &str) {
        let Some(admin) = state.admin.connection else {
            return;
        };

        let report = state.bsl.get(fingerprint);
        let name = state
            .members
            .iter()
            .find(|m| m.connection == connection)
            .map(|m| m.name.clone())
            .unwrap_or_default();

        self.gateway.send(
            admin,
            &ServerEvent::BslStatusUpdate(BslStatus {
                client_connection_id: connection,
                client_name: name,
                fingerprint: fingerprint.to_string(),
                total_matched: report.map(|r| r.matched.len()).unwrap_or_default(),
                total_playlist: state.playlist.len(),
                active: self.bsl_active_locked(state),
            }),
        );
    }

    /// Everything the admin wants to know about connected members.
    pub fn client_list(&self) -> Vec<ClientSummary> {
        let state = self.state.lock();

        state
            .members
            .iter()
            .map(|member| ClientSummary {
                connection_id: member.connection,
                fingerprint: member.fingerprint.clone(),
                name: member.name.clone(),
                connected_at: member.connected_at.to_rfc3339(),
                has_reported_folder: state.bsl.contains_key(&member.fingerprint),
                drift: state
                    .drift
                    .get(&member.fingerprint)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// Renames a live member, returning its connection and fingerprint.
    pub fn rename_member(&self, connection: ConnectionId, name: &str) -> Option<String> {
        let mut state = self.state.lock();

        let member = state
            .members
            .iter_mut()
            .find(|m| m.connection == connection)?;

        member.name = name.to_string();
        let fingerprint = member.fingerprint.clone();
        drop(state);

        self.store.set_client_name(&fingerprint, name);
        self.gateway.send(
            connection,
            &ServerEvent::NameUpdated {
                name: name.to_string(),
            },
        );

        Some(fingerprint)
    }

    /// Renames every live member carrying a fingerprint and persists the
    /// new display name.
    pub fn set_name_for_fingerprint(&self, fingerprint: &str, name: &str) -> usize {
        let connections = {
            let mut state = self.state.lock();
            let mut connections = Vec::new();

            for member in state.members.iter_mut() {
                if member.fingerprint == fingerprint {
                    member.name = name.to_string();
                    connections.push(member.connection);
                }
            }

            connections
        };

        self.store.set_client_name(fingerprint, name);

        for connection in &connections {
            self.gateway.send(
                *connection,
                &ServerEvent::NameUpdated {
                    name: name.to_string(),
                },
            );
        }

        connections.len()
    }

    /// One status entry per member that has reported a folder.
    pub fn bsl_statuses(&self) -> Vec<BslStatus> {
        let state = self.state.lock();
        let active = self.bsl_active_locked(&state);

        state
            .members
            .iter()
            .filter_map(|member| {
                let report = state.bsl.get(&member.fingerprint)?;

                Some(BslStatus {
                    client_connection_id: member.connection,
                    client_name: member.name.clone(),
                    fingerprint: member.fingerprint.clone(),
                    total_matched: report.matched.len(),
                    total_playlist: state.playlist.len(),
                    active: active.clone(),
                })
            })
            .collect()
    }

    pub fn member_connections_for(&self, fingerprint: &str) -> Vec<ConnectionId> {
        self.state
            .lock()
            .members
            .iter()
            .filter(|m| m.fingerprint == fingerprint)
            .map(|m| m.connection)
            .collect()
    }

    pub fn member_fingerprint_of(&self, connection: ConnectionId) -> Option<String> {
        member_fingerprint(&self.state.lock(), connection)
    }

    /// The full snapshot a late client reconciles against.
    pub fn initial_state(&self, connection: ConnectionId) -> InitialState {
        let state = self.state.lock();
        let now = Instant::now();

        InitialState {
            playlist: state.playlist.clone(),
            playback: state.playback.snapshot(now),
            config: ClientConfig::from_config(&self.config),
            bsl_active: self.bsl_active_locked(&state),
            viewers: state.members.len(),
            is_admin: state.admin.connection == Some(connection),
        }
    }

    pub fn broadcast_sync(&self) {
        let state = self.state.lock();
        self.broadcast_sync_locked(&state, Instant::now());
    }

    pub fn send_sync_to(&self, connection: ConnectionId) {
        let state = self.state.lock();
        self.gateway.send(
            connection,
            &ServerEvent::Sync(state.playback.snapshot(Instant::now())),
        );
    }

    /// Fans chat out to the whole room, handling the `/rename` command.
    pub fn chat(&self, connection: ConnectionId, sender: Option<&str>, message: &str) {
        use crate::validate::escape_html;

        if let Some(new_name) = message.strip_prefix("/rename ") {
            let new_name: String = new_name.trim().chars().take(32).collect();

            if !new_name.is_empty() && self.rename_member(connection, &new_name).is_some() {
                let state = self.state.lock();
                self.gateway.broadcast(
                    &Recipients::Some(member_ids_of(&state)),
                    &ServerEvent::ChatMessage {
                        sender: String::new(),
                        message: format!("{} changed their name", escape_html(&new_name)),
                        system: true,
                    },
                );
            }

            return;
        }

        let state = self.state.lock();

        let sender = sender
            .map(str::to_string)
            .or_else(|| member_name(&state, connection))
            .unwrap_or_else(|| "Viewer".to_string());

        self.gateway.broadcast(
            &Recipients::Some(member_ids_of(&state)),
            &ServerEvent::ChatMessage {
                sender: escape_html(&sender),
                message: escape_html(message),
                system: false,
            },
        );
    }

    /// Tells every member the room is gone and empties it.
    pub fn notify_deleted(&self) {
        let mut state = self.state.lock();

        self.gateway.broadcast(
            &Recipients::Some(member_ids_of(&state)),
            &ServerEvent::RoomDeleted {
                room_code: self.code.clone(),
            },
        );

        state.members.clear();
        state.admin = AdminSeat::default();
        info!("Room {} deleted", self.code);
    }

    fn broadcast_sync_locked(&self, state: &RoomState, now: Instant) {
        self.gateway.broadcast(
            &Recipients::Some(member_ids_of(state)),
            &ServerEvent::Sync(state.playback.snapshot(now)),
        );
    }

    fn broadcast_playlist_locked(&self, state: &RoomState) {
        self.gateway.broadcast(
            &Recipients::Some(member_ids_of(state)),
            &ServerEvent::PlaylistUpdate {
                playlist: state.playlist.clone(),
            },
        );
    }

    fn broadcast_playlist_position_locked(&self, state: &RoomState) {
        self.gateway.broadcast(
            &Recipients::Some(member_ids_of(state)),
            &ServerEvent::PlaylistPosition {
                current_index: state.playlist.current_index,
            },
        );
    }

    fn broadcast_viewer_count(&self, state: &RoomState) {
        let count = state.members.len();
        let recipients = Recipients::Some(member_ids_of(state));

        self.gateway
            .broadcast(&recipients, &ServerEvent::ViewerCount { count });

        if !self.config.server_mode {
            self.gateway
                .broadcast(&recipients, &ServerEvent::ClientCount { count });
        }
    }

    #[cfg(test)]
    pub fn state_for_tests(&self) -> parking_lot::MutexGuard<'_, RoomState> {
        self.state.lock()
    }
}

fn member_ids_of(state: &RoomState) -> Vec<ConnectionId> {
    state.members.iter().map(|m| m.connection).collect()
}

fn member_fingerprint(state: &RoomState, connection: ConnectionId) -> Option<String> {
    state
        .members
        .iter()
        .find(|m| m.connection == connection)
        .map(|m| m.fingerprint.clone())
}

fn member_name(state: &RoomState, connection: ConnectionId) -> Option<String> {
    state
        .members
        .iter()
        .find(|m| m.connection == connection)
        .map(|m| m.name.clone())
}

/// The per-room clock task. Owns only a weak reference so a deleted room
/// takes its ticker down with it.
fn spawn_ticker(room: Weak<Room>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICKER_PERIOD);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            match room.upgrade() {
                Some(room) => room.tick(),
                None => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playlist::PlaylistEntry;

    fn build_room(configure: impl FnOnce(&mut Config)) -> Arc<Room> {
        let dir = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        configure(&mut config);

        let store = Arc::new(Store::load(dir.path()).unwrap());
        std::mem::forget(dir);

        Room::new(
            "ROOMAA".to_string(),
            "Test Room".to_string(),
            false,
            Arc::new(config),
            store,
            Gateway::new(),
        )
    }

    fn entries(names: &[&str]) -> Vec<PlaylistEntry> {
        names
            .iter()
            .map(|name| PlaylistEntry::new(name.to_string(), true))
            .collect()
    }

    #[tokio::test]
    async fn admin_seat_survives_disconnects() {
        let room = build_room(|_| {});

        room.join(1, "fp-admin", Some("Admin"));
        room.claim_admin(1, "fp-admin");
        assert!(room.is_admin(1));

        // disconnect vacates the seat but keeps the fingerprint
        room.leave(1);
        assert_eq!(room.admin_connection(), None);

        let outcome = room.join(2, "fp-admin", None);
        assert!(outcome.is_admin);
        assert_eq!(room.admin_connection(), Some(2));

        // a different fingerprint does not inherit the seat
        let outcome = room.join(3, "fp-other", None);
        assert!(!outcome.is_admin);
    }

    #[tokio::test]
    async fn set_playlist_resets_the_clock() {
        let room = build_room(|_| {});
        room.join(1, "fp", None);

        room.play_pause(true);
        room.seek(100.0);

        room.set_playlist(entries(&["a.mkv", "b.mkv"]), 0, 0.0);

        let state = room.state_for_tests();
        assert_eq!(state.playlist.current_index, 0);
        assert_eq!(state.playback.current_time, 0.0);
        assert!(!state.playback.is_playing);
    }

    #[tokio::test]
    async fn autoplay_config_starts_playback() {
        let room = build_room(|config| config.video_autoplay = true);

        room.set_playlist(entries(&["a.mkv"]), -1, 0.0);

        let state = room.state_for_tests();
        assert!(state.playback.is_playing);
    }

    #[tokio::test]
    async fn track_change_mirrors_into_playback_for_current_entry() {
        let room = build_room(|_| {});
        room.set_playlist(entries(&["a.mkv", "b.mkv"]), -1, 0.0);

        // current entry is index 0
        assert!(room.track_change(0, TrackKind::Subtitle, 2));
        assert_eq!(room.state_for_tests().playback.subtitle_track, 2);

        // selections on other entries are recorded without mirroring
        assert!(room.track_change(1, TrackKind::Audio, 1));
        let state = room.state_for_tests();
        assert_eq!(state.playlist.videos[1].selected_audio_track, 1);
        assert_eq!(state.playback.audio_track, 0);

        // out of range is refused
        drop(state);
        assert!(!room.track_change(5, TrackKind::Audio, 0));
    }

    #[tokio::test]
    async fn drift_is_stored_clamped_per_fingerprint() {
        let room = build_room(|_| {});
        room.set_playlist(entries(&["a.mkv"]), -1, 0.0);
        room.join(7, "fp-v", None);

        assert_eq!(room.set_drift("fp-v", 0, 75.0), 60.0);
        assert_eq!(room.set_drift("fp-v", 0, -99.0), -60.0);
        assert_eq!(room.set_drift("fp-v", 0, 12.0), 12.0);

        let state = room.state_for_tests();
        assert_eq!(state.drift["fp-v"][&0], 12.0);
    }

    #[tokio::test]
    async fn folder_reports_drive_aggregation() {
        let room = build_room(|_| {});
        room.set_playlist(entries(&["a.mkv", "b.mkv"]), -1, 0.0);

        room.claim_admin(1, "fp-admin");
        room.join(1, "fp-admin", None);
        room.join(2, "fp-x", None);
        room.join(3, "fp-y", None);

        let report = |name: &str| {
            vec![ClientFile {
                name: name.to_string(),
                size: None,
                mime: None,
            }]
        };

        room.folder_selected(2, report("a.mkv")).unwrap();
        room.folder_selected(3, report("b.mkv")).unwrap();

        // any mode: both entries covered by someone
        assert_eq!(room.bsl_active(), vec![true, true]);
    }

    #[tokio::test]
    async fn all_mode_requires_every_reporter() {
        let room = build_room(|config| config.bsl_s2_mode = crate::config::BslMode::All);
        room.set_playlist(entries(&["a.mkv", "b.mkv"]), -1, 0.0);

        room.join(2, "fp-x", None);
        room.join(3, "fp-y", None);

        let report = |names: &[&str]| {
            names
                .iter()
                .map(|name| ClientFile {
                    name: name.to_string(),
                    size: None,
                    mime: None,
                })
                .collect::<Vec<_>>()
        };

        room.folder_selected(2, report(&["a.mkv", "b.mkv"])).unwrap();
        room.folder_selected(3, report(&["a.mkv"])).unwrap();

        assert_eq!(room.bsl_active(), vec![true, false]);
    }

    #[tokio::test]
    async fn skip_moves_relative_to_projection() {
        let room = build_room(|_| {});
        room.set_playlist(entries(&["a.mkv"]), -1, 0.0);

        room.seek(20.0);
        room.skip(5.0);
        assert!((room.state_for_tests().playback.current_time - 25.0).abs() < 0.1);

        room.skip(-100.0);
        assert_eq!(room.state_for_tests().playback.current_time, 0.0);
    }
}
