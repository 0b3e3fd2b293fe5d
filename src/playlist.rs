use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A probed audio or subtitle stream of a playlist entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub index: i32,
    pub codec: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrackSet {
    pub audio: Vec<TrackInfo>,
    pub subtitles: Vec<TrackInfo>,
}

/// A logical item in the queue: filename, probed tracks, selections, hints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistEntry {
    pub filename: String,
    #[serde(default)]
    pub is_external: bool,
    #[serde(default)]
    pub tracks: TrackSet,
    #[serde(default)]
    pub selected_audio_track: i32,
    #[serde(default = "default_subtitle_track")]
    pub selected_subtitle_track: i32,
    #[serde(default)]
    pub uses_hevc: bool,
}

fn default_subtitle_track() -> i32 {
    -1
}

impl PlaylistEntry {
    pub fn new(filename: String, is_external: bool) -> Self {
        Self {
            filename,
            is_external,
            tracks: TrackSet::default(),
            selected_audio_track: 0,
            selected_subtitle_track: -1,
            uses_hevc: false,
        }
    }
}

/// The ordered queue of a room. `current_index` is `-1` until playback of
/// the playlist has started.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub videos: Vec<PlaylistEntry>,
    pub current_index: i32,
    pub main_video_index: i32,
    pub main_video_start_time: f64,
    pub preload_main_video: bool,
}

impl Default for Playlist {
    fn default() -> Self {
        Self {
            videos: Vec::new(),
            current_index: -1,
            main_video_index: -1,
            main_video_start_time: 0.0,
            preload_main_video: false,
        }
    }
}

impl Playlist {
    /// Replaces the whole queue. Playback restarts at the first entry, or
    /// nowhere when the new list is empty.
    pub fn replace(&mut self, videos: Vec<PlaylistEntry>, main_index: i32, start_time: f64) {
        self.current_index = if videos.is_empty() { -1 } else { 0 };
        self.main_video_index = bounded(main_index, videos.len());
        self.main_video_start_time = start_time.max(0.0);
        self.preload_main_video = self.main_video_index >= 0;
        self.videos = videos;
    }

    pub fn len(&self) -> usize {
        self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }

    pub fn current(&self) -> Option<&PlaylistEntry> {
        self.entry(self.current_index)
    }

    pub fn entry(&self, index: i32) -> Option<&PlaylistEntry> {
        usize::try_from(index).ok().and_then(|i| self.videos.get(i))
    }

    pub fn entry_mut(&mut self, index: i32) -> Option<&mut PlaylistEntry> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.videos.get_mut(i))
    }

    /// Moves playback to the given entry, returning it.
    pub fn jump(&mut self, index: usize) -> Option<&PlaylistEntry> {
        if index >= self.videos.len() {
            return None;
        }

        self.current_index = index as i32;
        self.videos.get(index)
    }

    /// Moves to the entry after the current one, if there is one.
    pub fn next(&mut self) -> Option<&PlaylistEntry> {
        let next = self.current_index + 1;

        if next < 0 || next as usize >= self.videos.len() {
            return None;
        }

        self.jump(next as usize)
    }

    /// Swaps two entries. The current and main pointers follow the entries
    /// they pointed at.
    pub fn reorder(&mut self, from: usize, to: usize) -> bool {
        if from >= self.videos.len() || to >= self.videos.len() || from == to {
            return false;
        }

        self.videos.swap(from, to);
        self.current_index = follow_swap(self.current_index, from, to);
        self.main_video_index = follow_swap(self.main_video_index, from, to);

        true
    }
}

fn bounded(index: i32, len: usize) -> i32 {
    if index >= 0 && (index as usize) < len {
        index
    } else {
        -1
    }
}

fn follow_swap(pointer: i32, from: usize, to: usize) -> i32 {
    if pointer == from as i32 {
        to as i32
    } else if pointer == to as i32 {
        from as i32
    } else {
        pointer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playlist_of(names: &[&str]) -> Playlist {
        let mut playlist = Playlist::default();
        let videos = names
            .iter()
            .map(|name| PlaylistEntry::new(name.to_string(), false))
            .collect();

        playlist.replace(videos, 1, 0.0);
        playlist
    }

    #[test]
    fn replace_resets_position() {
        let playlist = playlist_of(&["a.mkv", "b.mkv", "c.mkv"]);

        assert_eq!(playlist.current_index, 0);
        assert_eq!(playlist.main_video_index, 1);
        assert!(playlist.preload_main_video);
    }

    #[test]
    fn replace_with_empty_list_clears_position() {
        let mut playlist = playlist_of(&["a.mkv"]);
        playlist.replace(Vec::new(), 3, 10.0);

        assert_eq!(playlist.current_index, -1);
        assert_eq!(playlist.main_video_index, -1);
        assert!(playlist.is_empty());
    }

    #[test]
    fn out_of_range_main_index_is_cleared() {
        let mut playlist = Playlist::default();
        let videos = vec![PlaylistEntry::new("a.mkv".to_string(), false)];
        playlist.replace(videos, 5, 0.0);

        assert_eq!(playlist.main_video_index, -1);
        assert!(!playlist.preload_main_video);
    }

    #[test]
    fn jump_rejects_out_of_bounds() {
        let mut playlist = playlist_of(&["a.mkv", "b.mkv"]);

        assert!(playlist.jump(1).is_some());
        assert_eq!(playlist.current_index, 1);

        assert!(playlist.jump(2).is_none());
        assert_eq!(playlist.current_index, 1);
    }

    #[test]
    fn next_stops_at_the_end() {
        let mut playlist = playlist_of(&["a.mkv", "b.mkv"]);

        assert_eq!(playlist.next().map(|e| e.filename.clone()), Some("b.mkv".to_string()));
        assert!(playlist.next().is_none());
        assert_eq!(playlist.current_index, 1);
    }

    #[test]
    fn reorder_swaps_and_follows_pointers() {
        let mut playlist = playlist_of(&["a.mkv", "b.mkv", "c.mkv"]);
        playlist.jump(2);

        assert!(playlist.reorder(2, 0));
        assert_eq!(playlist.videos[0].filename, "c.mkv");
        assert_eq!(playlist.videos[2].filename, "a.mkv");

        // current pointed at "c.mkv", main at "b.mkv"
        assert_eq!(playlist.current_index, 0);
        assert_eq!(playlist.main_video_index, 1);
    }

    #[test]
    fn reorder_rejects_bad_indices() {
        let mut playlist = playlist_of(&["a.mkv", "b.mkv"]);

        assert!(!playlist.reorder(0, 2));
        assert!(!playlist.reorder(1, 1));
        assert_eq!(playlist.videos[0].filename, "a.mkv");
    }

    #[test]
    fn index_stays_valid_after_any_accepted_move() {
        let mut playlist = playlist_of(&["a.mkv", "b.mkv", "c.mkv"]);

        for _ in 0..5 {
            playlist.next();
            let index = playlist.current_index;
            assert!(index >= 0 && (index as usize) < playlist.len());
        }

        playlist.reorder(0, 2);
        let index = playlist.current_index;
        assert!(index >= 0 && (index as usize) < playlist.len());
    }
}
