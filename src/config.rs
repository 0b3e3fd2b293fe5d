use std::{collections::HashMap, env, fmt::Display, fs, ops::RangeInclusive, path::PathBuf};

use log::warn;
use serde::Serialize;

/// The environment variable prefix every option is also accepted under.
const ENV_PREFIX: &str = "SYNC_";

/// Validated server options, immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listening port
    pub port: u16,
    /// Volume change per step, in percent
    pub volume_step: u32,
    /// Seek delta for skip actions, in seconds
    pub skip_seconds: u32,
    /// What happens to the timeline when someone joins
    pub join_mode: JoinMode,
    /// Serve TLS when key and certificate exist
    pub use_https: bool,
    /// Aggregation mode for "BSL active" per video
    pub bsl_s2_mode: BslMode,
    /// Whether the multi-criteria matcher is used
    pub bsl_advanced_match: bool,
    /// Minimum criteria that must match for the advanced matcher
    pub bsl_advanced_match_threshold: u32,
    /// Initial isPlaying when a playlist is set
    pub video_autoplay: bool,
    /// First admin fingerprint is recorded, others rejected
    pub admin_fingerprint_lock: bool,
    /// Enables rooms; when false the server is a single implicit room
    pub server_mode: bool,
    /// Non-admin messages that would mutate playback are rejected
    pub client_controls_disabled: bool,
    /// Non-action sync pushes from clients are ignored
    pub client_sync_disabled: bool,
    /// Allow chat fan-out
    pub chat_enabled: bool,
    /// Client volume ceiling, in percent
    pub max_volume: u32,
    /// Client hint for the intro-skip button
    pub skip_intro_seconds: u32,
    /// Inline initial state in the admin page
    pub data_hydration: bool,

    /// Directory the served media lives in
    pub media_dir: PathBuf,
    /// Directory for persisted state, thumbnails and logs
    pub data_dir: PathBuf,
    /// Directory the static pages are served from
    pub web_dir: PathBuf,
    /// TLS certificate path, used when `use_https` is set
    pub tls_cert: PathBuf,
    /// TLS private key path, used when `use_https` is set
    pub tls_key: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinMode {
    /// A late joiner snaps to the current time
    Sync,
    /// The room rewinds to zero on every join
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BslMode {
    /// A video is active if at least one member matched it
    Any,
    /// A video is active only if every reporting member matched it
    All,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            volume_step: 5,
            skip_seconds: 5,
            join_mode: JoinMode::Sync,
            use_https: false,
            bsl_s2_mode: BslMode::Any,
            bsl_advanced_match: true,
            bsl_advanced_match_threshold: 1,
            video_autoplay: false,
            admin_fingerprint_lock: false,
            server_mode: false,
            client_controls_disabled: false,
            client_sync_disabled: false,
            chat_enabled: true,
            max_volume: 100,
            skip_intro_seconds: 87,
            data_hydration: true,
            media_dir: PathBuf::from("./media"),
            data_dir: PathBuf::from("./data"),
            web_dir: PathBuf::from("./web"),
            tls_cert: PathBuf::from("./certs/cert.pem"),
            tls_key: PathBuf::from("./certs/key.pem"),
        }
    }
}

impl Config {
    /// Loads the config from the given file, letting `SYNC_`-prefixed
    /// environment variables take precedence over file entries.
    pub fn load(path: &PathBuf) -> Self {
        let file_options = fs::read_to_string(path)
            .map(|text| parse_options_file(&text))
            .unwrap_or_default();

        Self::from_options(&file_options)
    }

    fn from_options(file_options: &HashMap<String, String>) -> Self {
        let mut config = Self::default();
        let opt = |key: &str| resolve_option(file_options, key);

        if let Some(raw) = opt("port") {
            config.port = ranged(&raw, "port", 1024..=49151, config.port as u32) as u16;
        }
        if let Some(raw) = opt("volume_step") {
            config.volume_step = ranged(&raw, "volume_step", 1..=20, config.volume_step);
        }
        if let Some(raw) = opt("skip_seconds") {
            config.skip_seconds = ranged(&raw, "skip_seconds", 5..=60, config.skip_seconds);
        }
        if let Some(raw) = opt("join_mode") {
            config.join_mode = match raw.as_str() {
                "sync" => JoinMode::Sync,
                "reset" => JoinMode::Reset,
                _ => revert("join_mode", &raw, config.join_mode),
            };
        }
        if let Some(raw) = opt("use_https") {
            config.use_https = boolean(&raw, "use_https", config.use_https);
        }
        if let Some(raw) = opt("bsl_s2_mode") {
            config.bsl_s2_mode = match raw.as_str() {
                "any" => BslMode::Any,
                "all" => BslMode::All,
                _ => revert("bsl_s2_mode", &raw, config.bsl_s2_mode),
            };
        }
        if let Some(raw) = opt("bsl_advanced_match") {
            config.bsl_advanced_match = boolean(&raw, "bsl_advanced_match", true);
        }
        if let Some(raw) = opt("bsl_advanced_match_threshold") {
            config.bsl_advanced_match_threshold =
                ranged(&raw, "bsl_advanced_match_threshold", 1..=4, 1);
        }
        if let Some(raw) = opt("video_autoplay") {
            config.video_autoplay = boolean(&raw, "video_autoplay", false);
        }
        if let Some(raw) = opt("admin_fingerprint_lock") {
            config.admin_fingerprint_lock = boolean(&raw, "admin_fingerprint_lock", false);
        }
        if let Some(raw) = opt("server_mode") {
            config.server_mode = boolean(&raw, "server_mode", false);
        }
        if let Some(raw) = opt("client_controls_disabled") {
            config.client_controls_disabled = boolean(&raw, "client_controls_disabled", false);
        }
        if let Some(raw) = opt("client_sync_disabled") {
            config.client_sync_disabled = boolean(&raw, "client_sync_disabled", false);
        }
        if let Some(raw) = opt("chat_enabled") {
            config.chat_enabled = boolean(&raw, "chat_enabled", true);
        }
        if let Some(raw) = opt("max_volume") {
            config.max_volume = ranged(&raw, "max_volume", 100..=1000, config.max_volume);
        }
        if let Some(raw) = opt("skip_intro_seconds") {
            config.skip_intro_seconds = match raw.parse::<u32>() {
                Ok(value) if value > 0 => value,
                _ => revert("skip_intro_seconds", &raw, config.skip_intro_seconds),
            };
        }
        if let Some(raw) = opt("data_hydration") {
            config.data_hydration = boolean(&raw, "data_hydration", true);
        }
        if let Some(raw) = opt("media_dir") {
            config.media_dir = PathBuf::from(raw);
        }
        if let Some(raw) = opt("data_dir") {
            config.data_dir = PathBuf::from(raw);
        }
        if let Some(raw) = opt("web_dir") {
            config.web_dir = PathBuf::from(raw);
        }
        if let Some(raw) = opt("tls_cert") {
            config.tls_cert = PathBuf::from(raw);
        }
        if let Some(raw) = opt("tls_key") {
            config.tls_key = PathBuf::from(raw);
        }

        config
    }
}

/// Parses a key:value options file. Lines starting with `#` and lines
/// without a colon are ignored.
fn parse_options_file(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            line.split_once(':')
                .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// The environment variable wins over the file entry when both exist.
fn resolve_option(file_options: &HashMap<String, String>, key: &str) -> Option<String> {
    let env_key = format!("{}{}", ENV_PREFIX, key.to_uppercase());

    env::var(env_key)
        .ok()
        .or_else(|| file_options.get(key).cloned())
}

fn ranged(raw: &str, key: &str, range: RangeInclusive<u32>, default: u32) -> u32 {
    match raw.parse::<u32>() {
        Ok(value) if range.contains(&value) => value,
        _ => revert(key, raw, default),
    }
}

fn boolean(raw: &str, key: &str, default: bool) -> bool {
    match raw {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => revert(key, raw, default),
    }
}

fn revert<T: std::fmt::Debug + Copy>(key: &str, raw: &str, default: T) -> T {
    warn!("Invalid value {:?} for {}, using {:?}", raw, key, default);
    default
}

impl Display for JoinMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinMode::Sync => write!(f, "sync"),
            JoinMode::Reset => write!(f, "reset"),
        }
    }
}

impl Display for BslMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BslMode::Any => write!(f, "any"),
            BslMode::All => write!(f, "all"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_in_range() {
        let config = Config::default();

        assert_eq!(config.port, 3000);
        assert_eq!(config.join_mode, JoinMode::Sync);
        assert_eq!(config.bsl_advanced_match_threshold, 1);
        assert!(!config.video_autoplay);
    }

    #[test]
    fn parses_key_colon_value_file() {
        let text = "# a comment\nport: 8080\njoin_mode: reset\n\nnot a pair\nmax_volume: 250\n";
        let options = parse_options_file(text);
        let config = Config::from_options(&options);

        assert_eq!(config.port, 8080);
        assert_eq!(config.join_mode, JoinMode::Reset);
        assert_eq!(config.max_volume, 250);
    }

    #[test]
    fn invalid_values_revert_to_defaults() {
        let mut options = HashMap::new();
        options.insert("port".to_string(), "80".to_string());
        options.insert("volume_step".to_string(), "200".to_string());
        options.insert("join_mode".to_string(), "teleport".to_string());
        options.insert("chat_enabled".to_string(), "maybe".to_string());

        let config = Config::from_options(&options);

        assert_eq!(config.port, 3000);
        assert_eq!(config.volume_step, 5);
        assert_eq!(config.join_mode, JoinMode::Sync);
        assert!(config.chat_enabled);
    }

    #[test]
    fn environment_wins_over_file() {
        env::set_var("SYNC_SKIP_SECONDS", "30");

        let mut options = HashMap::new();
        options.insert("skip_seconds".to_string(), "10".to_string());

        let config = Config::from_options(&options);
        env::remove_var("SYNC_SKIP_SECONDS");

        assert_eq!(config.skip_seconds, 30);
    }

    #[test]
    fn zero_skip_intro_is_rejected() {
        let mut options = HashMap::new();
        options.insert("skip_intro_seconds".to_string(), "0".to_string());

        let config = Config::from_options(&options);
        assert_eq!(config.skip_intro_seconds, 87);
    }
}
