use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use chrono::Utc;
use log::{error, warn};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable holding the 32-byte store key as hex.
const KEY_ENV: &str = "SYNC_STORE_KEY";
const KEY_FILE: &str = "store.key";
const STORE_FILE: &str = "store.json";
const ROOM_ADMIN_FILE: &str = "rooms.json";

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

const ROOM_LOG_CAP: usize = 500;
const GENERAL_LOG_CAP: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Could not access the data directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not load or derive the store key: {0}")]
    Key(String),
    #[error("Stored fingerprint is corrupt")]
    Corrupt,
    #[error("Could not serialize store contents: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The single-file persisted state: the encrypted admin fingerprint,
/// display names and manual BSL matches, all keyed by fingerprint.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StoreData {
    encrypted: Option<String>,
    client_names: HashMap<String, String>,
    bsl_matches: HashMap<String, HashMap<String, String>>,
}

/// An earlier layout that kept the admin fingerprint in the clear.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyStoreData {
    admin_fingerprint: Option<String>,
    #[serde(default)]
    client_names: HashMap<String, String>,
    #[serde(default)]
    bsl_matches: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomAdminRecord {
    pub fingerprint: String,
    pub saved_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    at: String,
    event: String,
}

/// Owns every piece of persisted state. Writes replace whole files and are
/// serialized behind the data mutex; readers see the in-memory copy.
#[derive(Debug)]
pub struct Store {
    data_dir: PathBuf,
    key: [u8; 32],
    data: Mutex<StoreData>,
    room_admins: Mutex<HashMap<String, RoomAdminRecord>>,
}

impl Store {
    pub fn load(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;
        fs::create_dir_all(data_dir.join("logs"))?;
        fs::create_dir_all(data_dir.join("thumbnails"))?;

        let key = load_key(data_dir)?;
        let store_path = data_dir.join(STORE_FILE);

        let (data, migrated) = read_store_data(&store_path, &key);

        let room_admins = fs::read_to_string(data_dir.join(ROOM_ADMIN_FILE))
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();

        let store = Self {
            data_dir: data_dir.to_path_buf(),
            key,
            data: Mutex::new(data),
            room_admins: Mutex::new(room_admins),
        };

        if migrated {
            let data = store.data.lock();
            store.persist(&data);
        }

        Ok(store)
    }

    /// The decrypted admin fingerprint, if one has been recorded.
    pub fn admin_fingerprint(&self) -> Option<String> {
        let data = self.data.lock();
        let encrypted = data.encrypted.as_deref()?;

        match decrypt_fingerprint(&self.key, encrypted) {
            Ok(fingerprint) => Some(fingerprint),
            Err(_) => {
                warn!("Persisted admin fingerprint could not be decrypted, ignoring it");
                None
            }
        }
    }

    pub fn set_admin_fingerprint(&self, fingerprint: &str) {
        let mut data = self.data.lock();

        match encrypt_fingerprint(&self.key, fingerprint) {
            Ok(encrypted) => {
                data.encrypted = Some(encrypted);
                self.persist(&data);
            }
            Err(_) => error!("Could not encrypt the admin fingerprint"),
        }
    }

    pub fn client_name(&self, fingerprint: &str) -> Option<String> {
        self.data.lock().client_names.get(fingerprint).cloned()
    }

    pub fn set_client_name(&self, fingerprint: &str, name: &str) {
        let mut data = self.data.lock();
        data.client_names
            .insert(fingerprint.to_string(), name.to_string());
        self.persist(&data);
    }

    /// Manual matches for one client: lowercased local name to lowercased
    /// playlist name.
    pub fn bsl_matches(&self, fingerprint: &str) -> HashMap<String, String> {
        self.data
            .lock()
            .bsl_matches
            .get(fingerprint)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_bsl_match(&self, fingerprint: &str, client_file: &str, playlist_file: &str) {
        let mut data = self.data.lock();

        data.bsl_matches
            .entry(fingerprint.to_string())
            .or_default()
            .insert(client_file.to_lowercase(), playlist_file.to_lowercase());

        self.persist(&data);
    }

    pub fn room_admin(&self, code: &str) -> Option<String> {
        self.room_admins
            .lock()
            .get(code)
            .map(|record| record.fingerprint.clone())
    }

    pub fn set_room_admin(&self, code: &str, fingerprint: &str) {
        let mut admins = self.room_admins.lock();

        admins.insert(
            code.to_string(),
            RoomAdminRecord {
                fingerprint: fingerprint.to_string(),
                saved_at: Utc::now().to_rfc3339(),
            },
        );

        self.persist_room_admins(&admins);
    }

    pub fn remove_room_admin(&self, code: &str) {
        let mut admins = self.room_admins.lock();

        admins.remove(code);
        self.persist_room_admins(&admins);

        let log = self.data_dir.join("logs").join(format!("room-{}.json", code));
        let _ = fs::remove_file(log);
    }

    /// Appends to a room's capped activity log.
    pub fn log_room_event(&self, code: &str, event: &str) {
        let path = self.data_dir.join("logs").join(format!("room-{}.json", code));
        append_log(&path, event, ROOM_LOG_CAP);
    }

    /// Appends to the server-wide capped activity log.
    pub fn log_event(&self, event: &str) {
        let path = self.data_dir.join("logs").join("general.json");
        append_log(&path, event, GENERAL_LOG_CAP);
    }

    pub fn thumbnail_dir(&self) -> PathBuf {
        self.data_dir.join("thumbnails")
    }

    fn persist(&self, data: &StoreData) {
        if let Err(err) = write_atomically(&self.data_dir.join(STORE_FILE), data) {
            error!("Could not persist store, keeping in-memory state: {}", err);
        }
    }

    fn persist_room_admins(&self, admins: &HashMap<String, RoomAdminRecord>) {
        if let Err(err) = write_atomically(&self.data_dir.join(ROOM_ADMIN_FILE), admins) {
            error!("Could not persist room admin table: {}", err);
        }
    }
}

fn read_store_data(path: &Path, key: &[u8; 32]) -> (StoreData, bool) {
    let Ok(text) = fs::read_to_string(path) else {
        return (StoreData::default(), false);
    };

    let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
        warn!("Store file is unreadable, starting from an empty store");
        return (StoreData::default(), false);
    };

    // Migrate the plaintext-fingerprint layout forward
    if value.get("adminFingerprint").is_some() {
        if let Ok(legacy) = serde_json::from_value::<LegacyStoreData>(value) {
            let encrypted = legacy
                .admin_fingerprint
                .as_deref()
                .and_then(|fingerprint| encrypt_fingerprint(key, fingerprint).ok());

            return (
                StoreData {
                    encrypted,
                    client_names: legacy.client_names,
                    bsl_matches: legacy.bsl_matches,
                },
                true,
            );
        }

        warn!("Store file is unreadable, starting from an empty store");
        return (StoreData::default(), false);
    }

    match serde_json::from_value::<StoreData>(value) {
        Ok(data) => (data, false),
        Err(_) => {
            warn!("Store file is unreadable, starting from an empty store");
            (StoreData::default(), false)
        }
    }
}

fn write_atomically<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let text = serde_json::to_string_pretty(value)?;
    let temp = path.with_extension("tmp");

    fs::write(&temp, text)?;
    fs::rename(&temp, path)?;

    Ok(())
}

fn load_key(data_dir: &Path) -> Result<[u8; 32], StoreError> {
    if let Ok(hex_key) = env::var(KEY_ENV) {
        return parse_key(hex_key.trim())
            .ok_or_else(|| StoreError::Key(format!("{} must be 64 hex characters", KEY_ENV)));
    }

    let key_path = data_dir.join(KEY_FILE);

    if let Ok(text) = fs::read_to_string(&key_path) {
        return parse_key(text.trim())
            .ok_or_else(|| StoreError::Key("key file is malformed".to_string()));
    }

    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);

    fs::write(&key_path, hex::encode(key))
        .map_err(|err| StoreError::Key(format!("could not write key file: {}", err)))?;
    restrict_permissions(&key_path);

    Ok(key)
}

fn parse_key(hex_key: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_key).ok()?;
    bytes.try_into().ok()
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        warn!("Could not restrict key file permissions: {}", err);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

/// Encrypts a fingerprint into the `iv:authTag:ciphertext` hex form.
fn encrypt_fingerprint(key: &[u8; 32], fingerprint: &str) -> Result<String, StoreError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| StoreError::Corrupt)?;

    let mut iv = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), fingerprint.as_bytes())
        .map_err(|_| StoreError::Corrupt)?;

    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

    Ok(format!(
        "{}:{}:{}",
        hex::encode(iv),
        hex::encode(tag),
        hex::encode(ciphertext)
    ))
}

fn decrypt_fingerprint(key: &[u8; 32], encrypted: &str) -> Result<String, StoreError> {
    let mut parts = encrypted.split(':');

    let iv = parts.next().and_then(|p| hex::decode(p).ok());
    let tag = parts.next().and_then(|p| hex::decode(p).ok());
    let ciphertext = parts.next().and_then(|p| hex::decode(p).ok());

    let (Some(iv), Some(tag), Some(ciphertext)) = (iv, tag, ciphertext) else {
        return Err(StoreError::Corrupt);
    };

    if iv.len() != NONCE_SIZE || tag.len() != TAG_SIZE {
        return Err(StoreError::Corrupt);
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| StoreError::Corrupt)?;

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
        .map_err(|_| StoreError::Corrupt)?;

    String::from_utf8(plaintext).map_err(|_| StoreError::Corrupt)
}

fn append_log(path: &Path, event: &str, cap: usize) {
    let mut entries: Vec<LogEntry> = fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default();

    entries.push(LogEntry {
        at: Utc::now().to_rfc3339(),
        event: event.to_string(),
    });

    if entries.len() > cap {
        let excess = entries.len() - cap;
        entries.drain(..excess);
    }

    if let Err(err) = write_atomically(path, &entries) {
        error!("Could not append to log {}: {}", path.display(), err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fingerprint_round_trips_through_encryption() {
        let key = [7u8; 32];

        let encrypted = encrypt_fingerprint(&key, "fp-abc-123").unwrap();
        assert_eq!(encrypted.split(':').count(), 3);

        let decrypted = decrypt_fingerprint(&key, &encrypted).unwrap();
        assert_eq!(decrypted, "fp-abc-123");
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let encrypted = encrypt_fingerprint(&[1u8; 32], "fp").unwrap();
        assert!(decrypt_fingerprint(&[2u8; 32], &encrypted).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = [3u8; 32];
        let encrypted = encrypt_fingerprint(&key, "fp").unwrap();

        let mut tampered = encrypted.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == '0' { '1' } else { '0' });

        assert!(decrypt_fingerprint(&key, &tampered).is_err());
    }

    #[test]
    fn store_survives_a_reload() {
        let dir = tempdir().unwrap();

        {
            let store = Store::load(dir.path()).unwrap();
            store.set_admin_fingerprint("fp-admin");
            store.set_client_name("fp-a", "Alice");
            store.set_bsl_match("fp-a", "Local.MKV", "Remote.MKV");
            store.set_room_admin("ABC234", "fp-admin");
        }

        let store = Store::load(dir.path()).unwrap();

        assert_eq!(store.admin_fingerprint().as_deref(), Some("fp-admin"));
        assert_eq!(store.client_name("fp-a").as_deref(), Some("Alice"));
        assert_eq!(
            store.bsl_matches("fp-a").get("local.mkv").map(String::as_str),
            Some("remote.mkv")
        );
        assert_eq!(store.room_admin("ABC234").as_deref(), Some("fp-admin"));
    }

    #[test]
    fn legacy_plaintext_layout_is_migrated() {
        let dir = tempdir().unwrap();

        fs::write(
            dir.path().join(STORE_FILE),
            r#"{"adminFingerprint": "fp-old", "clientNames": {"fp-x": "Xavier"}}"#,
        )
        .unwrap();

        let store = Store::load(dir.path()).unwrap();

        assert_eq!(store.admin_fingerprint().as_deref(), Some("fp-old"));
        assert_eq!(store.client_name("fp-x").as_deref(), Some("Xavier"));

        // saved back in the current layout
        let text = fs::read_to_string(dir.path().join(STORE_FILE)).unwrap();
        assert!(text.contains("\"encrypted\""));
        assert!(!text.contains("adminFingerprint"));
    }

    #[test]
    fn room_logs_are_capped() {
        let dir = tempdir().unwrap();
        let store = Store::load(dir.path()).unwrap();

        for i in 0..ROOM_LOG_CAP + 20 {
            store.log_room_event("ROOMAA", &format!("event {}", i));
        }

        let text =
            fs::read_to_string(dir.path().join("logs").join("room-ROOMAA.json")).unwrap();
        let entries: Vec<LogEntry> = serde_json::from_str(&text).unwrap();

        assert_eq!(entries.len(), ROOM_LOG_CAP);
        assert_eq!(entries.last().unwrap().event, format!("event {}", ROOM_LOG_CAP + 19));
    }
}
