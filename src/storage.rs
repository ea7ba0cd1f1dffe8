//! Token persistence across process restarts.
//!
//! The OS secret store is preferred; a JSON file with owner-only
//! permissions is the fallback.  Either way, a token reaches storage only
//! immediately after a successful `rtm.auth.checkToken`, and is re-verified
//! on load before being treated as authoritative.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use etcetera::BaseStrategy;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const KEYRING_SERVICE: &str = "cowgnition";
const KEYRING_ACCOUNT: &str = "rtm";
const TOKEN_DIR: &str = "cowgnition";
const TOKEN_FILE: &str = "rtm_token.json";

/// The persisted token record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredToken {
    /// The RTM auth token.
    pub token: String,
    /// RTM user id the token belongs to.
    #[serde(rename = "userID")]
    pub user_id: String,
    /// RTM username the token belongs to.
    pub username: String,
    /// When the token was first persisted.
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// When the token was last re-persisted.
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Persistence for the verified auth token.
///
/// `delete` on an absent token is not an error; `load` returns `Ok(None)`
/// when nothing is stored.
pub trait TokenStorage: Send + Sync {
    /// Read the stored token, if any.
    fn load(&self) -> Result<Option<StoredToken>>;
    /// Persist a freshly-verified token.
    fn save(&self, token: &str, user_id: &str, username: &str) -> Result<()>;
    /// Remove the stored token.  Absence is not an error.
    fn delete(&self) -> Result<()>;
    /// Whether this backend can be used in the current environment.
    fn is_available(&self) -> bool;
    /// Short backend name for log lines.
    fn name(&self) -> &'static str;
}

fn record(existing: Option<StoredToken>, token: &str, user_id: &str, username: &str) -> StoredToken {
    let now = Utc::now();
    StoredToken {
        token: token.to_string(),
        user_id: user_id.to_string(),
        username: username.to_string(),
        created_at: existing.map(|t| t.created_at).unwrap_or(now),
        updated_at: now,
    }
}

/// Token storage backed by the OS secret service (keychain, credential
/// manager, libsecret), keyed `cowgnition:rtm`.
pub struct KeyringStorage;

impl KeyringStorage {
    /// Create the secret-store backend.
    pub fn new() -> KeyringStorage {
        KeyringStorage
    }

    fn entry(&self) -> Result<keyring::Entry> {
        keyring::Entry::new(KEYRING_SERVICE, KEYRING_ACCOUNT)
            .map_err(|e| Error::Storage(format!("secret store unavailable: {e}")))
    }
}

impl Default for KeyringStorage {
    fn default() -> Self {
        KeyringStorage::new()
    }
}

impl TokenStorage for KeyringStorage {
    fn load(&self) -> Result<Option<StoredToken>> {
        match self.entry()?.get_password() {
            Ok(blob) => {
                let stored = serde_json::from_str(&blob)
                    .map_err(|e| Error::Storage(format!("corrupt secret-store record: {e}")))?;
                Ok(Some(stored))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(Error::Storage(format!("secret store read failed: {e}"))),
        }
    }

    fn save(&self, token: &str, user_id: &str, username: &str) -> Result<()> {
        let entry = self.entry()?;
        let existing = self.load().unwrap_or(None);
        let stored = record(existing, token, user_id, username);
        let blob = serde_json::to_string(&stored)
            .map_err(|e| Error::Storage(format!("token serialisation failed: {e}")))?;
        entry
            .set_password(&blob)
            .map_err(|e| Error::Storage(format!("secret store write failed: {e}")))
    }

    fn delete(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(Error::Storage(format!("secret store delete failed: {e}"))),
        }
    }

    fn is_available(&self) -> bool {
        match self.entry() {
            Ok(entry) => matches!(
                entry.get_password(),
                Ok(_) | Err(keyring::Error::NoEntry)
            ),
            Err(_) => false,
        }
    }

    fn name(&self) -> &'static str {
        "secret store"
    }
}

/// Token storage in `<user-config-dir>/cowgnition/rtm_token.json`.
///
/// The file is written with mode 0600 inside a 0700 directory, via a temp
/// file and rename so concurrent external readers never observe a partial
/// write.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    /// Create the file backend at the default per-user path.
    pub fn new() -> Result<FileStorage> {
        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| Error::Storage(format!("cannot determine config directory: {e}")))?;
        Ok(FileStorage {
            path: strategy.config_dir().join(TOKEN_DIR).join(TOKEN_FILE),
        })
    }

    /// Create the file backend at an explicit path.
    pub fn with_path(path: impl Into<PathBuf>) -> FileStorage {
        FileStorage { path: path.into() }
    }

    /// Where the token file lives.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn write_atomically(&self, contents: &[u8]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::Storage(format!("token path {:?} has no parent", self.path)))?;
        fs::create_dir_all(dir)
            .map_err(|e| Error::Storage(format!("cannot create {}: {e}", dir.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
        }

        let tmp_path = dir.join(format!(".{TOKEN_FILE}.tmp-{}", std::process::id()));
        {
            let mut options = fs::OpenOptions::new();
            options.create(true).truncate(true).write(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut tmp = options
                .open(&tmp_path)
                .map_err(|e| Error::Storage(format!("cannot create {}: {e}", tmp_path.display())))?;
            tmp.write_all(contents)
                .map_err(|e| Error::Storage(format!("cannot write {}: {e}", tmp_path.display())))?;
            tmp.sync_all()
                .map_err(|e| Error::Storage(format!("cannot sync {}: {e}", tmp_path.display())))?;
        }

        fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            Error::Storage(format!("cannot replace {}: {e}", self.path.display()))
        })
    }
}

impl TokenStorage for FileStorage {
    fn load(&self) -> Result<Option<StoredToken>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let stored = serde_json::from_str(&contents).map_err(|e| {
                    Error::Storage(format!("corrupt token file {}: {e}", self.path.display()))
                })?;
                Ok(Some(stored))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!(
                "cannot read {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn save(&self, token: &str, user_id: &str, username: &str) -> Result<()> {
        let existing = self.load().unwrap_or(None);
        let stored = record(existing, token, user_id, username);
        let contents = serde_json::to_vec_pretty(&stored)
            .map_err(|e| Error::Storage(format!("token serialisation failed: {e}")))?;
        self.write_atomically(&contents)
    }

    fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!(
                "cannot delete {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "token file"
    }
}

/// Pick the best available backend: the secret store when it responds,
/// otherwise the per-user token file.
pub fn default_storage() -> Result<Arc<dyn TokenStorage>> {
    let keyring = KeyringStorage::new();
    if keyring.is_available() {
        log::debug!("using OS secret store for token persistence");
        return Ok(Arc::new(keyring));
    }
    let file = FileStorage::new()?;
    log::debug!(
        "secret store unavailable, using token file {}",
        file.path().display()
    );
    Ok(Arc::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_store() -> (tempfile::TempDir, FileStorage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::with_path(dir.path().join("cowgnition").join(TOKEN_FILE));
        (dir, storage)
    }

    #[test]
    fn file_round_trip() {
        let (_dir, storage) = file_store();
        assert_eq!(storage.load().unwrap(), None);

        storage.save("T1", "1", "alice").unwrap();
        let stored = storage.load().unwrap().unwrap();
        assert_eq!(stored.token, "T1");
        assert_eq!(stored.user_id, "1");
        assert_eq!(stored.username, "alice");
        assert_eq!(stored.created_at, stored.updated_at);
    }

    #[test]
    fn resave_preserves_created_at() {
        let (_dir, storage) = file_store();
        storage.save("T1", "1", "alice").unwrap();
        let first = storage.load().unwrap().unwrap();

        storage.save("T2", "1", "alice").unwrap();
        let second = storage.load().unwrap().unwrap();
        assert_eq!(second.token, "T2");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, storage) = file_store();
        storage.delete().unwrap();
        storage.save("T1", "1", "alice").unwrap();
        storage.delete().unwrap();
        storage.delete().unwrap();
        assert_eq!(storage.load().unwrap(), None);
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let (_dir, storage) = file_store();
        storage.save("T1", "1", "alice").unwrap();
        storage.save("T2", "1", "alice").unwrap();

        let parent = storage.path().parent().unwrap();
        let names: Vec<String> = fs::read_dir(parent)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![TOKEN_FILE.to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn file_permissions_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, storage) = file_store();
        storage.save("T1", "1", "alice").unwrap();

        let file_mode = fs::metadata(storage.path()).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
        let dir_mode = fs::metadata(storage.path().parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[test]
    fn stored_token_uses_documented_field_names() {
        let stored = StoredToken {
            token: "T1".into(),
            user_id: "1".into(),
            username: "alice".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&stored).unwrap();
        assert!(json.contains("\"userID\""));
        assert!(json.contains("\"createdAt\""));
        assert!(json.contains("\"updatedAt\""));
    }
}
