//! Token cache persistence using one local file per user.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::store::{TokenCacheBlob, TokenCacheStore};
use crate::claims::user_fingerprint;
use crate::error::CacheError;

/// Cache directory name under the platform data directory.
const CACHE_DIR: &str = "token-cache";

/// Stores each user's blob in `<dir>/<sha256(user id)>.bin`.
#[derive(Debug, Clone)]
pub struct FileTokenCacheStore {
    dir: PathBuf,
}

impl FileTokenCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under the platform data directory, e.g.
    /// `~/.local/share/groupmanager-auth/token-cache` on Linux.
    pub fn in_default_location() -> Result<Self, CacheError> {
        ProjectDirs::from("com", "groupmanager", "groupmanager-auth")
            .map(|dirs| Self::new(dirs.data_dir().join(CACHE_DIR)))
            .ok_or_else(|| CacheError::Unavailable("Could not determine data directory".into()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        let digest = Sha256::digest(user_id.as_bytes());
        let name: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}.bin", name))
    }
}

impl TokenCacheStore for FileTokenCacheStore {
    fn read(&self, user_id: &str) -> Result<TokenCacheBlob, CacheError> {
        match fs::read(self.path_for(user_id)) {
            Ok(bytes) => Ok(TokenCacheBlob::new(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(TokenCacheBlob::empty()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    fn write(&self, user_id: &str, blob: &TokenCacheBlob) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)?;

        // Write then rename so readers never see a partial blob
        let path = self.path_for(user_id);
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, blob.as_bytes())?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(CacheError::Io(e));
        }

        debug!("Saved token cache for {}", user_fingerprint(user_id));
        Ok(())
    }

    fn remove(&self, user_id: &str) -> Result<(), CacheError> {
        match fs::remove_file(self.path_for(user_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_and_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenCacheStore::new(dir.path().join("cache"));

        assert!(store.read("u1").unwrap().is_empty());

        store.write("u1", &TokenCacheBlob::new(b"one".to_vec())).unwrap();
        store.write("u1", &TokenCacheBlob::new(b"two".to_vec())).unwrap();

        assert_eq!(store.read("u1").unwrap().as_bytes(), b"two");
        assert!(store.read("u2").unwrap().is_empty());
    }

    #[test]
    fn test_file_name_does_not_contain_user_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenCacheStore::new(dir.path());
        store.write("user@contoso.com", &TokenCacheBlob::new(b"x".to_vec())).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(!names[0].contains("contoso"));
        assert!(names[0].ends_with(".bin"));
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenCacheStore::new(dir.path());
        assert!(store.remove("nobody").is_ok());

        store.write("u1", &TokenCacheBlob::new(b"x".to_vec())).unwrap();
        store.remove("u1").unwrap();
        assert!(store.read("u1").unwrap().is_empty());
    }
}
