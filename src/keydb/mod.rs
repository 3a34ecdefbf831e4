//! Per-database encryption keys, kept in a second small storage-core
//! instance beside the main data path.
//!
//! Each database key is sealed with AES-256-GCM under the master key, which
//! itself lives in an external key store (Vault, KMIP, or a local key
//! file). Master-key rotation clones every record into a fresh instance
//! re-sealed under a newly generated master key, then swaps directories and
//! aborts startup so the operator restarts against the new primary.

use crate::config::{CapstanConfig, CipherMode};
use crate::core::{CoreConnection, CoreCursor, CoreDriver, CoreResult, CoreSession, CursorIter};
use crate::error::CapstanError;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

pub const KEYDB_DIR: &str = "key.db";
pub const ROTATION_DIR: &str = "key.db.rotation";
pub const ROTATED_DIR: &str = "key.db.rotated";
const LEGACY_KEYDB_DIR: &str = "keydb";
const KEYS_URI: &str = "table:keys";
const KEYDB_OPEN_CONFIG: &str = "create,cache_size=5M,log=(enabled=true,path=journal)";

/// External master-key storage (Vault, KMIP, or a local key file).
pub trait MasterKeyStore: Send + Sync {
    fn load(&self) -> Result<Option<(String, Zeroizing<[u8; 32]>)>, CapstanError>;
    fn store(&self, key_id: &str, key: &[u8; 32]) -> Result<(), CapstanError>;
}

/// Key-file backed store for deployments without an external key service.
pub struct LocalKeyFile {
    path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct KeyFileContents {
    key_id: String,
    key_hex: String,
}

impl LocalKeyFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl MasterKeyStore for LocalKeyFile {
    fn load(&self) -> Result<Option<(String, Zeroizing<[u8; 32]>)>, CapstanError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.path)?;
        let contents: KeyFileContents =
            serde_json::from_slice(&bytes).map_err(|e| CapstanError::KeyDb {
                message: format!("malformed key file: {e}"),
            })?;
        let raw = decode_hex(&contents.key_hex).ok_or_else(|| CapstanError::KeyDb {
            message: "key file key is not 32 hex-encoded bytes".into(),
        })?;
        Ok(Some((contents.key_id, raw)))
    }

    fn store(&self, key_id: &str, key: &[u8; 32]) -> Result<(), CapstanError> {
        let contents = KeyFileContents {
            key_id: key_id.to_string(),
            key_hex: encode_hex(key),
        };
        let bytes = serde_json::to_vec_pretty(&contents).expect("key file serializes");
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct SealedKey {
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

pub struct EncryptionKeyDb {
    conn: Arc<dyn CoreConnection>,
    path: PathBuf,
    master_key: Zeroizing<[u8; 32]>,
    master_key_id: String,
}

impl std::fmt::Debug for EncryptionKeyDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKeyDb")
            .field("path", &self.path)
            .field("master_key_id", &self.master_key_id)
            .finish_non_exhaustive()
    }
}

impl EncryptionKeyDb {
    /// Opens the primary instance, loading (or creating) the master key
    /// through the external store.
    pub fn open(
        driver: &dyn CoreDriver,
        path: &Path,
        store: &dyn MasterKeyStore,
        just_created: bool,
    ) -> Result<EncryptionKeyDb, CapstanError> {
        let conn = driver
            .open(path, KEYDB_OPEN_CONFIG)
            .map_err(CapstanError::Core)?;

        let (master_key_id, master_key) = match store.load()? {
            Some((id, key)) => (id, key),
            None if just_created => {
                let (id, key) = generate_master_key();
                store.store(&id, &key)?;
                (id, key)
            }
            None => {
                return Err(CapstanError::KeyDb {
                    message: "master key is missing from the key store for an existing key db"
                        .into(),
                })
            }
        };

        let db = EncryptionKeyDb {
            conn,
            path: path.to_path_buf(),
            master_key,
            master_key_id,
        };
        db.ensure_keys_table()?;
        Ok(db)
    }

    /// Opens a rotation instance with a freshly generated master key. The
    /// key is NOT pushed to the store yet; that happens only after the
    /// records have been cloned.
    fn open_for_rotation(
        driver: &dyn CoreDriver,
        path: &Path,
    ) -> Result<EncryptionKeyDb, CapstanError> {
        let conn = driver
            .open(path, KEYDB_OPEN_CONFIG)
            .map_err(CapstanError::Core)?;
        let (master_key_id, master_key) = generate_master_key();
        let db = EncryptionKeyDb {
            conn,
            path: path.to_path_buf(),
            master_key,
            master_key_id,
        };
        db.ensure_keys_table()?;
        Ok(db)
    }

    fn ensure_keys_table(&self) -> Result<(), CapstanError> {
        let mut session = self.conn.open_session().map_err(CapstanError::Core)?;
        session
            .create(KEYS_URI, "key_format=S,value_format=u,log=(enabled=true)")
            .map_err(CapstanError::Core)
    }

    pub fn connection(&self) -> Arc<dyn CoreConnection> {
        self.conn.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn master_key_id(&self) -> &str {
        &self.master_key_id
    }

    /// Short digest identifying the master key in logs without exposing
    /// any key material.
    pub fn master_key_fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.master_key[..]);
        encode_hex(&digest[..8])
    }

    /// Looks up the symmetric key for a database, generating and sealing a
    /// fresh one on first use.
    pub fn get_key(&self, db_name: &str) -> Result<Zeroizing<Vec<u8>>, CapstanError> {
        let mut session = self.conn.open_session().map_err(CapstanError::Core)?;
        let mut cursor = session.open_cursor(KEYS_URI).map_err(CapstanError::Core)?;
        if cursor.search(db_name).map_err(CapstanError::Core)? {
            let sealed = cursor.value().map_err(CapstanError::Core)?;
            return self.unseal(&sealed);
        }

        let key = Zeroizing::new(Aes256Gcm::generate_key(&mut OsRng).to_vec());
        let sealed = self.seal(&key)?;
        cursor
            .insert(db_name, &sealed)
            .map_err(CapstanError::Core)?;
        Ok(key)
    }

    /// Removes a database's key. Missing keys are fine: the database may
    /// never have been written under encryption.
    pub fn delete_key_by_id(&self, db_name: &str) -> Result<(), CapstanError> {
        let mut session = self.conn.open_session().map_err(CapstanError::Core)?;
        let mut cursor = session.open_cursor(KEYS_URI).map_err(CapstanError::Core)?;
        match cursor.remove(db_name) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() || e.is_no_entry() => Ok(()),
            Err(e) => Err(CapstanError::Core(e)),
        }
    }

    /// Copies every key record from `source`, re-sealed under this
    /// instance's master key, then checkpoints so the clone is durable.
    pub fn clone_records_from(&self, source: &EncryptionKeyDb) -> Result<(), CapstanError> {
        let mut src_session = source.conn.open_session().map_err(CapstanError::Core)?;
        let src_cursor = src_session
            .open_cursor(KEYS_URI)
            .map_err(CapstanError::Core)?;

        let mut dst_session = self.conn.open_session().map_err(CapstanError::Core)?;
        let mut dst_cursor = dst_session
            .open_cursor(KEYS_URI)
            .map_err(CapstanError::Core)?;

        let mut cloned = 0usize;
        for entry in CursorIter::new(src_cursor) {
            let (db_name, sealed) = entry.map_err(CapstanError::Core)?;
            let plain = source.unseal(&sealed)?;
            let resealed = self.seal(&plain)?;
            dst_cursor
                .insert(&db_name, &resealed)
                .map_err(CapstanError::Core)?;
            cloned += 1;
        }
        drop(dst_cursor);
        dst_session
            .checkpoint("use_timestamp=false")
            .map_err(CapstanError::Core)?;
        info!(cloned, "cloned key records into rotation instance");
        Ok(())
    }

    pub fn store_master_key(&self, store: &dyn MasterKeyStore) -> Result<(), CapstanError> {
        store.store(&self.master_key_id, &self.master_key)
    }

    pub fn checkpoint(&self) -> CoreResult<()> {
        let mut session = self.conn.open_session()?;
        session.checkpoint("use_timestamp=false")
    }

    pub fn close(&self) -> CoreResult<()> {
        self.conn.close("")
    }

    fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, CapstanError> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.master_key[..]).map_err(|e| CapstanError::KeyDb {
                message: format!("invalid master key: {e}"),
            })?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plain)
            .map_err(|e| CapstanError::KeyDb {
                message: format!("key seal failed: {e}"),
            })?;
        let sealed = SealedKey {
            nonce: nonce.to_vec(),
            ciphertext,
        };
        Ok(serde_json::to_vec(&sealed).expect("sealed key serializes"))
    }

    fn unseal(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, CapstanError> {
        let sealed: SealedKey = serde_json::from_slice(sealed).map_err(|e| CapstanError::KeyDb {
            message: format!("malformed sealed key record: {e}"),
        })?;
        let cipher =
            Aes256Gcm::new_from_slice(&self.master_key[..]).map_err(|e| CapstanError::KeyDb {
                message: format!("invalid master key: {e}"),
            })?;
        let plain = cipher
            .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
            .map_err(|e| CapstanError::KeyDb {
                message: format!("key unseal failed: {e}"),
            })?;
        Ok(Zeroizing::new(plain))
    }
}

fn generate_master_key() -> (String, Zeroizing<[u8; 32]>) {
    let key = Aes256Gcm::generate_key(&mut OsRng);
    let mut raw = Zeroizing::new([0u8; 32]);
    raw.copy_from_slice(&key);
    (Uuid::new_v4().to_string(), raw)
}

/// Config fragment that loads the encryption extension into the main
/// storage-core open.
pub fn encryption_extension_config(mode: CipherMode) -> String {
    format!("local=(entry=encryption_extension_init,early_load=true,config=(cipher={mode}))")
}

/// Creates or migrates the key-DB directory, opens the primary instance,
/// and runs master-key rotation when requested. Returns `None` when
/// encryption is off.
pub fn bootstrap_encryption(
    driver: &dyn CoreDriver,
    data_path: &Path,
    config: &CapstanConfig,
    store: &dyn MasterKeyStore,
) -> Result<Option<Arc<EncryptionKeyDb>>, CapstanError> {
    if !config.enable_encryption {
        return Ok(None);
    }

    let keydb_path = data_path.join(KEYDB_DIR);
    let mut just_created = false;
    if !keydb_path.exists() {
        let legacy_path = data_path.join(LEGACY_KEYDB_DIR);
        if !legacy_path.exists() {
            std::fs::create_dir(&keydb_path).map_err(|e| {
                error!(path = %keydb_path.display(), "error creating key db dir: {e}");
                CapstanError::Io(e)
            })?;
            just_created = true;
        } else if !config.directory_per_db {
            // No per-database directories: the legacy tree holds only key
            // db files and a plain rename suffices.
            std::fs::rename(&legacy_path, &keydb_path).map_err(|e| {
                error!(
                    from = %legacy_path.display(),
                    to = %keydb_path.display(),
                    "error renaming legacy key db directory: {e}"
                );
                CapstanError::Io(e)
            })?;
        } else {
            // The legacy directory may double as the `keydb` database's own
            // data directory; move everything except user table files.
            migrate_legacy_keydb(&legacy_path, &keydb_path)?;
        }
    }

    let primary = match EncryptionKeyDb::open(driver, &keydb_path, store, just_created) {
        Ok(primary) => primary,
        Err(e) => {
            if just_created {
                let _ = std::fs::remove_dir_all(&keydb_path);
            }
            return Err(e);
        }
    };
    info!(
        key_id = %primary.master_key_id(),
        fingerprint = %primary.master_key_fingerprint(),
        "opened encryption key db"
    );

    if config.rotate_master_key {
        let rotation_path = data_path.join(ROTATION_DIR);
        if rotation_path.exists() {
            return Err(CapstanError::KeyDb {
                message: format!(
                    "cannot do master key rotation: rotation directory '{}' already exists",
                    rotation_path.display()
                ),
            });
        }
        std::fs::create_dir(&rotation_path).map_err(|e| {
            error!(path = %rotation_path.display(), "error creating rotation directory: {e}");
            CapstanError::Io(e)
        })?;

        let rotation = EncryptionKeyDb::open_for_rotation(driver, &rotation_path)?;
        rotation.clone_records_from(&primary)?;
        // The new key only reaches the store once the clone is durable.
        rotation.store_master_key(store)?;

        primary.close().map_err(CapstanError::Core)?;
        rotation.close().map_err(CapstanError::Core)?;

        let rotated_path = data_path.join(ROTATED_DIR);
        if rotated_path.exists() {
            std::fs::remove_dir_all(&rotated_path)?;
        }
        std::fs::rename(&keydb_path, &rotated_path)?;
        std::fs::rename(&rotation_path, &keydb_path)?;
        return Err(CapstanError::RotationFinished);
    }

    Ok(Some(Arc::new(primary)))
}

/// Moves the legacy `keydb` tree into `key.db`, skipping user table files
/// (`collection-*.wt`, `index-*.wt` and their per-db-directory variants).
/// Moved sources are deleted and emptied source directories removed.
fn migrate_legacy_keydb(from: &Path, to: &Path) -> Result<(), CapstanError> {
    let filter = Regex::new(r"(collection|index)[-/][^/]+\.wt$").expect("static regex");
    let mut empty_dirs = Vec::new();
    let mut copied_files = Vec::new();
    copy_keydb_files(from, to, &filter, &mut empty_dirs, &mut copied_files)?;
    for file in &copied_files {
        std::fs::remove_file(file)?;
    }
    for dir in &empty_dirs {
        std::fs::remove_dir(dir)?;
    }
    info!(
        moved = copied_files.len(),
        removed_dirs = empty_dirs.len(),
        "migrated legacy key db directory"
    );
    Ok(())
}

/// Recursive walk of the legacy tree. A directory counts as empty (and
/// thus removable) when everything in it was moved; user table files pin
/// their directory in place. Children are recorded before parents so the
/// removal pass can use plain `remove_dir`.
fn copy_keydb_files(
    from: &Path,
    to: &Path,
    filter: &Regex,
    empty_dirs: &mut Vec<PathBuf>,
    copied_files: &mut Vec<PathBuf>,
) -> Result<bool, CapstanError> {
    let mut empty = true;
    let mut check_to = true;

    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            let child_to = to.join(entry.file_name());
            let child_empty = copy_keydb_files(&path, &child_to, filter, empty_dirs, copied_files)?;
            if !child_empty {
                empty = false;
            }
        } else {
            let path_str = path.to_string_lossy().replace('\\', "/");
            if filter.is_match(&path_str) {
                empty = false;
            } else {
                if check_to {
                    check_to = false;
                    if !to.exists() {
                        std::fs::create_dir_all(to)?;
                    }
                }
                std::fs::copy(&path, to.join(entry.file_name()))?;
                copied_files.push(path);
            }
        }
    }

    if empty {
        empty_dirs.push(from.to_path_buf());
    }
    Ok(empty)
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn decode_hex(input: &str) -> Option<Zeroizing<[u8; 32]>> {
    let trimmed = input.trim();
    if trimmed.len() != 64 {
        return None;
    }
    let mut out = Zeroizing::new([0u8; 32]);
    for (i, pair) in trimmed.as_bytes().chunks_exact(2).enumerate() {
        let hi = hex_nibble(pair[0])?;
        let lo = hex_nibble(pair[1])?;
        out[i] = (hi << 4) | lo;
    }
    Some(out)
}

fn hex_nibble(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}

/// Warn-only wrapper used during database drop, which runs at a point
/// where failures must not unwind.
pub fn drop_database_key(keydb: Option<&EncryptionKeyDb>, db_name: &str) {
    if let Some(keydb) = keydb {
        if let Err(e) = keydb.delete_key_by_id(db_name) {
            warn!(db = db_name, "failed to delete encryption key: {e}");
        }
    }
}
