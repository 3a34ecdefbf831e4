//! Hot backup across the main storage instance and the optional key DB.
//!
//! Phase 1 opens a backup cursor per instance (under the engine's global
//! lock when both instances participate, so their logs are captured in a
//! consistent order) and resolves every reported filename to a source path
//! and size. Phase 2 copies: either to a local directory, or streamed to an
//! S3-compatible object store. The sizes captured by the cursors are
//! binding: files may keep growing during the copy, and only the captured
//! prefix is part of the backup.

use crate::core::{CoreConnection, CoreCursor, CoreSession};
use crate::error::CapstanError;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const ENGINE_METADATA_FILE: &str = "storage.bson";
const JOURNAL_DIR: &str = "journal";
const COPY_BUF_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Default)]
pub struct S3BackupParams {
    pub endpoint: String,
    pub scheme: String,
    pub region: String,
    pub profile: String,
    pub bucket: String,
    pub path: String,
    pub use_virtual_addressing: bool,
}

/// The object-put contract this engine needs from an S3-compatible client.
/// SDK specifics (signing, retries, addressing style) live behind it.
pub trait ObjectStore {
    fn list_buckets(&self) -> Result<Vec<String>, CapstanError>;
    fn create_bucket(&self, bucket: &str) -> Result<(), CapstanError>;
    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, CapstanError>;
    /// Streams exactly `content_length` bytes from `body`; a short body is
    /// an error on the implementation's side.
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        content_length: u64,
        body: &mut dyn Read,
    ) -> Result<(), CapstanError>;
}

/// One storage instance participating in the backup.
pub struct BackupInstance {
    pub conn: Arc<dyn CoreConnection>,
    pub src_root: PathBuf,
    pub dst_root: PathBuf,
}

/// Holds an instance's backup session and cursor open. The cursor pins the
/// backup snapshot; dropping this releases it.
pub struct InstanceBackup {
    _cursor: Box<dyn CoreCursor>,
    _session: Box<dyn CoreSession>,
}

impl InstanceBackup {
    pub fn new(cursor: Box<dyn CoreCursor>, session: Box<dyn CoreSession>) -> Self {
        Self {
            _cursor: cursor,
            _session: session,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCopySpec {
    pub src: PathBuf,
    pub dst: PathBuf,
    pub size: u64,
}

/// Phase 1: flush logs, open backup cursors, and resolve every filename
/// each cursor reports. The engine metadata file is appended last. The
/// returned [`InstanceBackup`]s must stay alive until the copy finishes.
pub fn populate_backup_lists(
    instances: Vec<BackupInstance>,
    metadata_src: &Path,
    metadata_dst: &Path,
) -> Result<(Vec<InstanceBackup>, Vec<FileCopySpec>), CapstanError> {
    let mut sessions = Vec::new();
    let mut files = Vec::new();

    for instance in instances {
        let mut session = instance.conn.open_session().map_err(CapstanError::Core)?;
        session
            .log_flush("sync=off")
            .map_err(CapstanError::Core)?;
        let mut cursor = session.open_cursor("backup:").map_err(CapstanError::Core)?;

        while cursor.next().map_err(CapstanError::Core)? {
            let filename = cursor.key().map_err(CapstanError::Core)?;
            let mut src = instance.src_root.join(&filename);
            let mut dst = instance.dst_root.join(&filename);
            if !src.exists() {
                // Log files are reported by bare name but live in the
                // journal subdirectory.
                src = instance.src_root.join(JOURNAL_DIR).join(&filename);
                dst = instance.dst_root.join(JOURNAL_DIR).join(&filename);
                if !src.exists() {
                    return Err(CapstanError::InvalidPath {
                        message: format!(
                            "cannot find source file for backup: {filename}, source path: {}",
                            instance.src_root.display()
                        ),
                    });
                }
            }
            let size = std::fs::metadata(&src)?.len();
            files.push(FileCopySpec { src, dst, size });
        }

        sessions.push(InstanceBackup {
            _cursor: cursor,
            _session: session,
        });
    }

    let metadata = metadata_src.join(ENGINE_METADATA_FILE);
    let size = std::fs::metadata(&metadata)?.len();
    files.push(FileCopySpec {
        src: metadata,
        dst: metadata_dst.join(ENGINE_METADATA_FILE),
        size,
    });

    Ok((sessions, files))
}

/// Copies exactly `size` bytes. A file that grew past the size the backup
/// cursor captured loses the excess; a file truncated below it fails the
/// backup.
pub fn copy_file_exact(src: &Path, dst: &Path, size: u64) -> Result<(), CapstanError> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut reader = std::fs::File::open(src)?;
    let mut writer = std::fs::File::create(dst)?;
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(COPY_BUF_SIZE as u64) as usize;
        let got = reader.read(&mut buf[..want])?;
        if got == 0 {
            return Err(CapstanError::InvalidPath {
                message: format!(
                    "source file truncated below its backup size: {} ({} bytes short)",
                    src.display(),
                    remaining
                ),
            });
        }
        writer.write_all(&buf[..got])?;
        remaining -= got as u64;
    }
    writer.flush()?;
    Ok(())
}

/// Phase 2a: copy every captured file into the destination tree.
pub fn local_backup(files: &[FileCopySpec]) -> Result<(), CapstanError> {
    for file in files {
        debug!(src = %file.src.display(), dst = %file.dst.display(), size = file.size, "copying backup file");
        copy_file_exact(&file.src, &file.dst, file.size)?;
    }
    Ok(())
}

/// Phase 2b: stream every captured file into the object store. The target
/// prefix must be empty apart from its directory marker.
pub fn s3_backup(
    store: &dyn ObjectStore,
    params: &S3BackupParams,
    files: &[FileCopySpec],
) -> Result<(), CapstanError> {
    let buckets = store.list_buckets()?;
    let bucket_exists = buckets.iter().any(|b| *b == params.bucket);

    if !bucket_exists {
        store.create_bucket(&params.bucket)?;
        info!(bucket = %params.bucket, "created bucket for backup");
    }

    if bucket_exists {
        let objects = store.list_objects(&params.bucket, &params.path)?;
        let root = format!("{}/", params.path);
        for key in &objects {
            if *key != root {
                return Err(CapstanError::InvalidPath {
                    message: format!(
                        "target location is not empty: {}/{}",
                        params.bucket, params.path
                    ),
                });
            }
        }
    }

    for file in files {
        let key = file.dst.to_string_lossy().replace('\\', "/");
        debug!(src = %file.src.display(), key = %key, "uploading backup file");
        let mut body = std::fs::File::open(&file.src).map_err(|e| CapstanError::InvalidPath {
            message: format!("cannot open file '{}' for backup: {e}", file.src.display()),
        })?;
        store.put_object(
            &params.bucket,
            &key,
            "application/octet-stream",
            file.size,
            &mut body,
        )?;
        debug!(key = %key, "uploaded backup file");
    }

    Ok(())
}

/// Object store backed by a local directory: one subdirectory per bucket,
/// one file per object key. Useful for tests and for air-gapped restores.
pub struct DirObjectStore {
    root: PathBuf,
}

impl DirObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn bucket_path(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }
}

impl ObjectStore for DirObjectStore {
    fn list_buckets(&self) -> Result<Vec<String>, CapstanError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut buckets = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                buckets.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        buckets.sort();
        Ok(buckets)
    }

    fn create_bucket(&self, bucket: &str) -> Result<(), CapstanError> {
        std::fs::create_dir_all(self.bucket_path(bucket))?;
        Ok(())
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, CapstanError> {
        let bucket_path = self.bucket_path(bucket);
        let mut keys = Vec::new();
        fn walk(base: &Path, cur: &Path, keys: &mut Vec<String>) -> std::io::Result<()> {
            for entry in std::fs::read_dir(cur)? {
                let entry = entry?;
                let path = entry.path();
                let rel = match path.strip_prefix(base) {
                    Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                    Err(_) => continue,
                };
                if entry.file_type()?.is_dir() {
                    if std::fs::read_dir(&path)?.next().is_none() {
                        // An empty directory stands in for a "directory
                        // marker" object.
                        keys.push(format!("{rel}/"));
                    } else {
                        walk(base, &path, keys)?;
                    }
                } else {
                    keys.push(rel);
                }
            }
            Ok(())
        }
        if bucket_path.exists() {
            walk(&bucket_path, &bucket_path, &mut keys)?;
        }
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        _content_type: &str,
        content_length: u64,
        body: &mut dyn Read,
    ) -> Result<(), CapstanError> {
        let path = self.bucket_path(bucket).join(key);
        if key.ends_with('/') {
            // Directory marker object.
            std::fs::create_dir_all(&path)?;
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut data = Vec::new();
        body.take(content_length).read_to_end(&mut data)?;
        if (data.len() as u64) < content_length {
            return Err(CapstanError::Backup {
                message: format!(
                    "object body shorter than its declared length: {key} ({} < {content_length})",
                    data.len()
                ),
            });
        }
        std::fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        copy_file_exact, s3_backup, DirObjectStore, FileCopySpec, ObjectStore, S3BackupParams,
    };
    use crate::error::CapstanError;
    use tempfile::tempdir;

    #[test]
    fn copy_is_bounded_by_captured_size() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("grew.wt");
        let dst = dir.path().join("out/grew.wt");
        std::fs::write(&src, b"0123456789").expect("write");
        // The file grew past the captured size; only the prefix is copied.
        copy_file_exact(&src, &dst, 4).expect("copy");
        assert_eq!(std::fs::read(&dst).expect("read"), b"0123");
    }

    #[test]
    fn truncated_source_fails_the_copy() {
        let dir = tempdir().expect("tempdir");
        let src = dir.path().join("short.wt");
        let dst = dir.path().join("short.copy");
        std::fs::write(&src, b"ab").expect("write");
        let err = copy_file_exact(&src, &dst, 10).expect_err("short read");
        assert!(matches!(err, CapstanError::InvalidPath { .. }));
    }

    fn params(bucket: &str, path: &str) -> S3BackupParams {
        S3BackupParams {
            endpoint: "127.0.0.1:9000".into(),
            scheme: "http".into(),
            region: String::new(),
            profile: String::new(),
            bucket: bucket.into(),
            path: path.into(),
            use_virtual_addressing: false,
        }
    }

    #[test]
    fn s3_upload_creates_bucket_and_streams_files() {
        let dir = tempdir().expect("tempdir");
        let store_dir = tempdir().expect("store dir");
        let store = DirObjectStore::new(store_dir.path().to_path_buf());

        let src = dir.path().join("data.wt");
        std::fs::write(&src, b"payload").expect("write");
        let files = vec![FileCopySpec {
            src,
            dst: "backups/2024-06-01/data.wt".into(),
            size: 7,
        }];

        s3_backup(&store, &params("backup-bucket", "backups/2024-06-01"), &files)
            .expect("upload");
        let keys = store
            .list_objects("backup-bucket", "backups/")
            .expect("list");
        assert_eq!(keys, vec!["backups/2024-06-01/data.wt".to_string()]);
    }

    #[test]
    fn s3_upload_refuses_non_empty_prefix() {
        let dir = tempdir().expect("tempdir");
        let store_dir = tempdir().expect("store dir");
        let store = DirObjectStore::new(store_dir.path().to_path_buf());
        store.create_bucket("bkt").expect("bucket");
        // An object other than the directory marker sits under the prefix.
        store
            .put_object("bkt", "dest/old.wt", "application/octet-stream", 1, &mut &b"x"[..])
            .expect("seed object");

        let src = dir.path().join("data.wt");
        std::fs::write(&src, b"payload").expect("write");
        let files = vec![FileCopySpec {
            src,
            dst: "dest/data.wt".into(),
            size: 7,
        }];

        let err = s3_backup(&store, &params("bkt", "dest"), &files).expect_err("non-empty");
        assert!(matches!(err, CapstanError::InvalidPath { .. }));
        // And nothing was uploaded.
        let keys = store.list_objects("bkt", "dest/").expect("list");
        assert_eq!(keys, vec!["dest/old.wt".to_string()]);
    }

    #[test]
    fn s3_upload_tolerates_directory_marker() {
        let dir = tempdir().expect("tempdir");
        let store_dir = tempdir().expect("store dir");
        let store = DirObjectStore::new(store_dir.path().to_path_buf());
        store.create_bucket("bkt").expect("bucket");
        store
            .put_object("bkt", "dest/", "application/octet-stream", 0, &mut &b""[..])
            .expect("marker");

        let src = dir.path().join("data.wt");
        std::fs::write(&src, b"payload").expect("write");
        let files = vec![FileCopySpec {
            src,
            dst: "dest/data.wt".into(),
            size: 7,
        }];
        s3_backup(&store, &params("bkt", "dest"), &files).expect("marker tolerated");
    }
}
