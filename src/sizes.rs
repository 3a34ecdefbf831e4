//! Size-storer: a write-behind cache of record counts and data sizes per
//! table, persisted in its own internal table so restarts do not have to
//! rescan everything. Flushes are opportunistic and tolerate transient
//! storage-core failures; the authoritative data can always be recounted.

use crate::core::{CoreConnection, CoreCursor, CoreResult, CoreSession};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub const SIZE_STORER_IDENT: &str = "sizeStorer";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeInfo {
    pub num_records: u64,
    pub data_size: u64,
}

pub struct SizeStorer {
    conn: Arc<dyn CoreConnection>,
    uri: String,
    read_only: bool,
    dirty: Mutex<HashMap<String, SizeInfo>>,
}

impl SizeStorer {
    pub fn open(
        conn: Arc<dyn CoreConnection>,
        uri: &str,
        read_only: bool,
    ) -> CoreResult<SizeStorer> {
        if !read_only {
            let mut session = conn.open_session()?;
            session.create(uri, "key_format=S,value_format=u,log=(enabled=true)")?;
        }
        Ok(SizeStorer {
            conn,
            uri: uri.to_string(),
            read_only,
            dirty: Mutex::new(HashMap::new()),
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn store(&self, table_uri: &str, info: SizeInfo) {
        if self.read_only {
            return;
        }
        self.dirty.lock().insert(table_uri.to_string(), info);
    }

    /// Buffered value if one is pending, otherwise the persisted value,
    /// otherwise zeros.
    pub fn load(&self, table_uri: &str) -> CoreResult<SizeInfo> {
        if let Some(info) = self.dirty.lock().get(table_uri) {
            return Ok(*info);
        }
        let mut session = self.conn.open_session()?;
        let mut cursor = session.open_cursor(&self.uri)?;
        if !cursor.search(table_uri)? {
            return Ok(SizeInfo::default());
        }
        let bytes = cursor.value()?;
        Ok(serde_json::from_slice(&bytes).unwrap_or_default())
    }

    /// Writes buffered entries through. `sync` additionally forces the log
    /// out when a journal is present.
    pub fn flush(&self, sync: bool) -> CoreResult<()> {
        if self.read_only {
            return Ok(());
        }
        let entries: Vec<(String, SizeInfo)> = {
            let mut dirty = self.dirty.lock();
            dirty.drain().collect()
        };
        if entries.is_empty() {
            return Ok(());
        }
        let mut session = self.conn.open_session()?;
        let mut cursor = session.open_cursor(&self.uri)?;
        for (table_uri, info) in &entries {
            let bytes = serde_json::to_vec(info).expect("size info serializes");
            if let Err(e) = cursor.insert(table_uri, &bytes) {
                // Put unwritten entries back so the next flush retries them.
                let mut dirty = self.dirty.lock();
                for (uri, info) in entries.iter() {
                    dirty.entry(uri.clone()).or_insert(*info);
                }
                return Err(e);
            }
        }
        drop(cursor);
        if sync {
            // Best effort; a nojournal engine has no log to flush.
            let _ = session.log_flush("sync=on");
        }
        Ok(())
    }

    pub fn pending_entries(&self) -> usize {
        self.dirty.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::{SizeInfo, SizeStorer};
    use crate::core::memcore::MemCoreDriver;
    use crate::core::CoreDriver;
    use tempfile::tempdir;

    #[test]
    fn store_flush_load_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let driver = MemCoreDriver::new();
        let conn = driver.open(dir.path(), "create").expect("open");
        let storer = SizeStorer::open(conn, "table:sizeStorer", false).expect("open storer");
        storer.store(
            "table:users",
            SizeInfo {
                num_records: 7,
                data_size: 512,
            },
        );
        assert_eq!(storer.pending_entries(), 1);
        storer.flush(false).expect("flush");
        assert_eq!(storer.pending_entries(), 0);
        let info = storer.load("table:users").expect("load");
        assert_eq!(info.num_records, 7);
        assert_eq!(info.data_size, 512);
    }

    #[test]
    fn load_of_unknown_table_is_zero() {
        let dir = tempdir().expect("tempdir");
        let driver = MemCoreDriver::new();
        let conn = driver.open(dir.path(), "create").expect("open");
        let storer = SizeStorer::open(conn, "table:sizeStorer", false).expect("open storer");
        let info = storer.load("table:absent").expect("load");
        assert_eq!(info, SizeInfo::default());
    }

    #[test]
    fn read_only_storer_buffers_nothing() {
        let dir = tempdir().expect("tempdir");
        let driver = MemCoreDriver::new();
        let conn = driver.open(dir.path(), "create").expect("open");
        {
            // Seed the table so the read-only open finds it.
            let storer = SizeStorer::open(conn.clone(), "table:sizeStorer", false).expect("rw");
            storer.store("table:t", SizeInfo::default());
            storer.flush(false).expect("flush");
        }
        let storer = SizeStorer::open(conn, "table:sizeStorer", true).expect("ro");
        storer.store(
            "table:t",
            SizeInfo {
                num_records: 1,
                data_size: 1,
            },
        );
        assert_eq!(storer.pending_entries(), 0);
        storer.flush(true).expect("flush is a no-op");
    }
}
