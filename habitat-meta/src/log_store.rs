use crate::error::{HdbError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const LOG_DB_FILE: &str = "raft.db";

pub const KEY_CURRENT_TERM: &str = "current_term";
pub const KEY_VOTED_FOR: &str = "voted_for";

/// A committed log entry. `payload` is the base64 batch handed to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub payload: Vec<u8>,
    pub appended_at: DateTime<Utc>,
}

/// SQLite-backed log store plus the stable (term/vote) store.
pub struct LogStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl LogStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        restrict_file(&path)?;

        let store = Self {
            path,
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS log_entries (
                log_index INTEGER PRIMARY KEY,
                term INTEGER NOT NULL,
                payload TEXT NOT NULL,
                appended_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS stable (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| HdbError::LogIo("log store connection poisoned".to_string()))
    }

    /// Appends `entry`; its index must directly follow the current last index.
    pub fn append(&self, entry: &LogEntry) -> Result<()> {
        let conn = self.conn()?;
        let last: Option<i64> =
            conn.query_row("SELECT MAX(log_index) FROM log_entries", [], |row| row.get(0))?;
        let last = last.unwrap_or(0) as u64;
        if last != 0 && entry.index != last + 1 {
            return Err(HdbError::LogIo(format!(
                "log entry {} does not follow last index {}",
                entry.index, last
            )));
        }

        let payload = std::str::from_utf8(&entry.payload).map_err(|error| {
            HdbError::Serialization(format!("log payload is not text: {}", error))
        })?;

        conn.execute(
            "INSERT INTO log_entries (log_index, term, payload, appended_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.index as i64,
                entry.term as i64,
                payload,
                entry.appended_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, index: u64) -> Result<Option<LogEntry>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT log_index, term, payload, appended_at FROM log_entries WHERE log_index = ?1",
                params![index as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(entry_from_row).transpose()
    }

    /// Every entry with an index strictly greater than `index`, in order
    pub fn entries_after(&self, index: u64) -> Result<Vec<LogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT log_index, term, payload, appended_at FROM log_entries
             WHERE log_index > ?1 ORDER BY log_index ASC",
        )?;
        let rows = stmt.query_map(params![index as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(entry_from_row(row?)?);
        }
        Ok(entries)
    }

    pub fn first_index(&self) -> Result<u64> {
        let conn = self.conn()?;
        let first: Option<i64> =
            conn.query_row("SELECT MIN(log_index) FROM log_entries", [], |row| row.get(0))?;
        Ok(first.unwrap_or(0) as u64)
    }

    pub fn last_index(&self) -> Result<u64> {
        let conn = self.conn()?;
        let last: Option<i64> =
            conn.query_row("SELECT MAX(log_index) FROM log_entries", [], |row| row.get(0))?;
        Ok(last.unwrap_or(0) as u64)
    }

    /// Deletes every entry up to and including `index`
    pub fn compact_until(&self, index: u64) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM log_entries WHERE log_index <= ?1",
            params![index as i64],
        )?;
        Ok(removed)
    }

    pub fn set_stable(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO stable (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_stable(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM stable WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_stable_u64(&self, key: &str, value: u64) -> Result<()> {
        self.set_stable(key, &value.to_string())
    }

    pub fn get_stable_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.get_stable(key)? {
            Some(value) => value.parse::<u64>().map(Some).map_err(|error| {
                HdbError::LogIo(format!("stable value {} is not a number: {}", key, error))
            }),
            None => Ok(None),
        }
    }
}

fn entry_from_row(row: (i64, i64, String, String)) -> Result<LogEntry> {
    let (index, term, payload, appended_at) = row;
    let appended_at = DateTime::parse_from_rfc3339(&appended_at)
        .map_err(|error| HdbError::LogIo(format!("bad timestamp on entry {}: {}", index, error)))?
        .with_timezone(&Utc);
    Ok(LogEntry {
        index: index as u64,
        term: term as u64,
        payload: payload.into_bytes(),
        appended_at,
    })
}

/// Creates `path` (and parents) readable only by the owner.
pub(crate) fn create_private_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

pub(crate) fn restrict_file(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Writes `contents` through a temp file and renames it into place.
pub(crate) fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;

    let temp_path = path.with_extension("tmp");
    let mut file = std::fs::File::create(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    restrict_file(&temp_path)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64) -> LogEntry {
        LogEntry {
            index,
            term: 1,
            payload: format!("payload-{}", index).into_bytes(),
            appended_at: Utc::now(),
        }
    }

    #[test]
    fn test_append_and_read() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(temp_dir.path().join(LOG_DB_FILE)).unwrap();

        assert_eq!(store.last_index().unwrap(), 0);
        store.append(&entry(1)).unwrap();
        store.append(&entry(2)).unwrap();
        store.append(&entry(3)).unwrap();

        assert_eq!(store.first_index().unwrap(), 1);
        assert_eq!(store.last_index().unwrap(), 3);
        assert_eq!(store.get(2).unwrap().unwrap().payload, b"payload-2".to_vec());
        assert!(store.get(9).unwrap().is_none());

        let tail: Vec<u64> = store
            .entries_after(1)
            .unwrap()
            .into_iter()
            .map(|entry| entry.index)
            .collect();
        assert_eq!(tail, vec![2, 3]);
    }

    #[test]
    fn test_append_rejects_gaps() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(temp_dir.path().join(LOG_DB_FILE)).unwrap();
        store.append(&entry(1)).unwrap();
        assert!(matches!(store.append(&entry(3)), Err(HdbError::LogIo(_))));
        assert!(store.append(&entry(1)).is_err());
    }

    #[test]
    fn test_compaction_and_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join(LOG_DB_FILE);
        {
            let store = LogStore::open(&path).unwrap();
            for index in 1..=5 {
                store.append(&entry(index)).unwrap();
            }
            assert_eq!(store.compact_until(3).unwrap(), 3);
            store.set_stable_u64(KEY_CURRENT_TERM, 4).unwrap();
        }

        let store = LogStore::open(&path).unwrap();
        assert_eq!(store.first_index().unwrap(), 4);
        assert_eq!(store.last_index().unwrap(), 5);
        assert_eq!(store.get_stable_u64(KEY_CURRENT_TERM).unwrap(), Some(4));
        assert_eq!(store.get_stable(KEY_VOTED_FOR).unwrap(), None);
        store.append(&entry(6)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_private_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::tempdir().unwrap();
        let dir = temp_dir.path().join("db");
        create_private_dir(&dir).unwrap();
        let file = dir.join("name");
        write_private_file(&file, b"node").unwrap();

        let dir_mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        let file_mode = std::fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert_eq!(file_mode, 0o600);
    }
}
