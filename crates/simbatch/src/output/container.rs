//! Hierarchical container writer backed by a single SQLite file.
//!
//! Every task is one group (row) of the `groups` table, keyed by task name.
//! The payload is stored as a JSON document; metadata attributes live in
//! their own columns so finalized groups can be queried without decoding
//! payloads. The single-row `batch` table holds batch-level metadata.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, TransactionBehavior, params};
use rustc_hash::FxHashSet;
use serde_json::{Map, Value};

use super::{ArtifactMetadata, OutputSettings, TaskStatus};
use crate::config::{Configuration, Payload};
use crate::error::{OutputError, StateError};

/// How long a writer waits for another connection's lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

fn init_container(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS groups (
            name TEXT PRIMARY KEY,
            payload TEXT,
            status TEXT,
            error TEXT,
            configuration TEXT,
            variation TEXT,
            duration_secs REAL,
            format_version INTEGER,
            finalized_at TEXT,
            finalized INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS batch (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            metadata TEXT NOT NULL,
            written_at TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Writer owning its own connection to the container file.
///
/// Several writers may point at the same file; SQLite serializes their
/// writes, waiting up to [`BUSY_TIMEOUT`] for a lock.
#[derive(Debug)]
pub struct ContainerWriter {
    settings: OutputSettings,
    conn: Option<Connection>,
    opened: FxHashSet<String>,
    finalized: FxHashSet<String>,
}

impl ContainerWriter {
    pub fn new(settings: OutputSettings) -> Self {
        Self {
            settings,
            conn: None,
            opened: FxHashSet::default(),
            finalized: FxHashSet::default(),
        }
    }

    pub fn settings(&self) -> &OutputSettings {
        &self.settings
    }

    pub fn file_path(&self) -> PathBuf {
        self.settings.directory().join(self.settings.file_name())
    }

    /// Read-write connection, created with the file on first use
    fn connection(&mut self) -> Result<&mut Connection, OutputError> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                fs::create_dir_all(self.settings.directory())?;
                let conn = Connection::open(self.file_path())?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                init_container(&conn)?;
                conn
            }
        };
        Ok(self.conn.insert(conn))
    }

    /// Run a query against the container without creating it.
    fn read<T>(&self, query: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Option<T> {
        let result = match &self.conn {
            Some(conn) => query(conn),
            None => {
                let path = self.file_path();
                if !path.is_file() {
                    return None;
                }
                let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                    .and_then(|conn| conn.busy_timeout(BUSY_TIMEOUT).map(|_| conn));
                conn.and_then(|conn| query(&conn))
            }
        };
        match result {
            Ok(value) => Some(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(err) => {
                tracing::debug!("cannot read container {}: {err}", self.file_path().display());
                None
            }
        }
    }

    pub fn save(&mut self, task: &str, payload: &Payload) -> Result<(), OutputError> {
        if self.finalized.contains(task) {
            return Err(StateError::AlreadyFinalized(task.to_string()).into());
        }
        let first = !self.opened.contains(task);
        let force = self.settings.force;
        let document = serde_json::to_string(payload)?;

        let conn = self.connection()?;
        if first && !force && finalized_success(conn, task)? {
            return Err(StateError::ArtifactExists(task.to_string()).into());
        }
        conn.execute(
            "INSERT INTO groups (name, payload, finalized) VALUES (?1, ?2, 0)
             ON CONFLICT(name) DO UPDATE SET
                payload = excluded.payload, status = NULL, error = NULL, finalized = 0",
            params![task, document],
        )?;

        self.opened.insert(task.to_string());
        Ok(())
    }

    pub fn finalize(&mut self, task: &str, metadata: &ArtifactMetadata) -> Result<(), OutputError> {
        if self.finalized.contains(task) {
            return Err(StateError::AlreadyFinalized(task.to_string()).into());
        }
        let saved = self.opened.contains(task);
        let force = self.settings.force;

        let metadata = metadata.stamped();
        let configuration = serde_json::to_string(&metadata.configuration)?;
        let variation = serde_json::to_string(&metadata.variation)?;
        let finalized_at = metadata.finalized_at.map(|t| t.to_string());

        let conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !saved {
            if !force && finalized_success(&tx, task)? {
                return Err(StateError::ArtifactExists(task.to_string()).into());
            }
            // Nothing saved in this run: drop any earlier snapshot
            tx.execute("DELETE FROM groups WHERE name = ?1", params![task])?;
        }
        tx.execute(
            "INSERT INTO groups (name, status, error, configuration, variation,
                                 duration_secs, format_version, finalized_at, finalized)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)
             ON CONFLICT(name) DO UPDATE SET
                status = excluded.status,
                error = excluded.error,
                configuration = excluded.configuration,
                variation = excluded.variation,
                duration_secs = excluded.duration_secs,
                format_version = excluded.format_version,
                finalized_at = excluded.finalized_at,
                finalized = 1",
            params![
                task,
                metadata.status.as_str(),
                metadata.error,
                configuration,
                variation,
                metadata.duration_secs,
                metadata.format_version,
                finalized_at,
            ],
        )?;
        tx.commit()?;

        self.finalized.insert(task.to_string());
        Ok(())
    }

    pub fn load_like(&self, task: &str) -> Option<Payload> {
        let document: Option<String> = self.read(|conn| {
            conn.query_row(
                "SELECT payload FROM groups
                 WHERE name = ?1 AND finalized = 1 AND status = 'success'",
                [task],
                |row| row.get(0),
            )
        })?;
        match document {
            None => Some(Payload::new()),
            Some(text) => serde_json::from_str(&text)
                .inspect_err(|err| tracing::debug!("corrupt payload for '{task}': {err}"))
                .ok(),
        }
    }

    pub fn metadata(&self, task: &str) -> Option<ArtifactMetadata> {
        let row = self.read(|conn| {
            conn.query_row(
                "SELECT status, error, configuration, variation, duration_secs,
                        format_version, finalized_at
                 FROM groups WHERE name = ?1 AND finalized = 1",
                [task],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, Option<u32>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
        })?;
        let (status, error, configuration, variation, duration, version, finalized_at) = row;

        let configuration: Configuration = match configuration {
            Some(text) => serde_json::from_str(&text).ok()?,
            None => Configuration::new(),
        };
        let variation = match variation {
            Some(text) => serde_json::from_str(&text).ok()?,
            None => Default::default(),
        };

        Some(ArtifactMetadata {
            task: task.to_string(),
            status: TaskStatus::parse(&status)?,
            error,
            configuration,
            variation,
            duration_secs: duration.unwrap_or_default(),
            format_version: version.unwrap_or_default(),
            finalized_at: finalized_at.and_then(|t| t.parse().ok()),
        })
    }

    pub fn save_batch_metadata(&mut self, metadata: &Map<String, Value>) -> Result<(), OutputError> {
        let document = serde_json::to_string(metadata)?;
        let written_at = jiff::Timestamp::now().to_string();
        self.connection()?.execute(
            "INSERT INTO batch (id, metadata, written_at) VALUES (0, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                metadata = excluded.metadata, written_at = excluded.written_at",
            params![document, written_at],
        )?;
        Ok(())
    }

    pub fn batch_metadata(&self) -> Option<Map<String, Value>> {
        let document: String = self.read(|conn| {
            conn.query_row("SELECT metadata FROM batch WHERE id = 0", [], |row| row.get(0))
        })?;
        serde_json::from_str(&document)
            .inspect_err(|err| tracing::debug!("corrupt batch metadata: {err}"))
            .ok()
    }

    pub fn dir(&self) -> Vec<String> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT name FROM groups WHERE finalized = 1 ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>();
            names
        })
        .unwrap_or_default()
    }
}

fn finalized_success(conn: &Connection, task: &str) -> Result<bool, rusqlite::Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM groups
         WHERE name = ?1 AND finalized = 1 AND status = 'success'",
        [task],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;
    use serde_json::{Value, json};
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> OutputSettings {
        OutputSettings::new("batch", OutputFormat::Sqlite).with_path(dir.path())
    }

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn success(task: &str) -> ArtifactMetadata {
        ArtifactMetadata::new(task, TaskStatus::Success, Configuration::new())
    }

    #[test]
    fn test_read_does_not_create_file() {
        let dir = TempDir::new().unwrap();
        let w = ContainerWriter::new(settings(&dir));
        assert_eq!(w.load_like("case_00"), None);
        assert!(w.dir().is_empty());
        assert!(!w.file_path().exists());
    }

    #[test]
    fn test_lifecycle() {
        let dir = TempDir::new().unwrap();
        let mut w = ContainerWriter::new(settings(&dir));
        w.save("case_00", &payload(json!({"x": [1, 2]}))).unwrap();
        w.save("case_00", &payload(json!({"x": [3]}))).unwrap();
        assert_eq!(w.load_like("case_00"), None);

        let metadata = success("case_00")
            .with_duration(0.5)
            .with_variation(payload(json!({"eggs": 2})));
        w.finalize("case_00", &metadata).unwrap();
        assert_eq!(w.load_like("case_00"), Some(payload(json!({"x": [3]}))));

        let stored = w.metadata("case_00").unwrap();
        assert_eq!(stored.duration_secs, 0.5);
        assert_eq!(stored.variation, payload(json!({"eggs": 2})));
        assert!(stored.finalized_at.is_some());

        let err = w.save("case_00", &payload(json!({"x": [4]}))).unwrap_err();
        assert!(matches!(err, OutputError::State(StateError::AlreadyFinalized(_))));
        let err = w.finalize("case_00", &metadata).unwrap_err();
        assert!(matches!(err, OutputError::State(StateError::AlreadyFinalized(_))));
    }

    #[test]
    fn test_batch_metadata_row() {
        let dir = TempDir::new().unwrap();
        let mut w = ContainerWriter::new(settings(&dir));
        assert_eq!(w.batch_metadata(), None);

        w.save_batch_metadata(&payload(json!({"tasks": 2}))).unwrap();
        let latest = payload(json!({"strategy": {"matrix": {"x": [1, 2]}}, "tasks": 2}));
        w.save_batch_metadata(&latest).unwrap();
        assert!(w.dir().is_empty());

        let reader = ContainerWriter::new(settings(&dir));
        assert_eq!(reader.batch_metadata(), Some(latest));
    }

    #[test]
    fn test_payload_round_trips_exactly() {
        let dir = TempDir::new().unwrap();
        let mut w = ContainerWriter::new(settings(&dir));
        let saved = payload(json!({"id": "42", "a.b": 1, "meta": {}, "xs": [1.0, null]}));
        w.save("case_00", &saved).unwrap();
        w.finalize("case_00", &success("case_00")).unwrap();
        assert_eq!(w.load_like("case_00"), Some(saved));
    }

    #[test]
    fn test_reopen_sees_finalized_groups() {
        let dir = TempDir::new().unwrap();
        {
            let mut w = ContainerWriter::new(settings(&dir));
            w.save("b", &payload(json!({"v": 1}))).unwrap();
            w.finalize("b", &success("b")).unwrap();
            w.save("a", &payload(json!({"v": 2}))).unwrap();
            w.finalize("a", &success("a")).unwrap();
            w.save("c", &payload(json!({"v": 3}))).unwrap();
        }

        let w = ContainerWriter::new(settings(&dir));
        assert_eq!(w.dir(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(w.load_like("a"), Some(payload(json!({"v": 2}))));
        assert_eq!(w.load_like("c"), None);
    }

    #[test]
    fn test_existing_group_requires_force() {
        let dir = TempDir::new().unwrap();
        let mut first = ContainerWriter::new(settings(&dir));
        first.save("case_00", &payload(json!({"v": 1}))).unwrap();
        first.finalize("case_00", &success("case_00")).unwrap();
        drop(first);

        let mut second = ContainerWriter::new(settings(&dir));
        let err = second.save("case_00", &payload(json!({"v": 2}))).unwrap_err();
        assert!(matches!(err, OutputError::State(StateError::ArtifactExists(_))));

        let mut forced = ContainerWriter::new(settings(&dir).with_force(true));
        forced.save("case_00", &payload(json!({"v": 2}))).unwrap();
        forced.finalize("case_00", &success("case_00")).unwrap();
        assert_eq!(forced.load_like("case_00"), Some(payload(json!({"v": 2}))));
    }

    #[test]
    fn test_failed_group_is_recorded_but_not_loaded() {
        let dir = TempDir::new().unwrap();
        let mut w = ContainerWriter::new(settings(&dir));
        let metadata = ArtifactMetadata::new("case_01", TaskStatus::Failed, Configuration::new())
            .with_error("diverged");
        w.finalize("case_01", &metadata).unwrap();

        assert_eq!(w.load_like("case_01"), None);
        assert_eq!(w.dir(), vec!["case_01".to_string()]);
        assert_eq!(w.metadata("case_01").unwrap().error.as_deref(), Some("diverged"));

        // A failed group does not block a rerun
        let mut rerun = ContainerWriter::new(settings(&dir));
        rerun.save("case_01", &payload(json!({"v": 1}))).unwrap();
    }

    #[test]
    fn test_unrelated_database_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batch.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute("CREATE TABLE other (id INTEGER)", []).unwrap();
        drop(conn);

        let w = ContainerWriter::new(settings(&dir));
        assert_eq!(w.load_like("case_00"), None);
        assert!(w.dir().is_empty());
    }
}
