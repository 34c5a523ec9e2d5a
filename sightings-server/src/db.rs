//! SQLite persistence: WAL mode, 3 tables.
//!
//! Schema: markers, feeds, sightings. A marker has at most one feed row and
//! the sightings parsed from that feed; both are replaced together in one
//! transaction so readers never see two feed generations mixed.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use sightings_core::feed::parse_timezone;
use sightings_core::types::{
    FeedDocument, ObservationPoint, ParsedFeed, Result, SightingError, SightingRecord,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS markers (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    label TEXT NOT NULL,
    lat REAL NOT NULL,
    lon REAL NOT NULL,
    timezone TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS feeds (
    marker_id INTEGER PRIMARY KEY REFERENCES markers(id),
    published TEXT NOT NULL,
    xml TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sightings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    marker_id INTEGER NOT NULL REFERENCES markers(id),
    datetime TEXT NOT NULL,
    timestamp REAL NOT NULL,
    info TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sightings_marker_ts ON sightings(marker_id, timestamp);
"#;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn store_err(e: rusqlite::Error) -> SightingError {
    SightingError::Store(e.to_string())
}

fn epoch_secs(dt: &DateTime<Utc>) -> f64 {
    dt.timestamp_millis() as f64 / 1000.0
}

fn parse_stored_time(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SightingError::Store(format!("bad stored time {text:?}: {e}")))
}

/// One entry of a `load-markers` input file.
#[derive(Debug, Clone, Deserialize)]
pub struct MarkerInput {
    pub label: String,
    pub lat: f64,
    pub lon: f64,
    pub country: String,
    pub state: String,
    pub town: String,
    pub timezone: String,
}

impl MarkerInput {
    /// Feed name, `Country_State_Town`.
    pub fn feed_name(&self) -> String {
        [self.country.as_str(), self.state.as_str(), self.town.as_str()].join("_")
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DbStats {
    pub markers: i64,
    pub feeds: i64,
    pub sightings: i64,
}

/// SQLite database for observation points and their sighting feeds.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory().map_err(store_err)?
        } else {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open(path).map_err(store_err)?
        };

        conn.busy_timeout(BUSY_TIMEOUT).map_err(store_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(store_err)?;
        conn.execute_batch(SCHEMA).map_err(store_err)?;

        Ok(Database { conn })
    }

    /// Open in-memory database (for testing).
    #[cfg(test)]
    pub fn open_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    // -----------------------------------------------------------------------
    // Markers
    // -----------------------------------------------------------------------

    /// Insert markers in one transaction. Any unknown time zone rejects the
    /// whole batch.
    pub fn insert_markers(&mut self, markers: &[MarkerInput]) -> Result<usize> {
        for m in markers {
            parse_timezone(&m.timezone)?;
        }

        let tx = self.conn.transaction().map_err(store_err)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO markers (name, label, lat, lon, timezone)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(store_err)?;
            for m in markers {
                stmt.execute(params![m.feed_name(), m.label, m.lat, m.lon, m.timezone])
                    .map_err(store_err)?;
            }
        }
        tx.commit().map_err(store_err)?;
        Ok(markers.len())
    }

    /// All observation points, ordered by id.
    pub fn load_markers(&self) -> Result<Vec<ObservationPoint>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, label, lat, lon, timezone FROM markers ORDER BY id")
            .map_err(store_err)?;

        let rows = stmt
            .query_map([], |r| {
                Ok(ObservationPoint {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    label: r.get(2)?,
                    lat: r.get(3)?,
                    lon: r.get(4)?,
                    timezone: r.get(5)?,
                })
            })
            .map_err(store_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(store_err)
    }

    // -----------------------------------------------------------------------
    // Feeds
    // -----------------------------------------------------------------------

    pub fn has_feed(&self, marker_id: i64) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM feeds WHERE marker_id = ?1)",
                params![marker_id],
                |r| r.get(0),
            )
            .map_err(store_err)
    }

    pub fn get_feed(&self, marker_id: i64) -> Result<Option<FeedDocument>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT published, xml FROM feeds WHERE marker_id = ?1",
                params![marker_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(store_err)?;

        row.map(|(published, body)| {
            Ok(FeedDocument {
                published: parse_stored_time(&published)?,
                body,
            })
        })
        .transpose()
    }

    /// Replace the feed document and its sightings as one unit.
    ///
    /// If any statement fails the transaction rolls back on drop and the
    /// previous generation stays in place.
    pub fn replace_feed(&mut self, marker_id: i64, feed: &ParsedFeed) -> Result<()> {
        let tx = self.conn.transaction().map_err(store_err)?;

        tx.execute(
            "REPLACE INTO feeds (marker_id, published, xml) VALUES (?1, ?2, ?3)",
            params![
                marker_id,
                feed.document.published.to_rfc3339(),
                feed.document.body
            ],
        )
        .map_err(store_err)?;

        tx.execute("DELETE FROM sightings WHERE marker_id = ?1", params![marker_id])
            .map_err(store_err)?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO sightings (marker_id, datetime, timestamp, info)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(store_err)?;
            for rec in &feed.records {
                let info = serde_json::to_string(&rec.info)
                    .map_err(|e| SightingError::Store(e.to_string()))?;
                stmt.execute(params![
                    marker_id,
                    rec.datetime.to_rfc3339(),
                    epoch_secs(&rec.datetime),
                    info
                ])
                .map_err(store_err)?;
            }
        }

        tx.commit().map_err(store_err)
    }

    /// Drop the feed document so the next request refetches it.
    ///
    /// Sightings stay until the refetch replaces them.
    pub fn delete_feed(&mut self, marker_id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM feeds WHERE marker_id = ?1", params![marker_id])
            .map_err(store_err)?;
        Ok(n > 0)
    }

    // -----------------------------------------------------------------------
    // Sightings
    // -----------------------------------------------------------------------

    /// Earliest sighting strictly after `after`.
    pub fn next_sighting(
        &self,
        marker_id: i64,
        after: DateTime<Utc>,
    ) -> Result<Option<SightingRecord>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT datetime, info FROM sightings
                 WHERE marker_id = ?1 AND timestamp > ?2
                 ORDER BY timestamp ASC LIMIT 1",
                params![marker_id, epoch_secs(&after)],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(store_err)?;

        row.map(|(dt, info)| row_to_record(&dt, &info)).transpose()
    }

    /// All sightings for a marker in time order.
    pub fn get_sightings(&self, marker_id: i64) -> Result<Vec<SightingRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT datetime, info FROM sightings
                 WHERE marker_id = ?1 ORDER BY timestamp ASC, id ASC",
            )
            .map_err(store_err)?;

        let rows = stmt
            .query_map(params![marker_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;

        rows.iter().map(|(dt, info)| row_to_record(dt, info)).collect()
    }

    pub fn stats(&self) -> Result<DbStats> {
        let count = |table: &str| -> Result<i64> {
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
                .map_err(store_err)
        };
        Ok(DbStats {
            markers: count("markers")?,
            feeds: count("feeds")?,
            sightings: count("sightings")?,
        })
    }
}

fn row_to_record(datetime: &str, info: &str) -> Result<SightingRecord> {
    let info: BTreeMap<String, String> = serde_json::from_str(info)
        .map_err(|e| SightingError::Store(format!("bad stored info: {e}")))?;
    Ok(SightingRecord {
        datetime: parse_stored_time(datetime)?,
        info,
    })
}

// ---------------------------------------------------------------------------
// Async access
// ---------------------------------------------------------------------------

/// Async handle on the database file.
///
/// Every call opens its own connection on a blocking thread, so concurrent
/// requests never share a connection and every transaction is released
/// when its closure returns.
#[derive(Clone)]
pub struct SqliteStore {
    path: Arc<str>,
}

impl SqliteStore {
    pub fn new(path: impl Into<String>) -> Self {
        SqliteStore {
            path: Arc::from(path.into()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut db = Database::open(&path)?;
            f(&mut db)
        })
        .await
        .map_err(|e| SightingError::Store(format!("database task failed: {e}")))?
    }

    pub async fn load_markers(&self) -> Result<Vec<ObservationPoint>> {
        self.run(|db| db.load_markers()).await
    }

    pub async fn has_feed(&self, marker_id: i64) -> Result<bool> {
        self.run(move |db| db.has_feed(marker_id)).await
    }

    pub async fn get_feed(&self, marker_id: i64) -> Result<Option<FeedDocument>> {
        self.run(move |db| db.get_feed(marker_id)).await
    }

    pub async fn replace_feed(&self, marker_id: i64, feed: ParsedFeed) -> Result<()> {
        self.run(move |db| db.replace_feed(marker_id, &feed)).await
    }

    pub async fn delete_feed(&self, marker_id: i64) -> Result<bool> {
        self.run(move |db| db.delete_feed(marker_id)).await
    }

    pub async fn next_sighting(
        &self,
        marker_id: i64,
        after: DateTime<Utc>,
    ) -> Result<Option<SightingRecord>> {
        self.run(move |db| db.next_sighting(marker_id, after)).await
    }

    pub async fn get_sightings(&self, marker_id: i64) -> Result<Vec<SightingRecord>> {
        self.run(move |db| db.get_sightings(marker_id)).await
    }

    pub async fn stats(&self) -> Result<DbStats> {
        self.run(|db| db.stats()).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn london_input() -> MarkerInput {
        MarkerInput {
            label: "London, England".into(),
            lat: 51.5072,
            lon: -0.1276,
            country: "United_Kingdom".into(),
            state: "England".into(),
            town: "London".into(),
            timezone: "Europe/London".into(),
        }
    }

    pub(crate) fn paris_input() -> MarkerInput {
        MarkerInput {
            label: "Paris, France".into(),
            lat: 48.8566,
            lon: 2.3522,
            country: "France".into(),
            state: "None".into(),
            town: "Paris".into(),
            timezone: "Europe/Paris".into(),
        }
    }

    pub(crate) fn record(at: DateTime<Utc>, duration: &str) -> SightingRecord {
        let mut info = BTreeMap::new();
        info.insert("duration".to_string(), duration.to_string());
        SightingRecord { datetime: at, info }
    }

    pub(crate) fn feed(records: Vec<SightingRecord>) -> ParsedFeed {
        ParsedFeed {
            document: FeedDocument {
                published: Utc.with_ymd_and_hms(2026, 10, 19, 9, 15, 0).unwrap(),
                body: "<rss/>".into(),
            },
            records,
        }
    }

    fn test_db() -> Database {
        let mut db = Database::open_memory().unwrap();
        db.insert_markers(&[london_input(), paris_input()]).unwrap();
        db
    }

    #[test]
    fn test_open_memory() {
        let db = Database::open_memory().unwrap();
        assert_eq!(
            db.stats().unwrap(),
            DbStats {
                markers: 0,
                feeds: 0,
                sightings: 0
            }
        );
    }

    #[test]
    fn test_insert_and_load_markers() {
        let db = test_db();
        let markers = db.load_markers().unwrap();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].name, "United_Kingdom_England_London");
        assert_eq!(markers[0].timezone, "Europe/London");
        assert_eq!(markers[1].name, "France_None_Paris");
        assert!(markers[0].id < markers[1].id);
    }

    #[test]
    fn test_insert_markers_rejects_bad_timezone() {
        let mut db = Database::open_memory().unwrap();
        let mut bad = paris_input();
        bad.timezone = "Europe/Atlantis".into();
        let err = db.insert_markers(&[london_input(), bad]).unwrap_err();
        assert!(matches!(err, SightingError::Config(_)));
        assert!(db.load_markers().unwrap().is_empty());
    }

    #[test]
    fn test_replace_feed_and_query() {
        let mut db = test_db();
        let t1 = Utc.with_ymd_and_hms(2026, 10, 20, 18, 12, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 10, 21, 17, 25, 0).unwrap();

        assert!(!db.has_feed(1).unwrap());
        db.replace_feed(1, &feed(vec![record(t2, "4 minutes"), record(t1, "6 minutes")]))
            .unwrap();
        assert!(db.has_feed(1).unwrap());
        assert!(!db.has_feed(2).unwrap());

        let doc = db.get_feed(1).unwrap().unwrap();
        assert_eq!(doc.published, Utc.with_ymd_and_hms(2026, 10, 19, 9, 15, 0).unwrap());

        let all = db.get_sightings(1).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].datetime, t1);
        assert_eq!(all[0].info["duration"], "6 minutes");

        let now = Utc.with_ymd_and_hms(2026, 10, 20, 12, 0, 0).unwrap();
        assert_eq!(db.next_sighting(1, now).unwrap().unwrap().datetime, t1);
        // Strictly after: a sighting exactly at `now` does not count.
        assert_eq!(db.next_sighting(1, t1).unwrap().unwrap().datetime, t2);
        assert!(db.next_sighting(1, t2).unwrap().is_none());
        assert!(db.next_sighting(2, now).unwrap().is_none());
    }

    #[test]
    fn test_replace_feed_replaces_generation() {
        let mut db = test_db();
        let old = Utc.with_ymd_and_hms(2026, 10, 20, 18, 12, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2026, 10, 22, 18, 0, 0).unwrap();

        db.replace_feed(1, &feed(vec![record(old, "old"), record(old, "old")]))
            .unwrap();
        db.replace_feed(1, &feed(vec![record(new, "new")])).unwrap();

        let all = db.get_sightings(1).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].info["duration"], "new");
        assert_eq!(db.stats().unwrap().feeds, 1);
    }

    #[test]
    fn test_failed_replace_keeps_previous_generation() {
        let mut db = test_db();
        let t = Utc.with_ymd_and_hms(2026, 10, 20, 18, 12, 0).unwrap();
        db.replace_feed(1, &feed(vec![record(t, "kept")])).unwrap();

        // Marker 99 does not exist, so the foreign key fails mid-transaction.
        assert!(db.replace_feed(99, &feed(vec![record(t, "lost")])).is_err());
        assert_eq!(db.get_sightings(1).unwrap()[0].info["duration"], "kept");
        assert!(db.get_sightings(99).unwrap().is_empty());
        assert!(!db.has_feed(99).unwrap());
    }

    #[test]
    fn test_failed_replace_of_same_marker_rolls_back() {
        let mut db = test_db();
        let t = Utc.with_ymd_and_hms(2026, 10, 20, 18, 12, 0).unwrap();
        db.replace_feed(1, &feed(vec![record(t, "kept"), record(t, "kept")]))
            .unwrap();
        let before = db.get_feed(1).unwrap().unwrap();

        // Fail the second insert, after the document was replaced and the
        // old sightings deleted.
        db.conn
            .execute_batch(
                "CREATE TRIGGER reject_bad BEFORE INSERT ON sightings
                 WHEN NEW.info LIKE '%bad%'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();
        let mut next = feed(vec![record(t, "fine"), record(t, "bad")]);
        next.document.published = Utc.with_ymd_and_hms(2026, 10, 21, 9, 0, 0).unwrap();
        next.document.body = "<rss>next</rss>".into();

        assert!(matches!(
            db.replace_feed(1, &next),
            Err(SightingError::Store(_))
        ));
        assert_eq!(db.get_feed(1).unwrap().unwrap(), before);
        let all = db.get_sightings(1).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|r| r.info["duration"] == "kept"));
    }

    #[test]
    fn test_delete_feed() {
        let mut db = test_db();
        let t = Utc.with_ymd_and_hms(2026, 10, 20, 18, 12, 0).unwrap();
        db.replace_feed(1, &feed(vec![record(t, "x")])).unwrap();

        assert!(db.delete_feed(1).unwrap());
        assert!(!db.has_feed(1).unwrap());
        assert!(!db.delete_feed(1).unwrap());
        assert_eq!(db.get_sightings(1).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/sightings.db");
        let path = path.to_str().unwrap().to_string();
        Database::open(&path)
            .unwrap()
            .insert_markers(&[london_input()])
            .unwrap();

        let store = SqliteStore::new(path);
        let markers = store.load_markers().await.unwrap();
        assert_eq!(markers.len(), 1);

        let t = Utc.with_ymd_and_hms(2026, 10, 20, 18, 12, 0).unwrap();
        store
            .replace_feed(markers[0].id, feed(vec![record(t, "x")]))
            .await
            .unwrap();
        assert!(store.has_feed(markers[0].id).await.unwrap());
        assert_eq!(store.stats().await.unwrap().sightings, 1);
    }
}
