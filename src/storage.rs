use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::location::Location;
use crate::open_db_connection;

/// One accepted plate, as handed to the outbox. Never mutated after creation.
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateRecord {
    pub license_text: String,
    pub vehicle_image_ref: String,
    pub plate_image_ref: String,
    pub cropped_image_ref: String,
    /// `YYYYMMDD_HHMMSS`
    pub timestamp: String,
    pub location: Location,
    pub hostname: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }

    fn from_columns(sent_to_server: i64, delivery_failed: i64) -> Self {
        if sent_to_server != 0 {
            DeliveryStatus::Sent
        } else if delivery_failed != 0 {
            DeliveryStatus::Failed
        } else {
            DeliveryStatus::Pending
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(anyhow!("unknown delivery status '{}'", other)),
        }
    }
}

/// A stored record. `status` is the only field that changes after insert.
#[derive(Clone, Debug, PartialEq)]
pub struct PersistedRecord {
    pub id: i64,
    pub record: CandidateRecord,
    pub status: DeliveryStatus,
    /// Collector message of the last rejected delivery.
    pub last_error: Option<String>,
}

/// Operator search criteria. Empty fields match everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordFilter {
    /// Substring of the plate text.
    pub license_plate: Option<String>,
    pub hostname: Option<String>,
    pub status: Option<DeliveryStatus>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    fn matches(&self, rec: &PersistedRecord) -> bool {
        self.license_plate
            .as_ref()
            .map_or(true, |p| rec.record.license_text.contains(p.as_str()))
            && self
                .hostname
                .as_ref()
                .map_or(true, |h| &rec.record.hostname == h)
            && self.status.map_or(true, |s| rec.status == s)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Durable record store shared by the orchestrator (insert) and the delivery
/// worker (status updates).
///
/// Every operation is a single atomic statement; readers never observe a
/// half-written record.
pub trait Outbox {
    /// Store a record and return its id. Never drops silently.
    fn insert(&mut self, record: &CandidateRecord) -> Result<i64>;

    /// Oldest pending record by `(timestamp, id)`.
    fn next_pending(&mut self) -> Result<Option<PersistedRecord>>;

    fn mark_sent(&mut self, id: i64) -> Result<()>;

    /// Mark a record rejected by the collector. The record is kept.
    fn mark_failed(&mut self, id: i64, reason: &str) -> Result<()>;

    fn get(&mut self, id: i64) -> Result<Option<PersistedRecord>>;

    /// Matching records, newest first.
    fn search(&mut self, filter: &RecordFilter) -> Result<Vec<PersistedRecord>>;

    fn counts(&mut self) -> Result<StatusCounts>;

    /// Move failed records back to pending.
    fn requeue_failed(&mut self) -> Result<usize>;

    /// Move every record back to pending.
    fn reset_all(&mut self) -> Result<usize>;

    fn delete(&mut self, id: i64) -> Result<bool>;

    /// Delete records already delivered.
    fn purge_sent(&mut self) -> Result<usize>;
}

// ----------------------------------------------------------------------------
// SQLite outbox
// ----------------------------------------------------------------------------

const RECORD_COLUMNS: &str = "id, license_plate, vehicle_image_path, license_plate_image_path, \
     cropped_image_path, timestamp, location, hostname, sent_to_server, delivery_failed, last_error";

pub struct SqliteOutbox {
    conn: Connection,
}

impl SqliteOutbox {
    /// Open (or create) the outbox. Accepts a file path or a `file:` URI.
    pub fn open(db_path: &str) -> Result<Self> {
        if !db_path.starts_with("file:") {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
            }
        }
        let conn = open_db_connection(db_path)
            .with_context(|| format!("failed to open outbox {}", db_path))?;
        let mut outbox = Self { conn };
        outbox.ensure_schema()?;
        Ok(outbox)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.busy_timeout(std::time::Duration::from_secs(5))?;
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS lpr_data (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              license_plate TEXT,
              vehicle_image_path TEXT,
              license_plate_image_path TEXT,
              cropped_image_path TEXT,
              timestamp TEXT,
              location TEXT,
              hostname TEXT,
              sent_to_server INTEGER DEFAULT 0
            );
            "#,
        )?;
        // Databases written by older deployments lack the failure columns.
        ensure_columns(
            &self.conn,
            "lpr_data",
            &[
                ("delivery_failed", "INTEGER NOT NULL DEFAULT 0"),
                ("last_error", "TEXT"),
            ],
        )?;
        self.conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_lpr_data_pending \
             ON lpr_data(sent_to_server, delivery_failed, timestamp);",
        )?;
        Ok(())
    }

    fn update_status(&mut self, sql: &str, id: i64) -> Result<()> {
        let changed = self.conn.execute(sql, params![id])?;
        if changed == 0 {
            return Err(anyhow!("outbox record {} not found", id));
        }
        Ok(())
    }
}

fn ensure_columns(conn: &Connection, table: &str, columns: &[(&str, &str)]) -> Result<()> {
    let existing: Vec<String> = {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
        names.collect::<rusqlite::Result<_>>()?
    };
    for (name, decl) in columns {
        if !existing.iter().any(|c| c == name) {
            log::info!("outbox: adding column {}.{}", table, name);
            conn.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {} {};", table, name, decl))?;
        }
    }
    Ok(())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<(PersistedRecord, String)> {
    let location: Option<String> = row.get(6)?;
    let record = PersistedRecord {
        id: row.get(0)?,
        record: CandidateRecord {
            license_text: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            vehicle_image_ref: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            plate_image_ref: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            cropped_image_ref: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            timestamp: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            location: Location::default(),
            hostname: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        },
        status: DeliveryStatus::from_columns(
            row.get::<_, Option<i64>>(8)?.unwrap_or(0),
            row.get(9)?,
        ),
        last_error: row.get(10)?,
    };
    Ok((record, location.unwrap_or_default()))
}

/// Parse the stored location text; rows written by hand may not parse.
fn finish_record((mut record, location): (PersistedRecord, String)) -> PersistedRecord {
    match location.parse::<Location>() {
        Ok(parsed) => record.record.location = parsed,
        Err(err) => log::warn!("outbox: record {} has unusable location: {:#}", record.id, err),
    }
    record
}

impl Outbox for SqliteOutbox {
    fn insert(&mut self, record: &CandidateRecord) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO lpr_data(license_plate, vehicle_image_path, license_plate_image_path,
                                 cropped_image_path, timestamp, location, hostname,
                                 sent_to_server, delivery_failed)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0)
            "#,
            params![
                record.license_text,
                record.vehicle_image_ref,
                record.plate_image_ref,
                record.cropped_image_ref,
                record.timestamp,
                record.location.to_string(),
                record.hostname,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn next_pending(&mut self) -> Result<Option<PersistedRecord>> {
        let sql = format!(
            "SELECT {} FROM lpr_data \
             WHERE COALESCE(sent_to_server, 0) = 0 AND delivery_failed = 0 \
             ORDER BY timestamp ASC, id ASC LIMIT 1",
            RECORD_COLUMNS
        );
        let row = self.conn.query_row(&sql, [], record_from_row).optional()?;
        Ok(row.map(finish_record))
    }

    fn mark_sent(&mut self, id: i64) -> Result<()> {
        self.update_status(
            "UPDATE lpr_data SET sent_to_server = 1, delivery_failed = 0, last_error = NULL WHERE id = ?1",
            id,
        )
    }

    fn mark_failed(&mut self, id: i64, reason: &str) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE lpr_data SET sent_to_server = 0, delivery_failed = 1, last_error = ?2 WHERE id = ?1",
            params![id, reason],
        )?;
        if changed == 0 {
            return Err(anyhow!("outbox record {} not found", id));
        }
        Ok(())
    }

    fn get(&mut self, id: i64) -> Result<Option<PersistedRecord>> {
        let sql = format!("SELECT {} FROM lpr_data WHERE id = ?1", RECORD_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], record_from_row)
            .optional()?;
        Ok(row.map(finish_record))
    }

    fn search(&mut self, filter: &RecordFilter) -> Result<Vec<PersistedRecord>> {
        let sql = format!(
            "SELECT {} FROM lpr_data ORDER BY timestamp DESC, id DESC",
            RECORD_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], record_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            let record = finish_record(row?);
            if filter.matches(&record) {
                out.push(record);
                if filter.limit.is_some_and(|limit| out.len() >= limit) {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn counts(&mut self) -> Result<StatusCounts> {
        let mut stmt = self.conn.prepare(
            "SELECT COALESCE(sent_to_server, 0), delivery_failed, COUNT(*) FROM lpr_data \
             GROUP BY COALESCE(sent_to_server, 0), delivery_failed",
        )?;
        let mut rows = stmt.query([])?;
        let mut counts = StatusCounts::default();
        while let Some(row) = rows.next()? {
            let n: i64 = row.get(2)?;
            match DeliveryStatus::from_columns(row.get(0)?, row.get(1)?) {
                DeliveryStatus::Pending => counts.pending += n as usize,
                DeliveryStatus::Sent => counts.sent += n as usize,
                DeliveryStatus::Failed => counts.failed += n as usize,
            }
        }
        Ok(counts)
    }

    fn requeue_failed(&mut self) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE lpr_data SET delivery_failed = 0, last_error = NULL \
             WHERE delivery_failed = 1 AND COALESCE(sent_to_server, 0) = 0",
            [],
        )?)
    }

    fn reset_all(&mut self) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE lpr_data SET sent_to_server = 0, delivery_failed = 0, last_error = NULL",
            [],
        )?)
    }

    fn delete(&mut self, id: i64) -> Result<bool> {
        Ok(self
            .conn
            .execute("DELETE FROM lpr_data WHERE id = ?1", params![id])?
            > 0)
    }

    fn purge_sent(&mut self) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM lpr_data WHERE sent_to_server = 1", [])?)
    }
}

// ----------------------------------------------------------------------------
// In-memory outbox
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct InMemoryOutbox {
    records: Vec<PersistedRecord>,
    next_id: i64,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn find_mut(&mut self, id: i64) -> Result<&mut PersistedRecord> {
        self.records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| anyhow!("outbox record {} not found", id))
    }
}

impl Outbox for InMemoryOutbox {
    fn insert(&mut self, record: &CandidateRecord) -> Result<i64> {
        self.next_id += 1;
        self.records.push(PersistedRecord {
            id: self.next_id,
            record: record.clone(),
            status: DeliveryStatus::Pending,
            last_error: None,
        });
        Ok(self.next_id)
    }

    fn next_pending(&mut self) -> Result<Option<PersistedRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.status == DeliveryStatus::Pending)
            .min_by(|a, b| {
                a.record
                    .timestamp
                    .cmp(&b.record.timestamp)
                    .then(a.id.cmp(&b.id))
            })
            .cloned())
    }

    fn mark_sent(&mut self, id: i64) -> Result<()> {
        let rec = self.find_mut(id)?;
        rec.status = DeliveryStatus::Sent;
        rec.last_error = None;
        Ok(())
    }

    fn mark_failed(&mut self, id: i64, reason: &str) -> Result<()> {
        let rec = self.find_mut(id)?;
        rec.status = DeliveryStatus::Failed;
        rec.last_error = Some(reason.to_string());
        Ok(())
    }

    fn get(&mut self, id: i64) -> Result<Option<PersistedRecord>> {
        Ok(self.records.iter().find(|r| r.id == id).cloned())
    }

    fn search(&mut self, filter: &RecordFilter) -> Result<Vec<PersistedRecord>> {
        let mut out: Vec<PersistedRecord> = self
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.record
                .timestamp
                .cmp(&a.record.timestamp)
                .then(b.id.cmp(&a.id))
        });
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn counts(&mut self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for rec in &self.records {
            match rec.status {
                DeliveryStatus::Pending => counts.pending += 1,
                DeliveryStatus::Sent => counts.sent += 1,
                DeliveryStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    fn requeue_failed(&mut self) -> Result<usize> {
        let mut n = 0;
        for rec in self
            .records
            .iter_mut()
            .filter(|r| r.status == DeliveryStatus::Failed)
        {
            rec.status = DeliveryStatus::Pending;
            rec.last_error = None;
            n += 1;
        }
        Ok(n)
    }

    fn reset_all(&mut self) -> Result<usize> {
        for rec in &mut self.records {
            rec.status = DeliveryStatus::Pending;
            rec.last_error = None;
        }
        Ok(self.records.len())
    }

    fn delete(&mut self, id: i64) -> Result<bool> {
        let before = self.records.len();
        self.records.retain(|r| r.id != id);
        Ok(self.records.len() != before)
    }

    fn purge_sent(&mut self) -> Result<usize> {
        let before = self.records.len();
        self.records.retain(|r| r.status != DeliveryStatus::Sent);
        Ok(before - self.records.len())
    }
}

// ----------------------------------------------------------------------------
// Shared handle
// ----------------------------------------------------------------------------

/// An outbox behind `Arc<Mutex<_>>`, for handing one store to both loops in
/// a single process when the store cannot be reopened (in-memory).
pub struct SharedOutbox<T: Outbox>(Arc<Mutex<T>>);

impl<T: Outbox> SharedOutbox<T> {
    pub fn new(inner: T) -> Self {
        Self(Arc::new(Mutex::new(inner)))
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut guard = self.0.lock().map_err(|_| anyhow!("outbox lock poisoned"))?;
        f(&mut guard)
    }
}

impl<T: Outbox> Clone for SharedOutbox<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Outbox> Outbox for SharedOutbox<T> {
    fn insert(&mut self, record: &CandidateRecord) -> Result<i64> {
        self.with(|o| o.insert(record))
    }

    fn next_pending(&mut self) -> Result<Option<PersistedRecord>> {
        self.with(|o| o.next_pending())
    }

    fn mark_sent(&mut self, id: i64) -> Result<()> {
        self.with(|o| o.mark_sent(id))
    }

    fn mark_failed(&mut self, id: i64, reason: &str) -> Result<()> {
        self.with(|o| o.mark_failed(id, reason))
    }

    fn get(&mut self, id: i64) -> Result<Option<PersistedRecord>> {
        self.with(|o| o.get(id))
    }

    fn search(&mut self, filter: &RecordFilter) -> Result<Vec<PersistedRecord>> {
        self.with(|o| o.search(filter))
    }

    fn counts(&mut self) -> Result<StatusCounts> {
        self.with(|o| o.counts())
    }

    fn requeue_failed(&mut self) -> Result<usize> {
        self.with(|o| o.requeue_failed())
    }

    fn reset_all(&mut self) -> Result<usize> {
        self.with(|o| o.reset_all())
    }

    fn delete(&mut self, id: i64) -> Result<bool> {
        self.with(|o| o.delete(id))
    }

    fn purge_sent(&mut self) -> Result<usize> {
        self.with(|o| o.purge_sent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_memory_uri;

    fn candidate(text: &str, timestamp: &str) -> CandidateRecord {
        CandidateRecord {
            license_text: text.to_string(),
            vehicle_image_ref: format!("output/vehicle_{}.jpg", timestamp),
            plate_image_ref: format!("output/plate_{}.jpg", timestamp),
            cropped_image_ref: format!("output/cropped_{}.jpg", timestamp),
            timestamp: timestamp.to_string(),
            location: Location::new(13.75, 100.5),
            hostname: "edge-01".to_string(),
        }
    }

    fn exercise(outbox: &mut dyn Outbox) -> Result<()> {
        let late = outbox.insert(&candidate("BBB222", "20240102_000000"))?;
        let early = outbox.insert(&candidate("AAA111", "20240101_000000"))?;
        let also_early = outbox.insert(&candidate("CCC333", "20240101_000000"))?;

        let next = outbox.next_pending()?.unwrap();
        assert_eq!(next.id, early);
        assert_eq!(next.record, candidate("AAA111", "20240101_000000"));
        assert_eq!(next.status, DeliveryStatus::Pending);

        outbox.mark_sent(early)?;
        assert_eq!(outbox.next_pending()?.unwrap().id, also_early);

        outbox.mark_failed(also_early, "duplicate plate")?;
        assert_eq!(outbox.next_pending()?.unwrap().id, late);
        let failed = outbox.get(also_early)?.unwrap();
        assert_eq!(failed.status, DeliveryStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("duplicate plate"));

        assert_eq!(
            outbox.counts()?,
            StatusCounts {
                pending: 1,
                sent: 1,
                failed: 1
            }
        );

        assert_eq!(outbox.requeue_failed()?, 1);
        assert_eq!(outbox.next_pending()?.unwrap().id, also_early);

        let hits = outbox.search(&RecordFilter {
            license_plate: Some("222".into()),
            ..RecordFilter::default()
        })?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, late);

        assert_eq!(outbox.purge_sent()?, 1);
        assert!(outbox.get(early)?.is_none());
        assert!(outbox.delete(late)?);
        assert!(!outbox.delete(late)?);
        assert!(outbox.mark_sent(9999).is_err());
        Ok(())
    }

    #[test]
    fn sqlite_outbox_lifecycle() -> Result<()> {
        let mut outbox = SqliteOutbox::open(&shared_memory_uri())?;
        exercise(&mut outbox)
    }

    #[test]
    fn in_memory_outbox_lifecycle() -> Result<()> {
        let mut outbox = InMemoryOutbox::new();
        exercise(&mut outbox)
    }

    #[test]
    fn legacy_table_gains_failure_columns() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("lpr_data.db");
        let path = path.to_string_lossy().to_string();
        {
            let conn = Connection::open(&path)?;
            conn.execute_batch(
                r#"
                CREATE TABLE lpr_data (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  license_plate TEXT, vehicle_image_path TEXT, license_plate_image_path TEXT,
                  cropped_image_path TEXT, timestamp TEXT, location TEXT, hostname TEXT,
                  sent_to_server INTEGER DEFAULT 0
                );
                INSERT INTO lpr_data(license_plate, timestamp, location, hostname, sent_to_server)
                VALUES ('OLD1', '20230101_101010', '1.0,2.0', 'legacy', 0);
                "#,
            )?;
        }

        let mut outbox = SqliteOutbox::open(&path)?;
        let rec = outbox.next_pending()?.unwrap();
        assert_eq!(rec.record.license_text, "OLD1");
        assert_eq!(rec.record.location, Location::new(1.0, 2.0));
        outbox.mark_failed(rec.id, "bad")?;
        assert!(outbox.next_pending()?.is_none());
        Ok(())
    }

    #[test]
    fn connections_on_one_uri_share_records() -> Result<()> {
        let uri = shared_memory_uri();
        let mut writer = SqliteOutbox::open(&uri)?;
        let mut reader = SqliteOutbox::open(&uri)?;
        let id = writer.insert(&candidate("XYZ789", "20240301_120000"))?;
        assert_eq!(reader.next_pending()?.unwrap().id, id);
        reader.mark_sent(id)?;
        assert!(writer.next_pending()?.is_none());
        Ok(())
    }

    #[test]
    fn status_parses_from_cli_text() {
        assert_eq!("Failed".parse::<DeliveryStatus>().unwrap(), DeliveryStatus::Failed);
        assert!("lost".parse::<DeliveryStatus>().is_err());
    }
}
