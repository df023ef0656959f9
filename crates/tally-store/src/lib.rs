//! tally-store: SQLite persistence for the attendance engine.
//!
//! One row per principal carries presence (`opened_at_ms`, NULL when
//! closed) and a `version` counter. Ledger days live in
//! `session_intervals` with their timings in a child table. A presence
//! flip and the ledger days it produced are written in one transaction,
//! guarded by `UPDATE … WHERE version = ?`.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use tally_core::{
    Embedding, Ledger, LedgerUpdate, Presence, Principal, PrincipalId, PrincipalKind, RosterEntry,
    SessionInterval, Timing,
};
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("principal {principal} changed concurrently (expected version {expected})")]
    VersionConflict { principal: PrincipalId, expected: u64 },
    #[error("principal not found: {0}")]
    NotFound(PrincipalId),
    #[error("a subject with contact {0:?} already exists")]
    DuplicateContact(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS principals (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    contact TEXT NOT NULL,
    supervisor_id TEXT REFERENCES principals(id) ON DELETE CASCADE,
    opened_at_ms INTEGER,
    version INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER DEFAULT (unixepoch())
);
CREATE INDEX IF NOT EXISTS idx_principals_supervisor ON principals(supervisor_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_principals_subject_contact
    ON principals(contact) WHERE kind = 'subject' AND contact <> '';

-- Reference embeddings (little-endian f32)
CREATE TABLE IF NOT EXISTS reference_embeddings (
    id INTEGER PRIMARY KEY,
    principal_id TEXT NOT NULL REFERENCES principals(id) ON DELETE CASCADE,
    dim INTEGER NOT NULL,
    vector BLOB NOT NULL,
    model_version TEXT,
    created_at INTEGER DEFAULT (unixepoch())
);
CREATE INDEX IF NOT EXISTS idx_refs_principal ON reference_embeddings(principal_id, id);

-- One row per (principal, calendar day); seq is first-touched order
CREATE TABLE IF NOT EXISTS session_intervals (
    principal_id TEXT NOT NULL REFERENCES principals(id) ON DELETE CASCADE,
    day TEXT NOT NULL,
    seq INTEGER NOT NULL,
    online_ms INTEGER NOT NULL,
    PRIMARY KEY (principal_id, day)
);

CREATE TABLE IF NOT EXISTS timings (
    principal_id TEXT NOT NULL,
    day TEXT NOT NULL,
    idx INTEGER NOT NULL,
    start_ms INTEGER NOT NULL,
    end_ms INTEGER NOT NULL,
    continues INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (principal_id, day, idx),
    FOREIGN KEY (principal_id, day)
        REFERENCES session_intervals(principal_id, day) ON DELETE CASCADE
);
"#;

const DAY_FORMAT: &str = "%Y-%m-%d";

// =============================================================================
// Row types
// =============================================================================

struct PrincipalRow {
    id: String,
    kind: String,
    name: String,
    contact: String,
    supervisor_id: Option<String>,
    opened_at_ms: Option<i64>,
    version: i64,
}

impl PrincipalRow {
    const COLUMNS: &'static str = "id, kind, name, contact, supervisor_id, opened_at_ms, version";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            name: row.get(2)?,
            contact: row.get(3)?,
            supervisor_id: row.get(4)?,
            opened_at_ms: row.get(5)?,
            version: row.get(6)?,
        })
    }
}

struct IntervalRow {
    day: String,
    online_ms: i64,
}

struct TimingRow {
    day: String,
    start_ms: i64,
    end_ms: i64,
    continues: bool,
}

struct ReferenceRow {
    principal_id: String,
    vector: Vec<u8>,
    model_version: Option<String>,
}

/// A write or guard that found a different version than expected.
struct Rejected {
    principal: PrincipalId,
    expected: u64,
}

// =============================================================================
// Conversion functions
// =============================================================================

fn parse_id(s: &str) -> Result<PrincipalId, StoreError> {
    s.parse()
        .map_err(|e| StoreError::Corrupt(format!("principal id {s:?}: {e}")))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms} out of range")))
}

fn parse_day(s: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(s, DAY_FORMAT).map_err(|e| StoreError::Corrupt(format!("day {s:?}: {e}")))
}

fn row_to_principal(row: PrincipalRow) -> Result<Principal, StoreError> {
    let kind = PrincipalKind::parse(&row.kind)
        .ok_or_else(|| StoreError::Corrupt(format!("principal kind {:?}", row.kind)))?;
    let presence = match row.opened_at_ms {
        Some(ms) => Presence::Open {
            opened_at: from_millis(ms)?,
        },
        None => Presence::Closed,
    };
    Ok(Principal {
        id: parse_id(&row.id)?,
        kind,
        name: row.name,
        contact: row.contact,
        supervisor: row.supervisor_id.as_deref().map(parse_id).transpose()?,
        presence,
        version: row.version as u64,
    })
}

fn rows_to_ledger(intervals: Vec<IntervalRow>, timings: Vec<TimingRow>) -> Result<Ledger, StoreError> {
    let mut by_day: HashMap<String, Vec<Timing>> = HashMap::new();
    for t in timings {
        by_day.entry(t.day).or_default().push(Timing {
            start: from_millis(t.start_ms)?,
            end: from_millis(t.end_ms)?,
            continues: t.continues,
        });
    }

    let intervals = intervals
        .into_iter()
        .map(|row| {
            Ok(SessionInterval {
                day: parse_day(&row.day)?,
                timings: by_day.remove(&row.day).unwrap_or_default(),
                online_ms: row.online_ms,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

    Ok(Ledger::from_intervals(intervals))
}

// =============================================================================
// Commit description
// =============================================================================

/// New presence and ledger days for one principal.
#[derive(Debug, Clone)]
pub struct PrincipalWrite {
    pub principal: PrincipalId,
    /// Version the caller read; the write is rejected if it moved.
    pub expected_version: u64,
    pub presence: Presence,
    /// Ledger days to upsert, each with its first-touched position.
    pub days: Vec<(usize, SessionInterval)>,
}

impl PrincipalWrite {
    /// Presence-only write based on the loaded record.
    pub fn new(principal: &Principal, presence: Presence) -> Self {
        Self {
            principal: principal.id,
            expected_version: principal.version,
            presence,
            days: Vec::new(),
        }
    }

    /// Attach the days touched by a ledger update.
    pub fn with_ledger(mut self, update: &LedgerUpdate) -> Self {
        self.days = update
            .touched_intervals()
            .map(|(pos, interval)| (pos, interval.clone()))
            .collect();
        self
    }
}

/// Everything written by one mark, applied all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct Commit {
    pub writes: Vec<PrincipalWrite>,
    /// Principals that must still be at the given version but are not
    /// written (a subject mark pins its supervisor's period this way).
    pub guards: Vec<(PrincipalId, u64)>,
}

impl Commit {
    pub fn single(write: PrincipalWrite) -> Self {
        Self {
            writes: vec![write],
            guards: Vec::new(),
        }
    }

    pub fn push(&mut self, write: PrincipalWrite) {
        self.writes.push(write);
    }

    pub fn guard(mut self, principal: &Principal) -> Self {
        self.guards.push((principal.id, principal.version));
        self
    }
}

/// Row counts reported by the daemon status call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub supervisors: usize,
    pub subjects: usize,
    pub references: usize,
    pub open: usize,
}

// =============================================================================
// Store
// =============================================================================

/// Async handle to the attendance database.
#[derive(Clone)]
pub struct AttendanceStore {
    conn: Connection,
}

impl AttendanceStore {
    /// Open or create a database at the given path.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref().to_path_buf()).await?;
        Self::init(conn).await
    }

    /// Create an in-memory database (for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    // =========================================================================
    // Principals
    // =========================================================================

    /// Insert a newly enrolled principal together with its reference
    /// embeddings.
    ///
    /// Subject contacts are unique; a taken one fails with
    /// [`StoreError::DuplicateContact`] and nothing is written.
    pub async fn insert_principal(&self, principal: &Principal, references: &[Embedding]) -> Result<(), StoreError> {
        let id = principal.id.to_string();
        let kind = principal.kind.as_str();
        let name = principal.name.clone();
        let contact = principal.contact.clone();
        let supervisor = principal.supervisor.map(|s| s.to_string());
        let opened_at = principal.presence.opened_at().map(|t| t.timestamp_millis());
        let version = principal.version as i64;
        let refs: Vec<(i64, Vec<u8>, Option<String>)> = references
            .iter()
            .map(|e| (e.dim() as i64, e.to_le_bytes(), e.model_version.clone()))
            .collect();
        let unique_contact = principal.kind == PrincipalKind::Subject && !principal.contact.is_empty();

        let inserted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                if unique_contact {
                    let taken = tx
                        .query_row(
                            "SELECT 1 FROM principals WHERE kind = 'subject' AND contact = ?1",
                            params![contact],
                            |_| Ok(true),
                        )
                        .optional()?
                        .unwrap_or(false);
                    if taken {
                        return Ok(false);
                    }
                }
                tx.execute(
                    "INSERT INTO principals (id, kind, name, contact, supervisor_id, opened_at_ms, version)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![id, kind, name, contact, supervisor, opened_at, version],
                )?;
                for (dim, blob, model) in &refs {
                    tx.execute(
                        "INSERT INTO reference_embeddings (principal_id, dim, vector, model_version)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![id, dim, blob, model],
                    )?;
                }
                tx.commit()?;
                Ok(true)
            })
            .await?;
        if !inserted {
            return Err(StoreError::DuplicateContact(principal.contact.clone()));
        }
        tracing::debug!(principal = %principal.id, kind, references = references.len(), "principal inserted");
        Ok(())
    }

    /// Load one principal.
    pub async fn principal(&self, id: PrincipalId) -> Result<Option<Principal>, StoreError> {
        let key = id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        &format!("SELECT {} FROM principals WHERE id = ?1", PrincipalRow::COLUMNS),
                        params![key],
                        PrincipalRow::from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        row.map(row_to_principal).transpose()
    }

    /// All subjects of a supervisor, in enrollment order.
    pub async fn subjects(&self, supervisor: PrincipalId) -> Result<Vec<Principal>, StoreError> {
        self.query_principals(
            format!(
                "SELECT {} FROM principals WHERE supervisor_id = ?1 ORDER BY rowid",
                PrincipalRow::COLUMNS
            ),
            supervisor,
        )
        .await
    }

    /// The subject on a supervisor's roster with the given contact.
    pub async fn subject_by_contact(
        &self,
        supervisor: PrincipalId,
        contact: &str,
    ) -> Result<Option<Principal>, StoreError> {
        let key = supervisor.to_string();
        let contact = contact.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        &format!(
                            "SELECT {} FROM principals
                             WHERE supervisor_id = ?1 AND kind = 'subject' AND contact = ?2",
                            PrincipalRow::COLUMNS
                        ),
                        params![key, contact],
                        PrincipalRow::from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;
        row.map(row_to_principal).transpose()
    }

    /// Subjects of a supervisor that are currently open.
    pub async fn open_subjects(&self, supervisor: PrincipalId) -> Result<Vec<Principal>, StoreError> {
        self.query_principals(
            format!(
                "SELECT {} FROM principals
                 WHERE supervisor_id = ?1 AND opened_at_ms IS NOT NULL ORDER BY rowid",
                PrincipalRow::COLUMNS
            ),
            supervisor,
        )
        .await
    }

    async fn query_principals(&self, sql: String, supervisor: PrincipalId) -> Result<Vec<Principal>, StoreError> {
        let key = supervisor.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![key], PrincipalRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(row_to_principal).collect()
    }

    /// Delete a principal. References, ledger days and (for a supervisor)
    /// subjects go with it.
    pub async fn remove_principal(&self, id: PrincipalId) -> Result<bool, StoreError> {
        let key = id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM principals WHERE id = ?1", params![key])?;
                Ok(n > 0)
            })
            .await?;
        if removed {
            tracing::info!(principal = %id, "principal removed");
        }
        Ok(removed)
    }

    // =========================================================================
    // Reference embeddings
    // =========================================================================

    /// Append a reference embedding. Returns the number of references the
    /// principal now has.
    pub async fn add_reference(&self, id: PrincipalId, embedding: &Embedding) -> Result<usize, StoreError> {
        let key = id.to_string();
        let dim = embedding.dim() as i64;
        let blob = embedding.to_le_bytes();
        let model = embedding.model_version.clone();

        let count = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let exists: bool = tx
                    .query_row("SELECT 1 FROM principals WHERE id = ?1", params![key], |_| Ok(true))
                    .optional()?
                    .unwrap_or(false);
                if !exists {
                    return Ok(None);
                }
                tx.execute(
                    "INSERT INTO reference_embeddings (principal_id, dim, vector, model_version)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![key, dim, blob, model],
                )?;
                let count: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM reference_embeddings WHERE principal_id = ?1",
                    params![key],
                    |row| row.get(0),
                )?;
                tx.commit()?;
                Ok(Some(count as usize))
            })
            .await?;

        count.ok_or(StoreError::NotFound(id))
    }

    /// Read-only snapshot of every reference embedding of a supervisor's
    /// subjects, ordered by enrollment then reference insertion.
    pub async fn roster(&self, supervisor: PrincipalId) -> Result<Vec<RosterEntry>, StoreError> {
        let key = supervisor.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT r.principal_id, r.vector, r.model_version
                     FROM reference_embeddings r
                     JOIN principals p ON p.id = r.principal_id
                     WHERE p.supervisor_id = ?1
                     ORDER BY p.rowid, r.id",
                )?;
                let rows = stmt
                    .query_map(params![key], |row| {
                        Ok(ReferenceRow {
                            principal_id: row.get(0)?,
                            vector: row.get(1)?,
                            model_version: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|row| {
                let embedding = Embedding::from_le_bytes(&row.vector, row.model_version)
                    .ok_or_else(|| StoreError::Corrupt(format!("embedding blob of {} bytes", row.vector.len())))?;
                Ok(RosterEntry {
                    principal: parse_id(&row.principal_id)?,
                    embedding,
                })
            })
            .collect()
    }

    // =========================================================================
    // Ledger
    // =========================================================================

    /// Full ledger of a principal, days in first-touched order.
    pub async fn ledger(&self, id: PrincipalId) -> Result<Ledger, StoreError> {
        let key = id.to_string();
        let (intervals, timings) = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT day, online_ms FROM session_intervals WHERE principal_id = ?1 ORDER BY seq",
                )?;
                let intervals = stmt
                    .query_map(params![key], |row| {
                        Ok(IntervalRow {
                            day: row.get(0)?,
                            online_ms: row.get(1)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut stmt = conn.prepare(
                    "SELECT day, start_ms, end_ms, continues FROM timings
                     WHERE principal_id = ?1 ORDER BY day, idx",
                )?;
                let timings = stmt
                    .query_map(params![key], |row| {
                        Ok(TimingRow {
                            day: row.get(0)?,
                            start_ms: row.get(1)?,
                            end_ms: row.get(2)?,
                            continues: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((intervals, timings))
            })
            .await?;

        rows_to_ledger(intervals, timings)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Apply a commit in one transaction.
    ///
    /// Guards are checked first. Each write then bumps the principal's
    /// version only if it still equals `expected_version`. Any mismatch
    /// rolls the whole commit back with [`StoreError::VersionConflict`].
    pub async fn commit(&self, commit: Commit) -> Result<(), StoreError> {
        let Commit { writes, guards } = commit;
        let count = writes.len();

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                for (principal, expected) in &guards {
                    let current: Option<i64> = tx
                        .query_row(
                            "SELECT version FROM principals WHERE id = ?1",
                            params![principal.to_string()],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if current != Some(*expected as i64) {
                        return Ok(Err(Rejected {
                            principal: *principal,
                            expected: *expected,
                        }));
                    }
                }

                for write in &writes {
                    let key = write.principal.to_string();
                    let opened_at = write.presence.opened_at().map(|t| t.timestamp_millis());
                    let changed = tx.execute(
                        "UPDATE principals SET opened_at_ms = ?1, version = version + 1
                         WHERE id = ?2 AND version = ?3",
                        params![opened_at, key, write.expected_version as i64],
                    )?;
                    if changed != 1 {
                        // Dropping `tx` rolls back every write made so far.
                        return Ok(Err(Rejected {
                            principal: write.principal,
                            expected: write.expected_version,
                        }));
                    }

                    for (seq, interval) in &write.days {
                        let day = interval.day.format(DAY_FORMAT).to_string();
                        tx.execute(
                            "INSERT INTO session_intervals (principal_id, day, seq, online_ms)
                             VALUES (?1, ?2, ?3, ?4)
                             ON CONFLICT(principal_id, day) DO UPDATE SET online_ms = excluded.online_ms",
                            params![key, day, *seq as i64, interval.online_ms],
                        )?;
                        tx.execute(
                            "DELETE FROM timings WHERE principal_id = ?1 AND day = ?2",
                            params![key, day],
                        )?;
                        for (idx, timing) in interval.timings.iter().enumerate() {
                            tx.execute(
                                "INSERT INTO timings (principal_id, day, idx, start_ms, end_ms, continues)
                                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                                params![
                                    key,
                                    day,
                                    idx as i64,
                                    timing.start.timestamp_millis(),
                                    timing.end.timestamp_millis(),
                                    timing.continues,
                                ],
                            )?;
                        }
                    }
                }

                tx.commit()?;
                Ok(Ok(()))
            })
            .await?;

        match outcome {
            Ok(()) => {
                tracing::debug!(writes = count, "commit applied");
                Ok(())
            }
            Err(rejected) => {
                tracing::warn!(
                    principal = %rejected.principal,
                    expected = rejected.expected,
                    "commit rejected by version guard"
                );
                Err(StoreError::VersionConflict {
                    principal: rejected.principal,
                    expected: rejected.expected,
                })
            }
        }
    }

    /// Row counts for status reporting.
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let stats = self
            .conn
            .call(|conn| {
                let count = |sql: &str| -> rusqlite::Result<usize> {
                    conn.query_row(sql, [], |row| row.get::<_, i64>(0)).map(|n| n as usize)
                };
                Ok(StoreStats {
                    supervisors: count("SELECT COUNT(*) FROM principals WHERE kind = 'supervisor'")?,
                    subjects: count("SELECT COUNT(*) FROM principals WHERE kind = 'subject'")?,
                    references: count("SELECT COUNT(*) FROM reference_embeddings")?,
                    open: count("SELECT COUNT(*) FROM principals WHERE opened_at_ms IS NOT NULL")?,
                })
            })
            .await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    async fn seeded() -> (AttendanceStore, Principal, Principal) {
        let store = AttendanceStore::in_memory().await.unwrap();
        let sup = Principal::new_supervisor("Ada", "ada@example.com");
        let sub = Principal::new_subject(sup.id, "Bob", "bob@example.com");
        store.insert_principal(&sup, &[]).await.unwrap();
        store.insert_principal(&sub, &[]).await.unwrap();
        (store, sup, sub)
    }

    #[tokio::test]
    async fn test_insert_and_load_principal() {
        let (store, sup, sub) = seeded().await;
        let loaded = store.principal(sub.id).await.unwrap().unwrap();
        assert_eq!(loaded, sub);
        assert_eq!(loaded.supervisor, Some(sup.id));
        assert!(store.principal(PrincipalId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_then_close_commit() {
        let (store, _sup, sub) = seeded().await;

        let opened = Presence::Open {
            opened_at: ts("2024-01-01T23:00:00Z"),
        };
        store.commit(Commit::single(PrincipalWrite::new(&sub, opened))).await.unwrap();
        let after_open = store.principal(sub.id).await.unwrap().unwrap();
        assert_eq!(after_open.presence, opened);
        assert_eq!(after_open.version, 1);

        let update = store
            .ledger(sub.id)
            .await
            .unwrap()
            .with_interval(ts("2024-01-01T23:00:00Z"), ts("2024-01-02T01:00:00Z"), &utc())
            .unwrap();
        store
            .commit(Commit::single(PrincipalWrite::new(&after_open, Presence::Closed).with_ledger(&update)))
            .await
            .unwrap();

        let after_close = store.principal(sub.id).await.unwrap().unwrap();
        assert_eq!(after_close.presence, Presence::Closed);
        assert_eq!(after_close.version, 2);

        let ledger = store.ledger(sub.id).await.unwrap();
        assert_eq!(ledger, update.ledger);
        assert_eq!(ledger.total_online_ms(), 7_200_000);
        assert!(ledger.intervals()[0].timings[0].continues);
    }

    #[tokio::test]
    async fn test_same_day_appends_are_persisted_in_order() {
        let (store, _sup, sub) = seeded().await;
        let mut current = sub.clone();
        for (start, end) in [
            ("2024-01-03T09:00:00Z", "2024-01-03T10:00:00Z"),
            ("2024-01-01T09:00:00Z", "2024-01-01T09:30:00Z"),
            ("2024-01-03T11:00:00Z", "2024-01-03T11:15:00Z"),
        ] {
            let update = store
                .ledger(sub.id)
                .await
                .unwrap()
                .with_interval(ts(start), ts(end), &utc())
                .unwrap();
            store
                .commit(Commit::single(PrincipalWrite::new(&current, Presence::Closed).with_ledger(&update)))
                .await
                .unwrap();
            current = store.principal(sub.id).await.unwrap().unwrap();
        }

        let ledger = store.ledger(sub.id).await.unwrap();
        let days: Vec<String> = ledger.intervals().iter().map(|i| i.day.to_string()).collect();
        assert_eq!(days, vec!["2024-01-03", "2024-01-01"]);
        assert_eq!(ledger.intervals()[0].timings.len(), 2);
        assert_eq!(ledger.intervals()[0].online_ms, 4_500_000);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected_without_partial_write() {
        let (store, sup, sub) = seeded().await;
        let opened = Presence::Open {
            opened_at: ts("2024-01-01T09:00:00Z"),
        };
        store.commit(Commit::single(PrincipalWrite::new(&sub, opened))).await.unwrap();

        // Both writes are based on stale/fresh reads; the stale one poisons the commit.
        let update = Ledger::new()
            .with_interval(ts("2024-01-01T09:00:00Z"), ts("2024-01-01T10:00:00Z"), &utc())
            .unwrap();
        let mut commit = Commit::single(PrincipalWrite::new(&sup, opened));
        commit.push(PrincipalWrite::new(&sub, Presence::Closed).with_ledger(&update));

        let err = store.commit(commit).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { principal, expected: 0 } if principal == sub.id));

        // Supervisor write rolled back; subject untouched.
        assert_eq!(store.principal(sup.id).await.unwrap().unwrap().presence, Presence::Closed);
        let sub_now = store.principal(sub.id).await.unwrap().unwrap();
        assert_eq!(sub_now.presence, opened);
        assert_eq!(sub_now.version, 1);
        assert!(store.ledger(sub.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_roster_orders_by_enrollment() {
        let (store, sup, first) = seeded().await;
        let second = Principal::new_subject(sup.id, "Cy", "cy@example.com");
        store.insert_principal(&second, &[]).await.unwrap();

        store.add_reference(second.id, &Embedding::new(vec![0.0, 1.0])).await.unwrap();
        store.add_reference(first.id, &Embedding::new(vec![1.0, 0.0])).await.unwrap();
        let n = store
            .add_reference(
                first.id,
                &Embedding {
                    values: vec![0.7, 0.7],
                    model_version: Some("facenet".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(n, 2);

        let roster = store.roster(sup.id).await.unwrap();
        let ids: Vec<PrincipalId> = roster.iter().map(|e| e.principal).collect();
        assert_eq!(ids, vec![first.id, first.id, second.id]);
        assert_eq!(roster[1].embedding.model_version.as_deref(), Some("facenet"));
        assert_eq!(roster[2].embedding.values, vec![0.0, 1.0]);

        // A different supervisor sees nobody.
        assert!(store.roster(PrincipalId::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_reference_unknown_principal() {
        let store = AttendanceStore::in_memory().await.unwrap();
        let id = PrincipalId::new();
        let err = store.add_reference(id, &Embedding::new(vec![1.0])).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(p) if p == id));
    }

    #[tokio::test]
    async fn test_open_subjects_and_stats() {
        let (store, sup, sub) = seeded().await;
        let other = Principal::new_subject(sup.id, "Cy", "cy@example.com");
        store.insert_principal(&other, &[]).await.unwrap();
        store
            .commit(Commit::single(PrincipalWrite::new(
                &other,
                Presence::Open {
                    opened_at: ts("2024-01-01T09:00:00Z"),
                },
            )))
            .await
            .unwrap();

        let open: Vec<PrincipalId> = store.open_subjects(sup.id).await.unwrap().iter().map(|p| p.id).collect();
        assert_eq!(open, vec![other.id]);
        assert_eq!(store.subjects(sup.id).await.unwrap().len(), 2);

        store.add_reference(sub.id, &Embedding::new(vec![1.0, 0.0])).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats,
            StoreStats {
                supervisors: 1,
                subjects: 2,
                references: 1,
                open: 1
            }
        );
    }

    #[tokio::test]
    async fn test_remove_supervisor_cascades() {
        let (store, sup, sub) = seeded().await;
        store.add_reference(sub.id, &Embedding::new(vec![1.0, 0.0])).await.unwrap();
        let update = Ledger::new()
            .with_interval(ts("2024-01-01T09:00:00Z"), ts("2024-01-01T10:00:00Z"), &utc())
            .unwrap();
        store
            .commit(Commit::single(PrincipalWrite::new(&sub, Presence::Closed).with_ledger(&update)))
            .await
            .unwrap();

        assert!(store.remove_principal(sup.id).await.unwrap());
        assert!(store.principal(sub.id).await.unwrap().is_none());
        assert!(store.ledger(sub.id).await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap(), StoreStats::default());
        assert!(!store.remove_principal(sup.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_insert_with_references_is_atomic() {
        let store = AttendanceStore::in_memory().await.unwrap();
        let sup = Principal::new_supervisor("Ada", "ada@example.com");
        store.insert_principal(&sup, &[]).await.unwrap();
        let sub = Principal::new_subject(sup.id, "Bob", "bob@example.com");
        store
            .insert_principal(&sub, &[Embedding::new(vec![1.0, 0.0]), Embedding::new(vec![0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(store.roster(sup.id).await.unwrap().len(), 2);

        // Duplicate id fails and leaves no extra references behind.
        assert!(store.insert_principal(&sub, &[Embedding::new(vec![0.5, 0.5])]).await.is_err());
        assert_eq!(store.roster(sup.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_guard_rejects_moved_supervisor() {
        let (store, sup, sub) = seeded().await;
        let opened = Presence::Open {
            opened_at: ts("2024-01-01T09:00:00Z"),
        };
        // Supervisor moves on after the subject mark read it.
        store.commit(Commit::single(PrincipalWrite::new(&sup, opened))).await.unwrap();

        let err = store
            .commit(Commit::single(PrincipalWrite::new(&sub, opened)).guard(&sup))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { principal, .. } if principal == sup.id));
        assert_eq!(store.principal(sub.id).await.unwrap().unwrap().presence, Presence::Closed);

        // With a fresh read the guard passes and does not bump the supervisor.
        let fresh = store.principal(sup.id).await.unwrap().unwrap();
        store
            .commit(Commit::single(PrincipalWrite::new(&sub, opened)).guard(&fresh))
            .await
            .unwrap();
        assert_eq!(store.principal(sup.id).await.unwrap().unwrap().version, fresh.version);
    }

    #[tokio::test]
    async fn test_subject_contact_is_unique() {
        let (store, sup, _sub) = seeded().await;
        let clash = Principal::new_subject(sup.id, "Bobby", "bob@example.com");
        let err = store
            .insert_principal(&clash, &[Embedding::new(vec![1.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateContact(ref c) if c == "bob@example.com"));
        assert!(store.principal(clash.id).await.unwrap().is_none());
        assert!(store.roster(sup.id).await.unwrap().is_empty());

        // Blank contacts never clash, and supervisors may share a subject's contact.
        store.insert_principal(&Principal::new_subject(sup.id, "Cy", ""), &[]).await.unwrap();
        store.insert_principal(&Principal::new_subject(sup.id, "Di", ""), &[]).await.unwrap();
        store
            .insert_principal(&Principal::new_supervisor("Bob Sr.", "bob@example.com"), &[])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subject_by_contact_stays_on_roster() {
        let (store, sup, sub) = seeded().await;
        let found = store.subject_by_contact(sup.id, "bob@example.com").await.unwrap();
        assert_eq!(found.map(|p| p.id), Some(sub.id));
        assert!(store.subject_by_contact(sup.id, "nobody@example.com").await.unwrap().is_none());

        // Another supervisor cannot reach Bob by contact.
        let other = Principal::new_supervisor("Cy", "cy@example.com");
        store.insert_principal(&other, &[]).await.unwrap();
        assert!(store.subject_by_contact(other.id, "bob@example.com").await.unwrap().is_none());
        // Supervisors themselves are not subjects.
        assert!(store.subject_by_contact(sup.id, "ada@example.com").await.unwrap().is_none());
    }
}
