//! SQLite-backed cadence store: quotes, contacts, cadence events and
//! follow-up tasks.
//!
//! Every state change that has to be atomic is a single transaction here.
//! The claim is one conditional `UPDATE ... RETURNING` inside an IMMEDIATE
//! transaction; SQLite serializes writers, so concurrent runners sharing the
//! database file partition due rows instead of double-claiming them.
//! Resolutions are conditional on `status = 'claimed' AND claimed_by = me`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use ritmo_core::error::{Result, RitmoError};
use ritmo_core::traits::ContactDirectory;
use ritmo_core::types::{
    BusinessStatus, CadenceEvent, CancelReason, Contact, EventStatus, EventType, FollowUpTask,
    Priority, Quote, RitmoStage, TaskKind, TaskStatus,
};

use crate::stages;

/// Shared SELECT column lists: single source of truth for the row mappers.
const EVENT_COLUMNS: &str = "id, quote_id, organization_id, cadence_run_id, event_type, scheduled_for, status, priority, claimed_at, claimed_by, processed_at, cancel_reason, attempts, last_error";
const QUOTE_COLUMNS: &str = "id, organization_id, title, business_status, ritmo_stage, cadence_run_id, first_sent_at, value, last_activity_at";
const TASK_COLUMNS: &str = "id, quote_id, event_id, kind, title, description, priority, due_at, status, created_at, completed_at";

/// One event of a run about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub event_type: EventType,
    pub scheduled_for: DateTime<Utc>,
    pub priority: Option<Priority>,
}

/// A manual task about to be created for an event.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub kind: TaskKind,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub due_at: DateTime<Utc>,
}

/// Result of writing a new cadence run.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RunWrite {
    pub run_id: i64,
    pub events_created: usize,
    pub cancelled_previous: usize,
}

/// Abandoned claims handled at the start of a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reclaimed {
    /// Current-run events returned to `scheduled`.
    pub requeued: usize,
    /// Events of a replaced run, cancelled as `resent`.
    pub cancelled_stale: usize,
}

impl Reclaimed {
    pub fn total(&self) -> usize {
        self.requeued + self.cancelled_stale
    }
}

/// Result of resolving a claimed event.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Applied {
        next_stage: Option<RitmoStage>,
        task_id: Option<String>,
    },
    /// The claim was no longer ours (lease expired and was taken over, or
    /// the row moved on). Nothing was written.
    LostClaim,
}

/// Result of recording a failed automatic send.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureResolution {
    /// Back to `scheduled` for another pass.
    Released { attempts: u32 },
    /// Out of attempts: completed and handed to a human.
    Downgraded {
        task_id: String,
        next_stage: Option<RitmoStage>,
    },
    LostClaim,
}

/// SQLite cadence store.
pub struct CadenceDb {
    conn: Mutex<Connection>,
}

fn db_err(context: &'static str) -> impl FnOnce(rusqlite::Error) -> RitmoError {
    move |e| RitmoError::Database(format!("{context}: {e}"))
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(idx, &s)).transpose()
}

fn parse_enum<T: FromStr<Err = RitmoError>>(idx: usize, s: &str) -> rusqlite::Result<T> {
    s.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<CadenceEvent> {
    Ok(CadenceEvent {
        id: row.get(0)?,
        quote_id: row.get(1)?,
        organization_id: row.get(2)?,
        cadence_run_id: row.get(3)?,
        event_type: parse_enum(4, &row.get::<_, String>(4)?)?,
        scheduled_for: parse_ts(5, &row.get::<_, String>(5)?)?,
        status: parse_enum(6, &row.get::<_, String>(6)?)?,
        priority: row
            .get::<_, Option<String>>(7)?
            .map(|s| parse_enum(7, &s))
            .transpose()?,
        claimed_at: parse_opt_ts(8, row.get(8)?)?,
        claimed_by: row.get(9)?,
        processed_at: parse_opt_ts(10, row.get(10)?)?,
        cancel_reason: row
            .get::<_, Option<String>>(11)?
            .map(|s| parse_enum(11, &s))
            .transpose()?,
        attempts: row.get(12)?,
        last_error: row.get(13)?,
    })
}

fn row_to_quote(row: &rusqlite::Row) -> rusqlite::Result<Quote> {
    Ok(Quote {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        title: row.get(2)?,
        business_status: parse_enum(3, &row.get::<_, String>(3)?)?,
        ritmo_stage: parse_enum(4, &row.get::<_, String>(4)?)?,
        cadence_run_id: row.get(5)?,
        first_sent_at: parse_opt_ts(6, row.get(6)?)?,
        value: row.get(7)?,
        last_activity_at: parse_opt_ts(8, row.get(8)?)?,
    })
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<FollowUpTask> {
    Ok(FollowUpTask {
        id: row.get(0)?,
        quote_id: row.get(1)?,
        event_id: row.get(2)?,
        kind: parse_enum(3, &row.get::<_, String>(3)?)?,
        title: row.get(4)?,
        description: row.get(5)?,
        priority: parse_enum(6, &row.get::<_, String>(6)?)?,
        due_at: parse_ts(7, &row.get::<_, String>(7)?)?,
        status: parse_enum(8, &row.get::<_, String>(8)?)?,
        created_at: parse_ts(9, &row.get::<_, String>(9)?)?,
        completed_at: parse_opt_ts(10, row.get(10)?)?,
    })
}

fn find_quote_in(conn: &Connection, quote_id: &str) -> Result<Option<Quote>> {
    conn.query_row(
        &format!("SELECT {QUOTE_COLUMNS} FROM quotes WHERE id = ?1"),
        params![quote_id],
        row_to_quote,
    )
    .optional()
    .map_err(db_err("Load quote"))
}

fn find_event_in(conn: &Connection, event_id: &str) -> Result<Option<CadenceEvent>> {
    conn.query_row(
        &format!("SELECT {EVENT_COLUMNS} FROM cadence_events WHERE id = ?1"),
        params![event_id],
        row_to_event,
    )
    .optional()
    .map_err(db_err("Load event"))
}

/// Advance the quote's stage after `event_type` of run `run_id` resolved.
/// No-op unless the quote is still `sent`, still on that run, and the move
/// is forward.
fn apply_cascade(
    conn: &Connection,
    quote_id: &str,
    run_id: i64,
    event_type: EventType,
    now: DateTime<Utc>,
) -> Result<Option<RitmoStage>> {
    let Some(quote) = find_quote_in(conn, quote_id)? else {
        return Ok(None);
    };
    if quote.cadence_run_id != run_id {
        tracing::debug!(
            "quote {quote_id}: run {run_id} event resolved after run {} started, stage kept",
            quote.cadence_run_id
        );
        return Ok(None);
    }
    let next = stages::advance(quote.business_status, quote.ritmo_stage, event_type);
    if let Some(stage) = next {
        conn.execute(
            "UPDATE quotes SET ritmo_stage = ?2, last_activity_at = ?3 WHERE id = ?1",
            params![quote_id, stage.as_str(), ts(now)],
        )
        .map_err(db_err("Advance stage"))?;
        tracing::debug!("quote {quote_id}: {} → {}", quote.ritmo_stage, stage);
    }
    Ok(next)
}

fn insert_task(
    conn: &Connection,
    quote_id: &str,
    event_id: Option<&str>,
    task: &NewTask,
    now: DateTime<Utc>,
) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO follow_up_tasks
         (id, quote_id, event_id, kind, title, description, priority, due_at, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9)",
        params![
            id,
            quote_id,
            event_id,
            task.kind.as_str(),
            task.title,
            task.description,
            task.priority.as_str(),
            ts(task.due_at),
            ts(now),
        ],
    )
    .map_err(db_err("Create task"))?;
    Ok(id)
}

/// Cancel every `scheduled` event of a quote and stop its cadence.
fn cancel_scheduled_in(
    conn: &Connection,
    quote_id: &str,
    reason: CancelReason,
    now: DateTime<Utc>,
) -> Result<usize> {
    let cancelled = conn
        .execute(
            "UPDATE cadence_events SET status = 'cancelled', cancel_reason = ?2
             WHERE quote_id = ?1 AND status = 'scheduled'",
            params![quote_id, reason.as_str()],
        )
        .map_err(db_err("Cancel pending events"))?;
    conn.execute(
        "UPDATE quotes SET ritmo_stage = 'stopped', last_activity_at = ?2 WHERE id = ?1",
        params![quote_id, ts(now)],
    )
    .map_err(db_err("Stop cadence"))?;
    Ok(cancelled)
}

impl CadenceDb {
    /// Open or create the cadence database.
    pub fn open(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {busy_timeout_ms};
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;"
        ))
        .map_err(db_err("DB pragma"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(db_err("DB pragma"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| RitmoError::Database("connection lock poisoned".into()))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            -- Quotes (owned by the application; the engine touches a subset)
            CREATE TABLE IF NOT EXISTS quotes (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                business_status TEXT NOT NULL DEFAULT 'draft',
                ritmo_stage TEXT NOT NULL DEFAULT 'none',
                cadence_run_id INTEGER NOT NULL DEFAULT 0,
                first_sent_at TEXT,
                value REAL NOT NULL DEFAULT 0,
                last_activity_at TEXT
            );

            -- Quote contact (read through ContactDirectory)
            CREATE TABLE IF NOT EXISTS quote_contacts (
                quote_id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                email TEXT,
                phone TEXT
            );

            -- Cadence events: 4 per run, never deleted
            CREATE TABLE IF NOT EXISTS cadence_events (
                id TEXT PRIMARY KEY,
                quote_id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                cadence_run_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,        -- email_d1, email_d3, call_d7, email_d14
                scheduled_for TEXT NOT NULL,     -- RFC 3339 UTC, millis
                status TEXT NOT NULL DEFAULT 'scheduled',
                priority TEXT,                   -- HIGH / LOW, call_d7 only
                claimed_at TEXT,
                claimed_by TEXT,
                processed_at TEXT,
                cancel_reason TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (quote_id, cadence_run_id, event_type)
            );
            CREATE INDEX IF NOT EXISTS idx_cadence_events_due
                ON cadence_events (status, scheduled_for);
            CREATE INDEX IF NOT EXISTS idx_cadence_events_quote
                ON cadence_events (quote_id, status);

            -- Manual follow-up tasks; at most one per event
            CREATE TABLE IF NOT EXISTS follow_up_tasks (
                id TEXT PRIMARY KEY,
                quote_id TEXT NOT NULL,
                event_id TEXT UNIQUE REFERENCES cadence_events(id),
                kind TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                priority TEXT NOT NULL DEFAULT 'LOW',
                due_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_follow_up_tasks_quote
                ON follow_up_tasks (quote_id, status);
         ",
            )
            .map_err(db_err("Migration"))?;
        Ok(())
    }

    // ─── Quotes & contacts ──────────────────────────────────────

    /// Insert or replace the engine-visible part of a quote.
    pub fn upsert_quote(&self, quote: &Quote) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT INTO quotes
                 (id, organization_id, title, business_status, ritmo_stage, cadence_run_id,
                  first_sent_at, value, last_activity_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    organization_id = excluded.organization_id,
                    title = excluded.title,
                    business_status = excluded.business_status,
                    ritmo_stage = excluded.ritmo_stage,
                    cadence_run_id = excluded.cadence_run_id,
                    first_sent_at = excluded.first_sent_at,
                    value = excluded.value,
                    last_activity_at = excluded.last_activity_at",
                params![
                    quote.id,
                    quote.organization_id,
                    quote.title,
                    quote.business_status.as_str(),
                    quote.ritmo_stage.as_str(),
                    quote.cadence_run_id,
                    quote.first_sent_at.map(ts),
                    quote.value,
                    quote.last_activity_at.map(ts),
                ],
            )
            .map_err(db_err("Save quote"))?;
        Ok(())
    }

    pub fn find_quote(&self, quote_id: &str) -> Result<Option<Quote>> {
        find_quote_in(&*self.lock()?, quote_id)
    }

    pub fn get_quote(&self, quote_id: &str) -> Result<Quote> {
        self.find_quote(quote_id)?
            .ok_or_else(|| RitmoError::QuoteNotFound(quote_id.to_string()))
    }

    /// Record a status change and, when the quote leaves `sent`, cancel its
    /// pending events and stop the cadence, all in one transaction. Returns
    /// how many events were cancelled.
    pub fn change_business_status(
        &self,
        quote_id: &str,
        status: BusinessStatus,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin status tx"))?;
        let changed = tx
            .execute(
                "UPDATE quotes SET business_status = ?2, last_activity_at = ?3 WHERE id = ?1",
                params![quote_id, status.as_str(), ts(now)],
            )
            .map_err(db_err("Update business status"))?;
        if changed == 0 {
            return Err(RitmoError::QuoteNotFound(quote_id.to_string()));
        }
        let cancelled = if status.is_followable() {
            0
        } else {
            cancel_scheduled_in(&tx, quote_id, CancelReason::StatusChanged, now)?
        };
        tx.commit().map_err(db_err("Commit status change"))?;
        Ok(cancelled)
    }

    pub fn upsert_contact(&self, quote_id: &str, contact: &Contact) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO quote_contacts (quote_id, name, email, phone)
                 VALUES (?1, ?2, ?3, ?4)",
                params![quote_id, contact.name, contact.email, contact.phone],
            )
            .map_err(db_err("Save contact"))?;
        Ok(())
    }

    pub fn find_contact(&self, quote_id: &str) -> Result<Option<Contact>> {
        self.lock()?
            .query_row(
                "SELECT name, email, phone FROM quote_contacts WHERE quote_id = ?1",
                params![quote_id],
                |row| {
                    Ok(Contact {
                        name: row.get(0)?,
                        email: row.get(1)?,
                        phone: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(db_err("Load contact"))
    }

    // ─── Cadence generation ──────────────────────────────────────

    /// Write a new run for a quote in one transaction: read the current run,
    /// cancel older `scheduled` events as `resent`, insert the drafts under
    /// `current + 1`, and mark the quote sent at stage `fup_d1`.
    pub fn write_cadence_run(
        &self,
        quote_id: &str,
        organization_id: &str,
        value: f64,
        sent_at: DateTime<Utc>,
        drafts: &[EventDraft],
        now: DateTime<Utc>,
    ) -> Result<RunWrite> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin run tx"))?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT cadence_run_id FROM quotes WHERE id = ?1",
                params![quote_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err("Read run id"))?;
        let run_id = current.unwrap_or(0) + 1;

        let cancelled_previous = tx
            .execute(
                "UPDATE cadence_events SET status = 'cancelled', cancel_reason = 'resent'
                 WHERE quote_id = ?1 AND cadence_run_id < ?2 AND status = 'scheduled'",
                params![quote_id, run_id],
            )
            .map_err(db_err("Cancel previous run"))?;

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO cadence_events
                     (id, quote_id, organization_id, cadence_run_id, event_type, scheduled_for,
                      status, priority, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'scheduled', ?7, ?8)",
                )
                .map_err(db_err("Prepare event insert"))?;
            for draft in drafts {
                stmt.execute(params![
                    uuid::Uuid::new_v4().to_string(),
                    quote_id,
                    organization_id,
                    run_id,
                    draft.event_type.as_str(),
                    ts(draft.scheduled_for),
                    draft.priority.map(|p| p.as_str()),
                    ts(now),
                ])
                .map_err(db_err("Insert event"))?;
            }
        }

        tx.execute(
            "INSERT INTO quotes
             (id, organization_id, title, business_status, ritmo_stage, cadence_run_id,
              first_sent_at, value, last_activity_at)
             VALUES (?1, ?2, ?1, 'sent', 'fup_d1', ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                business_status = 'sent',
                ritmo_stage = 'fup_d1',
                cadence_run_id = excluded.cadence_run_id,
                first_sent_at = COALESCE(quotes.first_sent_at, excluded.first_sent_at),
                value = excluded.value,
                last_activity_at = excluded.last_activity_at",
            params![quote_id, organization_id, run_id, ts(sent_at), value, ts(now)],
        )
        .map_err(db_err("Update quote run"))?;

        let live_runs: i64 = tx
            .query_row(
                "SELECT COUNT(DISTINCT cadence_run_id) FROM cadence_events
                 WHERE quote_id = ?1 AND status = 'scheduled'",
                params![quote_id],
                |row| row.get(0),
            )
            .map_err(db_err("Check live runs"))?;
        if live_runs > 1 {
            tracing::error!("🚨 quote {quote_id}: {live_runs} runs hold scheduled events");
            return Err(RitmoError::IntegrityViolation(format!(
                "quote {quote_id} has {live_runs} live cadence runs"
            )));
        }

        tx.commit().map_err(db_err("Commit run"))?;
        Ok(RunWrite {
            run_id,
            events_created: drafts.len(),
            cancelled_previous,
        })
    }

    /// Cancel every `scheduled` event of a quote and set its stage to `stopped`.
    pub fn cancel_pending(
        &self,
        quote_id: &str,
        reason: CancelReason,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin cancel tx"))?;
        if find_quote_in(&tx, quote_id)?.is_none() {
            return Err(RitmoError::QuoteNotFound(quote_id.to_string()));
        }
        let cancelled = cancel_scheduled_in(&tx, quote_id, reason, now)?;
        tx.commit().map_err(db_err("Commit cancel"))?;
        Ok(cancelled)
    }

    /// Run ids that still have `scheduled` or `claimed` events.
    pub fn live_run_ids(&self, quote_id: &str) -> Result<Vec<i64>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT cadence_run_id FROM cadence_events
                 WHERE quote_id = ?1 AND status IN ('scheduled', 'claimed')
                 ORDER BY cadence_run_id",
            )
            .map_err(db_err("Prepare"))?;
        let ids = stmt
            .query_map(params![quote_id], |row| row.get(0))
            .map_err(db_err("Query"))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .map_err(db_err("Scan"))?;
        Ok(ids)
    }

    // ─── Claiming ──────────────────────────────────────

    /// Deal with abandoned claims (older than `cutoff`). Claims from a run
    /// the quote has since replaced are cancelled as `resent`; the rest go
    /// back to `scheduled`.
    pub fn reclaim_orphans(&self, cutoff: DateTime<Utc>) -> Result<Reclaimed> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin reclaim tx"))?;
        let cancelled_stale = tx
            .execute(
                "UPDATE cadence_events SET status = 'cancelled', cancel_reason = 'resent'
                 WHERE status = 'claimed' AND claimed_at < ?1
                   AND cadence_run_id < (
                       SELECT q.cadence_run_id FROM quotes q
                       WHERE q.id = cadence_events.quote_id
                   )",
                params![ts(cutoff)],
            )
            .map_err(db_err("Cancel stale orphans"))?;
        let requeued = tx
            .execute(
                "UPDATE cadence_events SET status = 'scheduled', claimed_at = NULL, claimed_by = NULL
                 WHERE status = 'claimed' AND claimed_at < ?1",
                params![ts(cutoff)],
            )
            .map_err(db_err("Reclaim orphans"))?;
        tx.commit().map_err(db_err("Commit reclaim"))?;
        Ok(Reclaimed {
            requeued,
            cancelled_stale,
        })
    }

    /// Push a held event's due time to `until` and release it, without
    /// counting an attempt.
    pub fn defer_claim(&self, event_id: &str, worker: &str, until: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .lock()?
            .execute(
                "UPDATE cadence_events
                 SET status = 'scheduled', claimed_at = NULL, claimed_by = NULL, scheduled_for = ?3
                 WHERE id = ?1 AND status = 'claimed' AND claimed_by = ?2",
                params![event_id, worker, ts(until)],
            )
            .map_err(db_err("Defer claim"))?;
        Ok(changed > 0)
    }

    /// Atomically claim up to `limit` due events for `worker`.
    ///
    /// Selection and transition are one statement; a row is only claimed if
    /// it is still `scheduled` when the write lands. Ordered by due time,
    /// HIGH priority first on ties.
    pub fn claim_due(
        &self,
        now: DateTime<Utc>,
        worker: &str,
        limit: u32,
    ) -> Result<Vec<CadenceEvent>> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin claim tx"))?;
        let mut claimed = {
            let mut stmt = tx
                .prepare(&format!(
                    "UPDATE cadence_events
                     SET status = 'claimed', claimed_at = ?1, claimed_by = ?2
                     WHERE id IN (
                         SELECT id FROM cadence_events
                         WHERE status = 'scheduled' AND scheduled_for <= ?1
                         ORDER BY scheduled_for ASC,
                                  CASE priority WHEN 'HIGH' THEN 0 ELSE 1 END ASC
                         LIMIT ?3
                     ) AND status = 'scheduled'
                     RETURNING {EVENT_COLUMNS}"
                ))
                .map_err(db_err("Prepare claim"))?;
            stmt.query_map(params![ts(now), worker, limit], row_to_event)
                .map_err(db_err("Claim"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err("Scan claim"))?
        };
        tx.commit().map_err(db_err("Commit claim"))?;
        claimed.sort_by(|a, b| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then_with(|| priority_rank(a.priority).cmp(&priority_rank(b.priority)))
        });
        Ok(claimed)
    }

    /// Cancel one event this runner holds.
    pub fn cancel_claimed(
        &self,
        event_id: &str,
        worker: &str,
        reason: CancelReason,
    ) -> Result<bool> {
        let changed = self
            .lock()?
            .execute(
                "UPDATE cadence_events SET status = 'cancelled', cancel_reason = ?3
                 WHERE id = ?1 AND status = 'claimed' AND claimed_by = ?2",
                params![event_id, worker, reason.as_str()],
            )
            .map_err(db_err("Cancel claimed event"))?;
        Ok(changed > 0)
    }

    /// The quote left `sent`: cancel the held event, every other pending
    /// event of the quote, and stop the cadence. Returns how many events were
    /// cancelled (0 if the claim was lost).
    pub fn cancel_for_status_change(
        &self,
        event_id: &str,
        worker: &str,
        quote_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin status cancel tx"))?;
        let held = tx
            .execute(
                "UPDATE cadence_events SET status = 'cancelled', cancel_reason = 'status_changed'
                 WHERE id = ?1 AND status = 'claimed' AND claimed_by = ?2",
                params![event_id, worker],
            )
            .map_err(db_err("Cancel claimed event"))?;
        if held == 0 {
            return Ok(0);
        }
        let others = cancel_scheduled_in(&tx, quote_id, CancelReason::StatusChanged, now)?;
        tx.commit().map_err(db_err("Commit status cancel"))?;
        Ok(held + others)
    }

    /// Mark a held email event `sent` and apply the stage cascade.
    pub fn resolve_sent(
        &self,
        event_id: &str,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin resolve tx"))?;
        let row: Option<(String, i64, String)> = tx
            .query_row(
                "UPDATE cadence_events SET status = 'sent', processed_at = ?3
                 WHERE id = ?1 AND status = 'claimed' AND claimed_by = ?2
                 RETURNING quote_id, cadence_run_id, event_type",
                params![event_id, worker, ts(now)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(db_err("Resolve sent"))?;
        let Some((quote_id, run_id, event_type)) = row else {
            return Ok(Resolution::LostClaim);
        };
        let next_stage = apply_cascade(&tx, &quote_id, run_id, event_type.parse()?, now)?;
        tx.commit().map_err(db_err("Commit resolve"))?;
        Ok(Resolution::Applied {
            next_stage,
            task_id: None,
        })
    }

    /// Create the manual task for a held event, mark the event `completed`
    /// and apply the stage cascade.
    pub fn resolve_with_task(
        &self,
        event_id: &str,
        worker: &str,
        task: &NewTask,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin task tx"))?;
        let row: Option<(String, i64, String)> = tx
            .query_row(
                "UPDATE cadence_events SET status = 'completed', processed_at = ?3
                 WHERE id = ?1 AND status = 'claimed' AND claimed_by = ?2
                 RETURNING quote_id, cadence_run_id, event_type",
                params![event_id, worker, ts(now)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(db_err("Resolve completed"))?;
        let Some((quote_id, run_id, event_type)) = row else {
            return Ok(Resolution::LostClaim);
        };
        let task_id = insert_task(&tx, &quote_id, Some(event_id), task, now)?;
        let next_stage = apply_cascade(&tx, &quote_id, run_id, event_type.parse()?, now)?;
        tx.commit().map_err(db_err("Commit task"))?;
        Ok(Resolution::Applied {
            next_stage,
            task_id: Some(task_id),
        })
    }

    /// Record a failed automatic send. Below `max_attempts` the claim goes
    /// back to `scheduled`; at the cap the event is completed with `fallback`
    /// as its manual task.
    pub fn record_send_failure(
        &self,
        event_id: &str,
        worker: &str,
        error: &str,
        max_attempts: u32,
        fallback: &NewTask,
        now: DateTime<Utc>,
    ) -> Result<FailureResolution> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin failure tx"))?;
        let row: Option<(String, i64, String, u32)> = tx
            .query_row(
                "SELECT quote_id, cadence_run_id, event_type, attempts FROM cadence_events
                 WHERE id = ?1 AND status = 'claimed' AND claimed_by = ?2",
                params![event_id, worker],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(db_err("Load failed event"))?;
        let Some((quote_id, run_id, event_type, attempts)) = row else {
            return Ok(FailureResolution::LostClaim);
        };
        let attempts = attempts + 1;

        let outcome = if attempts >= max_attempts {
            tx.execute(
                "UPDATE cadence_events
                 SET status = 'completed', processed_at = ?2, attempts = ?3, last_error = ?4
                 WHERE id = ?1",
                params![event_id, ts(now), attempts, error],
            )
            .map_err(db_err("Downgrade event"))?;
            let task_id = insert_task(&tx, &quote_id, Some(event_id), fallback, now)?;
            let next_stage = apply_cascade(&tx, &quote_id, run_id, event_type.parse()?, now)?;
            FailureResolution::Downgraded {
                task_id,
                next_stage,
            }
        } else {
            tx.execute(
                "UPDATE cadence_events
                 SET status = 'scheduled', claimed_at = NULL, claimed_by = NULL,
                     attempts = ?2, last_error = ?3
                 WHERE id = ?1",
                params![event_id, attempts, error],
            )
            .map_err(db_err("Release failed event"))?;
            FailureResolution::Released { attempts }
        };
        tx.commit().map_err(db_err("Commit failure"))?;
        Ok(outcome)
    }

    // ─── Manual actions ──────────────────────────────────────

    /// A user did the action of a still-scheduled event by hand. Completes
    /// the event and any pending linked task, then applies the cascade.
    ///
    /// An event already `completed` by the processor with a pending task
    /// just gets its task completed (the cascade already ran).
    pub fn complete_event(&self, event_id: &str, now: DateTime<Utc>) -> Result<Option<RitmoStage>> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin complete tx"))?;
        let event = find_event_in(&tx, event_id)?
            .ok_or_else(|| RitmoError::EventNotFound(event_id.to_string()))?;

        let current_run = find_quote_in(&tx, &event.quote_id)?.map(|q| q.cadence_run_id);
        let next_stage = match event.status {
            EventStatus::Scheduled if current_run != Some(event.cadence_run_id) => {
                return Err(RitmoError::InvalidTransition(format!(
                    "event {event_id} belongs to run {}, which is no longer current",
                    event.cadence_run_id
                )));
            }
            EventStatus::Scheduled => {
                tx.execute(
                    "UPDATE cadence_events SET status = 'completed', processed_at = ?2 WHERE id = ?1",
                    params![event_id, ts(now)],
                )
                .map_err(db_err("Complete event"))?;
                complete_linked_task(&tx, event_id, now)?;
                apply_cascade(
                    &tx,
                    &event.quote_id,
                    event.cadence_run_id,
                    event.event_type,
                    now,
                )?
            }
            EventStatus::Completed => {
                if complete_linked_task(&tx, event_id, now)? == 0 {
                    return Err(RitmoError::InvalidTransition(format!(
                        "event {event_id} is already completed"
                    )));
                }
                None
            }
            EventStatus::Claimed => {
                return Err(RitmoError::InvalidTransition(format!(
                    "event {event_id} is being processed by {}",
                    event.claimed_by.as_deref().unwrap_or("another runner")
                )));
            }
            other => {
                return Err(RitmoError::InvalidTransition(format!(
                    "event {event_id} is {other}"
                )));
            }
        };
        tx.commit().map_err(db_err("Commit complete"))?;
        Ok(next_stage)
    }

    /// Complete a manual task and keep its event consistent.
    pub fn complete_task(&self, task_id: &str, now: DateTime<Utc>) -> Result<Option<RitmoStage>> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin task complete tx"))?;
        let task = tx
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM follow_up_tasks WHERE id = ?1"),
                params![task_id],
                row_to_task,
            )
            .optional()
            .map_err(db_err("Load task"))?
            .ok_or_else(|| RitmoError::TaskNotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Pending {
            return Err(RitmoError::InvalidTransition(format!(
                "task {task_id} is {}",
                task.status.as_str()
            )));
        }
        tx.execute(
            "UPDATE follow_up_tasks SET status = 'completed', completed_at = ?2 WHERE id = ?1",
            params![task_id, ts(now)],
        )
        .map_err(db_err("Complete task"))?;

        let mut next_stage = None;
        if let Some(event_id) = &task.event_id {
            if let Some(event) = find_event_in(&tx, event_id)? {
                let current_run =
                    find_quote_in(&tx, &event.quote_id)?.map(|q| q.cadence_run_id);
                if event.status == EventStatus::Scheduled
                    && current_run != Some(event.cadence_run_id)
                {
                    tx.execute(
                        "UPDATE cadence_events SET status = 'cancelled', cancel_reason = 'resent'
                         WHERE id = ?1",
                        params![event_id],
                    )
                    .map_err(db_err("Cancel stale linked event"))?;
                } else if event.status == EventStatus::Scheduled {
                    tx.execute(
                        "UPDATE cadence_events SET status = 'completed', processed_at = ?2 WHERE id = ?1",
                        params![event_id, ts(now)],
                    )
                    .map_err(db_err("Complete linked event"))?;
                    next_stage = apply_cascade(
                        &tx,
                        &event.quote_id,
                        event.cadence_run_id,
                        event.event_type,
                        now,
                    )?;
                }
            }
        }
        tx.commit().map_err(db_err("Commit task complete"))?;
        Ok(next_stage)
    }

    /// Skip an event by hand (no stage cascade). A still-scheduled event
    /// becomes `skipped`; a completed event's pending task becomes `skipped`.
    pub fn skip_event(&self, event_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin skip tx"))?;
        let event = find_event_in(&tx, event_id)?
            .ok_or_else(|| RitmoError::EventNotFound(event_id.to_string()))?;
        let skipped_task = tx
            .execute(
                "UPDATE follow_up_tasks SET status = 'skipped', completed_at = ?2
                 WHERE event_id = ?1 AND status = 'pending'",
                params![event_id, ts(now)],
            )
            .map_err(db_err("Skip task"))?;
        match event.status {
            EventStatus::Scheduled => {
                tx.execute(
                    "UPDATE cadence_events SET status = 'skipped', processed_at = ?2 WHERE id = ?1",
                    params![event_id, ts(now)],
                )
                .map_err(db_err("Skip event"))?;
            }
            EventStatus::Completed if skipped_task > 0 => {}
            other => {
                return Err(RitmoError::InvalidTransition(format!(
                    "event {event_id} is {other}"
                )));
            }
        }
        tx.commit().map_err(db_err("Commit skip"))?;
        Ok(())
    }

    /// Raw SQL against the store, for fault injection in tests.
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.lock()?
            .execute_batch(sql)
            .map_err(db_err("Raw SQL"))
    }

    // ─── Introspection ──────────────────────────────────────

    pub fn get_event(&self, event_id: &str) -> Result<CadenceEvent> {
        find_event_in(&*self.lock()?, event_id)?
            .ok_or_else(|| RitmoError::EventNotFound(event_id.to_string()))
    }

    /// All events of a quote, oldest run first, in schedule order.
    pub fn events_for_quote(&self, quote_id: &str) -> Result<Vec<CadenceEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM cadence_events WHERE quote_id = ?1
                 ORDER BY cadence_run_id, scheduled_for"
            ))
            .map_err(db_err("Prepare"))?;
        let events = stmt
            .query_map(params![quote_id], row_to_event)
            .map_err(db_err("Query"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Scan"))?;
        Ok(events)
    }

    pub fn tasks_for_quote(&self, quote_id: &str) -> Result<Vec<FollowUpTask>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM follow_up_tasks WHERE quote_id = ?1 ORDER BY created_at"
            ))
            .map_err(db_err("Prepare"))?;
        let tasks = stmt
            .query_map(params![quote_id], row_to_task)
            .map_err(db_err("Query"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Scan"))?;
        Ok(tasks)
    }

    pub fn task_for_event(&self, event_id: &str) -> Result<Option<FollowUpTask>> {
        self.lock()?
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM follow_up_tasks WHERE event_id = ?1"),
                params![event_id],
                row_to_task,
            )
            .optional()
            .map_err(db_err("Load task"))
    }
}

fn complete_linked_task(conn: &Connection, event_id: &str, now: DateTime<Utc>) -> Result<usize> {
    conn.execute(
        "UPDATE follow_up_tasks SET status = 'completed', completed_at = ?2
         WHERE event_id = ?1 AND status = 'pending'",
        params![event_id, ts(now)],
    )
    .map_err(db_err("Complete linked task"))
}

fn priority_rank(p: Option<Priority>) -> u8 {
    match p {
        Some(Priority::High) => 0,
        _ => 1,
    }
}

/// Contacts live next to the quotes; a quote without a contact row is
/// treated as a contact without email, so it surfaces as a manual task.
#[async_trait]
impl ContactDirectory for CadenceDb {
    async fn contact_for_quote(&self, quote_id: &str) -> Result<Contact> {
        Ok(self.find_contact(quote_id)?.unwrap_or(Contact {
            name: String::new(),
            email: None,
            phone: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, 0, 0).unwrap()
    }

    fn drafts(base: DateTime<Utc>) -> Vec<EventDraft> {
        EventType::ALL
            .iter()
            .enumerate()
            .map(|(i, et)| EventDraft {
                event_type: *et,
                scheduled_for: base + Duration::days(i as i64 + 1),
                priority: (*et == EventType::CallD7).then_some(Priority::Low),
            })
            .collect()
    }

    fn call_task(due: DateTime<Utc>) -> NewTask {
        NewTask {
            kind: TaskKind::Call,
            title: "Call".into(),
            description: String::new(),
            priority: Priority::Low,
            due_at: due,
        }
    }

    #[test]
    fn test_open_and_migrate() {
        let db = CadenceDb::open_in_memory().unwrap();
        assert!(db.find_quote("q1").unwrap().is_none());
        assert!(db.events_for_quote("q1").unwrap().is_empty());
    }

    #[test]
    fn test_quote_round_trip() {
        let db = CadenceDb::open_in_memory().unwrap();
        let mut q = Quote::draft("q1", "org", "ORC-1", 250.0);
        q.first_sent_at = Some(t(2, 10));
        db.upsert_quote(&q).unwrap();
        assert_eq!(db.get_quote("q1").unwrap(), q);
        assert!(matches!(db.get_quote("nope"), Err(RitmoError::QuoteNotFound(_))));
    }

    #[test]
    fn test_write_run_then_resend_cancels_previous() {
        let db = CadenceDb::open_in_memory().unwrap();
        let first = db
            .write_cadence_run("q1", "org", 10.0, t(2, 10), &drafts(t(2, 9)), t(2, 10))
            .unwrap();
        assert_eq!(first.run_id, 1);
        assert_eq!(first.events_created, 4);

        let second = db
            .write_cadence_run("q1", "org", 10.0, t(4, 10), &drafts(t(4, 9)), t(4, 10))
            .unwrap();
        assert_eq!(second.run_id, 2);
        assert_eq!(second.cancelled_previous, 4);
        assert_eq!(db.live_run_ids("q1").unwrap(), vec![2]);

        let quote = db.get_quote("q1").unwrap();
        assert_eq!(quote.cadence_run_id, 2);
        assert_eq!(quote.ritmo_stage, RitmoStage::FupD1);
        assert_eq!(quote.first_sent_at, Some(t(2, 10)));
    }

    #[test]
    fn test_claim_is_ordered_and_bounded() {
        let db = CadenceDb::open_in_memory().unwrap();
        db.write_cadence_run("q1", "org", 10.0, t(2, 10), &drafts(t(2, 9)), t(2, 10))
            .unwrap();
        let claimed = db.claim_due(t(20, 0), "w1", 2).unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].event_type, EventType::EmailD1);
        assert_eq!(claimed[1].event_type, EventType::EmailD3);
        assert!(claimed.iter().all(|e| e.status == EventStatus::Claimed));
        assert_eq!(claimed[0].claimed_by.as_deref(), Some("w1"));

        // Nothing due yet for the remaining two at this instant.
        assert!(db.claim_due(t(3, 0), "w2", 10).unwrap().is_empty());
    }

    #[test]
    fn test_claimed_rows_are_not_claimed_twice() {
        let db = CadenceDb::open_in_memory().unwrap();
        db.write_cadence_run("q1", "org", 10.0, t(2, 10), &drafts(t(2, 9)), t(2, 10))
            .unwrap();
        let a = db.claim_due(t(20, 0), "w1", 10).unwrap();
        let b = db.claim_due(t(20, 0), "w2", 10).unwrap();
        assert_eq!(a.len(), 4);
        assert!(b.is_empty());
    }

    #[test]
    fn test_reclaim_orphans_after_cutoff() {
        let db = CadenceDb::open_in_memory().unwrap();
        db.write_cadence_run("q1", "org", 10.0, t(2, 10), &drafts(t(2, 9)), t(2, 10))
            .unwrap();
        db.claim_due(t(3, 10), "dead", 1).unwrap();
        assert_eq!(db.reclaim_orphans(t(3, 10) - Duration::minutes(1)).unwrap().total(), 0);
        assert_eq!(
            db.reclaim_orphans(t(3, 10) + Duration::minutes(1)).unwrap(),
            Reclaimed {
                requeued: 1,
                cancelled_stale: 0
            }
        );
        let again = db.claim_due(t(3, 11), "alive", 1).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].claimed_by.as_deref(), Some("alive"));
    }

    #[test]
    fn test_reclaim_cancels_orphans_of_replaced_run() {
        let db = CadenceDb::open_in_memory().unwrap();
        db.write_cadence_run("q1", "org", 10.0, t(2, 10), &drafts(t(2, 9)), t(2, 10))
            .unwrap();
        // A runner holds all of run 1 and dies; the quote is resent meanwhile.
        assert_eq!(db.claim_due(t(20, 0), "dead", 10).unwrap().len(), 4);
        db.write_cadence_run("q1", "org", 10.0, t(20, 1), &drafts(t(20, 1)), t(20, 1))
            .unwrap();

        let reclaimed = db.reclaim_orphans(t(20, 2)).unwrap();
        assert_eq!(reclaimed.cancelled_stale, 4);
        assert_eq!(reclaimed.requeued, 0);
        assert_eq!(db.live_run_ids("q1").unwrap(), vec![2]);

        let old = db
            .events_for_quote("q1")
            .unwrap()
            .into_iter()
            .find(|e| e.cadence_run_id == 1 && e.event_type == EventType::EmailD14)
            .unwrap();
        assert_eq!(old.status, EventStatus::Cancelled);
        assert_eq!(old.cancel_reason, Some(CancelReason::Resent));
        assert!(db.complete_event(&old.id, t(20, 3)).is_err());
        assert_eq!(db.get_quote("q1").unwrap().ritmo_stage, RitmoStage::FupD1);
    }

    #[test]
    fn test_old_run_resolution_keeps_new_run_stage() {
        let db = CadenceDb::open_in_memory().unwrap();
        db.write_cadence_run("q1", "org", 10.0, t(2, 10), &drafts(t(2, 9)), t(2, 10))
            .unwrap();
        let ev = db.claim_due(t(3, 10), "w1", 1).unwrap().remove(0);
        db.write_cadence_run("q1", "org", 10.0, t(3, 10), &drafts(t(3, 10)), t(3, 10))
            .unwrap();

        // The holder finishes its run-1 send after the resend.
        assert_eq!(
            db.resolve_sent(&ev.id, "w1", t(3, 11)).unwrap(),
            Resolution::Applied {
                next_stage: None,
                task_id: None
            }
        );
        let quote = db.get_quote("q1").unwrap();
        assert_eq!(quote.cadence_run_id, 2);
        assert_eq!(quote.ritmo_stage, RitmoStage::FupD1);
    }

    #[test]
    fn test_manual_actions_on_replaced_run_leave_stage() {
        let db = CadenceDb::open_in_memory().unwrap();
        db.write_cadence_run("q1", "org", 10.0, t(2, 10), &drafts(t(2, 9)), t(2, 10))
            .unwrap();
        let call = db.claim_due(t(20, 0), "w1", 10).unwrap().remove(2);
        assert_eq!(call.event_type, EventType::CallD7);
        let fallback = NewTask {
            kind: TaskKind::Call,
            ..call_task(call.scheduled_for)
        };
        db.record_send_failure(&call.id, "w1", "boom", 1, &fallback, t(20, 0))
            .unwrap();
        db.write_cadence_run("q1", "org", 10.0, t(20, 1), &drafts(t(20, 1)), t(20, 1))
            .unwrap();

        let task = db.task_for_event(&call.id).unwrap().unwrap();
        assert_eq!(db.complete_task(&task.id, t(20, 2)).unwrap(), None);
        assert_eq!(db.get_quote("q1").unwrap().ritmo_stage, RitmoStage::FupD1);
    }

    #[test]
    fn test_change_business_status_is_atomic() {
        let db = CadenceDb::open_in_memory().unwrap();
        db.write_cadence_run("q1", "org", 10.0, t(2, 10), &drafts(t(2, 9)), t(2, 10))
            .unwrap();
        assert_eq!(
            db.change_business_status("q1", BusinessStatus::Negotiation, t(2, 11))
                .unwrap(),
            4
        );
        let quote = db.get_quote("q1").unwrap();
        assert_eq!(quote.business_status, BusinessStatus::Negotiation);
        assert_eq!(quote.ritmo_stage, RitmoStage::Stopped);
        assert!(matches!(
            db.change_business_status("missing", BusinessStatus::Lost, t(2, 11)),
            Err(RitmoError::QuoteNotFound(_))
        ));
    }

    #[test]
    fn test_defer_claim_moves_due_time() {
        let db = CadenceDb::open_in_memory().unwrap();
        db.write_cadence_run("q1", "org", 10.0, t(2, 10), &drafts(t(2, 9)), t(2, 10))
            .unwrap();
        let ev = db.claim_due(t(3, 10), "w1", 1).unwrap().remove(0);
        assert!(!db.defer_claim(&ev.id, "w2", t(3, 14)).unwrap());
        assert!(db.defer_claim(&ev.id, "w1", t(3, 14)).unwrap());
        let stored = db.get_event(&ev.id).unwrap();
        assert_eq!(stored.status, EventStatus::Scheduled);
        assert_eq!(stored.scheduled_for, t(3, 14));
        assert_eq!(stored.attempts, 0);
        assert!(db.claim_due(t(3, 13), "w1", 10).unwrap().is_empty());
    }

    #[test]
    fn test_resolution_requires_holding_the_claim() {
        let db = CadenceDb::open_in_memory().unwrap();
        db.write_cadence_run("q1", "org", 10.0, t(2, 10), &drafts(t(2, 9)), t(2, 10))
            .unwrap();
        let ev = db.claim_due(t(3, 10), "w1", 1).unwrap().remove(0);
        assert_eq!(db.resolve_sent(&ev.id, "w2", t(3, 11)).unwrap(), Resolution::LostClaim);
        let res = db.resolve_sent(&ev.id, "w1", t(3, 11)).unwrap();
        assert_eq!(
            res,
            Resolution::Applied {
                next_stage: Some(RitmoStage::FupD3),
                task_id: None
            }
        );
        assert_eq!(db.get_event(&ev.id).unwrap().status, EventStatus::Sent);
    }

    #[test]
    fn test_one_task_per_event() {
        let db = CadenceDb::open_in_memory().unwrap();
        db.write_cadence_run("q1", "org", 10.0, t(2, 10), &drafts(t(2, 9)), t(2, 10))
            .unwrap();
        let ev = db.claim_due(t(3, 10), "w1", 1).unwrap().remove(0);
        db.resolve_with_task(&ev.id, "w1", &call_task(ev.scheduled_for), t(3, 11))
            .unwrap();
        // Second resolution finds no claim and writes nothing.
        assert_eq!(
            db.resolve_with_task(&ev.id, "w1", &call_task(ev.scheduled_for), t(3, 12))
                .unwrap(),
            Resolution::LostClaim
        );
        assert_eq!(db.tasks_for_quote("q1").unwrap().len(), 1);
    }

    #[test]
    fn test_send_failure_releases_then_downgrades() {
        let db = CadenceDb::open_in_memory().unwrap();
        db.write_cadence_run("q1", "org", 10.0, t(2, 10), &drafts(t(2, 9)), t(2, 10))
            .unwrap();
        let fallback = NewTask {
            kind: TaskKind::EmailFailed,
            ..call_task(t(3, 9))
        };
        let ev = db.claim_due(t(3, 10), "w1", 1).unwrap().remove(0);
        assert_eq!(
            db.record_send_failure(&ev.id, "w1", "smtp down", 2, &fallback, t(3, 10))
                .unwrap(),
            FailureResolution::Released { attempts: 1 }
        );
        let stored = db.get_event(&ev.id).unwrap();
        assert_eq!(stored.status, EventStatus::Scheduled);
        assert_eq!(stored.last_error.as_deref(), Some("smtp down"));

        let ev = db.claim_due(t(3, 11), "w1", 1).unwrap().remove(0);
        let out = db
            .record_send_failure(&ev.id, "w1", "smtp down", 2, &fallback, t(3, 11))
            .unwrap();
        assert!(matches!(out, FailureResolution::Downgraded { .. }));
        let stored = db.get_event(&ev.id).unwrap();
        assert_eq!(stored.status, EventStatus::Completed);
        assert_eq!(stored.attempts, 2);
        let task = db.task_for_event(&ev.id).unwrap().unwrap();
        assert_eq!(task.kind, TaskKind::EmailFailed);
    }

    #[test]
    fn test_cancel_pending_stops_quote() {
        let db = CadenceDb::open_in_memory().unwrap();
        db.write_cadence_run("q1", "org", 10.0, t(2, 10), &drafts(t(2, 9)), t(2, 10))
            .unwrap();
        let n = db.cancel_pending("q1", CancelReason::Manual, t(2, 12)).unwrap();
        assert_eq!(n, 4);
        assert_eq!(db.get_quote("q1").unwrap().ritmo_stage, RitmoStage::Stopped);
        assert!(db
            .events_for_quote("q1")
            .unwrap()
            .iter()
            .all(|e| e.cancel_reason == Some(CancelReason::Manual)));
        assert!(matches!(
            db.cancel_pending("missing", CancelReason::Manual, t(2, 12)),
            Err(RitmoError::QuoteNotFound(_))
        ));
    }

    #[test]
    fn test_complete_task_and_event_stay_consistent() {
        let db = CadenceDb::open_in_memory().unwrap();
        db.write_cadence_run("q1", "org", 10.0, t(2, 10), &drafts(t(2, 9)), t(2, 10))
            .unwrap();
        let ev = db.claim_due(t(3, 10), "w1", 1).unwrap().remove(0);
        db.resolve_with_task(&ev.id, "w1", &call_task(ev.scheduled_for), t(3, 11))
            .unwrap();
        let task = db.task_for_event(&ev.id).unwrap().unwrap();

        // Completing the already-completed event closes its task.
        assert_eq!(db.complete_event(&ev.id, t(4, 9)).unwrap(), None);
        let task = db.tasks_for_quote("q1").unwrap().into_iter().find(|x| x.id == task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(matches!(
            db.complete_event(&ev.id, t(4, 9)),
            Err(RitmoError::InvalidTransition(_))
        ));
        assert!(matches!(
            db.complete_task(&task.id, t(4, 9)),
            Err(RitmoError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_manual_complete_of_claimed_event_is_refused() {
        let db = CadenceDb::open_in_memory().unwrap();
        db.write_cadence_run("q1", "org", 10.0, t(2, 10), &drafts(t(2, 9)), t(2, 10))
            .unwrap();
        let ev = db.claim_due(t(3, 10), "w1", 1).unwrap().remove(0);
        assert!(matches!(
            db.complete_event(&ev.id, t(3, 10)),
            Err(RitmoError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_skip_event() {
        let db = CadenceDb::open_in_memory().unwrap();
        db.write_cadence_run("q1", "org", 10.0, t(2, 10), &drafts(t(2, 9)), t(2, 10))
            .unwrap();
        let ev = db.events_for_quote("q1").unwrap().remove(0);
        db.skip_event(&ev.id, t(2, 11)).unwrap();
        assert_eq!(db.get_event(&ev.id).unwrap().status, EventStatus::Skipped);
        assert_eq!(db.get_quote("q1").unwrap().ritmo_stage, RitmoStage::FupD1);
        assert!(db.skip_event(&ev.id, t(2, 12)).is_err());
    }

    #[tokio::test]
    async fn test_missing_contact_has_no_email() {
        let db = CadenceDb::open_in_memory().unwrap();
        let c = db.contact_for_quote("q1").await.unwrap();
        assert!(!c.has_email());

        db.upsert_contact(
            "q1",
            &Contact {
                name: "Rita".into(),
                email: Some("rita@example.com".into()),
                phone: None,
            },
        )
        .unwrap();
        assert!(db.contact_for_quote("q1").await.unwrap().has_email());
    }
}
