//! Conversations and their append-only logs, including the fork-on-conflict
//! append path.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use lumen_core::ids::ConversationId;
use lumen_core::log::{derive_conversation_name, LogEntry};
use lumen_core::user::EffectiveUser;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const FORK_SUFFIX: &str = " (fork)";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRow {
    pub id: ConversationId,
    pub tenant_id: String,
    pub user_id: String,
    pub name: String,
    pub forked_from: Option<ConversationId>,
    pub created_at: String,
    pub updated_at: String,
}

/// Where an append landed. `conversation_id` differs from the requested id
/// exactly when the append forked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendOutcome {
    pub conversation_id: ConversationId,
    pub log_index: usize,
    pub forked_from: Option<ConversationId>,
}

impl AppendOutcome {
    pub fn forked(&self) -> bool {
        self.forked_from.is_some()
    }
}

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Resolve `id` for `user`, or create a new conversation named after the
    /// first message when no id is given.
    #[instrument(skip(self, user, first_message), fields(tenant = %user.tenant_id))]
    pub fn get_or_create(
        &self,
        id: Option<ConversationId>,
        user: &EffectiveUser,
        first_message: Option<&str>,
    ) -> Result<ConversationRow, StoreError> {
        match id {
            Some(id) => self.get(id, user),
            None => self.db.with_conn(|conn| {
                let name = derive_conversation_name(first_message);
                insert_conversation(conn, user, &name, None)
            }),
        }
    }

    /// Fetch a conversation. Conversations of other tenants are `NotFound`.
    #[instrument(skip(self, user), fields(conversation_id = %id))]
    pub fn get(&self, id: ConversationId, user: &EffectiveUser) -> Result<ConversationRow, StoreError> {
        self.db.with_conn(|conn| fetch_conversation(conn, id, user))
    }

    /// The first `up_to` entries of the log, or all of it.
    #[instrument(skip(self, user), fields(conversation_id = %id))]
    pub fn load_log(
        &self,
        id: ConversationId,
        user: &EffectiveUser,
        up_to: Option<usize>,
    ) -> Result<Vec<LogEntry>, StoreError> {
        self.db.with_conn(|conn| {
            fetch_conversation(conn, id, user)?;
            let limit = up_to.map(|n| n as i64).unwrap_or(-1);
            let mut stmt = conn.prepare(
                "SELECT payload FROM log_entries WHERE conversation_id = ?1 ORDER BY seq LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![id.get(), limit])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                let raw: String = row_helpers::get(row, 0, "log_entries", "payload")?;
                entries.push(row_helpers::parse_json(&raw, "log_entries", "payload")?);
            }
            Ok(entries)
        })
    }

    /// Number of persisted log entries.
    pub fn log_len(&self, id: ConversationId, user: &EffectiveUser) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            fetch_conversation(conn, id, user)?;
            count_entries(conn, id)
        })
    }

    /// Append `entries` given the log length the caller last observed.
    ///
    /// When `expected_index` matches the persisted length the entries extend
    /// the log in place. Otherwise a new conversation is created holding the
    /// persisted log cut at `expected_index` (or the whole log, if the caller
    /// claims more than exists) followed by `entries`, with `forked_from`
    /// pointing at `id`. The check and the write happen in one transaction, so
    /// at most one concurrent writer extends a log past a given index.
    #[instrument(
        skip(self, user, entries),
        fields(conversation_id = %id, entries = entries.len())
    )]
    pub fn append_log(
        &self,
        id: ConversationId,
        user: &EffectiveUser,
        expected_index: usize,
        entries: &[LogEntry],
    ) -> Result<AppendOutcome, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let original = fetch_conversation(&tx, id, user)?;
            let current = count_entries(&tx, id)?;
            let now = Utc::now().to_rfc3339();

            let outcome = if current == expected_index {
                insert_entries(&tx, id, current, entries)?;
                tx.execute(
                    "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                    rusqlite::params![now, id.get()],
                )?;
                AppendOutcome {
                    conversation_id: id,
                    log_index: current + entries.len(),
                    forked_from: None,
                }
            } else {
                let keep = expected_index.min(current);
                let name = format!("{}{FORK_SUFFIX}", original.name);
                let fork = insert_conversation(&tx, user, &name, Some(id))?;
                tx.execute(
                    "INSERT INTO log_entries (conversation_id, seq, entry_type, task_id, payload, created_at)
                     SELECT ?1, seq, entry_type, task_id, payload, created_at
                     FROM log_entries WHERE conversation_id = ?2 AND seq < ?3",
                    rusqlite::params![fork.id.get(), id.get(), keep as i64],
                )?;
                insert_entries(&tx, fork.id, keep, entries)?;
                warn!(
                    conversation_id = %id,
                    expected_index,
                    persisted = current,
                    "stale log index, forking"
                );
                info!(from = %id, to = %fork.id, kept = keep, "conversation forked");
                AppendOutcome {
                    conversation_id: fork.id,
                    log_index: keep + entries.len(),
                    forked_from: Some(id),
                }
            };

            tx.commit()?;
            Ok(outcome)
        })
    }

    /// The caller's most recently updated conversations.
    #[instrument(skip(self, user), fields(tenant = %user.tenant_id))]
    pub fn list_for_user(
        &self,
        user: &EffectiveUser,
        limit: u32,
    ) -> Result<Vec<ConversationRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, tenant_id, user_id, name, forked_from, created_at, updated_at
                 FROM conversations WHERE tenant_id = ?1 AND user_id = ?2
                 ORDER BY updated_at DESC, id DESC LIMIT ?3",
            )?;
            let mut rows = stmt.query(rusqlite::params![user.tenant_id, user.user_id, limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_conversation(row)?);
            }
            Ok(results)
        })
    }
}

fn fetch_conversation(
    conn: &Connection,
    id: ConversationId,
    user: &EffectiveUser,
) -> Result<ConversationRow, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, tenant_id, user_id, name, forked_from, created_at, updated_at
         FROM conversations WHERE id = ?1 AND tenant_id = ?2",
    )?;
    let found = stmt
        .query_row(rusqlite::params![id.get(), user.tenant_id], |row| {
            Ok(row_to_conversation(row))
        })
        .optional()?;
    found.unwrap_or_else(|| Err(StoreError::NotFound(format!("conversation {id}"))))
}

fn insert_conversation(
    conn: &Connection,
    user: &EffectiveUser,
    name: &str,
    forked_from: Option<ConversationId>,
) -> Result<ConversationRow, StoreError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO conversations (tenant_id, user_id, name, forked_from, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            user.tenant_id,
            user.user_id,
            name,
            forked_from.map(ConversationId::get),
            now,
            now,
        ],
    )?;
    Ok(ConversationRow {
        id: ConversationId::new(conn.last_insert_rowid()),
        tenant_id: user.tenant_id.clone(),
        user_id: user.user_id.clone(),
        name: name.to_string(),
        forked_from,
        created_at: now.clone(),
        updated_at: now,
    })
}

fn count_entries(conn: &Connection, id: ConversationId) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM log_entries WHERE conversation_id = ?1",
        [id.get()],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

fn insert_entries(
    conn: &Connection,
    id: ConversationId,
    start: usize,
    entries: &[LogEntry],
) -> Result<(), StoreError> {
    let now = Utc::now().to_rfc3339();
    let mut stmt = conn.prepare(
        "INSERT INTO log_entries (conversation_id, seq, entry_type, task_id, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for (offset, entry) in entries.iter().enumerate() {
        stmt.execute(rusqlite::params![
            id.get(),
            (start + offset) as i64,
            entry.entry_type(),
            entry.task_id().as_str(),
            serde_json::to_string(entry)?,
            now,
        ])?;
    }
    Ok(())
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<ConversationRow, StoreError> {
    const T: &str = "conversations";
    Ok(ConversationRow {
        id: ConversationId::new(row_helpers::get(row, 0, T, "id")?),
        tenant_id: row_helpers::get(row, 1, T, "tenant_id")?,
        user_id: row_helpers::get(row, 2, T, "user_id")?,
        name: row_helpers::get(row, 3, T, "name")?,
        forked_from: row_helpers::get_opt::<i64>(row, 4, T, "forked_from")?.map(ConversationId::new),
        created_at: row_helpers::get(row, 5, T, "created_at")?,
        updated_at: row_helpers::get(row, 6, T, "updated_at")?,
    })
}
