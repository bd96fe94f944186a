use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use lumen_core::ids::ConversationId;
use lumen_core::protocol::UsageDetail;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// One persisted LLM call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRow {
    pub llm_call_id: String,
    pub conversation_id: ConversationId,
    pub detail: UsageDetail,
    pub created_at: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

pub struct UsageRepo {
    db: Database,
}

impl UsageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store the usage the backend reported for one turn. Re-reported call
    /// ids overwrite the earlier row.
    #[instrument(skip(self, calls), fields(conversation_id = %conversation_id, calls = calls.len()))]
    pub fn record(
        &self,
        conversation_id: ConversationId,
        calls: &BTreeMap<String, UsageDetail>,
    ) -> Result<(), StoreError> {
        if calls.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO llm_usage
                         (llm_call_id, conversation_id, model, input_tokens, output_tokens, cost, payload, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for (call_id, detail) in calls {
                    stmt.execute(rusqlite::params![
                        call_id,
                        conversation_id.get(),
                        detail.model,
                        detail.input_tokens as i64,
                        detail.output_tokens as i64,
                        detail.cost,
                        serde_json::to_string(detail)?,
                        now,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn list_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<UsageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT llm_call_id, payload, created_at FROM llm_usage
                 WHERE conversation_id = ?1 ORDER BY created_at, llm_call_id",
            )?;
            let mut rows = stmt.query([conversation_id.get()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let payload: String = row_helpers::get(row, 1, "llm_usage", "payload")?;
                results.push(UsageRow {
                    llm_call_id: row_helpers::get(row, 0, "llm_usage", "llm_call_id")?,
                    conversation_id,
                    detail: row_helpers::parse_json(&payload, "llm_usage", "payload")?,
                    created_at: row_helpers::get(row, 2, "llm_usage", "created_at")?,
                });
            }
            Ok(results)
        })
    }

    pub fn totals_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<UsageTotals, StoreError> {
        self.db.with_conn(|conn| {
            let totals = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                        COALESCE(SUM(cost), 0.0)
                 FROM llm_usage WHERE conversation_id = ?1",
                [conversation_id.get()],
                |row| {
                    Ok(UsageTotals {
                        calls: row.get::<_, i64>(0)? as u64,
                        input_tokens: row.get::<_, i64>(1)? as u64,
                        output_tokens: row.get::<_, i64>(2)? as u64,
                        cost: row.get(3)?,
                    })
                },
            )?;
            Ok(totals)
        })
    }
}
