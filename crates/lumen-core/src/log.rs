//! Conversation log entries and pure helpers over a log.
//!
//! A log is append-only; insertion order is causal order. Each entry is
//! immutable once appended.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{RunId, ToolCallId};
use crate::tool_call::{ChildTask, ToolCall};

const MAX_NAME_CHARS: usize = 60;
const DEFAULT_NAME: &str = "New conversation";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type", rename_all = "snake_case")]
pub enum LogEntry {
    Task(TaskLogEntry),
    TaskResult(TaskResultEntry),
    TaskDebug(TaskDebugEntry),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub unique_id: ToolCallId,
    pub agent: String,
    #[serde(default)]
    pub args: Value,
    #[serde(rename = "_run_id", default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(
        rename = "_parent_unique_id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_unique_id: Option<ToolCallId>,
    #[serde(default)]
    pub created_at: String,
    /// Backend-specific fields, carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResultEntry {
    #[serde(rename = "_task_unique_id")]
    pub task_unique_id: ToolCallId,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub created_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskDebugEntry {
    #[serde(rename = "_task_unique_id")]
    pub task_unique_id: ToolCallId,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub created_at: String,
    /// Diagnostic payload (prompts, raw model output, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LogEntry {
    /// Task entry for a call created in orchestration batch `run_id`.
    pub fn task(call: &ToolCall, run_id: &RunId) -> Self {
        Self::Task(TaskLogEntry {
            unique_id: call.id.clone(),
            agent: call.function.name.clone(),
            args: Value::Object(call.function.arguments.clone()),
            run_id: Some(run_id.clone()),
            parent_unique_id: call.parent_unique_id.clone(),
            created_at: Utc::now().to_rfc3339(),
            extra: Map::new(),
        })
    }

    pub fn task_result(task_unique_id: ToolCallId, result: Value) -> Self {
        Self::TaskResult(TaskResultEntry {
            task_unique_id,
            result,
            created_at: Utc::now().to_rfc3339(),
            extra: Map::new(),
        })
    }

    /// Short type string, matching the `_type` tag.
    pub fn entry_type(&self) -> &'static str {
        match self {
            Self::Task(_) => "task",
            Self::TaskResult(_) => "task_result",
            Self::TaskDebug(_) => "task_debug",
        }
    }

    /// The task id this entry is about.
    pub fn task_id(&self) -> &ToolCallId {
        match self {
            Self::Task(t) => &t.unique_id,
            Self::TaskResult(r) => &r.task_unique_id,
            Self::TaskDebug(d) => &d.task_unique_id,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LogError {
    #[error("result for task {0} has no earlier task entry")]
    OrphanResult(ToolCallId),
    #[error("task {0} has more than one result")]
    DuplicateResult(ToolCallId),
}

/// Check that every result references an earlier task and no task has two results.
pub fn validate_log(log: &[LogEntry]) -> Result<(), LogError> {
    let mut tasks = HashSet::new();
    let mut resolved = HashSet::new();
    for entry in log {
        match entry {
            LogEntry::Task(t) => {
                tasks.insert(&t.unique_id);
            }
            LogEntry::TaskResult(r) => {
                if !tasks.contains(&r.task_unique_id) {
                    return Err(LogError::OrphanResult(r.task_unique_id.clone()));
                }
                if !resolved.insert(&r.task_unique_id) {
                    return Err(LogError::DuplicateResult(r.task_unique_id.clone()));
                }
            }
            LogEntry::TaskDebug(_) => {}
        }
    }
    Ok(())
}

/// Tasks without a result yet, in log order.
pub fn pending_tasks(log: &[LogEntry]) -> Vec<&TaskLogEntry> {
    let resolved: HashSet<&ToolCallId> = log
        .iter()
        .filter_map(|e| match e {
            LogEntry::TaskResult(r) => Some(&r.task_unique_id),
            _ => None,
        })
        .collect();
    log.iter()
        .filter_map(|e| match e {
            LogEntry::Task(t) if !resolved.contains(&t.unique_id) => Some(t),
            _ => None,
        })
        .collect()
}

/// Completed children of `parent`, grouped by run in first-appearance order.
///
/// This is the `child_tasks_batch` shape a resumed parent receives. Children
/// still waiting on a result are left out.
pub fn child_task_batches(log: &[LogEntry], parent: &ToolCallId) -> Vec<Vec<ChildTask>> {
    let results: HashMap<&ToolCallId, &Value> = log
        .iter()
        .filter_map(|e| match e {
            LogEntry::TaskResult(r) => Some((&r.task_unique_id, &r.result)),
            _ => None,
        })
        .collect();

    let mut order: Vec<Option<RunId>> = Vec::new();
    let mut batches: HashMap<Option<RunId>, Vec<ChildTask>> = HashMap::new();
    for entry in log {
        let LogEntry::Task(task) = entry else { continue };
        if task.parent_unique_id.as_ref() != Some(parent) {
            continue;
        }
        let Some(result) = results.get(&task.unique_id) else { continue };
        if !batches.contains_key(&task.run_id) {
            order.push(task.run_id.clone());
        }
        batches.entry(task.run_id.clone()).or_default().push(ChildTask {
            unique_id: task.unique_id.clone(),
            agent: task.agent.clone(),
            args: task.args.clone(),
            result: (*result).clone(),
            run_id: task.run_id.clone(),
        });
    }

    order
        .into_iter()
        .filter_map(|run| batches.remove(&run))
        .collect()
}

/// True when `parent` has spawned children and every one of them has a result.
pub fn children_complete(log: &[LogEntry], parent: &ToolCallId) -> bool {
    let children: Vec<&TaskLogEntry> = log
        .iter()
        .filter_map(|e| match e {
            LogEntry::Task(t) if t.parent_unique_id.as_ref() == Some(parent) => Some(t),
            _ => None,
        })
        .collect();
    if children.is_empty() {
        return false;
    }
    let pending: HashSet<&ToolCallId> = pending_tasks(log).into_iter().map(|t| &t.unique_id).collect();
    children.iter().all(|c| !pending.contains(&c.unique_id))
}

/// Display name for a conversation, from its first user message.
pub fn derive_conversation_name(first_message: Option<&str>) -> String {
    let line = first_message
        .and_then(|m| m.lines().map(str::trim).find(|l| !l.is_empty()))
        .unwrap_or("");
    if line.is_empty() {
        return DEFAULT_NAME.to_string();
    }
    if line.chars().count() <= MAX_NAME_CHARS {
        return line.to_string();
    }
    let truncated: String = line.chars().take(MAX_NAME_CHARS).collect();
    format!("{}…", truncated.trim_end())
}
