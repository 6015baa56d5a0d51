use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task, as stored in the external task record.
///
/// Wire format is the capitalized variant name (`"Queued"`, `"Deploying"`, ...)
/// to match the collaborator store's status field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Pending,
    Running,
    Deploying,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Deploying => "Deploying",
            Self::Completed => "Completed",
            Self::Error => "Error",
        }
    }

    /// Terminal for the task record itself. The processing slot has its own
    /// release points (see `queue.rs`); `Error` is not strictly terminal
    /// because a fix agent can move the lineage back to `Running`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Queued" => Ok(Self::Queued),
            "Pending" => Ok(Self::Pending),
            "Running" => Ok(Self::Running),
            "Deploying" => Ok(Self::Deploying),
            "Completed" => Ok(Self::Completed),
            "Error" => Ok(Self::Error),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Validate a task status transition.
///
/// `Error -> Running` is allowed: a fix agent relaunches the lineage and the
/// externally visible status walks the graph again.
pub fn is_valid_transition(from: &TaskStatus, to: &TaskStatus) -> bool {
    matches!(
        (from, to),
        (TaskStatus::Queued, TaskStatus::Pending)
            | (TaskStatus::Pending, TaskStatus::Running)
            | (TaskStatus::Pending, TaskStatus::Error)
            | (TaskStatus::Running, TaskStatus::Deploying)
            | (TaskStatus::Running, TaskStatus::Error)
            | (TaskStatus::Deploying, TaskStatus::Completed)
            | (TaskStatus::Deploying, TaskStatus::Error)
            | (TaskStatus::Error, TaskStatus::Running)
    )
}

/// Status of a remote agent job, as reported by the agent service.
///
/// Wire format is upper-case (`"CREATING"`, `"FINISHED"`, ...).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Creating,
    Running,
    Finished,
    Error,
    Expired,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "CREATING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
            Self::Expired => "EXPIRED",
        }
    }

    /// ERROR and EXPIRED both mean the job will never produce a deployment.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Error | Self::Expired)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATING" => Ok(Self::Creating),
            "RUNNING" => Ok(Self::Running),
            "FINISHED" => Ok(Self::Finished),
            "ERROR" => Ok(Self::Error),
            "EXPIRED" => Ok(Self::Expired),
            _ => Err(format!("Invalid agent status: {}", s)),
        }
    }
}

/// Free-form metadata attached to a prompt submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_branch: Option<String>,
}

/// A unit of requested work, owned by the orchestrator until terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Monotonic millisecond-epoch id, immutable.
    pub id: i64,
    pub prompt: String,
    #[serde(default)]
    pub metadata: TaskMetadata,
    pub created_at: String,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(prompt: String, metadata: TaskMetadata) -> Self {
        Self {
            id: next_task_id(),
            prompt,
            metadata,
            created_at: chrono::Utc::now().to_rfc3339(),
            status: TaskStatus::Queued,
        }
    }
}

static LAST_TASK_ID: AtomicI64 = AtomicI64::new(0);

/// Time-based task id, forced strictly monotonic even when two submissions
/// land in the same millisecond.
pub fn next_task_id() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let mut last = LAST_TASK_ID.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last + 1);
        match LAST_TASK_ID.compare_exchange_weak(
            last,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate,
            Err(observed) => last = observed,
        }
    }
}

/// Retry bookkeeping for one lineage of agent jobs, keyed by the *current*
/// agent id in the orchestrator's retry map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryRecord {
    pub count: u32,
    pub original_agent_id: String,
}

impl RetryRecord {
    pub fn initial(agent_id: &str) -> Self {
        Self {
            count: 0,
            original_agent_id: agent_id.to_string(),
        }
    }

    /// The record for a newly spawned fix agent: same lineage, count + 1.
    pub fn next(&self) -> Self {
        Self {
            count: self.count + 1,
            original_agent_id: self.original_agent_id.clone(),
        }
    }
}

/// Log analysis attached to a client-reported deployment error. Produced by
/// the collaborator UI's error classifier; field names follow its wire
/// format (camelCase).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorAnalysis {
    #[serde(default)]
    pub is_auto_fixable: bool,
    #[serde(default)]
    pub component_path: Option<String>,
    #[serde(default)]
    pub line_number: Option<u32>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
}

/// Deployment error details pushed by a client over the WebSocket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub logs: Option<String>,
    #[serde(default)]
    pub analysis: Option<ErrorAnalysis>,
}

// ── External store record types ───────────────────────────────────────

/// Body for creating a task record in the external store.
#[derive(Debug, Clone, Serialize)]
pub struct NewTaskRecord {
    pub component_name: Option<String>,
    pub component_directory: Option<String>,
    pub page_name: Option<String>,
    pub agent_id: Option<String>,
    pub agent_status: Option<AgentStatus>,
    pub agent_url: Option<String>,
    pub branch_name: Option<String>,
    pub status: TaskStatus,
}

impl NewTaskRecord {
    pub fn queued(task: &Task, staging_branch: &str) -> Self {
        Self {
            component_name: task.metadata.component_name.clone(),
            component_directory: task.metadata.component_directory.clone(),
            page_name: task.metadata.page_name.clone(),
            agent_id: None,
            agent_status: None,
            agent_url: None,
            branch_name: Some(staging_branch.to_string()),
            status: TaskStatus::Queued,
        }
    }
}

/// Partial update for a task record. The store resolves the target from
/// whichever selector fields (`id`, `component_name`, `agent_id`) are set;
/// unset fields are omitted from the wire entirely.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_status: Option<AgentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_agent_id: Option<String>,
}

/// A task record as returned by the external store. The store is eventually
/// consistent with webhook-driven updates, so most fields are optional.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TaskRecord {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub component_name: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub agent_status: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error_logs: Option<String>,
    #[serde(default)]
    pub deployment_logs: Option<String>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub previous_agent_id: Option<String>,
}

impl TaskRecord {
    /// Deployment error logs, preferring the deployment capture over the
    /// generic error field.
    pub fn failure_logs(&self) -> &str {
        self.deployment_logs
            .as_deref()
            .or(self.error_logs.as_deref())
            .unwrap_or("Unknown deployment error")
    }
}
