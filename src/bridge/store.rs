//! Client for the external task-record store.
//!
//! The store is a collaborator REST API (create / list / partial update over
//! `/api/tasks`). It is eventually consistent with webhook-driven updates
//! landing out of band, so callers tolerate stale reads and the deployment
//! poller compensates by re-fetching.
//!
//! The store usually runs as a local dev server on a shifting port, so the
//! base URL can be discovered by probing candidate ports and is re-discovered
//! once when a request cannot connect.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use super::models::{NewTaskRecord, TaskPatch, TaskRecord};

/// Per-probe timeout while discovering the store port.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Seam for the orchestrator; real implementation is [`HttpTaskStore`].
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a task record.
    async fn create(&self, record: &NewTaskRecord) -> Result<()>;

    /// Partially update a record; selector fields inside the patch identify
    /// the target.
    async fn update(&self, patch: &TaskPatch) -> Result<()>;

    /// Find the record currently associated with an agent id. `Ok(None)`
    /// means the store answered but has no such record yet.
    async fn find_by_agent(&self, agent_id: &str) -> Result<Option<TaskRecord>>;
}

#[derive(Debug, Deserialize)]
struct TasksEnvelope {
    #[serde(default)]
    tasks: Vec<TaskRecord>,
}

/// HTTP client for the task store.
pub struct HttpTaskStore {
    http: reqwest::Client,
    /// Configured base URL, if any; otherwise discovery picks one.
    explicit: Option<String>,
    probe_ports: Vec<u16>,
    resolved: RwLock<Option<String>>,
}

impl HttpTaskStore {
    pub fn new(explicit: Option<String>, probe_ports: Vec<u16>) -> Self {
        Self {
            http: reqwest::Client::new(),
            explicit: explicit.map(|u| u.trim_end_matches('/').to_string()),
            probe_ports,
            resolved: RwLock::new(None),
        }
    }

    /// Resolve the store base URL, probing candidate ports on first use.
    async fn base_url(&self) -> String {
        if let Some(url) = &self.explicit {
            return url.clone();
        }
        if let Some(url) = self.resolved.read().await.clone() {
            return url;
        }
        self.rediscover().await
    }

    /// Probe candidate ports and cache whichever answers. Any HTTP response,
    /// including an error status, proves the server is there.
    async fn rediscover(&self) -> String {
        if let Some(url) = &self.explicit {
            return url.clone();
        }
        for port in &self.probe_ports {
            let candidate = format!("http://localhost:{}", port);
            let probe = self
                .http
                .get(format!("{}/api/tasks", candidate))
                .timeout(PROBE_TIMEOUT)
                .send()
                .await;
            if probe.is_ok() {
                eprintln!("[store] found task store at {}", candidate);
                *self.resolved.write().await = Some(candidate.clone());
                return candidate;
            }
        }
        let fallback = format!(
            "http://localhost:{}",
            self.probe_ports.first().copied().unwrap_or(3000)
        );
        eprintln!("[store] could not detect task store, using {}", fallback);
        *self.resolved.write().await = Some(fallback.clone());
        fallback
    }

    /// Send a request built against the current base URL, re-discovering the
    /// port once if the connection is refused.
    async fn send(
        &self,
        build: impl Fn(&str) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let base = self.base_url().await;
        match build(&base).send().await {
            Ok(resp) => Ok(resp),
            Err(e) if e.is_connect() => {
                eprintln!("[store] connection failed, rediscovering store URL");
                *self.resolved.write().await = None;
                let base = self.rediscover().await;
                build(&base)
                    .send()
                    .await
                    .context("Task store request failed after rediscovery")
            }
            Err(e) => Err(e).context("Task store request failed"),
        }
    }
}

#[async_trait]
impl TaskStore for HttpTaskStore {
    async fn create(&self, record: &NewTaskRecord) -> Result<()> {
        let resp = self
            .send(|base| self.http.post(format!("{}/api/tasks", base)).json(record))
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("Task store create returned {}", resp.status());
        }
        Ok(())
    }

    async fn update(&self, patch: &TaskPatch) -> Result<()> {
        let resp = self
            .send(|base| self.http.patch(format!("{}/api/tasks", base)).json(patch))
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("Task store update returned {}", resp.status());
        }
        Ok(())
    }

    async fn find_by_agent(&self, agent_id: &str) -> Result<Option<TaskRecord>> {
        let resp = self
            .send(|base| self.http.get(format!("{}/api/tasks", base)))
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("Task store list returned {}", resp.status());
        }
        let envelope: TasksEnvelope = resp
            .json()
            .await
            .context("Failed to parse task store response")?;
        Ok(find_agent_record(envelope.tasks, agent_id))
    }
}

/// Pick the record whose `agent_id` matches exactly. Correlation is by agent
/// id only, never by branch name, so a reused staging branch cannot
/// attribute a deployment to the wrong task.
fn find_agent_record(tasks: Vec<TaskRecord>, agent_id: &str) -> Option<TaskRecord> {
    tasks
        .into_iter()
        .find(|t| t.agent_id.as_deref() == Some(agent_id))
}
