//! Task queue and orchestrator.
//!
//! Owns the single-concurrency task lifecycle: enqueue → stage via the VCS
//! operator → dispatch to the agent client → poll the agent → hand off to the
//! deployment-status poll → merge on success or invoke the retry controller
//! on failure → free the slot → dequeue the next task.
//!
//! The processing slot (a flag + current task id) is the only concurrency
//! primitive. Every path that sets it funnels its release through
//! [`Orchestrator::release_slot_and_advance`], which is generation-checked:
//! spawning a fix agent bumps the generation, so a superseded polling loop
//! can never double-free the slot or double-advance the queue. No failure is
//! allowed to escape a polling tick or pipeline step: anything unexpected
//! becomes a logged warning or a terminal transition plus slot release,
//! because an escaped error would stall the queue forever.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use super::agent::{AgentApi, CreatedAgent};
use super::config::{BridgeConfig, PollSection};
use super::git::{StagedComponent, Vcs};
use super::models::{
    AgentStatus, NewTaskRecord, RetryRecord, Task, TaskMetadata, TaskPatch, TaskRecord, TaskStatus,
};
use super::prompts;
use super::store::TaskStore;
use super::ws::{WsMessage, broadcast_message};
use crate::errors::MergeError;

/// Timeout for the local CLI dispatch fallback.
const FALLBACK_CLI_TIMEOUT: Duration = Duration::from_secs(10);

/// Polling cadence, iteration caps, and the retry bound.
///
/// Intervals are injectable so tests can run the loops at full speed instead
/// of waiting wall-clock seconds.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub agent_interval: Duration,
    pub agent_max_polls: u32,
    pub deploy_interval: Duration,
    pub deploy_max_polls: u32,
    pub max_retries: u32,
}

impl From<&PollSection> for PollSettings {
    fn from(section: &PollSection) -> Self {
        Self {
            agent_interval: Duration::from_secs(section.agent_interval_secs),
            agent_max_polls: section.agent_max_polls,
            deploy_interval: Duration::from_secs(section.deploy_interval_secs),
            deploy_max_polls: section.deploy_max_polls,
            max_retries: section.max_retries,
        }
    }
}

/// Dispatch fallbacks tried when the agent service rejects a creation.
#[derive(Debug, Clone, Default)]
pub struct FallbackTargets {
    pub cli_cmd: Option<String>,
    pub relay_url: Option<String>,
}

/// Orchestrator wiring that isn't a collaborator client.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub staging_branch: String,
    pub prompts_dir: PathBuf,
    pub fallback: FallbackTargets,
    pub poll: PollSettings,
}

impl OrchestratorSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            staging_branch: config.repo.staging_branch.clone(),
            prompts_dir: config.prompts_dir(),
            fallback: FallbackTargets {
                cli_cmd: config.fallback.cli_cmd.clone(),
                relay_url: config.fallback.relay_url.clone(),
            },
            poll: PollSettings::from(&config.poll),
        }
    }
}

/// Queue + slot state. Mutated only under the lock, never across an await.
struct QueueState {
    queue: VecDeque<Task>,
    processing: bool,
    current_task_id: Option<i64>,
    /// Bumped each time a pipeline (or fix agent) takes ownership of the
    /// slot. Terminal actions from older loops are ignored.
    generation: u64,
}

/// Point-in-time view of the queue, for tests and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub queued: usize,
    pub processing: bool,
    pub current_task_id: Option<i64>,
}

/// Single-worker task orchestrator.
pub struct Orchestrator {
    agent: Arc<dyn AgentApi>,
    store: Arc<dyn TaskStore>,
    vcs: Arc<dyn Vcs>,
    tx: broadcast::Sender<String>,
    settings: OrchestratorSettings,
    state: Mutex<QueueState>,
    retries: Mutex<HashMap<String, RetryRecord>>,
}

impl Orchestrator {
    pub fn new(
        agent: Arc<dyn AgentApi>,
        store: Arc<dyn TaskStore>,
        vcs: Arc<dyn Vcs>,
        tx: broadcast::Sender<String>,
        settings: OrchestratorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent,
            store,
            vcs,
            tx,
            settings,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                processing: false,
                current_task_id: None,
                generation: 0,
            }),
            retries: Mutex::new(HashMap::new()),
        })
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().expect("queue lock poisoned");
        QueueSnapshot {
            queued: state.queue.len(),
            processing: state.processing,
            current_task_id: state.current_task_id,
        }
    }

    /// Retry record for an agent id, if any fix agent lineage exists.
    pub fn retry_record(&self, agent_id: &str) -> Option<RetryRecord> {
        self.retries
            .lock()
            .expect("retry lock poisoned")
            .get(agent_id)
            .cloned()
    }

    fn retry_count_for(&self, agent_id: &str) -> u32 {
        self.retry_record(agent_id).map(|r| r.count).unwrap_or(0)
    }

    fn staging_branch_for<'a>(&'a self, task: &'a Task) -> &'a str {
        task.metadata
            .staging_branch
            .as_deref()
            .unwrap_or(&self.settings.staging_branch)
    }

    /// Append a task to the queue, notify listeners of its position, record
    /// it in the external store, and start processing if the slot is free.
    pub async fn enqueue(self: Arc<Self>, task: Task) {
        let (position, total) = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            state.queue.push_back(task.clone());
            // Position counts the in-flight task, so the first waiter behind
            // a running task reports position 2.
            let position = state.queue.len() + usize::from(state.processing);
            (position, state.queue.len())
        };
        eprintln!(
            "[queue] task {} queued (position {}, waiting {})",
            task.id, position, total
        );
        broadcast_message(
            &self.tx,
            &WsMessage::TaskQueued {
                task_id: task.id,
                queue_position: position,
                total_in_queue: total,
                metadata: task.metadata.clone(),
            },
        );

        let record = NewTaskRecord::queued(&task, self.staging_branch_for(&task));
        if let Err(e) = self.store.create(&record).await {
            eprintln!("[queue] failed to record queued task: {:#}", e);
        }

        self.drain_next();
    }

    /// Start the next task if the slot is free and the queue is non-empty;
    /// otherwise a no-op. Sync on purpose: queue mutation happens entirely
    /// under the lock, and the pipeline itself runs on a spawned task.
    pub fn drain_next(self: Arc<Self>) {
        let (task, generation, remaining) = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.processing {
                return;
            }
            let Some(task) = state.queue.pop_front() else {
                return;
            };
            state.processing = true;
            state.current_task_id = Some(task.id);
            state.generation += 1;
            (task, state.generation, state.queue.len())
        };
        eprintln!(
            "[queue] processing task {} ({} remaining in queue)",
            task.id, remaining
        );
        tokio::spawn(self.process_task(task, generation));
    }

    /// Free the processing slot and start the next queued task. A stale
    /// generation means a newer loop owns the slot; do nothing.
    fn release_slot_and_advance(self: Arc<Self>, generation: u64) {
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.generation != generation {
                eprintln!(
                    "[queue] ignoring slot release from superseded loop (generation {})",
                    generation
                );
                return;
            }
            state.processing = false;
            state.current_task_id = None;
        }
        eprintln!("[queue] processing slot freed");
        self.drain_next();
    }

    /// Bump the generation for a fix agent taking over the slot. The slot
    /// stays held; the previous loops become stale.
    fn supersede_generation(&self) -> u64 {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.generation += 1;
        state.generation
    }

    // ── Task pipeline ────────────────────────────────────────────────

    async fn process_task(self: Arc<Self>, task: Task, generation: u64) {
        // Step 1: pull latest trunk (best-effort).
        self.vcs.pull_trunk().await;

        // Steps 2-3: staging branch sync + component commit/push.
        let staging = self.staging_branch_for(&task).to_string();
        let component = staged_component(&task.metadata);
        self.vcs.prepare_staging(&staging, component.as_ref()).await;

        // Step 4: Queued -> Pending in the external store.
        if let Some(name) = &task.metadata.component_name {
            let patch = TaskPatch {
                component_name: Some(name.clone()),
                status: Some(TaskStatus::Pending),
                ..Default::default()
            };
            if let Err(e) = self.store.update(&patch).await {
                eprintln!("[queue] failed to mark task Pending: {:#}", e);
            }
        } else {
            eprintln!("[queue] component name missing, skipping status update");
        }

        // Step 5: persist the active-prompt artifact for manual fallback.
        let artifact = match prompts::write_active_prompt(&self.settings.prompts_dir, &task).await {
            Ok(path) => Some(path),
            Err(e) => {
                eprintln!("[queue] failed to write active prompt: {:#}", e);
                None
            }
        };

        // Step 6: dispatch to the remote agent service.
        match self.agent.create_agent(&task.prompt, &staging).await {
            Ok(created) => {
                eprintln!(
                    "[queue] agent {} created for task {} on {}",
                    created.id, task.id, staging
                );
                broadcast_message(
                    &self.tx,
                    &WsMessage::AgentCreated {
                        agent_id: created.id.clone(),
                        agent_status: created.status,
                        agent_url: created.url.clone(),
                        branch_name: created.branch_name.clone(),
                        metadata: task.metadata.clone(),
                    },
                );
                self.record_dispatch(&task, &created).await;

                // Step 7: agent-completion poll. The slot stays held until
                // the deployment resolves.
                self.poll_agent(task, created.id, generation).await;
            }
            Err(e) => {
                eprintln!("[queue] agent dispatch failed: {:#}", e);
                self.dispatch_fallbacks(&task.prompt, artifact.as_deref())
                    .await;
                // Step 8: a failed dispatch never retains the slot.
                self.release_slot_and_advance(generation);
            }
        }
    }

    /// Attach the created agent to the task record and move it to Running.
    async fn record_dispatch(&self, task: &Task, created: &CreatedAgent) {
        let Some(name) = &task.metadata.component_name else {
            return;
        };
        let patch = TaskPatch {
            component_name: Some(name.clone()),
            agent_id: Some(created.id.clone()),
            agent_status: Some(created.status),
            agent_url: created.url.clone(),
            status: Some(TaskStatus::Running),
            ..Default::default()
        };
        if let Err(e) = self.store.update(&patch).await {
            eprintln!("[queue] failed to record dispatched agent: {:#}", e);
        }
    }

    /// Route a client-reported deployment error to the local editor: write
    /// the fix prompt artifact, then walk the dispatch fallback cascade.
    /// Never touches the queue.
    pub async fn dispatch_fix_to_editor(&self, fix_prompt: &str) {
        let artifact =
            match prompts::write_fix_prompt(&self.settings.prompts_dir, fix_prompt).await {
                Ok(path) => Some(path),
                Err(e) => {
                    eprintln!("[queue] failed to write fix prompt: {:#}", e);
                    None
                }
            };
        self.dispatch_fallbacks(fix_prompt, artifact.as_deref()).await;
    }

    /// Dispatch fallback cascade: local CLI, then the editor-extension
    /// relay, then a manual-action notification. Best-effort throughout.
    async fn dispatch_fallbacks(&self, prompt: &str, artifact: Option<&Path>) {
        let artifact_str = artifact.map(|p| p.display().to_string());

        if let (Some(cmd), Some(path)) = (&self.settings.fallback.cli_cmd, artifact) {
            let run = tokio::time::timeout(
                FALLBACK_CLI_TIMEOUT,
                tokio::process::Command::new(cmd).arg(path).output(),
            )
            .await;
            match run {
                Ok(Ok(output)) if output.status.success() => {
                    eprintln!("[queue] dispatched via local CLI fallback");
                    broadcast_message(
                        &self.tx,
                        &WsMessage::AgentFailed {
                            message: "Remote dispatch failed; local CLI fallback used instead"
                                .to_string(),
                            file: artifact_str,
                        },
                    );
                    return;
                }
                _ => {
                    eprintln!("[queue] CLI fallback unavailable, trying extension relay");
                }
            }
        }

        if let Some(relay) = &self.settings.fallback.relay_url {
            let prompt = match &artifact_str {
                Some(path) => format!("Read and execute the prompt in {}", path),
                None => prompt.to_string(),
            };
            let payload = serde_json::json!({
                "type": "open_composer",
                "prompt": prompt,
                "metadata": {
                    "source": "taskbridge",
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                },
            });
            let sent = reqwest::Client::new()
                .post(relay)
                .json(&payload)
                .timeout(FALLBACK_CLI_TIMEOUT)
                .send()
                .await;
            match sent {
                Ok(resp) if resp.status().is_success() => {
                    eprintln!("[queue] dispatched via extension relay fallback");
                    broadcast_message(
                        &self.tx,
                        &WsMessage::AgentFailed {
                            message: "Remote dispatch failed; prompt relayed to the editor extension"
                                .to_string(),
                            file: artifact_str,
                        },
                    );
                    return;
                }
                _ => {
                    eprintln!("[queue] extension relay unavailable");
                }
            }
        }

        eprintln!("[queue] all dispatch methods failed; manual action required");
        broadcast_message(
            &self.tx,
            &WsMessage::AgentFailed {
                message: "All dispatch methods failed; run the active prompt manually".to_string(),
                file: artifact_str,
            },
        );
    }

    // ── Polling loops ────────────────────────────────────────────────

    /// Agent-completion poll. Fixed interval, capped iterations; transient
    /// fetch failures count toward the cap and reschedule.
    ///
    /// Returns a boxed future so the recursive dispatch through
    /// [`Orchestrator::attempt_retry`] (which spawns this poll again) has a
    /// concrete `Send` type, breaking the async auto-trait inference cycle.
    fn poll_agent(
        self: Arc<Self>,
        task: Task,
        agent_id: String,
        generation: u64,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
        let mut polls: u32 = 0;
        loop {
            tokio::time::sleep(self.settings.poll.agent_interval).await;
            polls += 1;
            if polls > self.settings.poll.agent_max_polls {
                eprintln!(
                    "[queue] agent poll cap reached for {} after {} polls",
                    agent_id,
                    polls - 1
                );
                self.release_slot_and_advance(generation);
                return;
            }

            let report = match self.agent.agent_status(&agent_id).await {
                Ok(report) => report,
                Err(e) => {
                    eprintln!("[queue] agent status fetch failed (rescheduling): {:#}", e);
                    continue;
                }
            };
            eprintln!(
                "[queue] agent {} status: {} (poll {}/{})",
                agent_id, report.status, polls, self.settings.poll.agent_max_polls
            );
            broadcast_message(
                &self.tx,
                &WsMessage::AgentStatusUpdate {
                    agent_id: agent_id.clone(),
                    agent_status: report.status,
                    response: report.raw.clone(),
                },
            );

            match report.status {
                AgentStatus::Finished => {
                    let branch = report.branch_name.clone();
                    // Keep the task Running: the slot is held until the
                    // deployment resolves, and the store record must stay
                    // findable by agent id for the deployment poll.
                    let patch = TaskPatch {
                        agent_id: Some(agent_id.clone()),
                        agent_status: Some(AgentStatus::Finished),
                        branch_name: branch.clone(),
                        status: Some(TaskStatus::Running),
                        ..Default::default()
                    };
                    if let Err(e) = self.store.update(&patch).await {
                        eprintln!("[queue] failed to mark agent finished: {:#}", e);
                    }
                    broadcast_message(
                        &self.tx,
                        &WsMessage::AgentCompleted {
                            agent_id: agent_id.clone(),
                            agent_status: AgentStatus::Finished,
                            branch_name: branch.clone(),
                            message: "Agent completed, waiting for preview deployment".to_string(),
                        },
                    );
                    eprintln!("[queue] slot stays held until deployment resolves");
                    self.poll_deployment(task, agent_id, branch, generation).await;
                    return;
                }
                AgentStatus::Error | AgentStatus::Expired => {
                    eprintln!("[queue] agent {} failed ({})", agent_id, report.status);
                    let patch = TaskPatch {
                        agent_id: Some(agent_id.clone()),
                        agent_status: Some(report.status),
                        status: Some(TaskStatus::Error),
                        ..Default::default()
                    };
                    if let Err(e) = self.store.update(&patch).await {
                        eprintln!("[queue] failed to mark task Error: {:#}", e);
                    }
                    broadcast_message(
                        &self.tx,
                        &WsMessage::AgentError {
                            agent_id: agent_id.clone(),
                            agent_status: report.status,
                        },
                    );
                    // No fix agent for agent-infrastructure failures; the
                    // remediation loop fixes code, not the agent service.
                    self.release_slot_and_advance(generation);
                    return;
                }
                AgentStatus::Creating | AgentStatus::Running => {}
            }
        }
        })
    }

    /// Deployment-status poll. Watches the external task record (by agent id
    /// only) for the webhook-driven status transitions.
    async fn poll_deployment(
        self: Arc<Self>,
        task: Task,
        agent_id: String,
        agent_branch: Option<String>,
        generation: u64,
    ) {
        eprintln!("[queue] watching deployment status for agent {}", agent_id);
        let mut polls: u32 = 0;
        let mut merged = false;
        loop {
            tokio::time::sleep(self.settings.poll.deploy_interval).await;
            polls += 1;
            if polls > self.settings.poll.deploy_max_polls {
                eprintln!(
                    "[queue] deployment poll cap reached for {} after {} polls",
                    agent_id,
                    polls - 1
                );
                broadcast_message(
                    &self.tx,
                    &WsMessage::DeploymentTimeout {
                        agent_id: agent_id.clone(),
                        message: "Deployment verification timed out".to_string(),
                    },
                );
                self.release_slot_and_advance(generation);
                return;
            }

            let record = match self.store.find_by_agent(&agent_id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    eprintln!("[queue] no task record for agent {} yet", agent_id);
                    continue;
                }
                Err(e) => {
                    eprintln!("[queue] task record fetch failed (rescheduling): {:#}", e);
                    continue;
                }
            };
            let status = record.status.clone().unwrap_or_default();
            eprintln!(
                "[queue] task status: {} (poll {}/{})",
                status, polls, self.settings.poll.deploy_max_polls
            );

            match status.as_str() {
                // Preview build succeeded (webhook flipped the record).
                "Deploying" => {
                    if merged {
                        continue; // Waiting for the production confirmation.
                    }
                    let branch = record
                        .branch_name
                        .clone()
                        .or_else(|| agent_branch.clone())
                        .unwrap_or_else(|| self.staging_branch_for(&task).to_string());
                    eprintln!("[queue] preview deployment succeeded, merging {}", branch);
                    match self.vcs.merge_to_trunk(&branch).await {
                        Ok(()) => {
                            merged = true;
                            broadcast_message(
                                &self.tx,
                                &WsMessage::DeploymentSuccess {
                                    agent_id: agent_id.clone(),
                                    status: TaskStatus::Deploying,
                                    branch_name: Some(branch),
                                    message: "Preview succeeded, merged to trunk, waiting for production deployment"
                                        .to_string(),
                                },
                            );
                            // Keep polling for the production confirmation.
                        }
                        Err(e) => {
                            let message = match &e {
                                MergeError::Conflict { .. } => format!("{}", e),
                                MergeError::Other(_) => format!("Failed to merge: {:#}", e),
                            };
                            eprintln!("[queue] {}", message);
                            let patch = TaskPatch {
                                agent_id: Some(agent_id.clone()),
                                status: Some(TaskStatus::Error),
                                ..Default::default()
                            };
                            if let Err(e) = self.store.update(&patch).await {
                                eprintln!("[queue] failed to mark task Error: {:#}", e);
                            }
                            broadcast_message(
                                &self.tx,
                                &WsMessage::DeploymentError {
                                    agent_id: agent_id.clone(),
                                    status: TaskStatus::Error,
                                    message,
                                    retry_count: self.retry_count_for(&agent_id),
                                },
                            );
                            self.release_slot_and_advance(generation);
                            return;
                        }
                    }
                }
                // Production deployment confirmed.
                "Completed" => {
                    eprintln!("[queue] task completed for agent {}", agent_id);
                    broadcast_message(
                        &self.tx,
                        &WsMessage::TaskCompleted {
                            agent_id: agent_id.clone(),
                            status: TaskStatus::Completed,
                            message: "Production deployment succeeded, task completed".to_string(),
                        },
                    );
                    self.release_slot_and_advance(generation);
                    return;
                }
                // Preview build failed.
                "Error" => {
                    eprintln!("[queue] preview deployment failed for agent {}", agent_id);
                    if Arc::clone(&self).attempt_retry(&agent_id, &record, &task).await {
                        // A fix agent owns a fresh poll under a newer
                        // generation; exit without freeing the slot.
                        eprintln!("[queue] retry initiated, leaving superseded deployment poll");
                        return;
                    }
                    let retry_count = self.retry_count_for(&agent_id);
                    broadcast_message(
                        &self.tx,
                        &WsMessage::DeploymentError {
                            agent_id: agent_id.clone(),
                            status: TaskStatus::Error,
                            message: format!(
                                "Preview deployment failed after {} retries",
                                retry_count
                            ),
                            retry_count,
                        },
                    );
                    self.release_slot_and_advance(generation);
                    return;
                }
                _ => {} // Not resolved yet; reschedule.
            }
        }
    }

    // ── Retry/fix controller ─────────────────────────────────────────

    /// Spawn a fix agent for a failed deployment, bounded per lineage.
    /// Returns whether a new agent took over (the caller keeps the slot
    /// held in that case).
    async fn attempt_retry(
        self: Arc<Self>,
        failed_agent_id: &str,
        record: &TaskRecord,
        task: &Task,
    ) -> bool {
        let lineage = self
            .retry_record(failed_agent_id)
            .unwrap_or_else(|| RetryRecord::initial(failed_agent_id));
        if lineage.count >= self.settings.poll.max_retries {
            eprintln!(
                "[queue] retries exhausted for lineage {} ({}/{})",
                lineage.original_agent_id, lineage.count, self.settings.poll.max_retries
            );
            return false;
        }
        eprintln!(
            "[queue] attempting automatic retry ({}/{})",
            lineage.count + 1,
            self.settings.poll.max_retries
        );

        let branch = record
            .branch_name
            .clone()
            .unwrap_or_else(|| self.staging_branch_for(task).to_string());
        let fix_prompt = prompts::fix_prompt(record.failure_logs(), Some(&branch), failed_agent_id);

        let created = match self.agent.create_agent(&fix_prompt, &branch).await {
            Ok(created) => created,
            Err(e) => {
                eprintln!("[queue] failed to create fix agent: {:#}", e);
                return false;
            }
        };
        eprintln!("[queue] fix agent {} created", created.id);

        let next = lineage.next();
        self.retries
            .lock()
            .expect("retry lock poisoned")
            .insert(created.id.clone(), next.clone());

        let patch = TaskPatch {
            id: record.id,
            component_name: record.component_name.clone(),
            agent_id: Some(created.id.clone()),
            status: Some(TaskStatus::Running),
            agent_status: Some(AgentStatus::Creating),
            retry_count: Some(next.count),
            previous_agent_id: Some(failed_agent_id.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.store.update(&patch).await {
            eprintln!("[queue] failed to update task with fix agent: {:#}", e);
            return false;
        }

        broadcast_message(
            &self.tx,
            &WsMessage::DeploymentRetry {
                original_agent_id: failed_agent_id.to_string(),
                new_agent_id: created.id.clone(),
                retry_count: next.count,
                max_retries: self.settings.poll.max_retries,
                message: format!(
                    "Retry {}/{}: fix agent created",
                    next.count, self.settings.poll.max_retries
                ),
            },
        );

        // The fix agent owns the slot from here; older loops go stale.
        let generation = self.supersede_generation();
        let this = Arc::clone(&self);
        let task = task.clone();
        let new_agent_id = created.id.clone();
        tokio::spawn(this.poll_agent(task, new_agent_id, generation));
        true
    }

    // ── Out-of-band status sync ──────────────────────────────────────

    /// Handle a status-check request: fetch the agent's status and sync the
    /// store and listeners, without touching the queue.
    pub async fn sync_agent_status(&self, agent_id: &str) {
        let report = match self.agent.agent_status(agent_id).await {
            Ok(report) => report,
            Err(e) => {
                eprintln!("[queue] status check for {} failed: {:#}", agent_id, e);
                return;
            }
        };
        eprintln!("[queue] agent {} status: {}", agent_id, report.status);
        broadcast_message(
            &self.tx,
            &WsMessage::AgentStatusUpdate {
                agent_id: agent_id.to_string(),
                agent_status: report.status,
                response: report.raw.clone(),
            },
        );

        match report.status {
            AgentStatus::Finished => {
                let patch = TaskPatch {
                    agent_id: Some(agent_id.to_string()),
                    agent_status: Some(AgentStatus::Finished),
                    branch_name: report.branch_name.clone(),
                    status: Some(TaskStatus::Running),
                    ..Default::default()
                };
                if let Err(e) = self.store.update(&patch).await {
                    eprintln!("[queue] failed to sync finished agent: {:#}", e);
                }
                broadcast_message(
                    &self.tx,
                    &WsMessage::AgentCompleted {
                        agent_id: agent_id.to_string(),
                        agent_status: AgentStatus::Finished,
                        branch_name: report.branch_name,
                        message: "Agent completed, waiting for preview deployment".to_string(),
                    },
                );
            }
            AgentStatus::Error | AgentStatus::Expired => {
                broadcast_message(
                    &self.tx,
                    &WsMessage::AgentError {
                        agent_id: agent_id.to_string(),
                        agent_status: report.status,
                    },
                );
            }
            AgentStatus::Creating | AgentStatus::Running => {}
        }
    }
}

/// Component files to stage, derived from task metadata. The directory
/// defaults to the component name when no explicit path was given.
fn staged_component(metadata: &TaskMetadata) -> Option<StagedComponent> {
    metadata.component_name.as_ref().map(|name| StagedComponent {
        name: name.clone(),
        path: metadata
            .component_directory
            .clone()
            .unwrap_or_else(|| name.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AgentApiError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::bridge::agent::{AgentApi, AgentStatusReport};

    // ── Test doubles ─────────────────────────────────────────────────

    /// Scripted agent service. Creation auto-succeeds with sequential ids
    /// unless failures are scripted; status calls pop from a shared
    /// sequence and fall back to `fallback_status` once it is drained.
    struct MockAgentApi {
        create_failures: Mutex<VecDeque<AgentApiError>>,
        created: Mutex<Vec<(String, String)>>,
        next_id: AtomicU32,
        statuses: Mutex<VecDeque<AgentStatus>>,
        fallback_status: AgentStatus,
        status_calls: AtomicU32,
    }

    impl MockAgentApi {
        fn new(statuses: Vec<AgentStatus>, fallback_status: AgentStatus) -> Self {
            Self {
                create_failures: Mutex::new(VecDeque::new()),
                created: Mutex::new(Vec::new()),
                next_id: AtomicU32::new(0),
                statuses: Mutex::new(statuses.into()),
                fallback_status,
                status_calls: AtomicU32::new(0),
            }
        }

        fn failing_creation(count: usize) -> Self {
            let mock = Self::new(vec![], AgentStatus::Running);
            {
                let mut failures = mock.create_failures.lock().unwrap();
                for _ in 0..count {
                    failures.push_back(AgentApiError::Network("connection refused".into()));
                }
            }
            mock
        }

        fn created_prompts(&self) -> Vec<String> {
            self.created
                .lock()
                .unwrap()
                .iter()
                .map(|(prompt, _)| prompt.clone())
                .collect()
        }
    }

    #[async_trait]
    impl AgentApi for MockAgentApi {
        async fn create_agent(
            &self,
            prompt: &str,
            branch_ref: &str,
        ) -> Result<CreatedAgent, AgentApiError> {
            self.created
                .lock()
                .unwrap()
                .push((prompt.to_string(), branch_ref.to_string()));
            if let Some(err) = self.create_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(CreatedAgent {
                id: format!("agent-{}", n),
                status: AgentStatus::Creating,
                url: Some(format!("https://agents.example/agent-{}", n)),
                branch_name: None,
            })
        }

        async fn agent_status(&self, _agent_id: &str) -> Result<AgentStatusReport, AgentApiError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            let status = self
                .statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.fallback_status);
            Ok(AgentStatusReport {
                status,
                branch_name: None,
                raw: serde_json::json!({"status": status.as_str()}),
            })
        }
    }

    /// What a scripted `find_by_agent` call should produce.
    enum DeployTick {
        Status(&'static str),
        Missing,
        Fail,
    }

    struct MockStore {
        creates: Mutex<Vec<NewTaskRecord>>,
        patches: Mutex<Vec<TaskPatch>>,
        deploy_script: Mutex<VecDeque<DeployTick>>,
        fallback_deploy: &'static str,
        find_calls: AtomicU32,
    }

    impl MockStore {
        fn new(script: Vec<DeployTick>, fallback_deploy: &'static str) -> Self {
            Self {
                creates: Mutex::new(Vec::new()),
                patches: Mutex::new(Vec::new()),
                deploy_script: Mutex::new(script.into()),
                fallback_deploy,
                find_calls: AtomicU32::new(0),
            }
        }

        fn patched_statuses(&self) -> Vec<TaskStatus> {
            self.patches
                .lock()
                .unwrap()
                .iter()
                .filter_map(|p| p.status)
                .collect()
        }
    }

    #[async_trait]
    impl TaskStore for MockStore {
        async fn create(&self, record: &NewTaskRecord) -> anyhow::Result<()> {
            self.creates.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn update(&self, patch: &TaskPatch) -> anyhow::Result<()> {
            self.patches.lock().unwrap().push(patch.clone());
            Ok(())
        }

        async fn find_by_agent(&self, agent_id: &str) -> anyhow::Result<Option<TaskRecord>> {
            self.find_calls.fetch_add(1, Ordering::SeqCst);
            let tick = self.deploy_script.lock().unwrap().pop_front();
            let status = match tick {
                Some(DeployTick::Status(s)) => s,
                Some(DeployTick::Missing) => return Ok(None),
                Some(DeployTick::Fail) => anyhow::bail!("store unavailable"),
                None => self.fallback_deploy,
            };
            Ok(Some(TaskRecord {
                id: Some(1),
                agent_id: Some(agent_id.to_string()),
                branch_name: Some("bridge-staging".to_string()),
                status: Some(status.to_string()),
                deployment_logs: Some("\u{1b}[31mModule not found\u{1b}[0m".to_string()),
                ..Default::default()
            }))
        }
    }

    struct MockVcs {
        merges: Mutex<Vec<String>>,
        merge_conflicts: Mutex<VecDeque<bool>>,
    }

    impl MockVcs {
        fn new() -> Self {
            Self {
                merges: Mutex::new(Vec::new()),
                merge_conflicts: Mutex::new(VecDeque::new()),
            }
        }

        fn with_conflict() -> Self {
            let vcs = Self::new();
            vcs.merge_conflicts.lock().unwrap().push_back(true);
            vcs
        }
    }

    #[async_trait]
    impl Vcs for MockVcs {
        async fn pull_trunk(&self) {}

        async fn prepare_staging(&self, _staging_branch: &str, _component: Option<&StagedComponent>) {
        }

        async fn merge_to_trunk(&self, branch: &str) -> Result<(), MergeError> {
            self.merges.lock().unwrap().push(branch.to_string());
            if self.merge_conflicts.lock().unwrap().pop_front().unwrap_or(false) {
                return Err(MergeError::Conflict {
                    branch: branch.to_string(),
                });
            }
            Ok(())
        }

        async fn remote_https_url(&self) -> anyhow::Result<String> {
            Ok("https://github.com/owner/repo".to_string())
        }
    }

    // ── Harness ──────────────────────────────────────────────────────

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        agent: Arc<MockAgentApi>,
        store: Arc<MockStore>,
        vcs: Arc<MockVcs>,
        rx: broadcast::Receiver<String>,
        _prompts_dir: tempfile::TempDir,
    }

    fn instant_polls() -> PollSettings {
        PollSettings {
            agent_interval: Duration::ZERO,
            agent_max_polls: 180,
            deploy_interval: Duration::ZERO,
            deploy_max_polls: 120,
            max_retries: 3,
        }
    }

    fn harness(agent: MockAgentApi, store: MockStore, vcs: MockVcs) -> Harness {
        harness_with_polls(agent, store, vcs, instant_polls())
    }

    fn harness_with_polls(
        agent: MockAgentApi,
        store: MockStore,
        vcs: MockVcs,
        poll: PollSettings,
    ) -> Harness {
        let agent = Arc::new(agent);
        let store = Arc::new(store);
        let vcs = Arc::new(vcs);
        let (tx, rx) = broadcast::channel(1024);
        let prompts_dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            Arc::clone(&agent) as Arc<dyn AgentApi>,
            Arc::clone(&store) as Arc<dyn TaskStore>,
            Arc::clone(&vcs) as Arc<dyn Vcs>,
            tx,
            OrchestratorSettings {
                staging_branch: "bridge-staging".to_string(),
                prompts_dir: prompts_dir.path().to_path_buf(),
                fallback: FallbackTargets::default(),
                poll,
            },
        );
        Harness {
            orchestrator,
            agent,
            store,
            vcs,
            rx,
            _prompts_dir: prompts_dir,
        }
    }

    fn task_named(prompt: &str, component: &str) -> Task {
        Task::new(
            prompt.to_string(),
            TaskMetadata {
                component_name: Some(component.to_string()),
                ..Default::default()
            },
        )
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached in time");
    }

    fn drain_events(rx: &mut broadcast::Receiver<String>) -> Vec<serde_json::Value> {
        let mut events = Vec::new();
        while let Ok(json) = rx.try_recv() {
            events.push(serde_json::from_str(&json).unwrap());
        }
        events
    }

    fn event_types(events: &[serde_json::Value]) -> Vec<String> {
        events
            .iter()
            .map(|e| e["type"].as_str().unwrap_or("").to_string())
            .collect()
    }

    // ── Tests ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn fifo_order_preserved_across_dispatch_failures() {
        // Every dispatch fails, so each task releases the slot and the next
        // begins; the attempt order must match the arrival order.
        let h = harness(
            MockAgentApi::failing_creation(3),
            MockStore::new(vec![], "Running"),
            MockVcs::new(),
        );

        for prompt in ["first", "second", "third"] {
            Arc::clone(&h.orchestrator)
                .enqueue(task_named(prompt, "Comp"))
                .await;
        }

        wait_until(|| {
            h.agent.created.lock().unwrap().len() == 3 && !h.orchestrator.snapshot().processing
        })
        .await;

        assert_eq!(h.agent.created_prompts(), vec!["first", "second", "third"]);
        assert_eq!(h.store.creates.lock().unwrap().len(), 3);
        assert_eq!(h.orchestrator.snapshot().queued, 0);
    }

    #[tokio::test]
    async fn single_flight_and_queue_position() {
        // First agent never finishes; slow the poll down so the first task
        // holds the slot while the second arrives.
        let mut poll = instant_polls();
        poll.agent_interval = Duration::from_millis(20);
        let mut h = harness_with_polls(
            MockAgentApi::new(vec![], AgentStatus::Running),
            MockStore::new(vec![], "Running"),
            MockVcs::new(),
            poll,
        );

        Arc::clone(&h.orchestrator)
            .enqueue(task_named("hang forever", "A"))
            .await;
        wait_until(|| h.orchestrator.snapshot().processing).await;

        Arc::clone(&h.orchestrator)
            .enqueue(task_named("wait in line", "B"))
            .await;
        wait_until(|| h.agent.created.lock().unwrap().len() == 1).await;

        let snapshot = h.orchestrator.snapshot();
        assert!(snapshot.processing);
        assert_eq!(snapshot.queued, 1, "second task must stay queued");
        // Only the first task was dispatched.
        assert_eq!(h.agent.created.lock().unwrap().len(), 1);

        let events = drain_events(&mut h.rx);
        let queued: Vec<_> = events
            .iter()
            .filter(|e| e["type"] == "task_queued")
            .collect();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0]["queue_position"], 1);
        assert_eq!(queued[1]["queue_position"], 2);
    }

    #[tokio::test]
    async fn agent_error_marks_task_and_advances_queue() {
        let mut h = harness(
            MockAgentApi::new(vec![AgentStatus::Error], AgentStatus::Finished),
            MockStore::new(vec![], "Completed"),
            MockVcs::new(),
        );

        Arc::clone(&h.orchestrator)
            .enqueue(task_named("fails", "A"))
            .await;
        Arc::clone(&h.orchestrator)
            .enqueue(task_named("succeeds", "B"))
            .await;

        wait_until(|| {
            let s = h.orchestrator.snapshot();
            !s.processing && s.queued == 0 && h.agent.created.lock().unwrap().len() == 2
        })
        .await;

        // First task ended in Error, second ran to completion.
        let statuses = h.store.patched_statuses();
        assert!(statuses.contains(&TaskStatus::Error));
        let events = event_types(&drain_events(&mut h.rx));
        assert!(events.contains(&"agent_error".to_string()));
        assert!(events.contains(&"task_completed".to_string()));
    }

    #[tokio::test]
    async fn agent_expired_releases_slot_without_retry() {
        let mut h = harness(
            MockAgentApi::new(vec![AgentStatus::Expired], AgentStatus::Running),
            MockStore::new(vec![], "Running"),
            MockVcs::new(),
        );

        Arc::clone(&h.orchestrator)
            .enqueue(task_named("expires", "A"))
            .await;
        wait_until(|| !h.orchestrator.snapshot().processing).await;

        // Agent failures never spawn fix agents.
        assert_eq!(h.agent.created.lock().unwrap().len(), 1);
        assert!(h.orchestrator.retry_record("agent-1").is_none());
        let events = event_types(&drain_events(&mut h.rx));
        assert!(events.contains(&"agent_error".to_string()));
        assert!(!events.contains(&"deployment_retry".to_string()));
    }

    #[tokio::test]
    async fn agent_poll_stops_after_exactly_180_ticks() {
        let h = harness(
            MockAgentApi::new(vec![], AgentStatus::Running),
            MockStore::new(vec![], "Running"),
            MockVcs::new(),
        );

        Arc::clone(&h.orchestrator)
            .enqueue(task_named("never finishes", "A"))
            .await;
        wait_until(|| !h.orchestrator.snapshot().processing).await;

        assert_eq!(h.agent.status_calls.load(Ordering::SeqCst), 180);
    }

    #[tokio::test]
    async fn deployment_poll_stops_after_exactly_120_ticks() {
        let mut h = harness(
            MockAgentApi::new(vec![AgentStatus::Finished], AgentStatus::Finished),
            MockStore::new(vec![], "Running"),
            MockVcs::new(),
        );

        Arc::clone(&h.orchestrator)
            .enqueue(task_named("deploy stalls", "A"))
            .await;
        wait_until(|| !h.orchestrator.snapshot().processing).await;

        assert_eq!(h.store.find_calls.load(Ordering::SeqCst), 120);
        let events = event_types(&drain_events(&mut h.rx));
        assert!(events.contains(&"deployment_timeout".to_string()));
    }

    #[tokio::test]
    async fn full_success_scenario() {
        // Agent finishes on the second tick; deployment goes Running ->
        // Deploying -> Completed.
        let mut h = harness(
            MockAgentApi::new(
                vec![AgentStatus::Running, AgentStatus::Finished],
                AgentStatus::Finished,
            ),
            MockStore::new(
                vec![
                    DeployTick::Status("Running"),
                    DeployTick::Status("Deploying"),
                    DeployTick::Status("Completed"),
                ],
                "Completed",
            ),
            MockVcs::new(),
        );

        Arc::clone(&h.orchestrator)
            .enqueue(task_named("Add a button", "Btn"))
            .await;
        wait_until(|| !h.orchestrator.snapshot().processing).await;

        assert_eq!(h.agent.status_calls.load(Ordering::SeqCst), 2);
        assert_eq!(*h.vcs.merges.lock().unwrap(), vec!["bridge-staging"]);

        // Status walked Queued -> Pending -> Running, agent marked FINISHED
        // while the task stayed Running.
        let statuses = h.store.patched_statuses();
        assert_eq!(
            statuses,
            vec![TaskStatus::Pending, TaskStatus::Running, TaskStatus::Running]
        );
        let finished_patch = h
            .store
            .patches
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.agent_status == Some(AgentStatus::Finished))
            .cloned()
            .expect("agent FINISHED patch");
        assert_eq!(finished_patch.status, Some(TaskStatus::Running));

        let events = event_types(&drain_events(&mut h.rx));
        for expected in [
            "task_queued",
            "agent_created",
            "agent_status_update",
            "agent_completed",
            "deployment_success",
            "task_completed",
        ] {
            assert!(events.contains(&expected.to_string()), "missing {}", expected);
        }

        let snapshot = h.orchestrator.snapshot();
        assert!(!snapshot.processing);
        assert_eq!(snapshot.queued, 0);
    }

    #[tokio::test]
    async fn merge_conflict_is_terminal_and_releases_slot() {
        let mut h = harness(
            MockAgentApi::new(vec![AgentStatus::Finished], AgentStatus::Finished),
            MockStore::new(vec![DeployTick::Status("Deploying")], "Deploying"),
            MockVcs::with_conflict(),
        );

        Arc::clone(&h.orchestrator)
            .enqueue(task_named("conflicts", "A"))
            .await;
        wait_until(|| !h.orchestrator.snapshot().processing).await;

        // One merge attempt, no retry (conflicts need a human).
        assert_eq!(h.vcs.merges.lock().unwrap().len(), 1);
        assert_eq!(h.agent.created.lock().unwrap().len(), 1);
        let events = drain_events(&mut h.rx);
        let error = events
            .iter()
            .find(|e| e["type"] == "deployment_error")
            .expect("deployment_error event");
        assert!(
            error["message"]
                .as_str()
                .unwrap()
                .contains("manual resolution required")
        );
        assert!(h.store.patched_statuses().contains(&TaskStatus::Error));
    }

    #[tokio::test]
    async fn retry_bound_spawns_exactly_three_fix_agents() {
        // Every deployment fails. Lineage: agent-1 (count 0) -> fixes
        // agent-2/3/4 (counts 1/2/3); the fourth failure must decline.
        let mut h = harness(
            MockAgentApi::new(vec![], AgentStatus::Finished),
            MockStore::new(vec![], "Error"),
            MockVcs::new(),
        );

        Arc::clone(&h.orchestrator)
            .enqueue(task_named("doomed", "A"))
            .await;
        wait_until(|| !h.orchestrator.snapshot().processing).await;

        // 1 original dispatch + exactly 3 fix agents.
        assert_eq!(h.agent.created.lock().unwrap().len(), 4);
        let last = h.orchestrator.retry_record("agent-4").expect("lineage record");
        assert_eq!(last.count, 3);
        assert_eq!(last.original_agent_id, "agent-1");
        assert!(h.orchestrator.retry_record("agent-5").is_none());

        // Fix prompts embed the ANSI-stripped logs.
        let prompts = h.agent.created_prompts();
        assert!(prompts[1].contains("Module not found"));
        assert!(!prompts[1].contains('\u{1b}'));
        assert!(prompts[3].contains("Failed agent id: agent-3"));

        let events = drain_events(&mut h.rx);
        let retries: Vec<_> = events
            .iter()
            .filter(|e| e["type"] == "deployment_retry")
            .collect();
        assert_eq!(retries.len(), 3);
        assert_eq!(retries[2]["retry_count"], 3);
        let final_error = events
            .iter()
            .filter(|e| e["type"] == "deployment_error")
            .next_back()
            .expect("final deployment_error");
        assert_eq!(final_error["retry_count"], 3);

        // Retry bookkeeping reached the store.
        let retry_patches: Vec<_> = h
            .store
            .patches
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.retry_count.is_some())
            .cloned()
            .collect();
        assert_eq!(retry_patches.len(), 3);
        assert_eq!(retry_patches[0].previous_agent_id.as_deref(), Some("agent-1"));
        assert_eq!(retry_patches[2].agent_id.as_deref(), Some("agent-4"));
    }

    #[tokio::test]
    async fn queue_advances_after_retries_exhausted() {
        // Two doomed tasks back to back: each burns its own 3-retry lineage
        // and the queue still drains completely.
        let h = harness(
            MockAgentApi::new(vec![], AgentStatus::Finished),
            MockStore::new(vec![], "Error"),
            MockVcs::new(),
        );

        Arc::clone(&h.orchestrator)
            .enqueue(task_named("doomed one", "A"))
            .await;
        Arc::clone(&h.orchestrator)
            .enqueue(task_named("doomed two", "B"))
            .await;

        wait_until(|| {
            let s = h.orchestrator.snapshot();
            !s.processing && s.queued == 0 && h.agent.created.lock().unwrap().len() == 8
        })
        .await;

        // Independent lineages: 4 creations each.
        let second_lineage = h.orchestrator.retry_record("agent-8").unwrap();
        assert_eq!(second_lineage.count, 3);
        assert_eq!(second_lineage.original_agent_id, "agent-5");
    }

    #[tokio::test]
    async fn deployment_success_after_one_retry() {
        // First agent's deployment fails, the fix agent's succeeds. The
        // superseded deployment poll must not free the slot early, and the
        // fix agent's poll must complete the task.
        let mut h = harness(
            MockAgentApi::new(vec![], AgentStatus::Finished),
            MockStore::new(
                vec![
                    DeployTick::Status("Error"),
                    DeployTick::Status("Deploying"),
                    DeployTick::Status("Completed"),
                ],
                "Completed",
            ),
            MockVcs::new(),
        );

        Arc::clone(&h.orchestrator)
            .enqueue(task_named("fix me", "A"))
            .await;
        wait_until(|| !h.orchestrator.snapshot().processing).await;

        assert_eq!(h.agent.created.lock().unwrap().len(), 2);
        assert_eq!(h.vcs.merges.lock().unwrap().len(), 1);
        let events = event_types(&drain_events(&mut h.rx));
        assert!(events.contains(&"deployment_retry".to_string()));
        assert!(events.contains(&"task_completed".to_string()));
        assert_eq!(h.orchestrator.retry_record("agent-2").unwrap().count, 1);
    }

    #[tokio::test]
    async fn transient_store_failures_reschedule_the_poll() {
        let h = harness(
            MockAgentApi::new(vec![AgentStatus::Finished], AgentStatus::Finished),
            MockStore::new(
                vec![
                    DeployTick::Fail,
                    DeployTick::Missing,
                    DeployTick::Status("Completed"),
                ],
                "Completed",
            ),
            MockVcs::new(),
        );

        Arc::clone(&h.orchestrator)
            .enqueue(task_named("flaky store", "A"))
            .await;
        wait_until(|| !h.orchestrator.snapshot().processing).await;

        // Both the error and the miss were tolerated.
        assert_eq!(h.store.find_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dispatch_failure_emits_manual_notification() {
        let mut h = harness(
            MockAgentApi::failing_creation(1),
            MockStore::new(vec![], "Running"),
            MockVcs::new(),
        );

        Arc::clone(&h.orchestrator)
            .enqueue(task_named("no agent", "A"))
            .await;
        wait_until(|| !h.orchestrator.snapshot().processing).await;

        let events = drain_events(&mut h.rx);
        let failed = events
            .iter()
            .find(|e| e["type"] == "agent_failed")
            .expect("agent_failed event");
        assert!(failed["message"].as_str().unwrap().contains("manually"));
        // The artifact path is surfaced for the manual fallback.
        assert!(failed["file"].as_str().is_some());
    }

    #[tokio::test]
    async fn dispatch_fix_to_editor_leaves_queue_alone() {
        let mut h = harness(
            MockAgentApi::new(vec![], AgentStatus::Running),
            MockStore::new(vec![], "Running"),
            MockVcs::new(),
        );

        h.orchestrator.dispatch_fix_to_editor("fix the build").await;

        let snapshot = h.orchestrator.snapshot();
        assert!(!snapshot.processing);
        assert_eq!(snapshot.queued, 0);
        // No fallbacks configured, so the manual notification carries the
        // fix-prompt artifact path.
        let events = drain_events(&mut h.rx);
        let failed = events
            .iter()
            .find(|e| e["type"] == "agent_failed")
            .expect("agent_failed event");
        assert!(
            failed["file"]
                .as_str()
                .unwrap()
                .ends_with(prompts::FIX_PROMPT_FILE)
        );
    }

    #[tokio::test]
    async fn sync_agent_status_does_not_touch_queue() {
        let mut h = harness(
            MockAgentApi::new(vec![AgentStatus::Finished], AgentStatus::Finished),
            MockStore::new(vec![], "Running"),
            MockVcs::new(),
        );

        h.orchestrator.sync_agent_status("agent-77").await;

        let snapshot = h.orchestrator.snapshot();
        assert!(!snapshot.processing);
        assert_eq!(snapshot.queued, 0);

        let events = event_types(&drain_events(&mut h.rx));
        assert!(events.contains(&"agent_status_update".to_string()));
        assert!(events.contains(&"agent_completed".to_string()));
        // The finished agent was synced to the store.
        let patches = h.store.patches.lock().unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].agent_id.as_deref(), Some("agent-77"));
        assert_eq!(patches[0].status, Some(TaskStatus::Running));
    }

    #[test]
    fn staged_component_defaults_path_to_name() {
        let meta = TaskMetadata {
            component_name: Some("Btn".into()),
            ..Default::default()
        };
        let component = staged_component(&meta).unwrap();
        assert_eq!(component.name, "Btn");
        assert_eq!(component.path, "Btn");

        let meta = TaskMetadata {
            component_name: Some("Btn".into()),
            component_directory: Some("components/Btn".into()),
            ..Default::default()
        };
        assert_eq!(staged_component(&meta).unwrap().path, "components/Btn");

        assert!(staged_component(&TaskMetadata::default()).is_none());
    }
}
