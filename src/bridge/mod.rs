//! Task bridge — single-worker orchestration of remote coding agents.
//!
//! ## Overview
//!
//! The bridge turns a user-submitted prompt into a deployed, verified code
//! change: prompts arrive over a WebSocket, wait in an in-memory FIFO queue,
//! and are processed strictly one at a time. Each task stages a branch
//! locally, dispatches a remote coding-agent job against it, polls the agent
//! to completion, then polls the external task record for the webhook-driven
//! deployment verdict. A verified preview gets merged to trunk; a failed one
//! triggers an automatic fix agent, bounded per lineage.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐ WebSocket ┌─────────────────────────────────────────────────┐
//! │  Client  │ ────────> │  server.rs  (axum Router, startup wiring)       │
//! │   (UI)   │ <──────── │    ├─ ws.rs   (WsMessage, socket loop)          │
//! └──────────┘   HTTP    │    └─ api.rs  (auto-merge + health, AppState)   │
//!                        │         │                                       │
//!                        │         │ Orchestrator::enqueue()               │
//!                        │         v                                       │
//!                        │  queue.rs  (FIFO queue, processing slot,        │
//!                        │             polling loops, retry controller)    │
//!                        │     │           │                │              │
//!                        │     v           v                v              │
//!                        │  git.rs     agent.rs         store.rs           │
//!                        │  (git CLI)  (agent service)  (task records)     │
//!                        └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module    | Responsibility                                          |
//! |-----------|---------------------------------------------------------|
//! | `models`  | Shared types: `Task`, `TaskStatus`, `AgentStatus`       |
//! | `config`  | `bridge.toml` + environment layering                    |
//! | `prompts` | Active-prompt artifact, fix prompts, ANSI stripping     |
//! | `history` | Persisted newest-first prompt history                   |
//!
//! ## Typical Task Flow (submit prompt → deployed change)
//!
//! 1. `send_prompt` arrives on `/ws` → `ws.rs` builds a `Task` and calls
//!    `Orchestrator::enqueue()`; the caller gets a `task_queued` event with
//!    its queue position.
//! 2. When the processing slot is free, `queue.rs` pops the head: trunk is
//!    pulled, the staging branch is synced and pushed (`git.rs`), the store
//!    record moves Queued → Pending, and the agent job is created
//!    (`agent.rs`) on the staging branch.
//! 3. The agent-completion poll relays status updates until `FINISHED`,
//!    then hands off to the deployment poll **without freeing the slot**.
//! 4. The deployment poll watches the store record: `"Deploying"` merges
//!    the branch to trunk and keeps waiting, `"Completed"` finishes the
//!    task, `"Error"` asks the retry controller for a fix agent (at most 3
//!    per lineage).
//! 5. Every terminal branch frees the slot exactly once and starts the next
//!    queued task.

pub mod agent;
pub mod api;
pub mod config;
pub mod git;
pub mod history;
pub mod models;
pub mod prompts;
pub mod queue;
pub mod server;
pub mod store;
pub mod ws;
