//! Version-control operator: sequences the local `git` operations that stage
//! work for a remote agent and later fold a verified deployment into trunk.
//!
//! Every command is an external `git` process with a bounded timeout. Most
//! failures here are logged warnings rather than errors: a stale staging
//! branch or an already-merged commit must never wedge the task queue. The
//! exceptions are checkout and push during the trunk merge, which are central
//! to correctness and fail the operation.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::MergeError;

/// Timeout for cheap local queries (rev-parse, branch --list).
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for local mutations (checkout, add, commit).
const LOCAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for fetch/merge.
const FETCH_TIMEOUT: Duration = Duration::from_secs(20);
/// Timeout for pull/push.
const NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured result of a git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// Stdout and stderr joined, for output inspection.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Component files to stage onto the staging branch before dispatch.
#[derive(Debug, Clone)]
pub struct StagedComponent {
    pub name: String,
    /// Repo-relative path passed to `git add -f` (force-add: component
    /// scratch directories are typically ignored).
    pub path: String,
}

/// Seam for the orchestrator; real implementation is [`GitWorkspace`].
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Pull the latest trunk into the working copy. Best-effort.
    async fn pull_trunk(&self);

    /// Ensure the staging branch exists (create from trunk if absent), merge
    /// the latest trunk into it, optionally commit and push component files,
    /// and restore the original branch. Best-effort throughout.
    async fn prepare_staging(&self, staging_branch: &str, component: Option<&StagedComponent>);

    /// Merge `branch` into trunk and push. A conflict is a distinct,
    /// non-retryable failure.
    async fn merge_to_trunk(&self, branch: &str) -> Result<(), MergeError>;

    /// The repository's origin URL in HTTPS form.
    async fn remote_https_url(&self) -> Result<String>;
}

/// Drives `git` in a local working copy.
pub struct GitWorkspace {
    repo_path: PathBuf,
    trunk: String,
}

impl GitWorkspace {
    pub fn new(repo_path: PathBuf, trunk: &str) -> Self {
        Self {
            repo_path,
            trunk: trunk.to_string(),
        }
    }

    async fn run_git(&self, args: &[&str], timeout: Duration) -> Result<GitOutput> {
        let fut = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output();
        let output = tokio::time::timeout(timeout, fut)
            .await
            .with_context(|| format!("git {} timed out after {:?}", args.join(" "), timeout))?
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
        Ok(GitOutput {
            ok: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run a best-effort git command: failures are logged, never propagated.
    async fn run_git_lenient(&self, args: &[&str], timeout: Duration) -> Option<GitOutput> {
        match self.run_git(args, timeout).await {
            Ok(output) => Some(output),
            Err(e) => {
                eprintln!("[git] {} failed: {:#}", args.join(" "), e);
                None
            }
        }
    }

    /// Current branch name, defaulting to trunk when it cannot be determined.
    pub async fn current_branch(&self) -> String {
        match self
            .run_git(&["rev-parse", "--abbrev-ref", "HEAD"], QUERY_TIMEOUT)
            .await
        {
            Ok(output) if output.ok => output.stdout.trim().to_string(),
            _ => self.trunk.clone(),
        }
    }

    async fn branch_exists(&self, branch: &str) -> bool {
        self.run_git_lenient(&["branch", "--list", branch], QUERY_TIMEOUT)
            .await
            .is_some_and(|o| o.ok && !o.stdout.trim().is_empty())
    }
}

#[async_trait]
impl Vcs for GitWorkspace {
    async fn pull_trunk(&self) {
        match self
            .run_git(&["pull", "origin", &self.trunk], NETWORK_TIMEOUT)
            .await
        {
            Ok(output) if output.ok || already_up_to_date(&output.combined()) => {
                eprintln!("[git] local {} updated", self.trunk);
            }
            Ok(output) => {
                eprintln!("[git] pull warning (continuing): {}", output.stderr.trim());
            }
            Err(e) => {
                eprintln!("[git] pull warning (continuing): {:#}", e);
            }
        }
    }

    async fn prepare_staging(&self, staging_branch: &str, component: Option<&StagedComponent>) {
        let original_branch = self.current_branch().await;
        let exists = self.branch_exists(staging_branch).await;

        let checkout = if exists {
            self.run_git_lenient(&["checkout", staging_branch], LOCAL_TIMEOUT)
                .await
        } else {
            self.run_git_lenient(&["checkout", "-b", staging_branch], LOCAL_TIMEOUT)
                .await
        };
        match checkout {
            Some(output) if output.ok => {
                eprintln!(
                    "[git] {} staging branch {}",
                    if exists { "switched to" } else { "created" },
                    staging_branch
                );
            }
            Some(output) => {
                eprintln!(
                    "[git] could not checkout {}: {}",
                    staging_branch,
                    output.stderr.trim()
                );
                return;
            }
            None => return,
        }

        // Fold the latest trunk into staging so the agent starts fresh.
        self.run_git_lenient(&["fetch", "origin", &self.trunk], FETCH_TIMEOUT)
            .await;
        let trunk_ref = format!("origin/{}", self.trunk);
        match self
            .run_git_lenient(&["merge", &trunk_ref, "--no-edit"], FETCH_TIMEOUT)
            .await
        {
            Some(output) if output.ok || already_up_to_date(&output.combined()) => {
                eprintln!("[git] {} synced with {}", staging_branch, self.trunk);
            }
            Some(output) => {
                eprintln!(
                    "[git] merge warning (continuing): {}",
                    output.stderr.trim()
                );
            }
            None => {}
        }

        if let Some(component) = component {
            if let Some(output) = self
                .run_git_lenient(&["add", "-f", &component.path], LOCAL_TIMEOUT)
                .await
                && !output.ok
            {
                eprintln!("[git] add warning: {}", output.stderr.trim());
            }

            let message = staging_commit_message(&component.name);
            match self
                .run_git_lenient(&["commit", "-m", &message], LOCAL_TIMEOUT)
                .await
            {
                Some(output) if output.ok => {
                    eprintln!("[git] committed {} to {}", component.name, staging_branch);
                }
                Some(output) if nothing_to_commit(&output.combined()) => {
                    eprintln!("[git] files already committed");
                }
                Some(output) => {
                    eprintln!("[git] commit warning: {}", output.stderr.trim());
                }
                None => {}
            }

            let push = if exists {
                self.run_git_lenient(&["push", "origin", staging_branch], NETWORK_TIMEOUT)
                    .await
            } else {
                self.run_git_lenient(&["push", "-u", "origin", staging_branch], NETWORK_TIMEOUT)
                    .await
            };
            match push {
                Some(output) if output.ok => {
                    eprintln!("[git] pushed {}", staging_branch);
                }
                Some(output) => {
                    eprintln!("[git] push warning: {}", output.stderr.trim());
                }
                None => {}
            }
        }

        // Restore the original branch regardless of how staging went.
        match self
            .run_git_lenient(&["checkout", &original_branch], LOCAL_TIMEOUT)
            .await
        {
            Some(output) if output.ok => {
                eprintln!("[git] switched back to {}", original_branch);
            }
            _ => {
                eprintln!("[git] could not switch back to {}", original_branch);
            }
        }
    }

    async fn merge_to_trunk(&self, branch: &str) -> Result<(), MergeError> {
        if let Some(status) = self
            .run_git_lenient(&["status", "--porcelain"], QUERY_TIMEOUT)
            .await
        {
            if status.stdout.trim().is_empty() {
                eprintln!("[git] working directory clean");
            } else {
                eprintln!("[git] uncommitted changes present before merge");
            }
        }

        // Pull trunk first; the agent may have pushed since our last sync.
        self.pull_trunk().await;

        let checkout = self
            .run_git(&["checkout", &self.trunk], LOCAL_TIMEOUT)
            .await
            .map_err(MergeError::Other)?;
        if !checkout.ok {
            return Err(MergeError::Other(anyhow::anyhow!(
                "Failed to checkout {}: {}",
                self.trunk,
                checkout.stderr.trim()
            )));
        }

        // The agent branch may only exist on the remote.
        self.run_git_lenient(&["fetch", "origin", branch], FETCH_TIMEOUT)
            .await;

        let merge_ref = format!("origin/{}", branch);
        match self
            .run_git(&["merge", &merge_ref, "--no-edit"], FETCH_TIMEOUT)
            .await
        {
            Ok(output) if output.ok => {}
            Ok(output) if is_merge_conflict(&output.combined()) => {
                return Err(MergeError::Conflict {
                    branch: branch.to_string(),
                });
            }
            Ok(output) => {
                // Non-conflict merge failure: the branch may already be
                // merged. Log and let the push decide.
                eprintln!("[git] merge note: {}", output.stderr.trim());
            }
            Err(e) => return Err(MergeError::Other(e)),
        }

        let push = self
            .run_git(&["push", "origin", &self.trunk], NETWORK_TIMEOUT)
            .await
            .map_err(MergeError::Other)?;
        if !push.ok {
            return Err(MergeError::Other(anyhow::anyhow!(
                "Failed to push {}: {}",
                self.trunk,
                push.stderr.trim()
            )));
        }

        eprintln!("[git] merged {} into {} and pushed", branch, self.trunk);
        Ok(())
    }

    async fn remote_https_url(&self) -> Result<String> {
        let output = self
            .run_git(&["remote", "get-url", "origin"], QUERY_TIMEOUT)
            .await?;
        if !output.ok {
            anyhow::bail!(
                "No git remote configured; remote agents require a hosted repository"
            );
        }
        Ok(https_remote(output.stdout.trim()))
    }
}

/// Commit message used when staging component files.
fn staging_commit_message(component: &str) -> String {
    format!("feat: Add {} component files for agent processing", component)
}

/// Convert an SSH-style remote to HTTPS and strip the `.git` suffix.
///
/// `git@host:owner/repo.git` → `https://host/owner/repo`
/// `ssh://git@host/owner/repo.git` → `https://host/owner/repo`
/// HTTPS remotes pass through (minus the suffix).
pub fn https_remote(url: &str) -> String {
    let url = url.trim();
    let converted = if let Some(rest) = url.strip_prefix("git@") {
        match rest.split_once(':') {
            Some((host, path)) => format!("https://{}/{}", host, path),
            None => format!("https://{}", rest),
        }
    } else if let Some(rest) = url.strip_prefix("ssh://git@") {
        format!("https://{}", rest)
    } else {
        url.to_string()
    };
    converted
        .strip_suffix(".git")
        .unwrap_or(&converted)
        .to_string()
}

/// Whether merge output indicates conflicts requiring manual resolution.
pub fn is_merge_conflict(output: &str) -> bool {
    output.contains("CONFLICT") || output.contains("Automatic merge failed")
}

/// Whether commit output indicates there was nothing to commit.
pub fn nothing_to_commit(output: &str) -> bool {
    output.contains("nothing to commit")
}

/// Whether pull/merge output indicates the branch was already current.
pub fn already_up_to_date(output: &str) -> bool {
    output.contains("Already up to date")
}
