//! Prompt history: a newest-first record of submissions, persisted as JSON
//! so a restarted bridge can still answer `get_history`.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};

use super::models::Task;

/// How many submissions to keep.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

pub struct PromptHistory {
    path: PathBuf,
    limit: usize,
    entries: Mutex<Vec<Task>>,
}

impl PromptHistory {
    /// Load history from `path`, starting fresh if the file is missing or
    /// unreadable (a corrupt history file is not worth failing startup over).
    pub fn load(path: PathBuf, limit: usize) -> Self {
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<Task>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    eprintln!("[history] Could not parse {}, starting fresh: {}", path.display(), e);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self {
            path,
            limit,
            entries: Mutex::new(entries),
        }
    }

    /// Record a submission at the front of the history and persist.
    pub async fn record(&self, task: &Task) -> Result<()> {
        let snapshot = {
            let mut entries = self.entries.lock().expect("history lock poisoned");
            entries.insert(0, task.clone());
            entries.truncate(self.limit);
            entries.clone()
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&snapshot).context("Failed to serialize history")?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("Failed to write history {}", self.path.display()))?;
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<Task> {
        self.entries.lock().expect("history lock poisoned").clone()
    }
}
