//! Prompt artifacts and the text transforms applied before prompts are
//! handed to an agent.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use super::models::{ErrorInfo, Task};

/// File name of the human-readable artifact describing the task currently
/// being dispatched. Kept on disk as the manual fallback when every
/// automatic dispatch path fails.
pub const ACTIVE_PROMPT_FILE: &str = "active-prompt.txt";

/// File name of the fix-prompt artifact written when a client-reported
/// deployment error is routed to the local editor.
pub const FIX_PROMPT_FILE: &str = "fix-prompt.txt";

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("\u{1b}\\[[0-9;]*m").expect("valid ANSI pattern"));

/// Remove ANSI color/formatting sequences (`ESC[...m`) from text.
///
/// Deployment logs arrive with terminal colors baked in; embedding them
/// verbatim in an agent prompt wastes tokens and confuses the model.
/// Idempotent: stripping already-clean text is the identity.
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// Compose the remediation prompt for a fix agent from captured deployment
/// error logs, the failing branch, and the failed agent id.
pub fn fix_prompt(raw_logs: &str, branch_name: Option<&str>, failed_agent_id: &str) -> String {
    let logs = strip_ansi(raw_logs);
    format!(
        "DEPLOYMENT ERROR - FIX REQUIRED\n\
         \n\
         A recent preview deployment failed. Analyze and fix the error.\n\
         \n\
         Deployment error logs:\n\
         ```\n\
         {logs}\n\
         ```\n\
         \n\
         Branch: {branch}\n\
         Failed agent id: {failed_agent_id}\n\
         \n\
         Instructions:\n\
         1. Read the error logs above carefully and identify the root cause.\n\
         2. Locate the problematic file(s) and line(s).\n\
         3. Fix the error with the appropriate solution:\n\
            - Type errors: correct the type definitions and mismatches\n\
            - Build errors: fix syntax or compilation issues\n\
            - Import errors: correct import paths or missing dependencies\n\
            - Runtime errors: add proper error handling and null checks\n\
         4. Ensure the fix does not break existing functionality.\n\
         5. Verify the code compiles cleanly.\n\
         6. Commit with message: \"fix: Resolve deployment error (retry)\"\n\
         \n\
         IMPORTANT: only fix the specific deployment error. Do NOT make\n\
         unrelated changes.\n",
        logs = logs,
        branch = branch_name.unwrap_or("unknown"),
        failed_agent_id = failed_agent_id,
    )
}

/// Compose the fix prompt handed to the local editor when a client reports
/// a deployment error, either automatically (auto-fixable analysis) or via
/// a manual trigger.
pub fn editor_fix_prompt(info: &ErrorInfo) -> String {
    let analysis = info.analysis.clone().unwrap_or_default();
    let logs = strip_ansi(info.logs.as_deref().unwrap_or(""));

    let mut prompt = format!(
        "DEPLOYMENT ERROR - FIX REQUIRED\n\
         \n\
         A recent preview deployment failed with the following error:\n\
         \n\
         ```\n\
         {logs}\n\
         ```\n\
         \n",
    );
    if let Some(path) = &analysis.component_path {
        prompt.push_str(&format!("File: {}\n", path));
    }
    if let Some(line) = analysis.line_number {
        prompt.push_str(&format!("Line: {}\n", line));
    }
    prompt.push_str(&format!(
        "Error: {}\n",
        analysis.error_message.as_deref().unwrap_or("Unknown error")
    ));
    prompt.push_str(&format!(
        "Type: {}\n\n",
        analysis.error_type.as_deref().unwrap_or("unknown")
    ));

    let location = match analysis.line_number {
        Some(line) => format!("line {}", line),
        None => "the error location".to_string(),
    };
    prompt.push_str(&format!(
        "Instructions:\n\
         1. Open {file}.\n\
         2. Navigate to {location} and analyze the error carefully.\n\
         3. Fix the error with the appropriate solution:\n\
            - Undefined/null errors: add null checks\n\
            - Type mismatches: correct the type definitions\n\
            - Syntax errors: fix the syntax\n\
         4. Ensure the code compiles without errors.\n\
         5. Test that the fix does not break existing functionality.\n\
         6. Commit with message: \"fix: {summary}\"\n\
         \n\
         IMPORTANT: only fix this specific error. Do NOT make unrelated\n\
         changes.\n",
        file = analysis
            .component_path
            .as_deref()
            .unwrap_or("the affected file"),
        location = location,
        summary = analysis
            .error_message
            .as_deref()
            .unwrap_or("Fix deployment error"),
    ));
    prompt
}

/// Render the active-prompt artifact for a task.
pub fn active_prompt_contents(task: &Task) -> String {
    let metadata = serde_json::to_string_pretty(&task.metadata)
        .unwrap_or_else(|_| "{}".to_string());
    format!(
        "==============================================================\n\
         ACTIVE TASK PROMPT\n\
         ==============================================================\n\
         \n\
         Timestamp: {created_at}\n\
         Prompt ID: {id}\n\
         \n\
         --------------------------------------------------------------\n\
         \n\
         {prompt}\n\
         \n\
         --------------------------------------------------------------\n\
         \n\
         Metadata:\n\
         {metadata}\n\
         \n\
         --------------------------------------------------------------\n\
         \n\
         INSTRUCTIONS:\n\
         1. Read the prompt above carefully\n\
         2. Execute the requested changes\n\
         3. Follow all project conventions\n\
         4. After completing the task, delete this file\n\
         5. Mark the task as complete in your response\n",
        created_at = task.created_at,
        id = task.id,
        prompt = task.prompt,
        metadata = metadata,
    )
}

/// Write the active-prompt artifact into `prompts_dir`, creating the
/// directory if needed. Returns the artifact path.
pub async fn write_active_prompt(prompts_dir: &Path, task: &Task) -> Result<PathBuf> {
    tokio::fs::create_dir_all(prompts_dir)
        .await
        .with_context(|| format!("Failed to create prompts dir {}", prompts_dir.display()))?;
    let path = prompts_dir.join(ACTIVE_PROMPT_FILE);
    tokio::fs::write(&path, active_prompt_contents(task))
        .await
        .with_context(|| format!("Failed to write active prompt {}", path.display()))?;
    Ok(path)
}

/// Write a composed fix prompt into `prompts_dir` so the CLI fallback has a
/// file to hand to the editor. Returns the artifact path.
pub async fn write_fix_prompt(prompts_dir: &Path, contents: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(prompts_dir)
        .await
        .with_context(|| format!("Failed to create prompts dir {}", prompts_dir.display()))?;
    let path = prompts_dir.join(FIX_PROMPT_FILE);
    tokio::fs::write(&path, contents)
        .await
        .with_context(|| format!("Failed to write fix prompt {}", path.display()))?;
    Ok(path)
}
