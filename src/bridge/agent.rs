//! Remote coding-agent service client.
//!
//! A thin authenticated wrapper over the agent service's HTTPS JSON API:
//! `POST /v0/agents` launches a job against a repository + branch ref,
//! `GET /v0/agents/{id}` reports its status. Outcomes are typed
//! ([`AgentApiError`]) so the orchestrator can branch on auth, permission,
//! and payload rejections without string matching.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::git::Vcs;
use super::models::AgentStatus;
use crate::errors::AgentApiError;

/// A successfully created agent job.
#[derive(Debug, Clone)]
pub struct CreatedAgent {
    pub id: String,
    pub status: AgentStatus,
    pub url: Option<String>,
    pub branch_name: Option<String>,
}

/// An agent status fetch: the parsed status plus the raw payload, which is
/// relayed verbatim to listening clients.
#[derive(Debug, Clone)]
pub struct AgentStatusReport {
    pub status: AgentStatus,
    pub branch_name: Option<String>,
    pub raw: serde_json::Value,
}

/// Seam for the orchestrator; real implementation is [`HttpAgentClient`].
#[async_trait]
pub trait AgentApi: Send + Sync {
    /// Launch an agent job for `prompt` on `branch_ref`.
    async fn create_agent(
        &self,
        prompt: &str,
        branch_ref: &str,
    ) -> Result<CreatedAgent, AgentApiError>;

    /// Fetch the current status of a job. No side effects.
    async fn agent_status(&self, agent_id: &str) -> Result<AgentStatusReport, AgentApiError>;
}

#[derive(Debug, Deserialize)]
struct AgentTarget {
    #[serde(default)]
    url: Option<String>,
    #[serde(default, rename = "branchName")]
    branch_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateAgentResponse {
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default, rename = "webUrl")]
    web_url: Option<String>,
    #[serde(default)]
    target: Option<AgentTarget>,
}

/// HTTP client for the agent service.
pub struct HttpAgentClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    vcs: Arc<dyn Vcs>,
}

impl HttpAgentClient {
    pub fn new(base_url: &str, api_key: &str, model: &str, vcs: Arc<dyn Vcs>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            vcs,
        }
    }
}

#[async_trait]
impl AgentApi for HttpAgentClient {
    async fn create_agent(
        &self,
        prompt: &str,
        branch_ref: &str,
    ) -> Result<CreatedAgent, AgentApiError> {
        let repository = self
            .vcs
            .remote_https_url()
            .await
            .map_err(|e| AgentApiError::Repository(format!("{:#}", e)))?;

        eprintln!(
            "[agent] creating job: repository={} ref={} model={}",
            repository, branch_ref, self.model
        );

        let payload = serde_json::json!({
            "prompt": { "text": prompt },
            "source": { "repository": repository, "ref": branch_ref },
            "model": self.model,
        });

        let resp = self
            .http
            .post(format!("{}/v0/agents", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AgentApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| AgentApiError::Network(e.to_string()))?;

        match status {
            200 | 201 => parse_created(&body),
            _ => Err(creation_failure(status, body)),
        }
    }

    async fn agent_status(&self, agent_id: &str) -> Result<AgentStatusReport, AgentApiError> {
        let resp = self
            .http
            .get(format!("{}/v0/agents/{}", self.base_url, agent_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| AgentApiError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| AgentApiError::Network(e.to_string()))?;

        if status != 200 {
            return Err(AgentApiError::Api { status, body });
        }
        parse_status_report(&body)
    }
}

/// Map a non-success creation status to its typed outcome.
fn creation_failure(status: u16, body: String) -> AgentApiError {
    match status {
        401 => AgentApiError::Auth,
        403 => AgentApiError::Permission,
        400 => AgentApiError::BadRequest(body),
        _ => AgentApiError::Api { status, body },
    }
}

fn parse_created(body: &str) -> Result<CreatedAgent, AgentApiError> {
    let resp: CreateAgentResponse =
        serde_json::from_str(body).map_err(|e| AgentApiError::Parse(e.to_string()))?;
    let id = resp
        .id
        .ok_or_else(|| AgentApiError::Parse("creation response missing agent id".into()))?;
    let status = resp
        .status
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(AgentStatus::Creating);
    let (target_url, branch_name) = match resp.target {
        Some(target) => (target.url, target.branch_name),
        None => (None, None),
    };
    Ok(CreatedAgent {
        id,
        status,
        url: target_url.or(resp.url).or(resp.web_url),
        branch_name,
    })
}

fn parse_status_report(body: &str) -> Result<AgentStatusReport, AgentApiError> {
    let raw: serde_json::Value =
        serde_json::from_str(body).map_err(|e| AgentApiError::Parse(e.to_string()))?;
    let status = raw
        .get("status")
        .and_then(|s| s.as_str())
        .ok_or_else(|| AgentApiError::Parse("status response missing status field".into()))?
        .parse::<AgentStatus>()
        .map_err(AgentApiError::Parse)?;
    let branch_name = raw
        .get("target")
        .and_then(|t| t.get("branchName"))
        .or_else(|| raw.get("branchName"))
        .and_then(|b| b.as_str())
        .map(str::to_string);
    Ok(AgentStatusReport {
        status,
        branch_name,
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── parse_created ────────────────────────────────────────────────

    #[test]
    fn test_parse_created_full_response() {
        let body = r#"{
            "id": "bc-123",
            "status": "CREATING",
            "target": {"url": "https://agents.example/bc-123", "branchName": "agent/bc-123"}
        }"#;
        let created = parse_created(body).unwrap();
        assert_eq!(created.id, "bc-123");
        assert_eq!(created.status, AgentStatus::Creating);
        assert_eq!(created.url.as_deref(), Some("https://agents.example/bc-123"));
        assert_eq!(created.branch_name.as_deref(), Some("agent/bc-123"));
    }

    #[test]
    fn test_parse_created_url_fallback_order() {
        // target.url wins over top-level url and webUrl
        let body = r#"{"id":"a","url":"u1","webUrl":"u2","target":{"url":"u0"}}"#;
        assert_eq!(parse_created(body).unwrap().url.as_deref(), Some("u0"));

        let body = r#"{"id":"a","url":"u1","webUrl":"u2"}"#;
        assert_eq!(parse_created(body).unwrap().url.as_deref(), Some("u1"));

        let body = r#"{"id":"a","webUrl":"u2"}"#;
        assert_eq!(parse_created(body).unwrap().url.as_deref(), Some("u2"));
    }

    #[test]
    fn test_parse_created_defaults_status_to_creating() {
        let created = parse_created(r#"{"id":"a"}"#).unwrap();
        assert_eq!(created.status, AgentStatus::Creating);
        assert!(created.url.is_none());
    }

    #[test]
    fn test_parse_created_missing_id_is_parse_error() {
        let err = parse_created(r#"{"status":"CREATING"}"#).unwrap_err();
        assert!(matches!(err, AgentApiError::Parse(_)));
    }

    #[test]
    fn test_parse_created_malformed_body_is_parse_error() {
        assert!(matches!(
            parse_created("<html>oops</html>"),
            Err(AgentApiError::Parse(_))
        ));
    }

    // ── parse_status_report ──────────────────────────────────────────

    #[test]
    fn test_parse_status_report_with_target_branch() {
        let body = r#"{"id":"a","status":"FINISHED","target":{"branchName":"agent/a"}}"#;
        let report = parse_status_report(body).unwrap();
        assert_eq!(report.status, AgentStatus::Finished);
        assert_eq!(report.branch_name.as_deref(), Some("agent/a"));
        assert_eq!(report.raw["id"], "a");
    }

    #[test]
    fn test_parse_status_report_top_level_branch_fallback() {
        let body = r#"{"status":"RUNNING","branchName":"agent/b"}"#;
        let report = parse_status_report(body).unwrap();
        assert_eq!(report.status, AgentStatus::Running);
        assert_eq!(report.branch_name.as_deref(), Some("agent/b"));
    }

    #[test]
    fn test_parse_status_report_unknown_status_is_parse_error() {
        let err = parse_status_report(r#"{"status":"SLEEPING"}"#).unwrap_err();
        assert!(matches!(err, AgentApiError::Parse(_)));
    }

    #[test]
    fn test_parse_status_report_missing_status_is_parse_error() {
        assert!(matches!(
            parse_status_report(r#"{"id":"a"}"#),
            Err(AgentApiError::Parse(_))
        ));
    }

    // ── creation_failure ─────────────────────────────────────────────

    #[test]
    fn test_creation_failure_mapping() {
        assert!(matches!(
            creation_failure(401, String::new()),
            AgentApiError::Auth
        ));
        assert!(matches!(
            creation_failure(403, String::new()),
            AgentApiError::Permission
        ));
        assert!(matches!(
            creation_failure(400, "bad payload".into()),
            AgentApiError::BadRequest(_)
        ));
        assert!(matches!(
            creation_failure(500, "oops".into()),
            AgentApiError::Api { status: 500, .. }
        ));
    }

    // ── payload shape ────────────────────────────────────────────────

    #[test]
    fn test_creation_payload_shape() {
        let payload = serde_json::json!({
            "prompt": { "text": "Add a button" },
            "source": { "repository": "https://github.com/o/r", "ref": "bridge-staging" },
            "model": "claude-4.5-sonnet",
        });
        assert_eq!(payload["prompt"]["text"], "Add a button");
        assert_eq!(payload["source"]["ref"], "bridge-staging");
        assert_eq!(payload["model"], "claude-4.5-sonnet");
    }
}
