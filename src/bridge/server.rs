use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use super::agent::{AgentApi, HttpAgentClient};
use super::api::{self, AppState, SharedState};
use super::config::BridgeConfig;
use super::git::{GitWorkspace, Vcs};
use super::history::{DEFAULT_HISTORY_LIMIT, PromptHistory};
use super::queue::{Orchestrator, OrchestratorSettings};
use super::store::{HttpTaskStore, TaskStore};
use super::ws;

/// Build the full application router: HTTP API plus the WebSocket endpoint.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Wire up the collaborators and start the bridge server.
pub async fn start_server(config: BridgeConfig) -> Result<()> {
    let api_key = config.agent.api_key.clone().context(
        "Agent service API key not configured (set BRIDGE_AGENT_API_KEY or [agent].api_key)",
    )?;

    let (ws_tx, _rx) = broadcast::channel::<String>(256);

    let vcs: Arc<dyn Vcs> = Arc::new(GitWorkspace::new(
        config.repo.path.clone(),
        &config.repo.trunk_branch,
    ));
    let agent: Arc<dyn AgentApi> = Arc::new(HttpAgentClient::new(
        &config.agent.base_url,
        &api_key,
        &config.agent.model,
        Arc::clone(&vcs),
    ));
    let store: Arc<dyn TaskStore> = Arc::new(HttpTaskStore::new(
        config.store.base_url.clone(),
        config.store.probe_ports.clone(),
    ));
    let history = Arc::new(PromptHistory::load(
        config.prompts_dir().join("prompt-history.json"),
        DEFAULT_HISTORY_LIMIT,
    ));
    let orchestrator = Orchestrator::new(
        agent,
        store,
        Arc::clone(&vcs),
        ws_tx.clone(),
        OrchestratorSettings::from_config(&config),
    );

    let state = Arc::new(AppState {
        orchestrator,
        ws_tx,
        history,
        vcs,
    });

    let mut app = build_router(state);
    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.server.dev_mode {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    let addr = format!("{}:{}", host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;

    println!("taskbridge running at http://{}", local_addr);
    println!("  WebSocket endpoint: ws://{}/ws", local_addr);
    println!("  Repository: {}", config.repo.path.display());
    println!("  Prompts directory: {}", config.prompts_dir().display());
    println!("Waiting for connections...");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_router() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BridgeConfig::default();
        config.repo.path = dir.path().to_path_buf();

        let (ws_tx, _rx) = broadcast::channel::<String>(16);
        let vcs: Arc<dyn Vcs> = Arc::new(GitWorkspace::new(
            config.repo.path.clone(),
            &config.repo.trunk_branch,
        ));
        let agent: Arc<dyn AgentApi> = Arc::new(HttpAgentClient::new(
            "http://localhost:9",
            "key_test",
            &config.agent.model,
            Arc::clone(&vcs),
        ));
        let store: Arc<dyn TaskStore> =
            Arc::new(HttpTaskStore::new(Some("http://localhost:9".into()), vec![]));
        let history = Arc::new(PromptHistory::load(dir.path().join("history.json"), 10));
        let orchestrator = Orchestrator::new(
            agent,
            store,
            Arc::clone(&vcs),
            ws_tx.clone(),
            OrchestratorSettings::from_config(&config),
        );
        let state = Arc::new(AppState {
            orchestrator,
            ws_tx,
            history,
            vcs,
        });
        (build_router(state), dir)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let (app, _dir) = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ws_route_mounted() {
        let (app, _dir) = test_router();
        // A plain GET without the upgrade handshake must not 404; the
        // route exists, the extractor rejects the request.
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_ne!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (app, _dir) = test_router();
        let req = Request::builder()
            .uri("/definitely-not-here")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
