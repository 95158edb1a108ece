// Podex control-plane API server and reconciler host
//
// Builds the whole service graph by constructor injection: settings,
// database, kv store, token service, compute client, event hub,
// orchestrator, reconcilers. Exit code 0 on a clean shutdown, 1 when
// startup fails.

mod events;
mod reconcilers;
mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use podex_agent::{
    ApprovalBus, ApprovalCallback, ApprovalRequest, ExecutorDeps, InMemoryApprovalBus,
    LocalToolRegistry, Orchestrator, OrchestratorConfig, ResolvingLlmService, ToolContext,
};
use podex_compute::{ComputeClient, ComputeToolBackend};
use podex_core::Settings;
use podex_storage::{
    load_tool_categories, Database, InMemoryKv, KvStore, RedisApprovalBus, RedisKv, TokenService,
};

use crate::events::SessionEventHub;
use crate::reconcilers::ReconcilerCtx;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        routes::tasks::create_task,
        routes::tasks::get_task,
        routes::tasks::cancel_task,
        routes::tasks::resolve_approval,
        routes::tasks::delegate,
        routes::auth::login,
        routes::auth::refresh,
        routes::auth::logout,
    ),
    components(schemas(
        routes::tasks::CreateTaskRequest,
        routes::tasks::TaskSubmitted,
        routes::tasks::ResolveApprovalRequest,
        routes::tasks::DelegateRequest,
        routes::tasks::DelegateAgentSpec,
        routes::auth::LoginRequest,
        routes::auth::TokenResponse,
        routes::auth::RefreshRequest,
        routes::auth::LogoutRequest,
    )),
    tags(
        (name = "tasks", description = "Agent task endpoints"),
        (name = "approvals", description = "Tool approval endpoints"),
        (name = "auth", description = "Authentication endpoints")
    ),
    info(
        title = "Podex API",
        version = "0.3.0",
        description = "Control plane for AI coding sessions in workspace containers",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "podex_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("podex-api starting...");

    let settings = Settings::from_env();

    // External stores. Schema and migrations are managed out of band; a
    // missing database is a startup failure (exit 1).
    let db = Database::from_url(&settings.database_url)
        .await
        .context("Failed to connect to database")?;
    info!("Connected to database");

    let kv: Arc<dyn KvStore> = match RedisKv::connect(&settings.redis_url).await {
        Ok(kv) => Arc::new(kv),
        Err(e) => {
            warn!(error = %e, "Redis unavailable, falling back to in-memory kv store");
            Arc::new(InMemoryKv::new())
        }
    };

    let approval_bus: Arc<dyn ApprovalBus> =
        match RedisApprovalBus::connect(&settings.redis_url).await {
            Ok(bus) => bus,
            Err(e) => {
                warn!(error = %e, "Redis pub/sub unavailable, using in-process approval bus");
                Arc::new(InMemoryApprovalBus::new())
            }
        };

    // Single initializer: categories load once and are shared from here
    let categories = Arc::new(load_tool_categories(kv.as_ref()).await);

    let hub = Arc::new(SessionEventHub::new());
    let tokens = Arc::new(TokenService::new(&settings, kv.clone()));
    let compute = ComputeClient::new(
        settings.compute_service_url.clone(),
        settings.compute_internal_api_key.clone(),
    );

    // Approval requests surface to the user through the session channel
    let approval_callback: ApprovalCallback = {
        let hub = hub.clone();
        Arc::new(move |request: ApprovalRequest| {
            let hub = hub.clone();
            Box::pin(async move {
                hub.emit_to_session(
                    &request.session_id,
                    "approval_request",
                    json!({
                        "approval_id": request.approval_id,
                        "agent_id": request.agent_id,
                        "tool_name": request.tool_name,
                        "action_type": request.action_type.as_str(),
                        "arguments": request.arguments,
                        "can_add_to_allowlist": request.can_add_to_allowlist,
                    }),
                );
            })
        })
    };

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(ResolvingLlmService::new(
            settings.clone(),
            podex_storage::usage_sink(db.clone()),
        )),
        podex_storage::memory_recall(db.clone()),
        hub.clone(),
        ExecutorDeps {
            categories,
            approval_bus,
            approval_callback: Some(approval_callback),
            remote: Arc::new(ComputeToolBackend::new(compute.clone())),
            local: Arc::new(local_tools(db.clone())),
        },
        None,
        OrchestratorConfig {
            max_agents: settings.max_agents,
            max_tasks: settings.max_tasks,
            agent_idle_ttl: settings.agent_idle_ttl,
            task_ttl: settings.task_ttl,
            max_iterations: settings.max_iterations,
        },
    ));
    let mut background = orchestrator.start().await;

    // Reconcilers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler_ctx = Arc::new(ReconcilerCtx {
        db: db.clone(),
        compute,
        events: hub.clone(),
        orchestrator: orchestrator.clone(),
        settings: settings.clone(),
    });
    background.extend(reconcilers::spawn_all(reconciler_ctx, shutdown_rx));
    info!("Reconcilers started");

    // Router
    let encryption = Arc::new(
        podex_storage::EncryptionService::from_settings(&settings)
            .context("Failed to initialize encryption service")?,
    );
    let tasks_state = routes::tasks::AppState {
        orchestrator: orchestrator.clone(),
        hub: hub.clone(),
        db: db.clone(),
        encryption,
    };
    let auth_state = routes::auth::AppState {
        db,
        tokens,
        settings,
    };

    let app = Router::new()
        .route("/health", get(health))
        .merge(routes::tasks::routes(tasks_state))
        .merge(routes::auth::routes(auth_state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = std::env::var("PODEX_API_BIND").unwrap_or_else(|_| "0.0.0.0:9000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    // Stop background work and wait for in-flight passes to finish
    shutdown_tx.send(true).ok();
    orchestrator.shutdown();
    for handle in background {
        handle.await.ok();
    }
    info!("podex-api stopped");

    Ok(())
}

/// In-process tool handlers: name -> handler(args, ctx) -> result.
/// Workspace tools never appear here - they go through the compute
/// backend. Families without a handler report a structured error.
fn local_tools(db: Database) -> LocalToolRegistry {
    let mut registry = LocalToolRegistry::new();

    let recall_db = db.clone();
    registry.register(
        "recall_memory",
        Arc::new(move |args: Value, ctx: ToolContext| {
            let db = recall_db.clone();
            Box::pin(async move {
                let Some(user_id) = ctx.user_id.as_deref().and_then(|id| id.parse().ok()) else {
                    return Ok(json!({"success": false, "error": "User ID required"}));
                };
                let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("");
                let limit = args.get("limit").and_then(|v| v.as_i64()).unwrap_or(5);
                match db.recall_memories(user_id, Some(query), limit).await {
                    Ok(rows) => Ok(json!({
                        "success": true,
                        "memories": rows
                            .iter()
                            .map(|row| json!({
                                "content": row.content,
                                "memory_type": row.memory_type,
                                "importance": row.importance,
                            }))
                            .collect::<Vec<_>>(),
                    })),
                    Err(e) => Ok(json!({"success": false, "error": e.to_string()})),
                }
            })
        }),
    );

    registry.register(
        "get_session_memories",
        Arc::new(move |args: Value, ctx: ToolContext| {
            let db = db.clone();
            Box::pin(async move {
                let Some(user_id) = ctx.user_id.as_deref().and_then(|id| id.parse().ok()) else {
                    return Ok(json!({"success": false, "error": "User ID required"}));
                };
                let limit = args.get("limit").and_then(|v| v.as_i64()).unwrap_or(20);
                match db.recall_memories(user_id, None, limit).await {
                    Ok(rows) => Ok(json!({
                        "success": true,
                        "count": rows.len(),
                        "memories": rows.iter().map(|row| row.content.clone()).collect::<Vec<_>>(),
                    })),
                    Err(e) => Ok(json!({"success": false, "error": e.to_string()})),
                }
            })
        }),
    );

    registry
}
