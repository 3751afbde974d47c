//! API route definitions.

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::handlers::{agents, artifacts, jobs, pipelines, projects, server, update, vault};
use crate::middleware::{cors_layer, request_id};
use crate::state::AppState;

/// Create the main API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/v1", api_routes())
        .route("/artifacts/{job_id}/{*path}", get(artifacts::serve_artifact))
        .layer(
            ServiceBuilder::new()
                .layer(axum_middleware::from_fn(request_id))
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer()),
        )
        .with_state(state)
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/server-info", get(server::server_info))
        .route("/healthz", get(server::healthz))
        .route("/runtime-state", get(server::runtime))
        .route("/server/restart", post(server::restart))
        .route("/heartbeat", post(agents::heartbeat))
        .route("/agent/lease", post(jobs::lease))
        .route("/config/load", post(projects::load_config))
        .route("/pipeline-chains/{id}/run", post(pipelines::run_chain))
        .nest("/agents", agent_routes())
        .nest("/projects", project_routes())
        .nest("/pipelines", pipeline_routes())
        .nest("/jobs", job_routes())
        .nest("/update", update_routes())
        .nest("/vault/connections", vault_routes())
}

fn agent_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(agents::list_agents))
        .route("/{id}", get(agents::get_agent))
        .route("/{id}/update", post(agents::request_update))
        .route("/{id}/refresh-tools", post(agents::refresh_tools))
        .route("/{id}/run-script", post(agents::run_script))
}

fn project_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(projects::list_projects))
        .route("/import", post(projects::import_project))
        .route("/{id}", get(projects::get_project))
        .route("/{id}/reload", post(projects::reload_project))
        .route("/{id}/icon", get(projects::project_icon))
}

fn pipeline_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{id}/run", post(pipelines::run_pipeline))
        .route("/{id}/run-selection", post(pipelines::run_selection))
        .route("/{id}/version-preview", get(pipelines::version_preview))
        .route("/{id}/version-resolve", get(pipelines::version_resolve))
        .route("/{id}/source-refs", get(pipelines::source_refs))
}

fn job_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(jobs::list_jobs).post(jobs::create_job))
        .route("/clear-queue", post(jobs::clear_queue))
        .route("/flush-history", post(jobs::flush_history))
        .route("/{id}", get(jobs::get_job).delete(jobs::delete_job))
        .route("/{id}/status", post(jobs::update_status))
        .route("/{id}/force-fail", post(jobs::force_fail))
        .route(
            "/{id}/events",
            get(jobs::list_events).post(jobs::append_events),
        )
        .route(
            "/{id}/artifacts",
            get(artifacts::list_artifacts).post(artifacts::upload_artifacts),
        )
        .route("/{id}/artifacts/download-all", get(artifacts::download_all))
        .route(
            "/{id}/tests",
            get(artifacts::get_test_report).post(artifacts::upload_test_report),
        )
}

fn update_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/check", post(update::check))
        .route("/apply", post(update::apply))
        .route("/rollback", post(update::rollback))
        .route("/tags", get(update::tags))
        .route("/status", get(update::status))
}

fn vault_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/",
            get(vault::list_connections).post(vault::create_connection),
        )
        .route(
            "/{id}",
            get(vault::get_connection)
                .put(vault::update_connection)
                .delete(vault::delete_connection),
        )
}
