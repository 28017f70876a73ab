//! Route definitions of the REST API.

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};

use super::{auth_middleware, handlers, rate_limit_middleware, ServerState};

//-------------------------------------------------------------------------------------------------
// Constants
//-------------------------------------------------------------------------------------------------

/// The largest request body accepted, which bounds file uploads.
pub const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Creates the router with every endpoint, authentication and rate limiting.
pub fn create_router(state: ServerState) -> Router {
    let sandboxes = Router::new()
        .route(
            "/sandboxes",
            post(handlers::create_sandbox_handler).get(handlers::list_sandboxes_handler),
        )
        .route(
            "/sandboxes/{id}",
            get(handlers::get_sandbox_handler).delete(handlers::kill_sandbox_handler),
        )
        .route("/sandboxes/{id}/connect", post(handlers::connect_sandbox_handler))
        .route("/sandboxes/{id}/timeout", post(handlers::set_timeout_handler))
        .route("/sandboxes/{id}/pause", post(handlers::pause_sandbox_handler))
        .route("/sandboxes/{id}/resume", post(handlers::resume_sandbox_handler))
        .route("/sandboxes/{id}/logs", get(handlers::sandbox_logs_handler))
        .route("/sandboxes/{id}/metrics", get(handlers::sandbox_metrics_handler))
        .route("/sandboxes/{id}/hosts/{port}", get(handlers::sandbox_host_handler));

    let commands = Router::new()
        .route(
            "/sandboxes/{id}/commands",
            post(handlers::run_command_handler).get(handlers::list_processes_handler),
        )
        .route(
            "/sandboxes/{id}/commands/{pid}",
            axum::routing::delete(handlers::kill_command_handler),
        )
        .route("/sandboxes/{id}/commands/{pid}/wait", post(handlers::wait_command_handler))
        .route("/sandboxes/{id}/commands/{pid}/stdin", post(handlers::send_stdin_handler));

    let files = Router::new()
        .route(
            "/sandboxes/{id}/files",
            get(handlers::read_file_handler)
                .put(handlers::write_file_handler)
                .delete(handlers::remove_file_handler),
        )
        .route("/sandboxes/{id}/files/list", get(handlers::list_files_handler))
        .route("/sandboxes/{id}/files/info", get(handlers::file_info_handler))
        .route("/sandboxes/{id}/files/exists", get(handlers::file_exists_handler))
        .route("/sandboxes/{id}/files/rename", post(handlers::rename_file_handler))
        .route("/sandboxes/{id}/files/mkdir", post(handlers::make_dir_handler));

    let volumes = Router::new()
        .route(
            "/volumes",
            post(handlers::create_volume_handler).get(handlers::list_volumes_handler),
        )
        .route(
            "/volumes/{volume}",
            get(handlers::get_volume_handler).delete(handlers::delete_volume_handler),
        )
        .route("/volumes/{volume}/files", get(handlers::list_volume_files_handler))
        .route(
            "/volumes/{volume}/file",
            get(handlers::download_volume_file_handler)
                .put(handlers::upload_volume_file_handler)
                .delete(handlers::delete_volume_file_handler),
        );

    let templates = Router::new()
        .route(
            "/templates",
            post(handlers::build_template_handler).get(handlers::list_templates_handler),
        )
        .route(
            "/templates/{template}",
            get(handlers::get_template_handler)
                .patch(handlers::update_template_handler)
                .delete(handlers::delete_template_handler),
        )
        .route("/templates/builds/{build_id}", get(handlers::build_status_handler));

    // The last layer added runs first, so the team is attached before it is rate limited.
    let api = Router::new()
        .merge(sandboxes)
        .merge(commands)
        .merge(files)
        .merge(volumes)
        .merge(templates)
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(handlers::health_handler))
        .merge(api)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}
