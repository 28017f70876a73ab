use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};

use crate::{
    orchestration::{CreateOptions, SandboxInfo, SandboxMetrics},
    server::{
        ApiResult, CreatedSandbox, HostResponse, KillResponse, ListSandboxesQuery, LogsQuery,
        LogsResponse, ResumeRequest, ServerState, Team, TimeoutRequest,
    },
    utils::Page,
};

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for `POST /sandboxes`
pub async fn create_sandbox_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Json(options): Json<CreateOptions>,
) -> ApiResult<(StatusCode, Json<CreatedSandbox>)> {
    tracing::debug!(team, template = %options.template, "received create request");
    let sandbox = state.nimbus().orchestrator().create(&team, options).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedSandbox {
            info: sandbox.info(),
            traffic_token: sandbox.traffic_token().to_string(),
        }),
    ))
}

/// Handler for `GET /sandboxes`
pub async fn list_sandboxes_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Query(query): Query<ListSandboxesQuery>,
) -> ApiResult<Json<Page<SandboxInfo>>> {
    let metadata = query.metadata_filter()?;
    let page = state
        .nimbus()
        .orchestrator()
        .list(&team, &metadata, query.limit, query.next.as_deref())
        .await?;
    Ok(Json(page))
}

/// Handler for `GET /sandboxes/{id}`
pub async fn get_sandbox_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
) -> ApiResult<Json<SandboxInfo>> {
    Ok(Json(state.nimbus().orchestrator().info(&team, &id).await?))
}

/// Handler for `POST /sandboxes/{id}/connect`
pub async fn connect_sandbox_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
) -> ApiResult<Json<SandboxInfo>> {
    let sandbox = state.nimbus().orchestrator().connect(&team, &id).await?;
    Ok(Json(sandbox.info()))
}

/// Handler for `POST /sandboxes/{id}/timeout`
pub async fn set_timeout_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
    Json(request): Json<TimeoutRequest>,
) -> ApiResult<Json<SandboxInfo>> {
    let info = state
        .nimbus()
        .orchestrator()
        .set_timeout(&team, &id, Duration::from_secs(request.timeout_secs))
        .await?;
    Ok(Json(info))
}

/// Handler for `POST /sandboxes/{id}/pause`
pub async fn pause_sandbox_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
) -> ApiResult<Json<SandboxInfo>> {
    Ok(Json(state.nimbus().orchestrator().pause(&team, &id).await?))
}

/// Handler for `POST /sandboxes/{id}/resume`
pub async fn resume_sandbox_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
    Json(request): Json<ResumeRequest>,
) -> ApiResult<Json<SandboxInfo>> {
    let info = state
        .nimbus()
        .orchestrator()
        .resume(&team, &id, request.timeout_secs.map(Duration::from_secs))
        .await?;
    Ok(Json(info))
}

/// Handler for `DELETE /sandboxes/{id}`
pub async fn kill_sandbox_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
) -> ApiResult<Json<KillResponse>> {
    let killed = state.nimbus().orchestrator().kill(&team, &id).await?;
    Ok(Json(KillResponse { killed }))
}

/// Handler for `GET /sandboxes/{id}/logs`
pub async fn sandbox_logs_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<LogsResponse>> {
    let lines = state
        .nimbus()
        .orchestrator()
        .logs(&team, &id, query.tail)
        .await?;
    Ok(Json(LogsResponse { lines }))
}

/// Handler for `GET /sandboxes/{id}/metrics`
pub async fn sandbox_metrics_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
) -> ApiResult<Json<SandboxMetrics>> {
    Ok(Json(state.nimbus().orchestrator().metrics(&team, &id).await?))
}

/// Handler for `GET /sandboxes/{id}/hosts/{port}`
pub async fn sandbox_host_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path((id, port)): Path<(String, u16)>,
) -> ApiResult<Json<HostResponse>> {
    let host = state
        .nimbus()
        .orchestrator()
        .get_host(&team, &id, port)
        .await?;
    Ok(Json(HostResponse { host }))
}
