use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use bytes::Bytes;

use crate::{
    gateway::{CommandOptions, CommandResult},
    guest::ProcessInfo,
    server::{
        ApiResult, RunCommandRequest, RunCommandResponse, ServerState, StdinRequest, Team,
    },
};

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for `POST /sandboxes/{id}/commands`
///
/// Foreground commands answer with their result once they exit. Dropping the connection kills
/// the process. Background commands answer with the pid right away.
pub async fn run_command_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
    Json(request): Json<RunCommandRequest>,
) -> ApiResult<Json<RunCommandResponse>> {
    let gateway = state.nimbus().orchestrator().gateway(&team, &id).await?;
    let options = CommandOptions {
        cwd: request.cwd,
        user: request.user,
        envs: request.envs,
        timeout: request.timeout_secs.map(Duration::from_secs),
        stdin: request.stdin,
        ..Default::default()
    };

    if request.background {
        let handle = gateway.spawn(&request.cmd, options).await?;
        return Ok(Json(RunCommandResponse::Started { pid: handle.pid() }));
    }

    let result = gateway.run(&request.cmd, options).await?;
    Ok(Json(RunCommandResponse::Finished(result)))
}

/// Handler for `GET /sandboxes/{id}/commands`
pub async fn list_processes_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ProcessInfo>>> {
    let gateway = state.nimbus().orchestrator().gateway(&team, &id).await?;
    Ok(Json(gateway.list_processes().await?))
}

/// Handler for `POST /sandboxes/{id}/commands/{pid}/wait`
pub async fn wait_command_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path((id, pid)): Path<(String, u32)>,
) -> ApiResult<Json<CommandResult>> {
    let gateway = state.nimbus().orchestrator().gateway(&team, &id).await?;
    Ok(Json(gateway.wait(pid).await?))
}

/// Handler for `POST /sandboxes/{id}/commands/{pid}/stdin`
pub async fn send_stdin_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path((id, pid)): Path<(String, u32)>,
    Json(request): Json<StdinRequest>,
) -> ApiResult<StatusCode> {
    let gateway = state.nimbus().orchestrator().gateway(&team, &id).await?;
    if !request.data.is_empty() {
        gateway.send_stdin(pid, Bytes::from(request.data)).await?;
    }
    if request.close {
        gateway.close_stdin(pid).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `DELETE /sandboxes/{id}/commands/{pid}`
pub async fn kill_command_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path((id, pid)): Path<(String, u32)>,
) -> ApiResult<StatusCode> {
    let gateway = state.nimbus().orchestrator().gateway(&team, &id).await?;
    gateway.kill(pid).await?;
    Ok(StatusCode::NO_CONTENT)
}
