use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;

use crate::{
    gateway::FileContent,
    guest::EntryInfo,
    server::{
        ApiResult, ExistsResponse, FileQuery, ListFilesQuery, MakeDirRequest, MakeDirResponse,
        RenameRequest, ServerState, Team,
    },
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for `GET /sandboxes/{id}/files`
pub async fn read_file_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Response> {
    let gateway = state.nimbus().orchestrator().gateway(&team, &id).await?;
    let content = gateway
        .read(&query.path, query.format, query.user.as_deref())
        .await?;

    Ok(match content {
        FileContent::Text(text) => ([(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], text).into_response(),
        FileContent::Bytes(data) => {
            ([(header::CONTENT_TYPE, BINARY_CONTENT_TYPE)], data).into_response()
        }
        FileContent::Stream(stream) => (
            [(header::CONTENT_TYPE, BINARY_CONTENT_TYPE)],
            Body::from_stream(stream),
        )
            .into_response(),
    })
}

/// Handler for `PUT /sandboxes/{id}/files`
pub async fn write_file_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
    Query(query): Query<FileQuery>,
    body: Bytes,
) -> ApiResult<Json<EntryInfo>> {
    let gateway = state.nimbus().orchestrator().gateway(&team, &id).await?;
    let entry = gateway
        .write(&query.path, body, query.user.as_deref())
        .await?;
    Ok(Json(entry))
}

/// Handler for `DELETE /sandboxes/{id}/files`
pub async fn remove_file_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult<StatusCode> {
    let gateway = state.nimbus().orchestrator().gateway(&team, &id).await?;
    gateway.remove(&query.path, query.user.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `GET /sandboxes/{id}/files/list`
pub async fn list_files_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
    Query(query): Query<ListFilesQuery>,
) -> ApiResult<Json<Vec<EntryInfo>>> {
    let gateway = state.nimbus().orchestrator().gateway(&team, &id).await?;
    let entries = gateway
        .list(&query.path, query.depth, query.user.as_deref())
        .await?;
    Ok(Json(entries))
}

/// Handler for `GET /sandboxes/{id}/files/info`
pub async fn file_info_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Json<EntryInfo>> {
    let gateway = state.nimbus().orchestrator().gateway(&team, &id).await?;
    Ok(Json(
        gateway.get_info(&query.path, query.user.as_deref()).await?,
    ))
}

/// Handler for `GET /sandboxes/{id}/files/exists`
pub async fn file_exists_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Json<ExistsResponse>> {
    let gateway = state.nimbus().orchestrator().gateway(&team, &id).await?;
    let exists = gateway.exists(&query.path, query.user.as_deref()).await?;
    Ok(Json(ExistsResponse { exists }))
}

/// Handler for `POST /sandboxes/{id}/files/rename`
pub async fn rename_file_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> ApiResult<Json<EntryInfo>> {
    let gateway = state.nimbus().orchestrator().gateway(&team, &id).await?;
    let entry = gateway
        .rename(&request.from, &request.to, request.user.as_deref())
        .await?;
    Ok(Json(entry))
}

/// Handler for `POST /sandboxes/{id}/files/mkdir`
pub async fn make_dir_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(id): Path<String>,
    Json(request): Json<MakeDirRequest>,
) -> ApiResult<Json<MakeDirResponse>> {
    let gateway = state.nimbus().orchestrator().gateway(&team, &id).await?;
    let created = gateway
        .make_dir(&request.path, request.user.as_deref())
        .await?;
    Ok(Json(MakeDirResponse { created }))
}
