use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;

use crate::{
    guest::EntryInfo,
    server::{ApiResult, CreateVolumeRequest, PageQuery, ServerState, Team, VolumePathQuery},
    utils::Page,
    volume::Volume,
};

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for `POST /volumes`
pub async fn create_volume_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Json(request): Json<CreateVolumeRequest>,
) -> ApiResult<(StatusCode, Json<Volume>)> {
    let volume = state.nimbus().volumes().create(&team, &request.name).await?;
    Ok((StatusCode::CREATED, Json(volume)))
}

/// Handler for `GET /volumes`
pub async fn list_volumes_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Page<Volume>>> {
    let page = state
        .nimbus()
        .volumes()
        .list(&team, query.limit, query.next.as_deref())
        .await?;
    Ok(Json(page))
}

/// Handler for `GET /volumes/{id_or_name}`
pub async fn get_volume_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(volume): Path<String>,
) -> ApiResult<Json<Volume>> {
    Ok(Json(state.nimbus().volumes().get(&team, &volume).await?))
}

/// Handler for `DELETE /volumes/{id_or_name}`
///
/// Goes through the orchestrator so volumes mounted by running sandboxes follow the configured
/// delete policy.
pub async fn delete_volume_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(volume): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .nimbus()
        .orchestrator()
        .delete_volume(&team, &volume)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `GET /volumes/{id}/files`
pub async fn list_volume_files_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(volume): Path<String>,
    Query(query): Query<VolumePathQuery>,
) -> ApiResult<Json<Page<EntryInfo>>> {
    let page = state
        .nimbus()
        .volumes()
        .list_files(&team, &volume, &query.path, query.limit, query.next.as_deref())
        .await?;
    Ok(Json(page))
}

/// Handler for `GET /volumes/{id}/file`
pub async fn download_volume_file_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(volume): Path<String>,
    Query(query): Query<VolumePathQuery>,
) -> ApiResult<Response> {
    let data = state
        .nimbus()
        .volumes()
        .download(&team, &volume, &query.path)
        .await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data).into_response())
}

/// Handler for `PUT /volumes/{id}/file`
pub async fn upload_volume_file_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(volume): Path<String>,
    Query(query): Query<VolumePathQuery>,
    body: Bytes,
) -> ApiResult<Json<EntryInfo>> {
    let entry = state
        .nimbus()
        .volumes()
        .upload(&team, &volume, &query.path, body)
        .await?;
    Ok(Json(entry))
}

/// Handler for `DELETE /volumes/{id}/file`
pub async fn delete_volume_file_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(volume): Path<String>,
    Query(query): Query<VolumePathQuery>,
) -> ApiResult<StatusCode> {
    state
        .nimbus()
        .volumes()
        .delete_path(&team, &volume, &query.path, query.recursive)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
