use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};

use crate::{
    server::{
        ApiResult, BuildStatusQuery, BuildTemplateRequest, PageQuery, ServerState, Team,
        UpdateTemplateRequest,
    },
    template::{BuildInfo, BuildOptions, TemplateInfo},
    utils::Page,
};

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for `POST /templates`
///
/// Answers `201` with the template once the build finished, or `202` with the build when
/// `background` is set.
pub async fn build_template_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Json(request): Json<BuildTemplateRequest>,
) -> ApiResult<Response> {
    let spec = request.template_spec()?;
    let mut options = BuildOptions::builder().skip_cache(request.skip_cache).build();
    if let Some(resources) = request.resources {
        options.resources = resources;
    }

    let builder = state.nimbus().builder();
    if request.background {
        let build = builder
            .build_in_background(&team, &request.alias, spec, options)
            .await?;
        return Ok((StatusCode::ACCEPTED, Json(build)).into_response());
    }

    let template = builder.build(&team, &request.alias, spec, options).await?;
    Ok((StatusCode::CREATED, Json(template)).into_response())
}

/// Handler for `GET /templates`
pub async fn list_templates_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Page<TemplateInfo>>> {
    let page = state
        .nimbus()
        .templates()
        .list(&team, query.limit, query.next.as_deref())
        .await?;
    Ok(Json(page))
}

/// Handler for `GET /templates/{id}`
pub async fn get_template_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(reference): Path<String>,
) -> ApiResult<Json<TemplateInfo>> {
    Ok(Json(state.nimbus().templates().get(&team, &reference).await?))
}

/// Handler for `PATCH /templates/{id}`
pub async fn update_template_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(reference): Path<String>,
    Json(request): Json<UpdateTemplateRequest>,
) -> ApiResult<Json<TemplateInfo>> {
    let template = state
        .nimbus()
        .templates()
        .set_public(&team, &reference, request.public)
        .await?;
    Ok(Json(template))
}

/// Handler for `DELETE /templates/{id}`
pub async fn delete_template_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(reference): Path<String>,
) -> ApiResult<StatusCode> {
    state.nimbus().templates().delete(&team, &reference).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `GET /templates/builds/{build_id}`
pub async fn build_status_handler(
    State(state): State<ServerState>,
    Extension(Team(team)): Extension<Team>,
    Path(build_id): Path<String>,
    Query(query): Query<BuildStatusQuery>,
) -> ApiResult<Json<BuildInfo>> {
    let build = state
        .nimbus()
        .builder()
        .build_status(&team, &build_id, query.logs_offset)
        .await?;
    Ok(Json(build))
}
