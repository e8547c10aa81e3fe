use axum::{
    Extension,
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use crate::{
    AppState,
    error::{AppError, AppResult},
    middleware::CurrentUser,
    routes::group::{require_admin, require_member},
    utils::success_to_api_response,
};

use super::model::{CreateTripRequest, Trip, UpdateTripRequest};

#[axum::debug_handler]
pub async fn create_trip(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(group_id): Path<Uuid>,
    Json(req): Json<CreateTripRequest>,
) -> AppResult<impl IntoResponse> {
    let len = req.name.trim().chars().count();
    if len == 0 || len > 100 {
        return Err(AppError::Validation("行程名称长度必须在1到100个字符之间".into()));
    }
    require_member(&state.pool, group_id, user_id).await?;

    let trip = Trip::create(&state.pool, group_id, &req).await?;
    tracing::info!(trip_id = %trip.id, %group_id, "Created trip");
    Ok((StatusCode::CREATED, success_to_api_response(trip)))
}

#[axum::debug_handler]
pub async fn list_trips(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(group_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    require_member(&state.pool, group_id, user_id).await?;
    let trips = Trip::list_for_group(&state.pool, group_id).await?;
    Ok(success_to_api_response(trips))
}

/// 管理员通过 HTTP 修改状态时不会产生实时广播
#[axum::debug_handler]
pub async fn update_trip(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path((group_id, trip_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateTripRequest>,
) -> AppResult<impl IntoResponse> {
    require_admin(&state.pool, group_id, user_id).await?;

    let trip = Trip::set_status(&state.pool, trip_id, group_id, req.status)
        .await?
        .ok_or_else(|| AppError::NotFound("行程不存在".into()))?;
    Ok(success_to_api_response(trip))
}
