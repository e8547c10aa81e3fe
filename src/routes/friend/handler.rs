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
    routes::user::model::User,
    utils::{Empty, success_to_api_response},
};

use super::model::{FriendRequestBody, Friendship, FriendshipStatus, RespondRequestBody};

#[axum::debug_handler]
pub async fn send_request(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Json(req): Json<FriendRequestBody>,
) -> AppResult<impl IntoResponse> {
    if req.user_id == user_id {
        return Err(AppError::Validation("不能添加自己为好友".into()));
    }
    if User::find_by_id(&state.pool, req.user_id).await?.is_none() {
        return Err(AppError::NotFound("用户不存在".into()));
    }

    if let Some(existing) = Friendship::find(&state.pool, user_id, req.user_id).await? {
        let msg = match existing.status {
            FriendshipStatus::Pending => "好友请求已存在",
            FriendshipStatus::Accepted => "你们已经是好友",
            FriendshipStatus::Blocked => "无法发送好友请求",
        };
        return Err(AppError::Conflict(msg.into()));
    }
    if !Friendship::request(&state.pool, user_id, req.user_id).await? {
        return Err(AppError::Conflict("好友请求已存在".into()));
    }

    tracing::info!(from = %user_id, to = %req.user_id, "Friend request sent");
    Ok((StatusCode::CREATED, success_to_api_response(Empty {})))
}

#[axum::debug_handler]
pub async fn list_requests(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> AppResult<impl IntoResponse> {
    let requests = Friendship::incoming_requests(&state.pool, user_id).await?;
    Ok(success_to_api_response(requests))
}

#[axum::debug_handler]
pub async fn respond_request(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(requester): Path<Uuid>,
    Json(req): Json<RespondRequestBody>,
) -> AppResult<impl IntoResponse> {
    if req.status == FriendshipStatus::Pending {
        return Err(AppError::Validation("状态只能是 accepted 或 blocked".into()));
    }
    if !Friendship::respond(&state.pool, user_id, requester, req.status).await? {
        return Err(AppError::NotFound("好友请求不存在".into()));
    }

    tracing::info!(%user_id, %requester, status = ?req.status, "Friend request answered");
    Ok(success_to_api_response(Empty {}))
}

#[axum::debug_handler]
pub async fn list_friends(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> AppResult<impl IntoResponse> {
    let friends = Friendship::friends_of(&state.pool, user_id).await?;
    Ok(success_to_api_response(friends))
}

#[axum::debug_handler]
pub async fn remove_friend(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(friend_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    if !Friendship::remove_accepted(&state.pool, user_id, friend_id).await? {
        return Err(AppError::NotFound("好友关系不存在".into()));
    }
    Ok(success_to_api_response(Empty {}))
}
