use axum::{
    Extension,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use uuid::Uuid;

use super::model::{HistoryQuery, Message, normalize_paging};
use crate::{
    AppState,
    error::{AppError, AppResult},
    middleware::CurrentUser,
    routes::group::require_member,
    utils::success_to_api_response,
};

#[axum::debug_handler]
pub async fn get_messages(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(group_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<impl IntoResponse> {
    let (page, limit) =
        normalize_paging(query.page, query.limit).map_err(|msg| AppError::Validation(msg.into()))?;
    require_member(&state.pool, group_id, user_id).await?;

    let history = Message::history(&state.pool, group_id, page, limit).await?;
    tracing::debug!(%group_id, page, count = history.messages.len(), "Loaded message history");
    Ok(success_to_api_response(history))
}
