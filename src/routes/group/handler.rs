use axum::{
    Extension,
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    AppState,
    error::{AppError, AppResult},
    middleware::CurrentUser,
    routes::user::model::User,
    utils::{Empty, success_to_api_response},
};

use super::model::{
    AddMemberRequest, CreateGroupRequest, Group, GroupDetail, GroupMember, MemberRole,
    UpdateGroupRequest,
};

/// 非成员一律 403，不区分群组是否存在
pub async fn require_member(pool: &PgPool, group_id: Uuid, user_id: Uuid) -> AppResult<GroupMember> {
    ensure_member(GroupMember::find(pool, group_id, user_id).await?)
}

fn ensure_member(member: Option<GroupMember>) -> AppResult<GroupMember> {
    member.ok_or_else(|| AppError::Forbidden("你不是该群组成员".into()))
}

/// 先判断成员身份；两次查询之间群组被删除时同样按非成员处理
fn visible_group(member: Option<GroupMember>, group: Option<Group>) -> AppResult<Group> {
    ensure_member(member)?;
    group.ok_or_else(|| AppError::Forbidden("你不是该群组成员".into()))
}

pub async fn require_admin(pool: &PgPool, group_id: Uuid, user_id: Uuid) -> AppResult<GroupMember> {
    let member = require_member(pool, group_id, user_id).await?;
    if !member.is_admin() {
        return Err(AppError::Forbidden("需要群组管理员权限".into()));
    }
    Ok(member)
}

fn validate_name(name: &str) -> AppResult<()> {
    let len = name.trim().chars().count();
    if len == 0 || len > 100 {
        return Err(AppError::Validation(
            "群组名称长度必须在1到100个字符之间".into(),
        ));
    }
    Ok(())
}

#[axum::debug_handler]
pub async fn create_group(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Json(req): Json<CreateGroupRequest>,
) -> AppResult<impl IntoResponse> {
    validate_name(&req.name)?;

    let group = Group::create(&state.pool, user_id, &req).await.map_err(|e| {
        // 成员列表里有不存在的用户
        if matches!(&e, sqlx::Error::Database(db) if db.is_foreign_key_violation()) {
            AppError::Validation("成员列表包含不存在的用户".into())
        } else {
            e.into()
        }
    })?;
    let members = Group::members(&state.pool, group.id).await?;

    Ok((
        StatusCode::CREATED,
        success_to_api_response(GroupDetail { group, members }),
    ))
}

#[axum::debug_handler]
pub async fn list_groups(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> AppResult<impl IntoResponse> {
    let groups = Group::list_for_user(&state.pool, user_id).await?;
    Ok(success_to_api_response(groups))
}

#[axum::debug_handler]
pub async fn get_group(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(group_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let member = GroupMember::find(&state.pool, group_id, user_id).await?;
    let group = visible_group(member, Group::find_by_id(&state.pool, group_id).await?)?;

    let members = Group::members(&state.pool, group_id).await?;
    Ok(success_to_api_response(GroupDetail { group, members }))
}

#[axum::debug_handler]
pub async fn update_group(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(group_id): Path<Uuid>,
    Json(req): Json<UpdateGroupRequest>,
) -> AppResult<impl IntoResponse> {
    if let Some(name) = &req.name {
        validate_name(name)?;
    }
    require_admin(&state.pool, group_id, user_id).await?;

    let group = Group::update(&state.pool, group_id, &req)
        .await?
        .ok_or_else(|| AppError::NotFound("群组不存在".into()))?;
    Ok(success_to_api_response(group))
}

#[axum::debug_handler]
pub async fn delete_group(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(group_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let group = Group::find_by_id(&state.pool, group_id)
        .await?
        .ok_or_else(|| AppError::NotFound("群组不存在".into()))?;
    if group.owner_id != user_id {
        return Err(AppError::Forbidden("只有群主可以删除群组".into()));
    }

    Group::delete(&state.pool, group_id).await?;
    tracing::info!(%group_id, %user_id, "Deleted group");
    Ok(success_to_api_response(Empty {}))
}

#[axum::debug_handler]
pub async fn add_member(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(group_id): Path<Uuid>,
    Json(req): Json<AddMemberRequest>,
) -> AppResult<impl IntoResponse> {
    require_admin(&state.pool, group_id, user_id).await?;

    if User::find_by_id(&state.pool, req.user_id).await?.is_none() {
        return Err(AppError::NotFound("用户不存在".into()));
    }
    if !GroupMember::add(&state.pool, group_id, req.user_id, MemberRole::Member).await? {
        return Err(AppError::Conflict("该用户已是群组成员".into()));
    }

    // 新成员下次连接时才会加入实时房间
    tracing::info!(%group_id, member_id = %req.user_id, "Added group member");
    let members = Group::members(&state.pool, group_id).await?;
    Ok((StatusCode::CREATED, success_to_api_response(members)))
}

#[axum::debug_handler]
pub async fn remove_member(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path((group_id, member_id)): Path<(Uuid, Uuid)>,
) -> AppResult<impl IntoResponse> {
    let group = Group::find_by_id(&state.pool, group_id)
        .await?
        .ok_or_else(|| AppError::NotFound("群组不存在".into()))?;

    if member_id != user_id {
        require_admin(&state.pool, group_id, user_id).await?;
    }
    if member_id == group.owner_id {
        return Err(AppError::Validation("不能移除群主".into()));
    }
    if !GroupMember::remove(&state.pool, group_id, member_id).await? {
        return Err(AppError::NotFound("该用户不是群组成员".into()));
    }

    tracing::info!(%group_id, %member_id, removed_by = %user_id, "Removed group member");
    Ok(success_to_api_response(Empty {}))
}
