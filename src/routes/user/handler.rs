use axum::{
    extract::{Extension, Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::{
    AppState,
    error::{AppError, AppResult},
    middleware::CurrentUser,
    utils::{
        Empty, TokenKind, digest_token, generate_token_pair, hash_password, success_to_api_response,
        verify_token,
    },
};

use super::model::{
    AuthResponse, LoginRequest, RefreshRequest, RegisterRequest, SearchQuery, UpdatePictureRequest,
    User, UserProfile, is_valid_email, is_valid_picture_url,
};

const MIN_USERNAME_CHARS: usize = 3;
const MIN_PASSWORD_CHARS: usize = 8;

fn validate_registration(req: &RegisterRequest) -> AppResult<()> {
    if req.username.trim().chars().count() < MIN_USERNAME_CHARS {
        return Err(AppError::Validation("用户名至少需要3个字符".into()));
    }
    if !is_valid_email(req.email.trim()) {
        return Err(AppError::Validation("邮箱格式无效".into()));
    }
    if req.password.chars().count() < MIN_PASSWORD_CHARS {
        return Err(AppError::Validation("密码至少需要8个字符".into()));
    }
    Ok(())
}

/// 签发新的令牌对并保存刷新令牌摘要
async fn issue_tokens(state: &AppState, user: User) -> AppResult<AuthResponse> {
    let tokens = generate_token_pair(user.id, &state.config)?;
    User::set_refresh_token_hash(&state.pool, user.id, Some(&digest_token(&tokens.refresh_token)))
        .await?;
    Ok(AuthResponse {
        user: user.into(),
        tokens,
    })
}

#[axum::debug_handler]
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> AppResult<impl IntoResponse> {
    validate_registration(&req)?;
    let username = req.username.trim();
    let email = req.email.trim().to_lowercase();

    if User::exists(&state.pool, username, &email).await? {
        return Err(AppError::Conflict("用户名或邮箱已被注册".into()));
    }

    let password_hash = hash_password(&req.password)?;
    let user = User::create(&state.pool, username, &email, &password_hash)
        .await
        .map_err(|e| {
            // 并发注册时由唯一约束兜底
            if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                AppError::Conflict("用户名或邮箱已被注册".into())
            } else {
                e.into()
            }
        })?;

    let response = issue_tokens(&state, user).await?;
    Ok((StatusCode::CREATED, success_to_api_response(response)))
}

#[axum::debug_handler]
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> AppResult<impl IntoResponse> {
    let invalid = || AppError::AuthFailed("Invalid email or password".into());

    let user = User::find_by_email(&state.pool, &req.email.trim().to_lowercase())
        .await?
        .ok_or_else(invalid)?;
    if !user.verify_login(&req.password)? {
        tracing::info!(user_id = %user.id, "Login rejected");
        return Err(invalid());
    }

    let response = issue_tokens(&state, user).await?;
    Ok(success_to_api_response(response))
}

#[axum::debug_handler]
pub async fn refresh_token(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> AppResult<impl IntoResponse> {
    let token = req
        .refresh_token
        .filter(|token| !token.trim().is_empty())
        .ok_or_else(|| AppError::Validation("缺少刷新令牌".into()))?;
    let rejected = || AppError::AuthFailed("刷新令牌无效".into());

    let claims = verify_token(&token, &state.config.jwt_secret).map_err(|_| rejected())?;
    if claims.kind != TokenKind::Refresh {
        return Err(rejected());
    }
    let user_id = claims.user_id().ok_or_else(rejected)?;

    let user = User::find_by_id(&state.pool, user_id)
        .await?
        .ok_or_else(rejected)?;
    // 只有最近一次签发的刷新令牌有效
    if user.refresh_token_hash.as_deref() != Some(digest_token(&token).as_str()) {
        tracing::info!(%user_id, "Stale refresh token presented");
        return Err(rejected());
    }

    let response = issue_tokens(&state, user).await?;
    Ok(success_to_api_response(response.tokens))
}

#[axum::debug_handler]
pub async fn logout(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> AppResult<impl IntoResponse> {
    User::set_refresh_token_hash(&state.pool, user_id, None).await?;
    tracing::info!(%user_id, "User logged out");
    Ok(success_to_api_response(Empty {}))
}

#[axum::debug_handler]
pub async fn me(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> AppResult<impl IntoResponse> {
    let user = User::find_by_id(&state.pool, user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("用户不存在".into()))?;
    Ok(success_to_api_response(UserProfile::from(user)))
}

#[axum::debug_handler]
pub async fn update_picture(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Json(req): Json<UpdatePictureRequest>,
) -> AppResult<impl IntoResponse> {
    let url = req.profile_picture_url.trim();
    if !is_valid_picture_url(url) {
        return Err(AppError::Validation("头像地址无效".into()));
    }

    let user = User::set_profile_picture(&state.pool, user_id, url)
        .await?
        .ok_or_else(|| AppError::NotFound("用户不存在".into()))?;
    tracing::info!(%user_id, "Updated profile picture");
    Ok(success_to_api_response(UserProfile::from(user)))
}

#[axum::debug_handler]
pub async fn search(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Query(query): Query<SearchQuery>,
) -> AppResult<impl IntoResponse> {
    let term = query
        .query
        .as_deref()
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .ok_or_else(|| AppError::Validation("缺少搜索关键字".into()))?;

    let users = User::search(&state.pool, term, user_id).await?;
    Ok(success_to_api_response(users))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(username: &str, email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            username: username.into(),
            email: email.into(),
            password: password.into(),
        }
    }

    #[test]
    fn registration_rules() {
        assert!(validate_registration(&request("ana", "ana@example.com", "longenough")).is_ok());
        assert!(validate_registration(&request("an", "ana@example.com", "longenough")).is_err());
        assert!(validate_registration(&request("ana", "not-an-email", "longenough")).is_err());
        assert!(validate_registration(&request("ana", "ana@example.com", "short")).is_err());
    }
}
