use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use uuid::Uuid;

use crate::{
    AppState,
    error::AppError,
    utils::{TokenKind, verify_token},
};

/// 已认证请求的用户
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub Uuid);

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .typed_get::<Authorization<Bearer>>()
        .ok_or(AppError::Unauthorized)?;

    let claims = verify_token(token.token(), &state.config.jwt_secret).map_err(|e| {
        tracing::debug!(error = %e, "Rejected bearer token");
        AppError::AuthFailed("令牌无效或已过期".into())
    })?;

    // 刷新令牌不能用来访问受保护接口
    if claims.kind != TokenKind::Access {
        return Err(AppError::AuthFailed("令牌类型错误".into()));
    }
    let user_id = claims.user_id().ok_or(AppError::Unauthorized)?;

    request.extensions_mut().insert(CurrentUser(user_id));
    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}
