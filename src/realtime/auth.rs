use axum::{
    extract::{FromRef, FromRequestParts, Query},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use super::RealtimeHub;
use crate::utils::{TokenKind, error_codes, error_to_api_response, verify_token};

/// 握手失败：连接不会建立，也不会有任何事件进入分发器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthenticationError {
    #[error("Authentication error: token not provided")]
    TokenNotProvided,
    #[error("Authentication error: invalid token")]
    InvalidToken,
}

impl IntoResponse for AuthenticationError {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            error_to_api_response::<()>(error_codes::AUTH_FAILED, self.to_string()),
        )
            .into_response()
    }
}

/// 校验握手时携带的访问令牌。无网络、无存储调用。
pub struct ConnectionAuthenticator {
    jwt_secret: String,
}

impl ConnectionAuthenticator {
    pub fn new(jwt_secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
        }
    }

    pub fn authenticate(&self, token: Option<&str>) -> Result<Uuid, AuthenticationError> {
        let token = token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthenticationError::TokenNotProvided)?;

        let claims = verify_token(token, &self.jwt_secret).map_err(|e| {
            tracing::debug!(error = %e, "Rejected connection token");
            AuthenticationError::InvalidToken
        })?;

        if claims.kind != TokenKind::Access {
            return Err(AuthenticationError::InvalidToken);
        }
        claims.user_id().ok_or(AuthenticationError::InvalidToken)
    }
}

#[derive(Debug, Deserialize)]
struct HandshakeQuery {
    token: Option<String>,
}

/// 握手阶段的身份：`?token=` 优先，其次 `Authorization: Bearer`
pub struct ConnectionIdentity(pub Uuid);

impl<S> FromRequestParts<S> for ConnectionIdentity
where
    RealtimeHub: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthenticationError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let hub = RealtimeHub::from_ref(state);

        let query_token = Query::<HandshakeQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(query)| query.token);
        let header_token = parts
            .headers
            .typed_get::<Authorization<Bearer>>()
            .map(|auth| auth.token().to_string());

        let token = query_token.or(header_token);
        let result = hub.authenticator().authenticate(token.as_deref());
        if let Err(e) = &result {
            tracing::info!(error = %e, "Connection handshake rejected");
        }
        result.map(ConnectionIdentity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{Claims, generate_token};
    use chrono::Utc;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use std::time::Duration;

    const SECRET: &str = "handshake-secret";

    fn authenticator() -> ConnectionAuthenticator {
        ConnectionAuthenticator::new(SECRET)
    }

    #[test]
    fn missing_token_is_rejected() {
        assert_eq!(
            authenticator().authenticate(None),
            Err(AuthenticationError::TokenNotProvided)
        );
        assert_eq!(
            authenticator().authenticate(Some("  ")),
            Err(AuthenticationError::TokenNotProvided)
        );
    }

    #[test]
    fn garbage_token_is_invalid() {
        assert_eq!(
            authenticator().authenticate(Some("abc.def.ghi")),
            Err(AuthenticationError::InvalidToken)
        );
    }

    #[test]
    fn expired_token_is_invalid() {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            exp: now - 3600,
            iat: now - 7200,
            kind: TokenKind::Access,
            jti: Uuid::new_v4().to_string(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert_eq!(
            authenticator().authenticate(Some(&token)),
            Err(AuthenticationError::InvalidToken)
        );
    }

    #[test]
    fn refresh_token_cannot_open_connection() {
        let token = generate_token(
            Uuid::new_v4(),
            TokenKind::Refresh,
            SECRET,
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(
            authenticator().authenticate(Some(&token)),
            Err(AuthenticationError::InvalidToken)
        );
    }

    #[test]
    fn valid_token_yields_subject() {
        let user_id = Uuid::new_v4();
        let token =
            generate_token(user_id, TokenKind::Access, SECRET, Duration::from_secs(60)).unwrap();
        assert_eq!(authenticator().authenticate(Some(&token)), Ok(user_id));
    }

    #[test]
    fn rejection_is_unauthorized() {
        let response = AuthenticationError::TokenNotProvided.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
