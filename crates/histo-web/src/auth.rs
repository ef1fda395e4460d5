//! 请求认证
//!
//! 令牌签发与校验由外部身份服务负责，这里只把 Bearer 令牌解析为操作者。

use crate::error::ApiError;
use crate::server::AppState;
use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use histo_core::Actor;
use std::collections::HashMap;
use tracing::warn;

/// 令牌 → 操作者
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// 令牌无效时返回 None
    async fn verify(&self, token: &str) -> Option<Actor>;
}

/// 静态令牌表，来自配置
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Actor>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: impl IntoIterator<Item = (String, Actor)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Option<Actor> {
        self.tokens.get(token).copied()
    }
}

/// 认证中间件，校验通过后把 `Actor` 放入请求扩展
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))?;

    match state.verifier.verify(token).await {
        Some(actor) => {
            request.extensions_mut().insert(actor);
            Ok(next.run(request).await)
        }
        None => {
            warn!("Rejected request to {} with unknown token", request.uri().path());
            Err(ApiError::Unauthorized("Invalid token".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_static_verifier() {
        let admin = Actor::admin(Uuid::new_v4());
        let verifier = StaticTokenVerifier::new([("admin-token".to_string(), admin)]);

        assert_eq!(verifier.verify("admin-token").await, Some(admin));
        assert_eq!(verifier.verify("other").await, None);
        assert_eq!(verifier.len(), 1);
    }
}
