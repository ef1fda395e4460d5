//! # 病理报告 Web 服务模块
//!
//! 基于axum的REST接口。请求携带 Bearer 令牌，由 `TokenVerifier` 解析为操作者，
//! 再交给工作流引擎执行；引擎错误按类别映射为HTTP状态码。

pub mod auth;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod server;

pub use auth::{StaticTokenVerifier, TokenVerifier};
pub use error::ApiError;
pub use server::{AppState, WebServer};
