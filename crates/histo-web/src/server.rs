//! Web服务器

use crate::auth::{auth_middleware, TokenVerifier};
use crate::handlers::*;
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use histo_workflow::LabWorkflowEngine;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

/// 处理器共享状态
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LabWorkflowEngine>,
    pub verifier: Arc<dyn TokenVerifier>,
}

impl AppState {
    pub fn new(engine: Arc<LabWorkflowEngine>, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { engine, verifier }
    }
}

pub struct WebServer {
    addr: SocketAddr,
    app: Router,
}

impl WebServer {
    pub fn new(addr: SocketAddr, state: AppState, request_timeout: Duration) -> Self {
        let app = create_app(state, request_timeout);
        Self { addr, app }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!("Starting web server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start web server: {}", e))?;

        info!("Web server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// 构建完整的路由
pub fn create_app(state: AppState, request_timeout: Duration) -> Router {
    let api = api_routes().route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        // 根路径
        .route("/", get(api_root))
        // 健康检查
        .route("/health", get(health))
        // API路由
        .nest("/api/v1", api)
        .with_state(state)
        // 全局中间件
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_timeout))
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
}

/// API v1 路由
fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/patients", get(list_patients).post(register_patient))
        .route(
            "/patients/referring-doctors",
            get(list_referring_doctors).post(add_referring_doctor),
        )
        .route(
            "/patients/referring-doctors/:id",
            put(update_referring_doctor).delete(remove_referring_doctor),
        )
        .route("/patients/accession/:accession_id", get(get_patient_by_accession))
        .route("/patients/:id", get(get_patient))
        .route("/patients/:id/verify", post(verify_patient))
        .route("/patients/:id/reject", post(reject_patient))
        .route("/reports", get(list_reports).post(create_report))
        .route("/reports/patient/:accession_id", get(list_patient_reports))
        .route("/reports/:id", get(get_report).put(edit_report).delete(discard_report))
        .route("/reports/:id/submit", post(submit_report))
        .route("/reports/:id/approve", post(approve_report))
        .route("/reports/:id/reject", post(reject_report))
        .route("/reports/:id/sign", post(sign_report))
        .route("/reports/:id/publish", post(publish_report))
        .route("/reports/:id/amend", post(amend_report))
        .route("/reports/:id/versions", get(list_versions))
        .route("/reports/:id/chain", get(amendment_chain))
}
