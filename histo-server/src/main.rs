//! 病理报告服务器主程序

use anyhow::Context;
use clap::Parser;
use histo_admin::{init_logging, ConfigManager, DatabaseBackend, HistoConfig};
use histo_database::PgWorkflowStore;
use histo_web::{AppState, StaticTokenVerifier, WebServer};
use histo_workflow::{LabWorkflowEngine, MemoryStore, WorkflowStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// 服务器命令行参数
#[derive(Parser, Debug)]
#[command(name = "histo-server")]
#[command(about = "组织病理实验室患者登记与报告服务器")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 服务器端口，覆盖配置文件
    #[arg(short, long)]
    port: Option<u16>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let manager = ConfigManager::load(args.config.as_deref())?;
    let config = manager.apply_overrides(args.port, args.log_level).await?;

    init_logging(&config.logging)?;

    info!("启动病理报告服务器...");
    info!("  监听地址: {}:{}", config.server.host, config.server.port);
    info!("  存储后端: {:?}", config.database.backend);
    info!("  登记编号前缀: {}", config.workflow.accession_prefix);

    if let Err(e) = run(config).await {
        error!("服务器启动失败: {:#}", e);
        return Err(e);
    }

    Ok(())
}

async fn run(config: HistoConfig) -> anyhow::Result<()> {
    let store: Arc<dyn WorkflowStore> = match config.database.backend {
        DatabaseBackend::Memory => {
            warn!("Using in-memory store; data is lost on restart");
            Arc::new(MemoryStore::new())
        }
        DatabaseBackend::Postgres => {
            let url = config
                .database
                .url
                .as_deref()
                .context("database.url is required for the postgres backend")?;
            let store = PgWorkflowStore::connect(
                url,
                config.database.max_connections,
                Duration::from_secs(config.database.connect_timeout_secs),
                config.database.run_migrations,
            )
            .await?;
            Arc::new(store)
        }
    };

    let engine = LabWorkflowEngine::new(store, config.workflow.to_settings());

    let verifier = StaticTokenVerifier::new(config.auth.tokens.iter().map(|t| {
        info!(
            "Registered token for {} ({})",
            t.name.as_deref().unwrap_or("unnamed"),
            t.role
        );
        (t.token.clone(), t.actor())
    }));
    if verifier.is_empty() {
        warn!("No auth tokens configured; every API request will be rejected");
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, config.server.port))?;

    let state = AppState::new(Arc::new(engine), Arc::new(verifier));
    let server = WebServer::new(addr, state, Duration::from_secs(config.server.request_timeout_secs));
    server.run().await
}
