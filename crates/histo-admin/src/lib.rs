//! # 病理报告系统管理模块
//!
//! 提供配置管理 (默认值 → 配置文件 → 环境变量，逐层覆盖) 与日志初始化。

pub mod config;
pub mod logging;

pub use config::{
    AuthConfig, ConfigManager, ConfigValidator, DatabaseBackend, DatabaseConfig, HistoConfig,
    LogFormat, LoggingConfig, ServerConfig, TokenConfig, WorkflowConfig,
};
pub use logging::init_logging;
