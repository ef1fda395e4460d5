//! 配置管理
//!
//! 提供统一的配置加载与验证。加载顺序: 内置默认值 → 配置文件 → 环境变量，
//! 环境变量以 `HISTO__` 为前缀、`__` 分隔层级，例如 `HISTO__SERVER__PORT=9000`。

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use histo_core::{utils::MAX_ACCESSION_PREFIX_LEN, Actor, UserRole};
use histo_workflow::WorkflowSettings;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use uuid::Uuid;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "HISTO";

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    /// 配置数据
    config: Arc<RwLock<HistoConfig>>,
    /// 配置文件路径
    config_path: Option<String>,
    /// 配置验证器
    validator: ConfigValidator,
}

/// 系统完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoConfig {
    /// 服务器配置
    pub server: ServerConfig,
    /// 数据库配置
    pub database: DatabaseConfig,
    /// 工作流配置
    pub workflow: WorkflowConfig,
    /// 认证配置
    pub auth: AuthConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听主机
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// 请求超时时间 (秒)
    pub request_timeout_secs: u64,
}

/// 存储后端
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseBackend {
    /// 进程内存储，重启后数据丢失
    #[default]
    Memory,
    Postgres,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// 存储后端
    pub backend: DatabaseBackend,
    /// 连接字符串
    pub url: Option<String>,
    /// 最大连接数
    pub max_connections: u32,
    /// 获取连接超时 (秒)
    pub connect_timeout_secs: u64,
    /// 启动时创建表结构
    pub run_migrations: bool,
}

/// 工作流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// 登记编号前缀
    pub accession_prefix: String,
    /// 编号冲突时的最大尝试次数
    pub allocation_retries: u32,
    /// 默认分页大小
    pub default_page_size: usize,
    /// 最大分页大小
    pub max_page_size: usize,
}

/// 认证配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// 静态令牌列表
    pub tokens: Vec<TokenConfig>,
}

/// 静态令牌 → 操作者
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub token: String,
    pub user_id: Uuid,
    pub role: UserRole,
    /// 仅用于日志
    pub name: Option<String>,
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别或过滤表达式，例如 `info,histo_workflow=debug`
    pub level: String,
    /// 输出格式
    pub format: LogFormat,
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    /// 验证规则
    validation_rules: Vec<ValidationRule>,
}

/// 验证规则
#[derive(Debug)]
struct ValidationRule {
    /// 字段路径
    field_path: &'static str,
    /// 验证函数
    validator: fn(&HistoConfig) -> std::result::Result<(), String>,
    /// 错误消息
    error_message: &'static str,
}

impl ConfigManager {
    /// 加载配置，未指定路径时只使用默认值与环境变量
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        Self::load_with_prefix(config_path, ENV_PREFIX)
    }

    fn load_with_prefix(config_path: Option<&str>, env_prefix: &str) -> Result<Self> {
        let config = Self::load_config(config_path, env_prefix)?;
        let validator = ConfigValidator::new();
        validator.validate(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: config_path.map(str::to_string),
            validator,
        })
    }

    /// 直接使用给定配置
    pub fn from_config(config: HistoConfig) -> Result<Self> {
        let validator = ConfigValidator::new();
        validator.validate(&config)?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: None,
            validator,
        })
    }

    /// 逐层合并配置源
    fn load_config(config_path: Option<&str>, env_prefix: &str) -> Result<HistoConfig> {
        let mut builder = Config::builder().add_source(
            Config::try_from(&HistoConfig::default()).context("Failed to build default configuration")?,
        );

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        let config: HistoConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        match config_path {
            Some(path) => info!("Configuration loaded successfully from: {}", path),
            None => info!("Configuration loaded from defaults and environment"),
        }
        Ok(config)
    }

    /// 获取配置
    pub async fn get_config(&self) -> HistoConfig {
        self.config.read().await.clone()
    }

    /// 配置文件路径
    pub fn config_path(&self) -> Option<&str> {
        self.config_path.as_deref()
    }

    /// 重新加载配置，验证失败时保留原配置
    pub async fn reload_config(&self) -> Result<()> {
        let new_config = Self::load_config(self.config_path.as_deref(), ENV_PREFIX)?;
        self.validator.validate(&new_config)?;
        *self.config.write().await = new_config;
        info!("Configuration reloaded");
        Ok(())
    }

    /// 按点分路径读取配置值，例如 `workflow.accession_prefix`
    pub async fn get_value<T>(&self, path: &str) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let config = self.config.read().await;
        let mut current = serde_json::to_value(&*config).context("Failed to serialize config to JSON")?;

        for part in path.split('.') {
            current = match current {
                serde_json::Value::Object(mut map) => map
                    .remove(part)
                    .ok_or_else(|| anyhow::anyhow!("Configuration path not found: {}", path))?,
                _ => return Err(anyhow::anyhow!("Invalid path at segment: {}", part)),
            };
        }

        serde_json::from_value(current).context("Failed to deserialize configuration value")
    }

    /// 应用命令行覆盖项并重新验证，验证失败时保留原配置
    pub async fn apply_overrides(&self, port: Option<u16>, log_level: Option<String>) -> Result<HistoConfig> {
        let mut config = self.config.write().await;
        let mut candidate = config.clone();
        if let Some(port) = port {
            candidate.server.port = port;
        }
        if let Some(level) = log_level {
            candidate.logging.level = level;
        }

        self.validator.validate(&candidate)?;
        *config = candidate.clone();
        Ok(candidate)
    }

    /// 验证配置
    pub async fn validate_config(&self) -> Result<()> {
        let config = self.config.read().await;
        self.validator.validate(&config)
    }
}

impl ConfigValidator {
    /// 创建新的配置验证器
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "server.port",
                validator: |config| {
                    if config.server.port == 0 {
                        Err("Server port cannot be 0".to_string())
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid server port",
            },
            ValidationRule {
                field_path: "database.url",
                validator: |config| match (&config.database.backend, config.database.url.as_deref()) {
                    (DatabaseBackend::Postgres, None) => {
                        Err("Postgres backend requires database.url".to_string())
                    }
                    (DatabaseBackend::Postgres, Some(url)) if url.trim().is_empty() => {
                        Err("Postgres backend requires database.url".to_string())
                    }
                    _ => Ok(()),
                },
                error_message: "Invalid database url",
            },
            ValidationRule {
                field_path: "database.max_connections",
                validator: |config| {
                    if config.database.max_connections == 0 {
                        Err("Database max connections cannot be 0".to_string())
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid database max connections",
            },
            ValidationRule {
                field_path: "workflow.accession_prefix",
                validator: |config| {
                    let prefix = &config.workflow.accession_prefix;
                    if prefix.trim().is_empty() {
                        Err("Accession prefix cannot be empty".to_string())
                    } else if prefix.contains('-') || prefix.chars().any(char::is_whitespace) {
                        Err(format!("Accession prefix '{}' must not contain '-' or spaces", prefix))
                    } else if prefix.chars().count() > MAX_ACCESSION_PREFIX_LEN {
                        Err(format!(
                            "Accession prefix '{}' is longer than {} characters",
                            prefix, MAX_ACCESSION_PREFIX_LEN
                        ))
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid accession prefix",
            },
            ValidationRule {
                field_path: "workflow.allocation_retries",
                validator: |config| {
                    if config.workflow.allocation_retries == 0 {
                        Err("Allocation retries cannot be 0".to_string())
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid allocation retries",
            },
            ValidationRule {
                field_path: "workflow.default_page_size",
                validator: |config| {
                    let workflow = &config.workflow;
                    if workflow.default_page_size == 0 {
                        Err("Default page size cannot be 0".to_string())
                    } else if workflow.max_page_size < workflow.default_page_size {
                        Err(format!(
                            "Max page size {} is smaller than default page size {}",
                            workflow.max_page_size, workflow.default_page_size
                        ))
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid page sizes",
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置
    pub fn validate(&self, config: &HistoConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(anyhow::anyhow!("{}: {}", rule.error_message, e));
            }
        }

        debug!("Configuration validation passed");
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowConfig {
    /// 转换为工作流引擎参数
    pub fn to_settings(&self) -> WorkflowSettings {
        WorkflowSettings {
            accession_prefix: self.accession_prefix.clone(),
            allocation_retries: self.allocation_retries,
            default_page_size: self.default_page_size,
            max_page_size: self.max_page_size,
        }
    }
}

impl TokenConfig {
    pub fn actor(&self) -> Actor {
        Actor::new(self.user_id, self.role)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 30,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::Memory,
            url: None,
            max_connections: 10,
            connect_timeout_secs: 10,
            run_migrations: true,
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        let settings = WorkflowSettings::default();
        Self {
            accession_prefix: settings.accession_prefix,
            allocation_retries: settings.allocation_retries,
            default_page_size: settings.default_page_size,
            max_page_size: settings.max_page_size,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use histo_core::utils::{format_accession_id, MAX_ACCESSION_ID_LEN};
    use std::io::Write;

    fn write_temp(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("histo-config-{}.toml", Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = HistoConfig::default();
        assert!(ConfigValidator::new().validate(&config).is_ok());
        assert_eq!(config.workflow.accession_prefix, "INV");
        assert_eq!(config.database.backend, DatabaseBackend::Memory);
    }

    #[test]
    fn test_validation_rules() {
        let validator = ConfigValidator::new();

        let mut config = HistoConfig::default();
        config.server.port = 0;
        assert!(validator.validate(&config).is_err());

        let mut config = HistoConfig::default();
        config.workflow.accession_prefix = "HP-X".to_string();
        assert!(validator.validate(&config).is_err());

        // 最长前缀生成的编号仍能写入数据库列
        let mut config = HistoConfig::default();
        config.workflow.accession_prefix = "H".repeat(MAX_ACCESSION_PREFIX_LEN);
        assert!(validator.validate(&config).is_ok());
        let longest = format_accession_id(&config.workflow.accession_prefix, 2026, u32::MAX);
        assert!(longest.len() <= MAX_ACCESSION_ID_LEN);
        config.workflow.accession_prefix.push('H');
        assert!(validator.validate(&config).is_err());

        let mut config = HistoConfig::default();
        config.workflow.max_page_size = 10;
        config.workflow.default_page_size = 20;
        assert!(validator.validate(&config).is_err());

        let mut config = HistoConfig::default();
        config.database.backend = DatabaseBackend::Postgres;
        assert!(validator.validate(&config).is_err());
        config.database.url = Some("postgres://localhost/histo".to_string());
        assert!(validator.validate(&config).is_ok());

        let mut config = HistoConfig::default();
        config.workflow.allocation_retries = 0;
        assert!(validator.validate(&config).is_err());
    }

    #[tokio::test]
    async fn test_command_line_overrides_are_validated() {
        let manager = ConfigManager::from_config(HistoConfig::default()).unwrap();
        let default_port = HistoConfig::default().server.port;

        assert!(manager.apply_overrides(Some(0), Some("trace".to_string())).await.is_err());
        let config = manager.get_config().await;
        assert_eq!(config.server.port, default_port);
        assert_ne!(config.logging.level, "trace");

        let config = manager
            .apply_overrides(Some(9100), Some("debug".to_string()))
            .await
            .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(manager.get_config().await.server.port, 9100);

        let config = manager.apply_overrides(None, None).await.unwrap();
        assert_eq!(config.server.port, 9100);
    }

    #[tokio::test]
    async fn test_file_overrides_defaults() {
        let path = write_temp(
            r#"
            [server]
            port = 9100

            [workflow]
            accession_prefix = "HP"

            [[auth.tokens]]
            token = "dr-token"
            user_id = "6f1c2f52-7a43-4d7e-9a5c-0d7e1f6a9b10"
            role = "doctor"
            "#,
        );

        let manager = ConfigManager::load_with_prefix(path.to_str(), "HISTO_TEST_FILE").unwrap();
        let config = manager.get_config().await;
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.workflow.accession_prefix, "HP");
        assert_eq!(config.workflow.allocation_retries, 3);
        assert_eq!(config.auth.tokens.len(), 1);
        assert_eq!(config.auth.tokens[0].actor().role, UserRole::Doctor);

        let prefix: String = manager.get_value("workflow.accession_prefix").await.unwrap();
        assert_eq!(prefix, "HP");
        assert!(manager.get_value::<String>("workflow.missing").await.is_err());

        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_environment_overrides_file() {
        let path = write_temp("[server]\nport = 9100\n");
        std::env::set_var("HISTO_TEST_ENV__SERVER__PORT", "9200");
        std::env::set_var("HISTO_TEST_ENV__DATABASE__BACKEND", "postgres");
        std::env::set_var("HISTO_TEST_ENV__DATABASE__URL", "postgres://histo@localhost/histo");

        let manager = ConfigManager::load_with_prefix(path.to_str(), "HISTO_TEST_ENV").unwrap();
        let config = manager.get_config().await;
        assert_eq!(config.server.port, 9200);
        assert_eq!(config.database.backend, DatabaseBackend::Postgres);

        std::env::remove_var("HISTO_TEST_ENV__SERVER__PORT");
        std::env::remove_var("HISTO_TEST_ENV__DATABASE__BACKEND");
        std::env::remove_var("HISTO_TEST_ENV__DATABASE__URL");
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let path = write_temp("[workflow]\ndefault_page_size = 0\n");
        assert!(ConfigManager::load_with_prefix(path.to_str(), "HISTO_TEST_INVALID").is_err());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_workflow_settings_conversion() {
        let config = WorkflowConfig {
            accession_prefix: "CY".to_string(),
            allocation_retries: 5,
            default_page_size: 25,
            max_page_size: 75,
        };
        let settings = config.to_settings();
        assert_eq!(settings.accession_prefix, "CY");
        assert_eq!(settings.allocation_retries, 5);
        assert_eq!(settings.max_page_size, 75);
    }
}
