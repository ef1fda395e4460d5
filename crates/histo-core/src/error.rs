//! 错误定义模块

use crate::models::UserRole;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 出错的实体类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Patient,
    Report,
    ReferringDoctor,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Patient => write!(f, "patient"),
            EntityKind::Report => write!(f, "report"),
            EntityKind::ReferringDoctor => write!(f, "referring doctor"),
        }
    }
}

/// 病理报告系统统一错误类型
#[derive(Error, Debug)]
pub enum HistoError {
    #[error("资源未找到: {entity} {id}")]
    NotFound { entity: EntityKind, id: String },

    #[error("权限不足: 角色 {role} 无法执行 {action} (需要: {})", format_roles(.required))]
    Forbidden {
        role: UserRole,
        action: String,
        required: Vec<UserRole>,
    },

    #[error("无效状态转换: {entity} {id} 处于 {from}, 无法执行 {transition}")]
    InvalidTransition {
        entity: EntityKind,
        id: String,
        from: String,
        transition: String,
    },

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("并发冲突: {entity} {id}: {message}")]
    Conflict {
        entity: EntityKind,
        id: String,
        message: String,
    },

    #[error("编号分配冲突: {year} 年编号在 {attempts} 次尝试后仍冲突, 请重试")]
    AllocationConflict { year: i32, attempts: u32 },

    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

fn format_roles(roles: &[UserRole]) -> String {
    roles
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl HistoError {
    pub fn not_found(entity: EntityKind, id: impl ToString) -> Self {
        HistoError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(entity: EntityKind, id: impl ToString, message: impl Into<String>) -> Self {
        HistoError::Conflict {
            entity,
            id: id.to_string(),
            message: message.into(),
        }
    }

    /// 仅并发冲突与编号分配冲突允许调用方自动重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HistoError::Conflict { .. } | HistoError::AllocationConflict { .. }
        )
    }

    /// 稳定的错误类别标识，用于API响应
    pub fn kind(&self) -> &'static str {
        match self {
            HistoError::NotFound { .. } => "not_found",
            HistoError::Forbidden { .. } => "forbidden",
            HistoError::InvalidTransition { .. } => "invalid_transition",
            HistoError::Validation(_) => "validation_failure",
            HistoError::Conflict { .. } => "conflict",
            HistoError::AllocationConflict { .. } => "allocation_conflict",
            HistoError::Config(_) => "config",
            HistoError::Database(_) => "database",
            HistoError::Serialization(_) => "serialization",
            HistoError::Io(_) => "io",
            HistoError::Internal(_) => "internal",
        }
    }
}

/// 病理报告系统统一结果类型
pub type Result<T> = std::result::Result<T, HistoError>;
