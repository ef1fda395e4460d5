//! # 病理报告数据库模块
//!
//! 基于PostgreSQL的工作流持久化实现：患者、报告、审计版本与年度编号计数器。
//! 所有比对写入 (核对、状态转换、修订) 都在单个事务内完成。

pub mod connection;
pub mod models;
pub mod queries;
pub mod store;

// 重新导出主要类型
pub use connection::DatabasePool;
pub use models::*;
pub use queries::DatabaseQueries;
pub use store::PgWorkflowStore;
