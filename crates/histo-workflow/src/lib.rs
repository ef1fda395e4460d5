//! # 病理报告工作流模块
//!
//! 提供报告从创建到具有法律效力的发布全过程管理，包括：
//! - 状态机：患者核对与报告审批的状态转换表
//! - 登记编号分配：按年度生成唯一的登记编号
//! - 患者核对引擎：待核对 → 已核对 / 已驳回
//! - 报告工作流引擎：草稿 → 待审核 → 已审核 → 已签署 → 已发布
//! - 审计版本账本：每次变更追加一条不可修改的快照
//! - 修订链管理：基于已发布报告创建新的修订报告
//! - 送检医生目录：登记时选用，删除即停用

pub mod accession;
pub mod amendment;
pub mod directory;
pub mod engine;
pub mod ledger;
pub mod patient;
pub mod report;
pub mod state_machine;
pub mod store;

// 重新导出主要类型
pub use accession::IdentifierAllocator;
pub use amendment::AmendmentChainManager;
pub use directory::ReferringDoctorDirectory;
pub use engine::{LabWorkflowEngine, WorkflowSettings};
pub use ledger::VersionLedger;
pub use patient::PatientVerificationEngine;
pub use report::ReportWorkflowEngine;
pub use state_machine::{PatientEvent, PatientStateMachine, ReportEvent, ReportStateMachine};
pub use store::{MemoryStore, ReportCommit, WorkflowStore};
