//! 状态机
//!
//! 报告与患者记录的状态转换表。两类实体的驳回语义不同：
//! 报告被退回后回到草稿继续编辑，患者驳回则是终态。

use histo_core::{Capability, EntityKind, HistoError, ReportStatus, Result, VerificationStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 报告状态转换事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReportEvent {
    Submit,  // 提交审核
    Approve, // 审核通过
    Reject,  // 审核退回
    Sign,    // 签署
    Publish, // 发布
    Amend,   // 修订
}

impl ReportEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportEvent::Submit => "submit",
            ReportEvent::Approve => "approve",
            ReportEvent::Reject => "reject",
            ReportEvent::Sign => "sign",
            ReportEvent::Publish => "publish",
            ReportEvent::Amend => "amend",
        }
    }

    /// 执行该转换所需的能力
    pub fn capability(&self) -> Capability {
        match self {
            ReportEvent::Submit => Capability::Creator,
            ReportEvent::Approve | ReportEvent::Reject => Capability::Verifier,
            ReportEvent::Sign | ReportEvent::Publish | ReportEvent::Amend => Capability::Signer,
        }
    }

    /// 是否必须附带原因
    pub fn requires_reason(&self) -> bool {
        matches!(self, ReportEvent::Reject | ReportEvent::Amend)
    }
}

impl fmt::Display for ReportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 报告状态机
#[derive(Debug)]
pub struct ReportStateMachine {
    transitions: HashMap<(ReportStatus, ReportEvent), ReportStatus>,
}

impl ReportStateMachine {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        let mut transitions = HashMap::new();

        transitions.insert((ReportStatus::Draft, ReportEvent::Submit), ReportStatus::PendingVerification);
        transitions.insert((ReportStatus::PendingVerification, ReportEvent::Approve), ReportStatus::Verified);
        transitions.insert((ReportStatus::PendingVerification, ReportEvent::Reject), ReportStatus::Draft);
        transitions.insert((ReportStatus::Verified, ReportEvent::Sign), ReportStatus::Signed);
        transitions.insert((ReportStatus::Signed, ReportEvent::Publish), ReportStatus::Published);
        // 修订不改变源报告，目标状态是新修订报告的初始状态
        transitions.insert((ReportStatus::Published, ReportEvent::Amend), ReportStatus::Draft);

        Self { transitions }
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: ReportStatus, event: ReportEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    /// 执行状态转换
    pub fn transition(&self, id: impl ToString, from: ReportStatus, event: ReportEvent) -> Result<ReportStatus> {
        self.transitions
            .get(&(from, event))
            .copied()
            .ok_or_else(|| HistoError::InvalidTransition {
                entity: EntityKind::Report,
                id: id.to_string(),
                from: from.to_string(),
                transition: event.to_string(),
            })
    }

    /// 内容编辑守卫
    pub fn check_editable(&self, id: impl ToString, status: ReportStatus) -> Result<()> {
        if status.is_editable() {
            Ok(())
        } else {
            Err(HistoError::InvalidTransition {
                entity: EntityKind::Report,
                id: id.to_string(),
                from: status.to_string(),
                transition: "edit".to_string(),
            })
        }
    }

    /// 获取状态的所有可能事件
    pub fn get_possible_events(&self, current: ReportStatus) -> Vec<ReportEvent> {
        let mut events: Vec<ReportEvent> = self
            .transitions
            .keys()
            .filter(|(state, _)| *state == current)
            .map(|(_, event)| *event)
            .collect();
        events.sort_by_key(|e| e.as_str());
        events
    }
}

impl Default for ReportStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// 患者核对事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PatientEvent {
    Verify,
    Reject,
}

impl fmt::Display for PatientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatientEvent::Verify => write!(f, "verify"),
            PatientEvent::Reject => write!(f, "reject"),
        }
    }
}

/// 患者核对状态机，已核对与已驳回均为终态
#[derive(Debug)]
pub struct PatientStateMachine {
    transitions: HashMap<(VerificationStatus, PatientEvent), VerificationStatus>,
}

impl PatientStateMachine {
    pub fn new() -> Self {
        let mut transitions = HashMap::new();
        transitions.insert((VerificationStatus::Pending, PatientEvent::Verify), VerificationStatus::Verified);
        transitions.insert((VerificationStatus::Pending, PatientEvent::Reject), VerificationStatus::Rejected);
        Self { transitions }
    }

    pub fn can_transition(&self, from: VerificationStatus, event: PatientEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    pub fn transition(
        &self,
        id: impl ToString,
        from: VerificationStatus,
        event: PatientEvent,
    ) -> Result<VerificationStatus> {
        self.transitions
            .get(&(from, event))
            .copied()
            .ok_or_else(|| HistoError::InvalidTransition {
                entity: EntityKind::Patient,
                id: id.to_string(),
                from: from.to_string(),
                transition: event.to_string(),
            })
    }
}

impl Default for PatientStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
