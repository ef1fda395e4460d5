//! 报告工作流引擎
//!
//! 草稿 → 待审核 → 已审核 → 已签署 → 已发布，不允许跳过任何步骤。
//! 审核退回回到草稿，可继续编辑后重新提交。
//! 每次成功的转换或内容编辑都会在同一原子单元内追加一条审计记录。

use crate::ledger::VersionLedger;
use crate::patient::PatientVerificationEngine;
use crate::state_machine::{ReportEvent, ReportStateMachine};
use crate::store::{ReportCommit, WorkflowStore};
use chrono::Utc;
use histo_core::{
    utils::is_blank, Actor, Capability, ContentPatch, EntityKind, HistoError, Report,
    ReportContent, ReportFilter, ReportStatus, ReportVersion, Result,
};
use std::sync::Arc;
use uuid::Uuid;

/// 报告工作流引擎
#[derive(Clone)]
pub struct ReportWorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    patients: PatientVerificationEngine,
    ledger: VersionLedger,
    state_machine: Arc<ReportStateMachine>,
}

impl ReportWorkflowEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        patients: PatientVerificationEngine,
        ledger: VersionLedger,
    ) -> Self {
        Self {
            store,
            patients,
            ledger,
            state_machine: Arc::new(ReportStateMachine::new()),
        }
    }

    pub fn state_machine(&self) -> &ReportStateMachine {
        &self.state_machine
    }

    // ========== 创建与查询 ==========

    /// 为已核对的患者创建报告草稿
    pub async fn create(&self, actor: &Actor, accession_id: &str, content: ReportContent) -> Result<Report> {
        actor.require(Capability::Creator, "create report")?;
        let patient = self.patients.require_verified(accession_id).await?;

        let now = Utc::now();
        let report = Report {
            id: Uuid::new_v4(),
            accession_id: patient.accession_id,
            content,
            status: ReportStatus::Draft,
            created_by: actor.user_id,
            created_at: now,
            updated_at: now,
            verified_by: None,
            verified_at: None,
            signed_by: None,
            signed_at: None,
            published_at: None,
            is_amended: false,
            amendment_reason: None,
            original_report_id: None,
            revision: 0,
        };

        self.store.insert_report(&report).await?;
        tracing::info!(
            "Created report {} for {} by {}",
            report.id,
            report.accession_id,
            actor.user_id
        );
        Ok(report)
    }

    pub async fn get(&self, id: Uuid) -> Result<Report> {
        self.store
            .get_report(id)
            .await?
            .ok_or_else(|| HistoError::not_found(EntityKind::Report, id))
    }

    pub async fn list(&self, filter: &ReportFilter) -> Result<Vec<Report>> {
        self.store.list_reports(filter).await
    }

    /// 患者的所有报告，包括修订报告
    pub async fn list_for_patient(&self, accession_id: &str) -> Result<Vec<Report>> {
        let filter = ReportFilter {
            accession_id: Some(accession_id.to_string()),
            offset: Some(0),
            limit: Some(usize::MAX),
            ..Default::default()
        };
        let mut reports = self.store.list_reports(&filter).await?;
        reports.retain(|r| r.accession_id == accession_id);
        Ok(reports)
    }

    /// 报告的审计历史
    pub async fn versions(&self, id: Uuid) -> Result<Vec<ReportVersion>> {
        self.get(id).await?;
        self.ledger.list_versions(id).await
    }

    // ========== 内容编辑 ==========

    /// 编辑内容，仅限草稿与待审核状态
    pub async fn edit(
        &self,
        id: Uuid,
        actor: &Actor,
        patch: &ContentPatch,
        reason: Option<String>,
    ) -> Result<Report> {
        let current = self.get(id).await?;
        actor.require(Capability::Editor, "edit report")?;
        self.state_machine.check_editable(id, current.status)?;
        if patch.is_empty() {
            return Err(HistoError::Validation("no content fields to update".to_string()));
        }

        let now = Utc::now();
        let mut updated = current.clone();
        patch.apply_to(&mut updated.content);
        updated.updated_at = now;
        updated.revision += 1;

        let reason = normalize(reason).or_else(|| Some("Content edited".to_string()));
        let version = self.ledger.entry_for(&updated, actor, reason, now);
        self.commit(&current, updated, version, "edit").await
    }

    /// 丢弃从未提交、从未编辑的草稿
    pub async fn discard(&self, id: Uuid, actor: &Actor) -> Result<()> {
        let current = self.get(id).await?;
        actor.require(Capability::Creator, "discard report")?;
        if current.status != ReportStatus::Draft || current.revision > 0 {
            return Err(HistoError::InvalidTransition {
                entity: EntityKind::Report,
                id: id.to_string(),
                from: format!("{} (revision {})", current.status, current.revision),
                transition: "discard".to_string(),
            });
        }

        if !self.store.delete_draft(id).await? {
            return Err(self.lost_race(id, "discard").await);
        }
        tracing::info!("Discarded draft report {} by {}", id, actor.user_id);
        Ok(())
    }

    // ========== 状态转换 ==========

    /// 提交审核
    pub async fn submit(&self, id: Uuid, actor: &Actor) -> Result<Report> {
        self.transition(id, actor, ReportEvent::Submit, None).await
    }

    /// 审核通过
    pub async fn approve(&self, id: Uuid, actor: &Actor) -> Result<Report> {
        self.transition(id, actor, ReportEvent::Approve, None).await
    }

    /// 审核退回到草稿，必须填写原因
    pub async fn reject(&self, id: Uuid, actor: &Actor, reason: &str) -> Result<Report> {
        self.transition(id, actor, ReportEvent::Reject, Some(reason.to_string()))
            .await
    }

    /// 签署
    pub async fn sign(&self, id: Uuid, actor: &Actor) -> Result<Report> {
        self.transition(id, actor, ReportEvent::Sign, None).await
    }

    /// 发布
    pub async fn publish(&self, id: Uuid, actor: &Actor) -> Result<Report> {
        self.transition(id, actor, ReportEvent::Publish, None).await
    }

    async fn transition(
        &self,
        id: Uuid,
        actor: &Actor,
        event: ReportEvent,
        reason: Option<String>,
    ) -> Result<Report> {
        if event == ReportEvent::Amend {
            return Err(HistoError::Internal(
                "amendments are created by the amendment chain manager".to_string(),
            ));
        }

        // 守卫顺序: 存在 → 角色 → 状态 → 参数
        let current = self.get(id).await?;
        actor.require(event.capability(), event.as_str())?;
        let next = self.state_machine.transition(id, current.status, event)?;

        let reason = normalize(reason);
        if event.requires_reason() && reason.is_none() {
            return Err(HistoError::Validation(format!("{} requires a reason", event)));
        }
        if event == ReportEvent::Submit {
            check_submittable(&current.content)?;
        }

        let now = Utc::now();
        let mut updated = current.clone();
        updated.status = next;
        updated.updated_at = now;
        updated.revision += 1;
        match event {
            ReportEvent::Approve => {
                updated.verified_by = Some(actor.user_id);
                updated.verified_at = Some(now);
            }
            ReportEvent::Sign => {
                updated.signed_by = Some(actor.user_id);
                updated.signed_at = Some(now);
            }
            ReportEvent::Publish => {
                updated.published_at = Some(now);
            }
            ReportEvent::Reject => {
                // 退回原因写在备注最前面，作者编辑草稿时可见
                if let Some(reason) = reason.as_deref() {
                    updated.content.comments =
                        Some(rejection_note(reason, updated.content.comments.as_deref()));
                }
            }
            ReportEvent::Submit | ReportEvent::Amend => {}
        }

        let reason = reason.or_else(|| default_reason(event).map(str::to_string));
        let version = self.ledger.entry_for(&updated, actor, reason, now);
        let report = self.commit(&current, updated, version, event.as_str()).await?;

        tracing::info!(
            "Report {} {} -> {} ({}) by {}",
            report.id,
            current.status,
            report.status,
            event,
            actor.user_id
        );
        Ok(report)
    }

    async fn commit(
        &self,
        current: &Report,
        updated: Report,
        version: ReportVersion,
        action: &str,
    ) -> Result<Report> {
        let commit = ReportCommit {
            report: updated,
            expected_status: current.status,
            expected_revision: current.revision,
            version,
        };

        if !self.store.commit_report(&commit).await? {
            return Err(self.lost_race(current.id, action).await);
        }
        Ok(commit.report)
    }

    /// 并发中落败时，告知报告已被谁推进到什么状态
    pub(crate) async fn lost_race(&self, id: Uuid, action: &str) -> HistoError {
        let message = match self.store.get_report(id).await {
            Ok(Some(report)) => {
                let by = match report.status {
                    ReportStatus::Verified => report.verified_by,
                    ReportStatus::Signed | ReportStatus::Published => report.signed_by,
                    _ => None,
                };
                match by {
                    Some(user) => format!(
                        "cannot {}: report already {} by {} (revision {})",
                        action, report.status, user, report.revision
                    ),
                    None => format!(
                        "cannot {}: report is now {} (revision {})",
                        action, report.status, report.revision
                    ),
                }
            }
            _ => format!("cannot {}: report changed concurrently", action),
        };
        tracing::warn!("Report {} {}", id, message);
        HistoError::conflict(EntityKind::Report, id, message)
    }
}

impl std::fmt::Debug for ReportWorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportWorkflowEngine")
            .field("state_machine", &self.state_machine)
            .finish_non_exhaustive()
    }
}

fn normalize(reason: Option<String>) -> Option<String> {
    reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
}

fn default_reason(event: ReportEvent) -> Option<&'static str> {
    match event {
        ReportEvent::Submit => Some("Submitted for verification"),
        ReportEvent::Approve => Some("Verified"),
        ReportEvent::Sign => Some("Signed"),
        ReportEvent::Publish => Some("Published"),
        ReportEvent::Reject | ReportEvent::Amend => None,
    }
}

fn rejection_note(reason: &str, comments: Option<&str>) -> String {
    match comments.map(str::trim).filter(|c| !c.is_empty()) {
        Some(existing) => format!("[REJECTED] {}\n\n{}", reason, existing),
        None => format!("[REJECTED] {}", reason),
    }
}

/// 提交前标本与诊断必须填写
fn check_submittable(content: &ReportContent) -> Result<()> {
    let mut missing = Vec::new();
    if is_blank(content.specimen.as_deref()) {
        missing.push("specimen");
    }
    if is_blank(content.diagnosis.as_deref()) {
        missing.push("diagnosis");
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(HistoError::Validation(format!(
            "{} required to submit",
            missing.join(" and ")
        )))
    }
}
