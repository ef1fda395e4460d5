//! 工作流引擎
//!
//! 组合编号分配、患者核对、报告工作流、审计账本与修订链，提供统一的操作入口。
//! 每个操作都显式接收操作者，不依赖任何请求上下文。

use crate::{
    accession::{IdentifierAllocator, DEFAULT_PREFIX},
    amendment::AmendmentChainManager,
    directory::ReferringDoctorDirectory,
    ledger::VersionLedger,
    patient::PatientVerificationEngine,
    report::ReportWorkflowEngine,
    store::WorkflowStore,
};
use histo_core::{
    Actor, ContentPatch, Demographics, NewReferringDoctor, Patient, PatientFilter, ReferringDoctor,
    ReferringDoctorFilter, ReferringDoctorPatch, Report, ReportContent, ReportFilter,
    ReportVersion, Result,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// 工作流参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// 登记编号前缀
    pub accession_prefix: String,
    /// 编号冲突时的最大尝试次数
    pub allocation_retries: u32,
    /// 默认分页大小
    pub default_page_size: usize,
    /// 最大分页大小
    pub max_page_size: usize,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            accession_prefix: DEFAULT_PREFIX.to_string(),
            allocation_retries: 3,
            default_page_size: 50,
            max_page_size: 200,
        }
    }
}

impl WorkflowSettings {
    /// 规范化分页参数，返回 (offset, limit)
    pub fn page(&self, offset: Option<usize>, limit: Option<usize>) -> (usize, usize) {
        let limit = limit
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size.max(1));
        (offset.unwrap_or(0), limit)
    }
}

/// 病理报告工作流引擎
#[derive(Debug, Clone)]
pub struct LabWorkflowEngine {
    settings: WorkflowSettings,
    allocator: IdentifierAllocator,
    directory: ReferringDoctorDirectory,
    patients: PatientVerificationEngine,
    reports: ReportWorkflowEngine,
    amendments: AmendmentChainManager,
}

impl LabWorkflowEngine {
    /// 创建新的工作流引擎
    pub fn new(store: Arc<dyn WorkflowStore>, settings: WorkflowSettings) -> Self {
        let allocator = IdentifierAllocator::new(store.clone(), settings.accession_prefix.clone());
        let directory = ReferringDoctorDirectory::new(store.clone());
        let patients =
            PatientVerificationEngine::new(store.clone(), allocator.clone(), settings.allocation_retries);
        let ledger = VersionLedger::new(store.clone());
        let reports = ReportWorkflowEngine::new(store.clone(), patients.clone(), ledger);
        let amendments = AmendmentChainManager::new(store, reports.clone());

        tracing::info!(
            "Workflow engine ready (accession prefix {})",
            settings.accession_prefix
        );

        Self {
            settings,
            allocator,
            directory,
            patients,
            reports,
            amendments,
        }
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    pub fn directory(&self) -> &ReferringDoctorDirectory {
        &self.directory
    }

    pub fn patients(&self) -> &PatientVerificationEngine {
        &self.patients
    }

    pub fn reports(&self) -> &ReportWorkflowEngine {
        &self.reports
    }

    pub fn amendments(&self) -> &AmendmentChainManager {
        &self.amendments
    }

    // ========== 登记编号 ==========

    /// 分配登记编号
    pub async fn allocate_accession_id(&self, year: i32) -> Result<String> {
        self.allocator.allocate(year).await
    }

    // ========== 患者 ==========

    pub async fn register_patient(&self, actor: &Actor, demographics: Demographics) -> Result<Patient> {
        self.patients.register(actor, demographics).await
    }

    pub async fn get_patient(&self, id: Uuid) -> Result<Patient> {
        self.patients.get(id).await
    }

    pub async fn get_patient_by_accession(&self, accession_id: &str) -> Result<Patient> {
        self.patients.get_by_accession(accession_id).await
    }

    pub async fn list_patients(&self, filter: &PatientFilter) -> Result<Vec<Patient>> {
        let mut filter = filter.clone();
        let (offset, limit) = self.settings.page(filter.offset, filter.limit);
        filter.offset = Some(offset);
        filter.limit = Some(limit);
        self.patients.list(&filter).await
    }

    pub async fn verify_patient(&self, id: Uuid, actor: &Actor, notes: Option<String>) -> Result<Patient> {
        self.patients.verify(id, actor, notes).await
    }

    pub async fn reject_patient(&self, id: Uuid, actor: &Actor, reason: &str) -> Result<Patient> {
        self.patients.reject(id, actor, reason).await
    }

    // ========== 送检医生 ==========

    pub async fn add_referring_doctor(&self, actor: &Actor, input: NewReferringDoctor) -> Result<ReferringDoctor> {
        self.directory.create(actor, input).await
    }

    pub async fn list_referring_doctors(&self, filter: &ReferringDoctorFilter) -> Result<Vec<ReferringDoctor>> {
        self.directory.list(filter).await
    }

    pub async fn update_referring_doctor(
        &self,
        id: Uuid,
        actor: &Actor,
        patch: &ReferringDoctorPatch,
    ) -> Result<ReferringDoctor> {
        self.directory.update(id, actor, patch).await
    }

    pub async fn deactivate_referring_doctor(&self, id: Uuid, actor: &Actor) -> Result<ReferringDoctor> {
        self.directory.deactivate(id, actor).await
    }

    // ========== 报告 ==========

    pub async fn create_report(&self, actor: &Actor, accession_id: &str, content: ReportContent) -> Result<Report> {
        self.reports.create(actor, accession_id, content).await
    }

    pub async fn get_report(&self, id: Uuid) -> Result<Report> {
        self.reports.get(id).await
    }

    pub async fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<Report>> {
        let mut filter = filter.clone();
        let (offset, limit) = self.settings.page(filter.offset, filter.limit);
        filter.offset = Some(offset);
        filter.limit = Some(limit);
        self.reports.list(&filter).await
    }

    pub async fn list_patient_reports(&self, accession_id: &str) -> Result<Vec<Report>> {
        self.reports.list_for_patient(accession_id).await
    }

    pub async fn edit_report(
        &self,
        id: Uuid,
        actor: &Actor,
        patch: &ContentPatch,
        reason: Option<String>,
    ) -> Result<Report> {
        self.reports.edit(id, actor, patch, reason).await
    }

    pub async fn discard_report(&self, id: Uuid, actor: &Actor) -> Result<()> {
        self.reports.discard(id, actor).await
    }

    pub async fn submit_report(&self, id: Uuid, actor: &Actor) -> Result<Report> {
        self.reports.submit(id, actor).await
    }

    pub async fn approve_report(&self, id: Uuid, actor: &Actor) -> Result<Report> {
        self.reports.approve(id, actor).await
    }

    pub async fn reject_report(&self, id: Uuid, actor: &Actor, reason: &str) -> Result<Report> {
        self.reports.reject(id, actor, reason).await
    }

    pub async fn sign_report(&self, id: Uuid, actor: &Actor) -> Result<Report> {
        self.reports.sign(id, actor).await
    }

    pub async fn publish_report(&self, id: Uuid, actor: &Actor) -> Result<Report> {
        self.reports.publish(id, actor).await
    }

    // ========== 修订与审计 ==========

    pub async fn amend_report(&self, id: Uuid, actor: &Actor, reason: &str) -> Result<Report> {
        self.amendments.amend(id, actor, reason).await
    }

    pub async fn amendment_chain(&self, id: Uuid) -> Result<Vec<Report>> {
        self.amendments.chain(id).await
    }

    pub async fn list_versions(&self, id: Uuid) -> Result<Vec<ReportVersion>> {
        self.reports.versions(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_clamping() {
        let settings = WorkflowSettings {
            default_page_size: 20,
            max_page_size: 100,
            ..Default::default()
        };
        assert_eq!(settings.page(None, None), (0, 20));
        assert_eq!(settings.page(Some(40), Some(500)), (40, 100));
        assert_eq!(settings.page(None, Some(0)), (0, 1));
    }
}
