//! 持久化接口
//!
//! 患者、报告、审计版本三张独立的表，按ID引用，不嵌套对象。
//! 每次报告变更与其审计记录在同一个原子单元内提交：
//! 提交时比对期望的状态与版本号，不一致即视为并发冲突，不写入任何数据。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use histo_core::{
    EntityKind, HistoError, Patient, PatientFilter, ReferringDoctor, ReferringDoctorFilter,
    ReferringDoctorPatch, Report, ReportFilter, ReportStatus, ReportVersion, Result,
    VerificationStatus,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// 一次报告变更：更新后的报告 + 对应的审计记录
#[derive(Debug, Clone)]
pub struct ReportCommit {
    pub report: Report,
    pub expected_status: ReportStatus,
    pub expected_revision: u32,
    pub version: ReportVersion,
}

impl ReportCommit {
    /// 提交前的自检：版本号必须紧接在期望版本之后
    pub fn check(&self) -> Result<()> {
        let next = self.expected_revision + 1;
        if self.version.version_number != next
            || self.report.revision != next
            || self.version.report_id != self.report.id
        {
            return Err(HistoError::Internal(format!(
                "malformed commit for report {}: expected version {}, got {} (revision {})",
                self.report.id, next, self.version.version_number, self.report.revision
            )));
        }
        Ok(())
    }
}

/// 工作流持久化接口
///
/// 返回 `Ok(false)` 表示比对失败 (被其他请求抢先)，调用方负责重新读取并给出说明。
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    // ========== 登记编号 ==========

    /// 原子递增并读取某年度的计数器
    async fn next_accession_sequence(&self, year: i32) -> Result<u32>;

    // ========== 患者 ==========

    /// 插入患者；登记编号重复时返回 AllocationConflict
    async fn insert_patient(&self, patient: &Patient) -> Result<()>;

    async fn get_patient(&self, id: Uuid) -> Result<Option<Patient>>;

    async fn get_patient_by_accession(&self, accession_id: &str) -> Result<Option<Patient>>;

    async fn list_patients(&self, filter: &PatientFilter) -> Result<Vec<Patient>>;

    /// 仅当当前核对状态等于 `expected` 时写入
    async fn update_patient(&self, patient: &Patient, expected: VerificationStatus) -> Result<bool>;

    // ========== 送检医生 ==========

    async fn insert_referring_doctor(&self, doctor: &ReferringDoctor) -> Result<()>;

    async fn get_referring_doctor(&self, id: Uuid) -> Result<Option<ReferringDoctor>>;

    /// 按姓名排序
    async fn list_referring_doctors(&self, filter: &ReferringDoctorFilter) -> Result<Vec<ReferringDoctor>>;

    /// 在同一原子单元内读取、应用补丁并写回；条目不存在时返回 NotFound
    async fn update_referring_doctor(
        &self,
        id: Uuid,
        patch: &ReferringDoctorPatch,
        at: DateTime<Utc>,
    ) -> Result<ReferringDoctor>;

    // ========== 报告 ==========

    /// 插入新报告；同一登记编号只允许一份非修订报告
    async fn insert_report(&self, report: &Report) -> Result<()>;

    /// 插入修订报告；源报告必须仍为已发布且尚无后继
    async fn insert_amendment(&self, successor: &Report) -> Result<bool>;

    async fn get_report(&self, id: Uuid) -> Result<Option<Report>>;

    async fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<Report>>;

    /// 修订后继 (original_report_id 指向该报告的记录)
    async fn find_successor(&self, report_id: Uuid) -> Result<Option<Report>>;

    /// 原子地应用报告变更并追加审计记录
    async fn commit_report(&self, commit: &ReportCommit) -> Result<bool>;

    /// 删除从未产生审计记录的草稿
    async fn delete_draft(&self, report_id: Uuid) -> Result<bool>;

    // ========== 审计版本 ==========

    /// 按版本号升序返回完整历史
    async fn list_versions(&self, report_id: Uuid) -> Result<Vec<ReportVersion>>;
}

/// 分页
pub(crate) fn paginate<T>(items: Vec<T>, offset: Option<usize>, limit: Option<usize>) -> Vec<T> {
    let offset = offset.unwrap_or(0);
    let limit = limit.unwrap_or(50);
    items.into_iter().skip(offset).take(limit).collect()
}

/// 报告槽位，互斥锁保护单个报告的状态与历史
#[derive(Debug)]
struct ReportSlot {
    report: Report,
    versions: Vec<ReportVersion>,
    successor: Option<Uuid>,
}

/// 报告单元，登记编号和修订标记不可变，可在锁外读取
///
/// `deleted` 只在持有槽位锁时置位，置位即完成丢弃；
/// 之后从报告表摘除、释放源报告只是清理，中途取消不影响可见状态。
#[derive(Debug)]
struct ReportCell {
    accession_id: String,
    is_amendment: bool,
    deleted: AtomicBool,
    slot: Mutex<ReportSlot>,
}

impl ReportCell {
    fn new(report: &Report) -> Self {
        Self {
            accession_id: report.accession_id.clone(),
            is_amendment: report.original_report_id.is_some(),
            deleted: AtomicBool::new(false),
            slot: Mutex::new(ReportSlot {
                report: report.clone(),
                versions: Vec::new(),
                successor: None,
            }),
        }
    }

    fn is_live(&self) -> bool {
        !self.deleted.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct PatientTable {
    by_id: HashMap<Uuid, Arc<Mutex<Patient>>>,
    by_accession: HashMap<String, Uuid>,
}

/// 内存存储
///
/// 每个实体一把锁，不同实体之间的写入互不阻塞；
/// 登记编号计数器使用独立的锁，不与报告转换共享。
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: Mutex<HashMap<i32, u32>>,
    patients: RwLock<PatientTable>,
    referring_doctors: RwLock<HashMap<Uuid, ReferringDoctor>>,
    reports: RwLock<HashMap<Uuid, Arc<ReportCell>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn patient_cell(&self, id: Uuid) -> Option<Arc<Mutex<Patient>>> {
        self.patients.read().await.by_id.get(&id).cloned()
    }

    async fn report_cell(&self, id: Uuid) -> Option<Arc<ReportCell>> {
        self.reports.read().await.get(&id).cloned()
    }

    async fn all_report_cells(&self) -> Vec<Arc<ReportCell>> {
        self.reports.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn next_accession_sequence(&self, year: i32) -> Result<u32> {
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(year).or_insert(0);
        *counter = counter
            .checked_add(1)
            .ok_or(HistoError::AllocationConflict { year, attempts: 1 })?;
        Ok(*counter)
    }

    async fn insert_patient(&self, patient: &Patient) -> Result<()> {
        let mut table = self.patients.write().await;
        if table.by_accession.contains_key(&patient.accession_id) {
            let year = histo_core::utils::parse_accession_id(&patient.accession_id)
                .map(|(_, year, _)| year)
                .unwrap_or_default();
            return Err(HistoError::AllocationConflict { year, attempts: 1 });
        }
        table.by_accession.insert(patient.accession_id.clone(), patient.id);
        table.by_id.insert(patient.id, Arc::new(Mutex::new(patient.clone())));
        tracing::debug!("Stored patient {} ({})", patient.id, patient.accession_id);
        Ok(())
    }

    async fn get_patient(&self, id: Uuid) -> Result<Option<Patient>> {
        match self.patient_cell(id).await {
            Some(cell) => Ok(Some(cell.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn get_patient_by_accession(&self, accession_id: &str) -> Result<Option<Patient>> {
        let id = self.patients.read().await.by_accession.get(accession_id).copied();
        match id {
            Some(id) => self.get_patient(id).await,
            None => Ok(None),
        }
    }

    async fn list_patients(&self, filter: &PatientFilter) -> Result<Vec<Patient>> {
        let cells: Vec<_> = self.patients.read().await.by_id.values().cloned().collect();

        let mut patients = Vec::with_capacity(cells.len());
        for cell in cells {
            let patient = cell.lock().await;
            if filter.matches(&patient) {
                patients.push(patient.clone());
            }
        }

        // 最新登记在前
        patients.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.accession_id.cmp(&a.accession_id)));
        Ok(paginate(patients, filter.offset, filter.limit))
    }

    async fn update_patient(&self, patient: &Patient, expected: VerificationStatus) -> Result<bool> {
        let cell = self
            .patient_cell(patient.id)
            .await
            .ok_or_else(|| HistoError::not_found(EntityKind::Patient, patient.id))?;

        let mut current = cell.lock().await;
        if current.verification_status != expected {
            return Ok(false);
        }
        *current = patient.clone();
        Ok(true)
    }

    async fn insert_referring_doctor(&self, doctor: &ReferringDoctor) -> Result<()> {
        self.referring_doctors
            .write()
            .await
            .insert(doctor.id, doctor.clone());
        Ok(())
    }

    async fn get_referring_doctor(&self, id: Uuid) -> Result<Option<ReferringDoctor>> {
        Ok(self.referring_doctors.read().await.get(&id).cloned())
    }

    async fn list_referring_doctors(&self, filter: &ReferringDoctorFilter) -> Result<Vec<ReferringDoctor>> {
        let mut doctors: Vec<_> = self
            .referring_doctors
            .read()
            .await
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        doctors.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(doctors)
    }

    async fn update_referring_doctor(
        &self,
        id: Uuid,
        patch: &ReferringDoctorPatch,
        at: DateTime<Utc>,
    ) -> Result<ReferringDoctor> {
        let mut doctors = self.referring_doctors.write().await;
        let current = doctors
            .get(&id)
            .ok_or_else(|| HistoError::not_found(EntityKind::ReferringDoctor, id))?;

        let mut updated = current.clone();
        patch.apply_to(&mut updated)?;
        updated.updated_at = at;
        doctors.insert(id, updated.clone());
        Ok(updated)
    }

    async fn insert_report(&self, report: &Report) -> Result<()> {
        let mut reports = self.reports.write().await;
        if report.original_report_id.is_none()
            && reports.values().any(|cell| {
                cell.is_live() && !cell.is_amendment && cell.accession_id == report.accession_id
            })
        {
            return Err(HistoError::Validation(format!(
                "report already exists for accession {}",
                report.accession_id
            )));
        }

        reports.insert(report.id, Arc::new(ReportCell::new(report)));
        Ok(())
    }

    async fn insert_amendment(&self, successor: &Report) -> Result<bool> {
        let source_id = successor
            .original_report_id
            .ok_or_else(|| HistoError::Internal("amendment without predecessor".to_string()))?;
        let source = self
            .report_cell(source_id)
            .await
            .ok_or_else(|| HistoError::not_found(EntityKind::Report, source_id))?;

        // 锁顺序: 源报告槽位 → 报告表
        let mut slot = source.slot.lock().await;
        if !source.is_live() {
            return Err(HistoError::not_found(EntityKind::Report, source_id));
        }
        if slot.report.status != ReportStatus::Published {
            return Ok(false);
        }

        let mut reports = self.reports.write().await;
        // 已丢弃的后继不占用修订位
        let occupied = slot
            .successor
            .and_then(|id| reports.get(&id))
            .is_some_and(|cell| cell.is_live());
        if occupied {
            return Ok(false);
        }

        reports.insert(successor.id, Arc::new(ReportCell::new(successor)));
        slot.successor = Some(successor.id);
        Ok(true)
    }

    async fn get_report(&self, id: Uuid) -> Result<Option<Report>> {
        let Some(cell) = self.report_cell(id).await else {
            return Ok(None);
        };
        let slot = cell.slot.lock().await;
        Ok(cell.is_live().then(|| slot.report.clone()))
    }

    async fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<Report>> {
        let mut reports = Vec::new();
        for cell in self.all_report_cells().await {
            let slot = cell.slot.lock().await;
            if cell.is_live() && filter.matches(&slot.report) {
                reports.push(slot.report.clone());
            }
        }

        reports.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(paginate(reports, filter.offset, filter.limit))
    }

    async fn find_successor(&self, report_id: Uuid) -> Result<Option<Report>> {
        let Some(cell) = self.report_cell(report_id).await else {
            return Ok(None);
        };
        let successor = cell.slot.lock().await.successor;
        match successor {
            Some(id) => self.get_report(id).await,
            None => Ok(None),
        }
    }

    async fn commit_report(&self, commit: &ReportCommit) -> Result<bool> {
        commit.check()?;
        let id = commit.report.id;
        let cell = self
            .report_cell(id)
            .await
            .ok_or_else(|| HistoError::not_found(EntityKind::Report, id))?;

        let mut slot = cell.slot.lock().await;
        if !cell.is_live() {
            return Err(HistoError::not_found(EntityKind::Report, id));
        }
        if slot.report.status != commit.expected_status
            || slot.report.revision != commit.expected_revision
            || slot.versions.len() as u32 != commit.expected_revision
        {
            tracing::debug!(
                "Commit for report {} rejected: expected {}@{}, found {}@{}",
                id,
                commit.expected_status,
                commit.expected_revision,
                slot.report.status,
                slot.report.revision
            );
            return Ok(false);
        }

        slot.report = commit.report.clone();
        slot.versions.push(commit.version.clone());
        Ok(true)
    }

    async fn delete_draft(&self, report_id: Uuid) -> Result<bool> {
        let cell = self
            .report_cell(report_id)
            .await
            .ok_or_else(|| HistoError::not_found(EntityKind::Report, report_id))?;

        let slot = cell.slot.lock().await;
        if !cell.is_live() {
            return Err(HistoError::not_found(EntityKind::Report, report_id));
        }
        if slot.report.status != ReportStatus::Draft || !slot.versions.is_empty() {
            return Ok(false);
        }
        cell.deleted.store(true, Ordering::Release);
        let predecessor = slot.report.original_report_id;
        drop(slot);

        self.reports.write().await.remove(&report_id);

        // 丢弃的修订草稿释放源报告，允许重新修订
        if let Some(source_id) = predecessor {
            if let Some(source) = self.report_cell(source_id).await {
                let mut source_slot = source.slot.lock().await;
                if source_slot.successor == Some(report_id) {
                    source_slot.successor = None;
                }
            }
        }
        Ok(true)
    }

    async fn list_versions(&self, report_id: Uuid) -> Result<Vec<ReportVersion>> {
        match self.report_cell(report_id).await {
            Some(cell) if cell.is_live() => Ok(cell.slot.lock().await.versions.clone()),
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use histo_core::ReportContent;
    use std::time::Duration;

    fn report(accession_id: &str, status: ReportStatus, original_report_id: Option<Uuid>) -> Report {
        let now = Utc::now();
        Report {
            id: Uuid::new_v4(),
            accession_id: accession_id.to_string(),
            content: ReportContent::default(),
            status,
            created_by: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            verified_by: None,
            verified_at: None,
            signed_by: None,
            signed_at: None,
            published_at: None,
            is_amended: original_report_id.is_some(),
            amendment_reason: original_report_id.map(|_| "typo".to_string()),
            original_report_id,
            revision: 0,
        }
    }

    /// 在报告表被读锁占用时丢弃草稿，并在清理阶段取消
    async fn discard_cancelled_during_cleanup(store: &MemoryStore, id: Uuid) {
        let reader = store.reports.read().await;
        let outcome = tokio::time::timeout(Duration::from_millis(50), store.delete_draft(id)).await;
        assert!(outcome.is_err(), "discard should still be waiting for the report table");
        drop(reader);
    }

    #[tokio::test]
    async fn test_cancelled_discard_frees_accession() {
        let store = MemoryStore::new();
        let draft = report("INV-2026-0001", ReportStatus::Draft, None);
        store.insert_report(&draft).await.unwrap();

        discard_cancelled_during_cleanup(&store, draft.id).await;

        assert_eq!(store.get_report(draft.id).await.unwrap(), None);
        assert!(store.list_reports(&ReportFilter::default()).await.unwrap().is_empty());
        assert!(matches!(
            store.delete_draft(draft.id).await,
            Err(HistoError::NotFound { .. })
        ));

        let replacement = report("INV-2026-0001", ReportStatus::Draft, None);
        store.insert_report(&replacement).await.unwrap();
        assert_eq!(store.get_report(replacement.id).await.unwrap(), Some(replacement));
    }

    #[tokio::test]
    async fn test_cancelled_discard_frees_amendment_source() {
        let store = MemoryStore::new();
        let published = report("INV-2026-0002", ReportStatus::Published, None);
        store.insert_report(&published).await.unwrap();

        let first = report("INV-2026-0002", ReportStatus::Draft, Some(published.id));
        assert!(store.insert_amendment(&first).await.unwrap());
        discard_cancelled_during_cleanup(&store, first.id).await;

        assert_eq!(store.find_successor(published.id).await.unwrap(), None);

        let second = report("INV-2026-0002", ReportStatus::Draft, Some(published.id));
        assert!(store.insert_amendment(&second).await.unwrap());
        assert_eq!(
            store.find_successor(published.id).await.unwrap().map(|r| r.id),
            Some(second.id)
        );

        let third = report("INV-2026-0002", ReportStatus::Draft, Some(published.id));
        assert!(!store.insert_amendment(&third).await.unwrap());
    }

    #[tokio::test]
    async fn test_counters_are_per_year() {
        let store = MemoryStore::new();
        assert_eq!(store.next_accession_sequence(2025).await.unwrap(), 1);
        assert_eq!(store.next_accession_sequence(2025).await.unwrap(), 2);
        assert_eq!(store.next_accession_sequence(2026).await.unwrap(), 1);
        assert_eq!(store.next_accession_sequence(2025).await.unwrap(), 3);
    }

    #[test]
    fn test_paginate() {
        let items: Vec<u32> = (1..=10).collect();
        assert_eq!(paginate(items.clone(), Some(2), Some(3)), vec![3, 4, 5]);
        assert_eq!(paginate(items.clone(), Some(9), Some(5)), vec![10]);
        assert!(paginate(items, Some(20), None).is_empty());
    }
}
