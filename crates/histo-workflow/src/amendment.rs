//! 修订链管理
//!
//! 已发布报告是永久的法律记录，修订不修改原报告，而是复制内容创建新的草稿报告，
//! 新报告的 `original_report_id` 指向其直接前驱。每份已发布报告至多有一个后继，
//! 修订链因此保持线性。

use crate::report::ReportWorkflowEngine;
use crate::state_machine::ReportEvent;
use crate::store::WorkflowStore;
use chrono::Utc;
use histo_core::{Actor, EntityKind, HistoError, Report, Result};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// 修订链管理器
#[derive(Clone)]
pub struct AmendmentChainManager {
    store: Arc<dyn WorkflowStore>,
    reports: ReportWorkflowEngine,
}

impl AmendmentChainManager {
    pub fn new(store: Arc<dyn WorkflowStore>, reports: ReportWorkflowEngine) -> Self {
        Self { store, reports }
    }

    /// 基于已发布报告创建修订报告
    pub async fn amend(&self, id: Uuid, actor: &Actor, reason: &str) -> Result<Report> {
        let event = ReportEvent::Amend;
        let source = self.reports.get(id).await?;
        actor.require(event.capability(), event.as_str())?;
        let initial = self
            .reports
            .state_machine()
            .transition(id, source.status, event)?;

        if let Some(successor) = self.store.find_successor(id).await? {
            return Err(HistoError::InvalidTransition {
                entity: EntityKind::Report,
                id: id.to_string(),
                from: format!("{} (superseded by {})", source.status, successor.id),
                transition: event.to_string(),
            });
        }

        let reason = reason.trim();
        if reason.is_empty() {
            return Err(HistoError::Validation("amend requires a reason".to_string()));
        }

        let now = Utc::now();
        let successor = Report {
            id: Uuid::new_v4(),
            accession_id: source.accession_id.clone(),
            content: source.content.clone(),
            status: initial,
            created_by: actor.user_id,
            created_at: now,
            updated_at: now,
            verified_by: None,
            verified_at: None,
            signed_by: None,
            signed_at: None,
            published_at: None,
            is_amended: true,
            amendment_reason: Some(reason.to_string()),
            original_report_id: Some(source.id),
            revision: 0,
        };

        if !self.store.insert_amendment(&successor).await? {
            return Err(self.reports.lost_race(id, event.as_str()).await);
        }

        tracing::info!(
            "Report {} amended as {} by {}: {}",
            source.id,
            successor.id,
            actor.user_id,
            reason
        );
        Ok(successor)
    }

    /// 直接后继
    pub async fn successor(&self, id: Uuid) -> Result<Option<Report>> {
        self.reports.get(id).await?;
        self.store.find_successor(id).await
    }

    /// 包含该报告的完整修订链，从最初报告到最新修订
    pub async fn chain(&self, id: Uuid) -> Result<Vec<Report>> {
        let start = self.reports.get(id).await?;
        let mut seen = HashSet::from([start.id]);

        // 向前追溯到最初报告
        let mut backwards = Vec::new();
        let mut cursor = start.original_report_id;
        while let Some(previous_id) = cursor {
            if !seen.insert(previous_id) {
                return Err(cycle_error(previous_id));
            }
            let previous = self.reports.get(previous_id).await?;
            cursor = previous.original_report_id;
            backwards.push(previous);
        }
        backwards.reverse();

        let mut chain = backwards;
        chain.push(start.clone());

        // 向后追踪到最新修订
        let mut current = start.id;
        while let Some(next) = self.store.find_successor(current).await? {
            if !seen.insert(next.id) {
                return Err(cycle_error(next.id));
            }
            current = next.id;
            chain.push(next);
        }
        Ok(chain)
    }
}

fn cycle_error(id: Uuid) -> HistoError {
    HistoError::Internal(format!("amendment chain loops back to report {}", id))
}

impl std::fmt::Debug for AmendmentChainManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmendmentChainManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accession::{IdentifierAllocator, DEFAULT_PREFIX};
    use crate::ledger::VersionLedger;
    use crate::patient::tests::demographics;
    use crate::patient::PatientVerificationEngine;
    use crate::store::MemoryStore;
    use histo_core::{ReportContent, ReportStatus};

    struct Fixture {
        reports: ReportWorkflowEngine,
        amendments: AmendmentChainManager,
        admin: Actor,
        doctor: Actor,
        accession_id: String,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn WorkflowStore> = Arc::new(MemoryStore::new());
        let allocator = IdentifierAllocator::new(store.clone(), DEFAULT_PREFIX);
        let patients = PatientVerificationEngine::new(store.clone(), allocator, 3);
        let reports = ReportWorkflowEngine::new(store.clone(), patients.clone(), VersionLedger::new(store.clone()));
        let amendments = AmendmentChainManager::new(store, reports.clone());

        let admin = Actor::admin(Uuid::new_v4());
        let doctor = Actor::doctor(Uuid::new_v4());
        let patient = patients.register(&doctor, demographics("Ayesha")).await.unwrap();
        patients.verify(patient.id, &admin, None).await.unwrap();

        Fixture {
            reports,
            amendments,
            admin,
            doctor,
            accession_id: patient.accession_id,
        }
    }

    async fn publish(f: &Fixture, report: &Report) -> Report {
        f.reports.submit(report.id, &f.doctor).await.unwrap();
        f.reports.approve(report.id, &f.admin).await.unwrap();
        f.reports.sign(report.id, &f.doctor).await.unwrap();
        f.reports.publish(report.id, &f.doctor).await.unwrap()
    }

    fn content() -> ReportContent {
        ReportContent {
            specimen: Some("Endometrial curettings".to_string()),
            diagnosis: Some("Proliferative endometrium".to_string()),
            icd_code: Some("N85.0".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_amend_creates_successor_and_keeps_original() {
        let f = fixture().await;
        let report = f.reports.create(&f.doctor, &f.accession_id, content()).await.unwrap();
        let published = publish(&f, &report).await;

        let amended = f
            .amendments
            .amend(report.id, &f.doctor, "typo in diagnosis")
            .await
            .unwrap();

        assert_ne!(amended.id, report.id);
        assert_eq!(amended.status, ReportStatus::Draft);
        assert!(amended.is_amended);
        assert_eq!(amended.original_report_id, Some(report.id));
        assert_eq!(amended.amendment_reason.as_deref(), Some("typo in diagnosis"));
        assert_eq!(amended.content, published.content);
        assert_eq!(amended.accession_id, report.accession_id);

        let original = f.reports.get(report.id).await.unwrap();
        assert_eq!(original, published);
    }

    #[tokio::test]
    async fn test_amend_guards() {
        let f = fixture().await;
        let report = f.reports.create(&f.doctor, &f.accession_id, content()).await.unwrap();

        assert!(matches!(
            f.amendments.amend(report.id, &f.doctor, "typo").await,
            Err(HistoError::InvalidTransition { .. })
        ));
        publish(&f, &report).await;

        assert!(matches!(
            f.amendments.amend(report.id, &f.admin, "typo").await,
            Err(HistoError::Forbidden { .. })
        ));
        assert!(matches!(
            f.amendments.amend(report.id, &f.doctor, "  ").await,
            Err(HistoError::Validation(_))
        ));
        assert!(matches!(
            f.amendments.amend(Uuid::new_v4(), &f.doctor, "typo").await,
            Err(HistoError::NotFound { .. })
        ));

        f.amendments.amend(report.id, &f.doctor, "typo").await.unwrap();
        // 同一报告只能修订一次，后续修订针对后继报告
        assert!(matches!(
            f.amendments.amend(report.id, &f.doctor, "second typo").await,
            Err(HistoError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_chain_points_to_immediate_predecessor() {
        let f = fixture().await;
        let root = f.reports.create(&f.doctor, &f.accession_id, content()).await.unwrap();
        publish(&f, &root).await;

        let second = f.amendments.amend(root.id, &f.doctor, "wrong ICD code").await.unwrap();
        publish(&f, &second).await;
        let third = f.amendments.amend(second.id, &f.doctor, "laterality").await.unwrap();

        assert_eq!(third.original_report_id, Some(second.id));
        assert_eq!(second.original_report_id, Some(root.id));

        let chain: Vec<Uuid> = f.amendments.chain(second.id).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(chain, vec![root.id, second.id, third.id]);
        assert_eq!(f.amendments.successor(root.id).await.unwrap().map(|r| r.id), Some(second.id));
        assert!(f.amendments.successor(third.id).await.unwrap().is_none());

        let for_patient = f.reports.list_for_patient(&f.accession_id).await.unwrap();
        assert_eq!(for_patient.len(), 3);
    }

    #[tokio::test]
    async fn test_discarded_amendment_frees_source() {
        let f = fixture().await;
        let report = f.reports.create(&f.doctor, &f.accession_id, content()).await.unwrap();
        publish(&f, &report).await;

        let draft = f.amendments.amend(report.id, &f.doctor, "typo").await.unwrap();
        f.reports.discard(draft.id, &f.doctor).await.unwrap();

        let retry = f.amendments.amend(report.id, &f.doctor, "typo, take two").await.unwrap();
        assert_eq!(retry.original_report_id, Some(report.id));
    }
}
