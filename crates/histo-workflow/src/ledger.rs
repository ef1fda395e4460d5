//! 审计版本账本
//!
//! 只追加的快照日志。每次报告变更生成一条记录，版本号从 1 开始连续递增；
//! 记录与状态变更在存储层的同一个原子单元内写入。

use crate::store::WorkflowStore;
use chrono::{DateTime, Utc};
use histo_core::{Actor, HistoError, Report, ReportSnapshot, ReportVersion, Result};
use std::sync::Arc;
use uuid::Uuid;

/// 审计版本账本
#[derive(Clone)]
pub struct VersionLedger {
    store: Arc<dyn WorkflowStore>,
}

impl VersionLedger {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }

    /// 为变更后的报告生成下一条审计记录
    ///
    /// `updated` 为变更后的报告，其 `revision` 已递增；快照在变更之后获取。
    pub fn entry_for(
        &self,
        updated: &Report,
        actor: &Actor,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> ReportVersion {
        ReportVersion {
            report_id: updated.id,
            version_number: updated.revision,
            snapshot: ReportSnapshot::from(updated),
            changed_by: actor.user_id,
            change_reason: reason,
            created_at: at,
        }
    }

    /// 报告的完整历史，按版本号升序
    pub async fn list_versions(&self, report_id: Uuid) -> Result<Vec<ReportVersion>> {
        let mut versions = self.store.list_versions(report_id).await?;
        versions.sort_by_key(|v| v.version_number);
        check_contiguous(report_id, &versions)?;
        Ok(versions)
    }
}

/// 版本号必须恰好是 1..=N
pub fn check_contiguous(report_id: Uuid, versions: &[ReportVersion]) -> Result<()> {
    for (index, version) in versions.iter().enumerate() {
        let expected = index as u32 + 1;
        if version.version_number != expected {
            tracing::error!(
                "Version history of report {} is broken: expected {}, found {}",
                report_id,
                expected,
                version.version_number
            );
            return Err(HistoError::Internal(format!(
                "version history of report {} is not contiguous at {}",
                report_id, expected
            )));
        }
    }
    Ok(())
}

impl std::fmt::Debug for VersionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionLedger").finish_non_exhaustive()
    }
}
