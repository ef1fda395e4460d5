//! 登记编号分配
//!
//! 格式 PREFIX-YYYY-NNNN，序号按年度从 1 开始。
//! 分配依赖存储层的原子递增，任何情况下都不会返回重复编号；
//! 无法保证唯一时返回 AllocationConflict，由调用方重试。

use crate::store::WorkflowStore;
use histo_core::{utils::format_accession_id, HistoError, Result};
use std::sync::Arc;

/// 默认编号前缀
pub const DEFAULT_PREFIX: &str = "INV";

/// 登记编号分配器
#[derive(Clone)]
pub struct IdentifierAllocator {
    store: Arc<dyn WorkflowStore>,
    prefix: String,
}

impl IdentifierAllocator {
    pub fn new(store: Arc<dyn WorkflowStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// 分配指定年度的下一个编号
    pub async fn allocate(&self, year: i32) -> Result<String> {
        if !(1..=9999).contains(&year) {
            return Err(HistoError::Validation(format!("year {} out of range", year)));
        }

        let sequence = self.store.next_accession_sequence(year).await?;
        let accession_id = format_accession_id(&self.prefix, year, sequence);
        tracing::debug!("Allocated accession id {}", accession_id);
        Ok(accession_id)
    }
}

impl std::fmt::Debug for IdentifierAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentifierAllocator")
            .field("prefix", &self.prefix)
            .finish()
    }
}
