//! 送检医生目录
//!
//! 登记患者时可从目录中选择送检医生，医生姓名与职称随之写入登记记录。
//! 删除只是停用：停用的医生不能再被选用，已有登记不受影响。

use crate::store::WorkflowStore;
use chrono::Utc;
use histo_core::{
    utils::is_blank, Actor, Capability, Demographics, EntityKind, HistoError, NewReferringDoctor,
    ReferringDoctor, ReferringDoctorFilter, ReferringDoctorPatch, Result,
};
use std::sync::Arc;
use uuid::Uuid;

/// 送检医生目录
#[derive(Clone)]
pub struct ReferringDoctorDirectory {
    store: Arc<dyn WorkflowStore>,
}

impl ReferringDoctorDirectory {
    pub fn new(store: Arc<dyn WorkflowStore>) -> Self {
        Self { store }
    }

    /// 新增送检医生
    pub async fn create(&self, actor: &Actor, input: NewReferringDoctor) -> Result<ReferringDoctor> {
        actor.require(Capability::Intake, "add referring doctor")?;
        input.validate()?;

        let now = Utc::now();
        let doctor = ReferringDoctor {
            id: Uuid::new_v4(),
            name: input.name.trim().to_string(),
            designation: input.designation,
            hospital: input.hospital,
            phone: input.phone,
            email: input.email,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_referring_doctor(&doctor).await?;
        tracing::info!("Added referring doctor {} ({}) by {}", doctor.id, doctor.name, actor.user_id);
        Ok(doctor)
    }

    pub async fn get(&self, id: Uuid) -> Result<ReferringDoctor> {
        self.store
            .get_referring_doctor(id)
            .await?
            .ok_or_else(|| HistoError::not_found(EntityKind::ReferringDoctor, id))
    }

    pub async fn list(&self, filter: &ReferringDoctorFilter) -> Result<Vec<ReferringDoctor>> {
        self.store.list_referring_doctors(filter).await
    }

    /// 部分更新，也可用于重新启用
    pub async fn update(&self, id: Uuid, actor: &Actor, patch: &ReferringDoctorPatch) -> Result<ReferringDoctor> {
        actor.require(Capability::Intake, "update referring doctor")?;
        if patch.is_empty() {
            return Err(HistoError::Validation("no referring doctor fields to update".to_string()));
        }

        let doctor = self.store.update_referring_doctor(id, patch, Utc::now()).await?;
        tracing::info!("Updated referring doctor {} by {}", id, actor.user_id);
        Ok(doctor)
    }

    /// 停用 (软删除)，重复停用无副作用
    pub async fn deactivate(&self, id: Uuid, actor: &Actor) -> Result<ReferringDoctor> {
        actor.require(Capability::Intake, "remove referring doctor")?;
        let patch = ReferringDoctorPatch {
            is_active: Some(false),
            ..Default::default()
        };

        let doctor = self.store.update_referring_doctor(id, &patch, Utc::now()).await?;
        tracing::info!("Deactivated referring doctor {} by {}", id, actor.user_id);
        Ok(doctor)
    }

    /// 登记时补全送检医生信息，已填写的字段保持不变
    pub async fn apply_to_intake(&self, demographics: &mut Demographics) -> Result<()> {
        let Some(id) = demographics.referring_doctor_id else {
            return Ok(());
        };

        let doctor = match self.store.get_referring_doctor(id).await? {
            Some(doctor) if doctor.is_active => doctor,
            Some(_) => {
                return Err(HistoError::Validation(format!(
                    "referring doctor {} is no longer active",
                    id
                )))
            }
            None => {
                return Err(HistoError::Validation(format!("unknown referring doctor {}", id)));
            }
        };

        if is_blank(demographics.consultant_name.as_deref()) {
            demographics.consultant_name = Some(doctor.name);
        }
        if is_blank(demographics.consultant_designation.as_deref()) {
            demographics.consultant_designation = doctor.designation;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ReferringDoctorDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferringDoctorDirectory").finish_non_exhaustive()
    }
}
