//! 患者核对引擎
//!
//! 患者登记后处于待核对状态，由管理员核对通过或驳回。
//! 驳回为终态，重新送检需以新的登记记录进入。

use crate::accession::IdentifierAllocator;
use crate::directory::ReferringDoctorDirectory;
use crate::state_machine::{PatientEvent, PatientStateMachine};
use crate::store::WorkflowStore;
use chrono::{Datelike, Utc};
use histo_core::{
    utils::is_blank, Actor, Capability, Demographics, EntityKind, HistoError, Patient,
    PatientFilter, Result, VerificationStatus,
};
use std::sync::Arc;
use uuid::Uuid;

/// 患者核对引擎
#[derive(Clone)]
pub struct PatientVerificationEngine {
    store: Arc<dyn WorkflowStore>,
    allocator: IdentifierAllocator,
    directory: ReferringDoctorDirectory,
    state_machine: Arc<PatientStateMachine>,
    allocation_retries: u32,
}

impl PatientVerificationEngine {
    pub fn new(store: Arc<dyn WorkflowStore>, allocator: IdentifierAllocator, allocation_retries: u32) -> Self {
        Self {
            directory: ReferringDoctorDirectory::new(store.clone()),
            store,
            allocator,
            state_machine: Arc::new(PatientStateMachine::new()),
            allocation_retries: allocation_retries.max(1),
        }
    }

    /// 登记新患者，分配登记编号
    pub async fn register(&self, actor: &Actor, mut demographics: Demographics) -> Result<Patient> {
        actor.require(Capability::Intake, "register patient")?;
        demographics.validate()?;
        self.directory.apply_to_intake(&mut demographics).await?;

        let now = Utc::now();
        let year = now.year();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let accession_id = self.allocator.allocate(year).await?;
            let patient = Patient {
                id: Uuid::new_v4(),
                accession_id,
                demographics: demographics.clone(),
                verification_status: VerificationStatus::Pending,
                verified_by: None,
                verified_at: None,
                verification_notes: None,
                created_by: actor.user_id,
                created_at: now,
                updated_at: now,
            };

            match self.store.insert_patient(&patient).await {
                Ok(()) => {
                    tracing::info!(
                        "Registered patient {} as {} by {}",
                        patient.id,
                        patient.accession_id,
                        actor.user_id
                    );
                    return Ok(patient);
                }
                Err(HistoError::AllocationConflict { .. }) if attempts < self.allocation_retries => {
                    tracing::warn!(
                        "Accession id {} already taken, retrying ({}/{})",
                        patient.accession_id,
                        attempts,
                        self.allocation_retries
                    );
                }
                Err(HistoError::AllocationConflict { .. }) => {
                    return Err(HistoError::AllocationConflict { year, attempts });
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Patient> {
        self.store
            .get_patient(id)
            .await?
            .ok_or_else(|| HistoError::not_found(EntityKind::Patient, id))
    }

    pub async fn get_by_accession(&self, accession_id: &str) -> Result<Patient> {
        self.store
            .get_patient_by_accession(accession_id)
            .await?
            .ok_or_else(|| HistoError::not_found(EntityKind::Patient, accession_id))
    }

    pub async fn list(&self, filter: &PatientFilter) -> Result<Vec<Patient>> {
        self.store.list_patients(filter).await
    }

    /// 核对通过
    pub async fn verify(&self, id: Uuid, actor: &Actor, notes: Option<String>) -> Result<Patient> {
        let notes = notes.filter(|n| !n.trim().is_empty());
        self.apply(id, actor, PatientEvent::Verify, notes).await
    }

    /// 驳回，必须填写原因
    pub async fn reject(&self, id: Uuid, actor: &Actor, reason: &str) -> Result<Patient> {
        self.apply(id, actor, PatientEvent::Reject, Some(reason.to_string())).await
    }

    /// 报告创建前的同步检查：患者必须已核对
    pub async fn require_verified(&self, accession_id: &str) -> Result<Patient> {
        let patient = self.get_by_accession(accession_id).await?;
        if patient.verification_status != VerificationStatus::Verified {
            return Err(HistoError::Validation(format!(
                "patient {} is {}, reports require a verified patient",
                accession_id, patient.verification_status
            )));
        }
        Ok(patient)
    }

    async fn apply(
        &self,
        id: Uuid,
        actor: &Actor,
        event: PatientEvent,
        notes: Option<String>,
    ) -> Result<Patient> {
        // 守卫顺序: 存在 → 角色 → 状态 → 参数
        let current = self.get(id).await?;
        actor.require(Capability::Verifier, &format!("{} patient", event))?;
        let next_status = self
            .state_machine
            .transition(id, current.verification_status, event)?;
        if event == PatientEvent::Reject && is_blank(notes.as_deref()) {
            return Err(HistoError::Validation("rejection reason is required".to_string()));
        }

        let now = Utc::now();
        let mut updated = current.clone();
        updated.verification_status = next_status;
        updated.verified_by = Some(actor.user_id);
        updated.verified_at = Some(now);
        updated.verification_notes = notes.map(|n| n.trim().to_string());
        updated.updated_at = now;

        if !self.store.update_patient(&updated, current.verification_status).await? {
            return Err(self.lost_race(id, event).await);
        }

        tracing::info!(
            "Patient {} {} -> {} by {}",
            updated.accession_id,
            current.verification_status,
            next_status,
            actor.user_id
        );
        Ok(updated)
    }

    /// 并发中落败时，说明记录已被谁处理
    async fn lost_race(&self, id: Uuid, event: PatientEvent) -> HistoError {
        let message = match self.store.get_patient(id).await {
            Ok(Some(patient)) => format!(
                "cannot {}: patient already {} by {}",
                event,
                patient.verification_status,
                patient
                    .verified_by
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| "another user".to_string())
            ),
            _ => format!("cannot {}: patient changed concurrently", event),
        };
        tracing::warn!("Patient {} {}", id, message);
        HistoError::conflict(EntityKind::Patient, id, message)
    }
}

impl std::fmt::Debug for PatientVerificationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatientVerificationEngine")
            .field("allocator", &self.allocator)
            .field("allocation_retries", &self.allocation_retries)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::accession::DEFAULT_PREFIX;
    use crate::store::MemoryStore;
    use chrono::NaiveDate;
    use histo_core::{AgeUnit, InvestigationType, Sex};

    pub(crate) fn demographics(name: &str) -> Demographics {
        Demographics {
            patient_name: name.to_string(),
            age: 52,
            age_unit: AgeUnit::Years,
            sex: Sex::Female,
            receive_date: NaiveDate::from_ymd_opt(2026, 1, 12).unwrap(),
            reporting_date: None,
            consultant_name: Some("Dr. Karim".to_string()),
            consultant_designation: Some("FCPS".to_string()),
            referring_doctor_id: None,
            investigation_type: InvestigationType::Histopathology,
            clinical_information: Some("Breast lump".to_string()),
            phone: None,
            email: None,
            address: None,
        }
    }

    fn engine() -> PatientVerificationEngine {
        let store: Arc<dyn WorkflowStore> = Arc::new(MemoryStore::new());
        let allocator = IdentifierAllocator::new(store.clone(), DEFAULT_PREFIX);
        PatientVerificationEngine::new(store, allocator, 3)
    }

    #[tokio::test]
    async fn test_register_assigns_accession_id() {
        let engine = engine();
        let doctor = Actor::doctor(Uuid::new_v4());

        let first = engine.register(&doctor, demographics("Ayesha")).await.unwrap();
        let second = engine.register(&doctor, demographics("Nasrin")).await.unwrap();

        let year = Utc::now().year();
        assert_eq!(first.accession_id, format!("INV-{}-0001", year));
        assert_eq!(second.accession_id, format!("INV-{}-0002", year));
        assert_eq!(first.verification_status, VerificationStatus::Pending);
        assert_eq!(first.created_by, doctor.user_id);
    }

    #[tokio::test]
    async fn test_verify_guards() {
        let engine = engine();
        let admin = Actor::admin(Uuid::new_v4());
        let doctor = Actor::doctor(Uuid::new_v4());
        let patient = engine.register(&doctor, demographics("Ayesha")).await.unwrap();

        assert!(matches!(
            engine.verify(Uuid::new_v4(), &admin, None).await,
            Err(HistoError::NotFound { .. })
        ));
        assert!(matches!(
            engine.verify(patient.id, &doctor, None).await,
            Err(HistoError::Forbidden { .. })
        ));

        let verified = engine
            .verify(patient.id, &admin, Some("ID checked".to_string()))
            .await
            .unwrap();
        assert_eq!(verified.verification_status, VerificationStatus::Verified);
        assert_eq!(verified.verified_by, Some(admin.user_id));
        assert!(verified.verified_at.is_some());
        assert_eq!(verified.verification_notes.as_deref(), Some("ID checked"));

        // 重复核对不是幂等操作
        assert!(matches!(
            engine.verify(patient.id, &admin, None).await,
            Err(HistoError::InvalidTransition { .. })
        ));
        assert!(matches!(
            engine.reject(patient.id, &admin, "wrong name").await,
            Err(HistoError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_reject_requires_reason_and_is_terminal() {
        let engine = engine();
        let admin = Actor::admin(Uuid::new_v4());
        let patient = engine
            .register(&admin, demographics("Salma"))
            .await
            .unwrap();

        assert!(matches!(
            engine.reject(patient.id, &admin, "   ").await,
            Err(HistoError::Validation(_))
        ));
        // 校验失败不改变记录
        assert_eq!(
            engine.get(patient.id).await.unwrap().verification_status,
            VerificationStatus::Pending
        );

        let rejected = engine.reject(patient.id, &admin, "age mismatch").await.unwrap();
        assert_eq!(rejected.verification_status, VerificationStatus::Rejected);
        assert_eq!(rejected.verification_notes.as_deref(), Some("age mismatch"));

        assert!(matches!(
            engine.verify(patient.id, &admin, None).await,
            Err(HistoError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_require_verified() {
        let engine = engine();
        let admin = Actor::admin(Uuid::new_v4());
        let patient = engine.register(&admin, demographics("Rina")).await.unwrap();

        assert!(matches!(
            engine.require_verified(&patient.accession_id).await,
            Err(HistoError::Validation(_))
        ));
        engine.verify(patient.id, &admin, None).await.unwrap();
        assert!(engine.require_verified(&patient.accession_id).await.is_ok());
        assert!(matches!(
            engine.require_verified("INV-1999-0001").await,
            Err(HistoError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_register_with_referring_doctor() {
        let store: Arc<dyn WorkflowStore> = Arc::new(MemoryStore::new());
        let allocator = IdentifierAllocator::new(store.clone(), DEFAULT_PREFIX);
        let engine = PatientVerificationEngine::new(store.clone(), allocator, 3);
        let directory = ReferringDoctorDirectory::new(store);
        let admin = Actor::admin(Uuid::new_v4());

        let doctor = directory
            .create(
                &admin,
                histo_core::NewReferringDoctor {
                    name: "Dr. Sultana".to_string(),
                    designation: Some("FCPS (Surgery)".to_string()),
                    hospital: None,
                    phone: None,
                    email: None,
                },
            )
            .await
            .unwrap();

        let mut intake = demographics("Ayesha");
        intake.consultant_name = None;
        intake.consultant_designation = None;
        intake.referring_doctor_id = Some(doctor.id);
        let patient = engine.register(&admin, intake.clone()).await.unwrap();
        assert_eq!(patient.demographics.consultant_name.as_deref(), Some("Dr. Sultana"));
        assert_eq!(patient.demographics.referring_doctor_id, Some(doctor.id));

        // 停用后不能再选用，也不消耗登记编号
        directory.deactivate(doctor.id, &admin).await.unwrap();
        assert!(matches!(
            engine.register(&admin, intake).await,
            Err(HistoError::Validation(_))
        ));
        let next = engine.register(&admin, demographics("Nasrin")).await.unwrap();
        assert!(next.accession_id.ends_with("-0002"));
    }

    #[tokio::test]
    async fn test_register_validates_demographics() {
        let engine = engine();
        let admin = Actor::admin(Uuid::new_v4());
        assert!(matches!(
            engine.register(&admin, demographics("")).await,
            Err(HistoError::Validation(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_verify_single_winner() {
        let engine = engine();
        let admin = Actor::admin(Uuid::new_v4());
        let patient = engine.register(&admin, demographics("Mita")).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let engine = engine.clone();
            let admin = Actor::admin(Uuid::new_v4());
            tasks.spawn(async move { engine.verify(patient.id, &admin, None).await });
        }

        let mut wins = 0;
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                Ok(_) => wins += 1,
                Err(HistoError::InvalidTransition { .. }) | Err(HistoError::Conflict { .. }) => {}
                Err(other) => panic!("unexpected error {:?}", other),
            }
        }
        assert_eq!(wins, 1);
    }
}
