//! 报告全生命周期测试 (内存存储)

use chrono::NaiveDate;
use histo_core::{
    Actor, AgeUnit, ContentPatch, Demographics, HistoError, InvestigationType, Report,
    ReportContent, ReportSnapshot, ReportStatus, Sex, VerificationStatus,
};
use histo_workflow::{LabWorkflowEngine, MemoryStore, WorkflowSettings};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

struct Lab {
    engine: LabWorkflowEngine,
    admin: Actor,
    doctor: Actor,
}

fn lab() -> Lab {
    Lab {
        engine: LabWorkflowEngine::new(Arc::new(MemoryStore::new()), WorkflowSettings::default()),
        admin: Actor::admin(Uuid::new_v4()),
        doctor: Actor::doctor(Uuid::new_v4()),
    }
}

fn demographics(name: &str) -> Demographics {
    Demographics {
        patient_name: name.to_string(),
        age: 38,
        age_unit: AgeUnit::Years,
        sex: Sex::Female,
        receive_date: NaiveDate::from_ymd_opt(2026, 2, 3).unwrap(),
        reporting_date: None,
        consultant_name: Some("Dr. Rahman".to_string()),
        consultant_designation: None,
        referring_doctor_id: None,
        investigation_type: InvestigationType::Histopathology,
        clinical_information: Some("Thyroid swelling".to_string()),
        phone: None,
        email: None,
        address: None,
    }
}

fn content() -> ReportContent {
    ReportContent {
        specimen: Some("Thyroid lobe".to_string()),
        gross_examination: Some("Grey-white nodule 2 cm".to_string()),
        diagnosis: Some("Follicular adenoma".to_string()),
        ..Default::default()
    }
}

impl Lab {
    async fn verified_patient(&self, name: &str) -> String {
        let patient = self.engine.register_patient(&self.doctor, demographics(name)).await.unwrap();
        self.engine.verify_patient(patient.id, &self.admin, None).await.unwrap();
        patient.accession_id
    }

    async fn published_report(&self, accession_id: &str) -> Report {
        let report = self.engine.create_report(&self.doctor, accession_id, content()).await.unwrap();
        self.engine.submit_report(report.id, &self.doctor).await.unwrap();
        self.engine.approve_report(report.id, &self.admin).await.unwrap();
        self.engine.sign_report(report.id, &self.doctor).await.unwrap();
        self.engine.publish_report(report.id, &self.doctor).await.unwrap()
    }
}

#[tokio::test]
async fn reject_returns_report_to_draft_with_reason_in_ledger() {
    let lab = lab();
    let accession_id = lab.verified_patient("Farhana").await;

    let report = lab.engine.create_report(&lab.doctor, &accession_id, content()).await.unwrap();
    lab.engine.submit_report(report.id, &lab.doctor).await.unwrap();
    let rejected = lab
        .engine
        .reject_report(report.id, &lab.admin, "missing diagnosis")
        .await
        .unwrap();

    assert_eq!(rejected.status, ReportStatus::Draft);
    assert_eq!(rejected.content.comments.as_deref(), Some("[REJECTED] missing diagnosis"));
    let versions = lab.engine.list_versions(report.id).await.unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].snapshot.status, ReportStatus::PendingVerification);
    assert_eq!(versions[1].snapshot.status, ReportStatus::Draft);
    assert_eq!(versions[1].change_reason.as_deref(), Some("missing diagnosis"));
    assert_eq!(versions[1].changed_by, lab.admin.user_id);
}

#[tokio::test]
async fn full_lifecycle_numbers_versions_contiguously() {
    let lab = lab();
    let accession_id = lab.verified_patient("Shirin").await;

    let report = lab.engine.create_report(&lab.doctor, &accession_id, content()).await.unwrap();
    let patch = ContentPatch {
        microscopic_examination: Some("Follicles lined by cuboidal cells".to_string()),
        ..Default::default()
    };
    lab.engine.edit_report(report.id, &lab.doctor, &patch, None).await.unwrap();
    lab.engine.submit_report(report.id, &lab.doctor).await.unwrap();
    lab.engine.edit_report(report.id, &lab.admin, &patch, Some("wording".to_string())).await.unwrap();
    lab.engine.approve_report(report.id, &lab.admin).await.unwrap();
    lab.engine.sign_report(report.id, &lab.doctor).await.unwrap();
    let published = lab.engine.publish_report(report.id, &lab.doctor).await.unwrap();

    assert_eq!(published.status, ReportStatus::Published);
    assert_eq!(published.verified_by, Some(lab.admin.user_id));
    assert_eq!(published.signed_by, Some(lab.doctor.user_id));
    assert!(published.published_at.is_some());

    let versions = lab.engine.list_versions(report.id).await.unwrap();
    let numbers: Vec<u32> = versions.iter().map(|v| v.version_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(published.revision, 6);
    assert_eq!(versions.last().unwrap().snapshot.status, ReportStatus::Published);

    // 发布后内容不可再编辑
    assert!(matches!(
        lab.engine.edit_report(report.id, &lab.doctor, &patch, None).await,
        Err(HistoError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn skipping_steps_is_rejected_without_side_effects() {
    let lab = lab();
    let accession_id = lab.verified_patient("Nadia").await;
    let report = lab.engine.create_report(&lab.doctor, &accession_id, content()).await.unwrap();

    assert!(matches!(
        lab.engine.approve_report(report.id, &lab.admin).await,
        Err(HistoError::InvalidTransition { .. })
    ));
    assert!(matches!(
        lab.engine.sign_report(report.id, &lab.doctor).await,
        Err(HistoError::InvalidTransition { .. })
    ));
    assert!(matches!(
        lab.engine.publish_report(report.id, &lab.doctor).await,
        Err(HistoError::InvalidTransition { .. })
    ));

    lab.engine.submit_report(report.id, &lab.doctor).await.unwrap();
    assert!(matches!(
        lab.engine.sign_report(report.id, &lab.doctor).await,
        Err(HistoError::InvalidTransition { .. })
    ));

    let current = lab.engine.get_report(report.id).await.unwrap();
    assert_eq!(current.status, ReportStatus::PendingVerification);
    assert_eq!(lab.engine.list_versions(report.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn roles_are_enforced_before_state() {
    let lab = lab();
    let accession_id = lab.verified_patient("Tania").await;
    let report = lab.engine.create_report(&lab.doctor, &accession_id, content()).await.unwrap();

    // 状态也不合法时，仍优先报告权限错误
    assert!(matches!(
        lab.engine.approve_report(report.id, &lab.doctor).await,
        Err(HistoError::Forbidden { .. })
    ));
    assert!(matches!(
        lab.engine.create_report(&lab.admin, &accession_id, content()).await,
        Err(HistoError::Forbidden { .. })
    ));
    assert!(matches!(
        lab.engine.approve_report(Uuid::new_v4(), &lab.doctor).await,
        Err(HistoError::NotFound { .. })
    ));
}

#[tokio::test]
async fn unverified_patient_cannot_receive_report() {
    let lab = lab();
    let pending = lab.engine.register_patient(&lab.admin, demographics("Moni")).await.unwrap();

    assert!(matches!(
        lab.engine.create_report(&lab.doctor, &pending.accession_id, content()).await,
        Err(HistoError::Validation(_))
    ));

    let rejected = lab.engine.reject_patient(pending.id, &lab.admin, "duplicate entry").await.unwrap();
    assert_eq!(rejected.verification_status, VerificationStatus::Rejected);
    assert!(matches!(
        lab.engine.create_report(&lab.doctor, &rejected.accession_id, content()).await,
        Err(HistoError::Validation(_))
    ));

    assert!(matches!(
        lab.engine.create_report(&lab.doctor, "INV-2001-0042", content()).await,
        Err(HistoError::NotFound { .. })
    ));
    assert!(lab.engine.list_patient_reports(&pending.accession_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn approve_twice_succeeds_once() {
    let lab = lab();
    let accession_id = lab.verified_patient("Ruma").await;
    let report = lab.engine.create_report(&lab.doctor, &accession_id, content()).await.unwrap();
    lab.engine.submit_report(report.id, &lab.doctor).await.unwrap();

    lab.engine.approve_report(report.id, &lab.admin).await.unwrap();
    assert!(matches!(
        lab.engine.approve_report(report.id, &lab.admin).await,
        Err(HistoError::InvalidTransition { .. })
    ));
    assert_eq!(lab.engine.list_versions(report.id).await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_have_single_winner() {
    let lab = lab();
    let accession_id = lab.verified_patient("Sumaiya").await;
    let report = lab.engine.create_report(&lab.doctor, &accession_id, content()).await.unwrap();
    lab.engine.submit_report(report.id, &lab.doctor).await.unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let engine = lab.engine.clone();
        let admin = Actor::admin(Uuid::new_v4());
        tasks.spawn(async move { engine.approve_report(report.id, &admin).await });
    }

    let mut winners = Vec::new();
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(report) => winners.push(report),
            Err(HistoError::InvalidTransition { .. }) | Err(HistoError::Conflict { .. }) => {}
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }

    assert_eq!(winners.len(), 1);
    let stored = lab.engine.get_report(report.id).await.unwrap();
    assert_eq!(stored.status, ReportStatus::Verified);
    assert_eq!(stored.verified_by, winners[0].verified_by);
    let versions = lab.engine.list_versions(report.id).await.unwrap();
    assert_eq!(versions.len(), 2);
}

#[tokio::test]
async fn amendment_preserves_published_original() {
    let lab = lab();
    let accession_id = lab.verified_patient("Laila").await;
    let published = lab.published_report(&accession_id).await;
    let history_before = lab.engine.list_versions(published.id).await.unwrap();

    let amended = lab
        .engine
        .amend_report(published.id, &lab.doctor, "typo in diagnosis")
        .await
        .unwrap();

    assert_eq!(amended.status, ReportStatus::Draft);
    assert!(amended.is_amended);
    assert_eq!(amended.original_report_id, Some(published.id));
    assert_eq!(amended.amendment_reason.as_deref(), Some("typo in diagnosis"));
    assert_eq!(amended.content, published.content);
    assert!(lab.engine.list_versions(amended.id).await.unwrap().is_empty());

    let original = lab.engine.get_report(published.id).await.unwrap();
    assert_eq!(original.status, ReportStatus::Published);
    assert_eq!(original, published);
    assert_eq!(lab.engine.list_versions(published.id).await.unwrap(), history_before);

    // 修订报告走完整流程
    let patch = ContentPatch {
        diagnosis: Some("Follicular adenoma, completely excised".to_string()),
        ..Default::default()
    };
    lab.engine.edit_report(amended.id, &lab.doctor, &patch, None).await.unwrap();
    lab.engine.submit_report(amended.id, &lab.doctor).await.unwrap();
    lab.engine.approve_report(amended.id, &lab.admin).await.unwrap();
    lab.engine.sign_report(amended.id, &lab.doctor).await.unwrap();
    lab.engine.publish_report(amended.id, &lab.doctor).await.unwrap();

    let chain: Vec<Uuid> = lab
        .engine
        .amendment_chain(published.id)
        .await
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(chain, vec![published.id, amended.id]);
    assert_eq!(lab.engine.list_patient_reports(&accession_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn only_published_reports_can_be_amended() {
    let lab = lab();
    let accession_id = lab.verified_patient("Parvin").await;
    let report = lab.engine.create_report(&lab.doctor, &accession_id, content()).await.unwrap();

    for _ in 0..2 {
        assert!(matches!(
            lab.engine.amend_report(report.id, &lab.doctor, "typo").await,
            Err(HistoError::InvalidTransition { .. })
        ));
    }
    lab.engine.submit_report(report.id, &lab.doctor).await.unwrap();
    assert!(matches!(
        lab.engine.amend_report(report.id, &lab.doctor, "typo").await,
        Err(HistoError::InvalidTransition { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_amendments_create_single_successor() {
    let lab = lab();
    let accession_id = lab.verified_patient("Tahmina").await;
    let published = lab.published_report(&accession_id).await;
    let id = published.id;

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..10 {
        let engine = lab.engine.clone();
        let doctor = Actor::doctor(Uuid::new_v4());
        tasks.spawn(async move {
            engine
                .amend_report(id, &doctor, &format!("correction {}", i))
                .await
        });
    }

    let mut successors = Vec::new();
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(report) => successors.push(report),
            Err(HistoError::InvalidTransition { .. }) | Err(HistoError::Conflict { .. }) => {}
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }

    assert_eq!(successors.len(), 1);
    let successor = &successors[0];
    assert_eq!(successor.original_report_id, Some(id));

    let chain: Vec<Uuid> = lab.engine.amendment_chain(id).await.unwrap().iter().map(|r| r.id).collect();
    assert_eq!(chain, vec![id, successor.id]);
    assert_eq!(lab.engine.list_patient_reports(&accession_id).await.unwrap().len(), 2);
    assert_eq!(lab.engine.get_report(id).await.unwrap(), published);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_edits_and_approval_keep_ledger_contiguous() {
    let lab = lab();

    for round in 0..5 {
        let accession_id = lab.verified_patient(&format!("Round {}", round)).await;
        let report = lab.engine.create_report(&lab.doctor, &accession_id, content()).await.unwrap();
        lab.engine.submit_report(report.id, &lab.doctor).await.unwrap();
        let id = report.id;

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..4 {
            let engine = lab.engine.clone();
            let editor = if i % 2 == 0 { lab.admin } else { lab.doctor };
            tasks.spawn(async move {
                let patch = ContentPatch {
                    comments: Some(format!("note {}", i)),
                    ..Default::default()
                };
                engine.edit_report(id, &editor, &patch, None).await
            });
        }
        let engine = lab.engine.clone();
        let admin = lab.admin;
        tasks.spawn(async move { engine.approve_report(id, &admin).await });

        let mut applied = 0;
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                Ok(_) => applied += 1,
                Err(HistoError::InvalidTransition { .. }) | Err(HistoError::Conflict { .. }) => {}
                Err(other) => panic!("unexpected error {:?}", other),
            }
        }

        let stored = lab.engine.get_report(id).await.unwrap();
        let versions = lab.engine.list_versions(id).await.unwrap();
        let numbers: Vec<u32> = versions.iter().map(|v| v.version_number).collect();
        assert_eq!(numbers, (1..=stored.revision).collect::<Vec<_>>());
        assert_eq!(stored.revision, 1 + applied);
        assert_eq!(versions.last().unwrap().snapshot, ReportSnapshot::from(&stored));
        // 已审核的报告不再有编辑落在审核之后
        if stored.status == ReportStatus::Verified {
            assert_eq!(versions.last().unwrap().snapshot.status, ReportStatus::Verified);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_get_gapless_accession_ids() {
    let lab = lab();
    let n = 50;

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..n {
        let engine = lab.engine.clone();
        let actor = lab.doctor;
        tasks.spawn(async move {
            engine
                .register_patient(&actor, demographics(&format!("Patient {}", i)))
                .await
        });
    }

    let mut ids = HashSet::new();
    while let Some(result) = tasks.join_next().await {
        let patient = result.unwrap().unwrap();
        assert!(ids.insert(patient.accession_id));
    }

    let year = chrono::Datelike::year(&chrono::Utc::now());
    let expected: HashSet<String> = (1..=n).map(|i| format!("INV-{}-{:04}", year, i)).collect();
    assert_eq!(ids, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocation_for_fixed_year() {
    let lab = lab();

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..100 {
        let engine = lab.engine.clone();
        tasks.spawn(async move { engine.allocate_accession_id(2026).await });
    }

    let mut ids = Vec::new();
    while let Some(result) = tasks.join_next().await {
        ids.push(result.unwrap().unwrap());
    }
    ids.sort();
    let expected: Vec<String> = (1..=100).map(|i| format!("INV-2026-{:04}", i)).collect();
    assert_eq!(ids, expected);

    assert_eq!(lab.engine.allocate_accession_id(2027).await.unwrap(), "INV-2027-0001");
}
