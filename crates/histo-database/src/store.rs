//! PostgreSQL 工作流存储
//!
//! 比对写入通过带条件的 UPDATE 实现：条件不满足时影响行数为零，
//! 报告变更与审计记录在同一个事务中提交。

use crate::connection::DatabasePool;
use crate::models::{enum_to_text, to_i32, DbReferringDoctor};
use crate::queries::{db_error, DatabaseQueries};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use histo_core::{
    utils::parse_accession_id, EntityKind, HistoError, Patient, PatientFilter, ReferringDoctor,
    ReferringDoctorFilter, ReferringDoctorPatch, Report, ReportFilter, ReportStatus,
    ReportVersion, Result, VerificationStatus,
};
use histo_workflow::{ReportCommit, WorkflowStore};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";

/// 唯一约束冲突时返回约束名
fn unique_violation(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            Some(db.constraint().unwrap_or_default().to_string())
        }
        _ => None,
    }
}

/// PostgreSQL 存储
#[derive(Debug, Clone)]
pub struct PgWorkflowStore {
    pool: DatabasePool,
}

impl PgWorkflowStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// 连接数据库并确保表结构存在
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
        run_migrations: bool,
    ) -> Result<Self> {
        let pool = DatabasePool::connect(url, max_connections, acquire_timeout).await?;
        if run_migrations {
            DatabaseQueries::new(&pool).create_tables().await?;
        }
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    fn queries(&self) -> DatabaseQueries<'_> {
        DatabaseQueries::new(&self.pool)
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        self.pool.pool().begin().await.map_err(db_error)
    }

    async fn report_exists(&self, id: Uuid) -> Result<bool> {
        let found: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM reports WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_error)?;
        Ok(found.is_some())
    }

    /// 插入报告行；唯一约束冲突交由调用方解释
    async fn insert_report_row(
        tx: &mut Transaction<'static, Postgres>,
        report: &Report,
    ) -> Result<std::result::Result<(), sqlx::Error>> {
        let report_type = enum_to_text(&report.content.report_type)?;
        let revision = to_i32("revision", report.revision)?;
        let result = sqlx::query(r#"
            INSERT INTO reports (id, accession_id, report_type, content, status, created_by, created_at, updated_at,
                                 verified_by, verified_at, signed_by, signed_at, published_at,
                                 is_amended, amendment_reason, original_report_id, revision)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        "#)
        .bind(report.id)
        .bind(&report.accession_id)
        .bind(report_type)
        .bind(Json(&report.content))
        .bind(report.status.as_str())
        .bind(report.created_by)
        .bind(report.created_at)
        .bind(report.updated_at)
        .bind(report.verified_by)
        .bind(report.verified_at)
        .bind(report.signed_by)
        .bind(report.signed_at)
        .bind(report.published_at)
        .bind(report.is_amended)
        .bind(&report.amendment_reason)
        .bind(report.original_report_id)
        .bind(revision)
        .execute(&mut **tx)
        .await;
        Ok(result.map(|_| ()))
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn next_accession_sequence(&self, year: i32) -> Result<u32> {
        let (value,): (i32,) = sqlx::query_as(r#"
            INSERT INTO accession_counters (year, last_value) VALUES ($1, 1)
            ON CONFLICT (year) DO UPDATE SET last_value = accession_counters.last_value + 1
            RETURNING last_value
        "#)
        .bind(year)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_error)?;

        u32::try_from(value).map_err(|_| HistoError::AllocationConflict { year, attempts: 1 })
    }

    async fn insert_patient(&self, patient: &Patient) -> Result<()> {
        let d = &patient.demographics;
        let result = sqlx::query(r#"
            INSERT INTO patients (id, accession_id, patient_name, age, age_unit, sex, receive_date, reporting_date,
                                  consultant_name, consultant_designation, referring_doctor_id, investigation_type,
                                  clinical_information, phone, email, address, verification_status, verified_by,
                                  verified_at, verification_notes, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)
        "#)
        .bind(patient.id)
        .bind(&patient.accession_id)
        .bind(&d.patient_name)
        .bind(i32::from(d.age))
        .bind(enum_to_text(&d.age_unit)?)
        .bind(enum_to_text(&d.sex)?)
        .bind(d.receive_date)
        .bind(d.reporting_date)
        .bind(&d.consultant_name)
        .bind(&d.consultant_designation)
        .bind(d.referring_doctor_id)
        .bind(enum_to_text(&d.investigation_type)?)
        .bind(&d.clinical_information)
        .bind(&d.phone)
        .bind(&d.email)
        .bind(&d.address)
        .bind(patient.verification_status.as_str())
        .bind(patient.verified_by)
        .bind(patient.verified_at)
        .bind(&patient.verification_notes)
        .bind(patient.created_by)
        .bind(patient.created_at)
        .bind(patient.updated_at)
        .execute(self.pool.pool())
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if unique_violation(&e).is_some() => {
                let year = parse_accession_id(&patient.accession_id)
                    .map(|(_, year, _)| year)
                    .unwrap_or_default();
                Err(HistoError::AllocationConflict { year, attempts: 1 })
            }
            Err(e) => Err(db_error(e)),
        }
    }

    async fn get_patient(&self, id: Uuid) -> Result<Option<Patient>> {
        self.queries().get_patient_by_id(id).await
    }

    async fn get_patient_by_accession(&self, accession_id: &str) -> Result<Option<Patient>> {
        self.queries().get_patient_by_accession(accession_id).await
    }

    async fn list_patients(&self, filter: &PatientFilter) -> Result<Vec<Patient>> {
        self.queries().search_patients(filter).await
    }

    async fn update_patient(&self, patient: &Patient, expected: VerificationStatus) -> Result<bool> {
        let result = sqlx::query(r#"
            UPDATE patients
            SET verification_status = $1, verified_by = $2, verified_at = $3,
                verification_notes = $4, updated_at = $5
            WHERE id = $6 AND verification_status = $7
        "#)
        .bind(patient.verification_status.as_str())
        .bind(patient.verified_by)
        .bind(patient.verified_at)
        .bind(&patient.verification_notes)
        .bind(patient.updated_at)
        .bind(patient.id)
        .bind(expected.as_str())
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            if self.get_patient(patient.id).await?.is_none() {
                return Err(HistoError::not_found(EntityKind::Patient, patient.id));
            }
            return Ok(false);
        }
        Ok(true)
    }

    async fn insert_referring_doctor(&self, doctor: &ReferringDoctor) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO referring_doctors (id, name, designation, hospital, phone, email, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#)
        .bind(doctor.id)
        .bind(&doctor.name)
        .bind(&doctor.designation)
        .bind(&doctor.hospital)
        .bind(&doctor.phone)
        .bind(&doctor.email)
        .bind(doctor.is_active)
        .bind(doctor.created_at)
        .bind(doctor.updated_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_referring_doctor(&self, id: Uuid) -> Result<Option<ReferringDoctor>> {
        self.queries().get_referring_doctor_by_id(id).await
    }

    async fn list_referring_doctors(&self, filter: &ReferringDoctorFilter) -> Result<Vec<ReferringDoctor>> {
        self.queries().search_referring_doctors(filter).await
    }

    async fn update_referring_doctor(
        &self,
        id: Uuid,
        patch: &ReferringDoctorPatch,
        at: DateTime<Utc>,
    ) -> Result<ReferringDoctor> {
        let mut tx = self.begin().await?;
        let row = sqlx::query_as::<_, DbReferringDoctor>("SELECT * FROM referring_doctors WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?;

        let mut doctor = row
            .map(ReferringDoctor::from)
            .ok_or_else(|| HistoError::not_found(EntityKind::ReferringDoctor, id))?;
        patch.apply_to(&mut doctor)?;
        doctor.updated_at = at;

        sqlx::query(r#"
            UPDATE referring_doctors
            SET name = $1, designation = $2, hospital = $3, phone = $4, email = $5,
                is_active = $6, updated_at = $7
            WHERE id = $8
        "#)
        .bind(&doctor.name)
        .bind(&doctor.designation)
        .bind(&doctor.hospital)
        .bind(&doctor.phone)
        .bind(&doctor.email)
        .bind(doctor.is_active)
        .bind(doctor.updated_at)
        .bind(doctor.id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(doctor)
    }

    async fn insert_report(&self, report: &Report) -> Result<()> {
        let mut tx = self.begin().await?;
        match Self::insert_report_row(&mut tx, report).await? {
            Ok(()) => {}
            Err(e) if unique_violation(&e).as_deref() == Some("uq_reports_primary_accession") => {
                return Err(HistoError::Validation(format!(
                    "report already exists for accession {}",
                    report.accession_id
                )));
            }
            Err(e) => return Err(db_error(e)),
        }
        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn insert_amendment(&self, successor: &Report) -> Result<bool> {
        let source_id = successor
            .original_report_id
            .ok_or_else(|| HistoError::Internal("amendment without predecessor".to_string()))?;

        let mut tx = self.begin().await?;
        // 锁定源报告行，串行化同一报告的并发修订
        let source: Option<(String,)> = sqlx::query_as("SELECT status FROM reports WHERE id = $1 FOR UPDATE")
            .bind(source_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?;

        let Some((status,)) = source else {
            return Err(HistoError::not_found(EntityKind::Report, source_id));
        };
        if status != ReportStatus::Published.as_str() {
            return Ok(false);
        }

        match Self::insert_report_row(&mut tx, successor).await? {
            Ok(()) => {}
            Err(e) if unique_violation(&e).is_some() => return Ok(false),
            Err(e) => return Err(db_error(e)),
        }
        tx.commit().await.map_err(db_error)?;
        Ok(true)
    }

    async fn get_report(&self, id: Uuid) -> Result<Option<Report>> {
        self.queries().get_report_by_id(id).await
    }

    async fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<Report>> {
        self.queries().search_reports(filter).await
    }

    async fn find_successor(&self, report_id: Uuid) -> Result<Option<Report>> {
        self.queries().get_successor(report_id).await
    }

    async fn commit_report(&self, commit: &ReportCommit) -> Result<bool> {
        commit.check()?;
        let report = &commit.report;
        let mut tx = self.begin().await?;

        let result = sqlx::query(r#"
            UPDATE reports
            SET report_type = $1, content = $2, status = $3, updated_at = $4,
                verified_by = $5, verified_at = $6, signed_by = $7, signed_at = $8,
                published_at = $9, revision = $10
            WHERE id = $11 AND status = $12 AND revision = $13
        "#)
        .bind(enum_to_text(&report.content.report_type)?)
        .bind(Json(&report.content))
        .bind(report.status.as_str())
        .bind(report.updated_at)
        .bind(report.verified_by)
        .bind(report.verified_at)
        .bind(report.signed_by)
        .bind(report.signed_at)
        .bind(report.published_at)
        .bind(to_i32("revision", report.revision)?)
        .bind(report.id)
        .bind(commit.expected_status.as_str())
        .bind(to_i32("revision", commit.expected_revision)?)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(db_error)?;
            if !self.report_exists(report.id).await? {
                return Err(HistoError::not_found(EntityKind::Report, report.id));
            }
            tracing::debug!(
                "Commit for report {} rejected: expected {}@{}",
                report.id,
                commit.expected_status,
                commit.expected_revision
            );
            return Ok(false);
        }

        let version = &commit.version;
        let inserted = sqlx::query(r#"
            INSERT INTO report_versions (report_id, version_number, snapshot, changed_by, change_reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
        "#)
        .bind(version.report_id)
        .bind(to_i32("version_number", version.version_number)?)
        .bind(Json(&version.snapshot))
        .bind(version.changed_by)
        .bind(&version.change_reason)
        .bind(version.created_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            // 版本号已被占用说明有并发写入，整体回滚
            Err(e) if unique_violation(&e).is_some() => {
                tx.rollback().await.map_err(db_error)?;
                return Ok(false);
            }
            Err(e) => return Err(db_error(e)),
        }

        tx.commit().await.map_err(db_error)?;
        Ok(true)
    }

    async fn delete_draft(&self, report_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM reports WHERE id = $1 AND status = $2 AND revision = 0",
        )
        .bind(report_id)
        .bind(ReportStatus::Draft.as_str())
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            if !self.report_exists(report_id).await? {
                return Err(HistoError::not_found(EntityKind::Report, report_id));
            }
            return Ok(false);
        }
        Ok(true)
    }

    async fn list_versions(&self, report_id: Uuid) -> Result<Vec<ReportVersion>> {
        self.queries().get_versions(report_id).await
    }
}
