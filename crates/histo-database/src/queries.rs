//! 数据库查询操作

use crate::connection::DatabasePool;
use crate::models::*;
use histo_core::{
    HistoError, Patient, PatientFilter, ReferringDoctor, ReferringDoctorFilter, Report,
    ReportFilter, ReportVersion, Result,
};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

/// 数据库查询操作接口
pub struct DatabaseQueries<'a> {
    pool: &'a DatabasePool,
}

pub(crate) fn db_error(e: sqlx::Error) -> HistoError {
    HistoError::Database(e.to_string())
}

fn page_bounds(offset: Option<usize>, limit: Option<usize>) -> (i64, i64) {
    let offset = i64::try_from(offset.unwrap_or(0)).unwrap_or(i64::MAX);
    let limit = i64::try_from(limit.unwrap_or(50)).unwrap_or(i64::MAX);
    (offset, limit)
}

impl<'a> DatabaseQueries<'a> {
    pub fn new(pool: &'a DatabasePool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        // 年度编号计数器
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS accession_counters (
                year INTEGER PRIMARY KEY,
                last_value INTEGER NOT NULL
            )
        "#).execute(pool).await.map_err(db_error)?;

        // 送检医生目录
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS referring_doctors (
                id UUID PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                designation VARCHAR(255),
                hospital VARCHAR(255),
                phone VARCHAR(64),
                email VARCHAR(255),
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
        "#).execute(pool).await.map_err(db_error)?;

        // 创建患者表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS patients (
                id UUID PRIMARY KEY,
                accession_id VARCHAR(32) NOT NULL,
                patient_name VARCHAR(255) NOT NULL,
                age INTEGER NOT NULL,
                age_unit VARCHAR(16) NOT NULL,
                sex VARCHAR(16) NOT NULL,
                receive_date DATE NOT NULL,
                reporting_date DATE,
                consultant_name VARCHAR(255),
                consultant_designation VARCHAR(255),
                referring_doctor_id UUID REFERENCES referring_doctors(id),
                investigation_type VARCHAR(32) NOT NULL,
                clinical_information TEXT,
                phone VARCHAR(64),
                email VARCHAR(255),
                address TEXT,
                verification_status VARCHAR(16) NOT NULL DEFAULT 'pending',
                verified_by UUID,
                verified_at TIMESTAMP WITH TIME ZONE,
                verification_notes TEXT,
                created_by UUID NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                CONSTRAINT uq_patients_accession_id UNIQUE (accession_id)
            )
        "#).execute(pool).await.map_err(db_error)?;

        // 早期库表没有送检医生列
        sqlx::query("ALTER TABLE patients ADD COLUMN IF NOT EXISTS referring_doctor_id UUID REFERENCES referring_doctors(id)")
            .execute(pool)
            .await
            .map_err(db_error)?;

        // 创建报告表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS reports (
                id UUID PRIMARY KEY,
                accession_id VARCHAR(32) NOT NULL REFERENCES patients(accession_id),
                report_type VARCHAR(32) NOT NULL,
                content JSONB NOT NULL,
                status VARCHAR(32) NOT NULL DEFAULT 'draft',
                created_by UUID NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                verified_by UUID,
                verified_at TIMESTAMP WITH TIME ZONE,
                signed_by UUID,
                signed_at TIMESTAMP WITH TIME ZONE,
                published_at TIMESTAMP WITH TIME ZONE,
                is_amended BOOLEAN NOT NULL DEFAULT FALSE,
                amendment_reason TEXT,
                original_report_id UUID REFERENCES reports(id),
                revision INTEGER NOT NULL DEFAULT 0
            )
        "#).execute(pool).await.map_err(db_error)?;

        // 创建审计版本表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS report_versions (
                report_id UUID NOT NULL REFERENCES reports(id),
                version_number INTEGER NOT NULL,
                snapshot JSONB NOT NULL,
                changed_by UUID NOT NULL,
                change_reason TEXT,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                PRIMARY KEY (report_id, version_number)
            )
        "#).execute(pool).await.map_err(db_error)?;

        // 创建索引以优化查询性能
        self.create_indexes().await?;

        tracing::info!("Database tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool.pool();

        let indexes = vec![
            "CREATE INDEX IF NOT EXISTS idx_patients_status ON patients(verification_status)",
            "CREATE INDEX IF NOT EXISTS idx_patients_created_at ON patients(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_referring_doctors_name ON referring_doctors(name)",
            "CREATE INDEX IF NOT EXISTS idx_reports_accession_id ON reports(accession_id)",
            "CREATE INDEX IF NOT EXISTS idx_reports_status ON reports(status)",
            // 每个登记编号只有一份非修订报告
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_reports_primary_accession ON reports(accession_id) WHERE original_report_id IS NULL",
            // 每份报告至多一个修订后继
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_reports_original_report_id ON reports(original_report_id) WHERE original_report_id IS NOT NULL",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql)
                .execute(pool)
                .await
                .map_err(db_error)?;
        }

        tracing::info!("Database indexes created successfully");
        Ok(())
    }

    // ========== 患者相关操作 ==========

    /// 根据ID查找患者
    pub async fn get_patient_by_id(&self, id: Uuid) -> Result<Option<Patient>> {
        let row = sqlx::query_as::<_, DbPatient>("SELECT * FROM patients WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_error)?;

        row.map(Patient::try_from).transpose()
    }

    /// 根据登记编号查找患者
    pub async fn get_patient_by_accession(&self, accession_id: &str) -> Result<Option<Patient>> {
        let row = sqlx::query_as::<_, DbPatient>("SELECT * FROM patients WHERE accession_id = $1")
            .bind(accession_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_error)?;

        row.map(Patient::try_from).transpose()
    }

    /// 按过滤条件查询患者，最新登记在前
    pub async fn search_patients(&self, filter: &PatientFilter) -> Result<Vec<Patient>> {
        let mut query = QueryBuilder::<Postgres>::new("SELECT * FROM patients WHERE TRUE");

        if let Some(status) = filter.verification_status {
            query.push(" AND verification_status = ").push_bind(status.as_str());
        }
        if let Some(kind) = filter.investigation_type {
            query.push(" AND investigation_type = ").push_bind(enum_to_text(&kind)?);
        }
        if let Some(term) = filter.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let pattern = format!("%{}%", term);
            query
                .push(" AND (patient_name ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR accession_id ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR consultant_name ILIKE ")
                .push_bind(pattern)
                .push(")");
        }

        let (offset, limit) = page_bounds(filter.offset, filter.limit);
        query
            .push(" ORDER BY created_at DESC, accession_id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = query
            .build_query_as::<DbPatient>()
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_error)?;

        rows.into_iter().map(Patient::try_from).collect()
    }

    // ========== 送检医生相关操作 ==========

    pub async fn get_referring_doctor_by_id(&self, id: Uuid) -> Result<Option<ReferringDoctor>> {
        let row = sqlx::query_as::<_, DbReferringDoctor>("SELECT * FROM referring_doctors WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_error)?;

        Ok(row.map(ReferringDoctor::from))
    }

    /// 按姓名排序的送检医生列表
    pub async fn search_referring_doctors(&self, filter: &ReferringDoctorFilter) -> Result<Vec<ReferringDoctor>> {
        let mut query = QueryBuilder::<Postgres>::new("SELECT * FROM referring_doctors WHERE TRUE");
        if let Some(active) = filter.is_active {
            query.push(" AND is_active = ").push_bind(active);
        }
        query.push(" ORDER BY name, id");

        let rows = query
            .build_query_as::<DbReferringDoctor>()
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_error)?;

        Ok(rows.into_iter().map(ReferringDoctor::from).collect())
    }

    // ========== 报告相关操作 ==========

    /// 根据ID查找报告
    pub async fn get_report_by_id(&self, id: Uuid) -> Result<Option<Report>> {
        let row = sqlx::query_as::<_, DbReport>("SELECT * FROM reports WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_error)?;

        row.map(Report::try_from).transpose()
    }

    /// 查找修订后继
    pub async fn get_successor(&self, report_id: Uuid) -> Result<Option<Report>> {
        let row = sqlx::query_as::<_, DbReport>("SELECT * FROM reports WHERE original_report_id = $1")
            .bind(report_id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_error)?;

        row.map(Report::try_from).transpose()
    }

    /// 按过滤条件查询报告，最新创建在前
    pub async fn search_reports(&self, filter: &ReportFilter) -> Result<Vec<Report>> {
        let mut query = QueryBuilder::<Postgres>::new("SELECT * FROM reports WHERE TRUE");

        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(kind) = filter.report_type {
            query.push(" AND report_type = ").push_bind(enum_to_text(&kind)?);
        }
        if let Some(term) = filter.accession_id.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            query.push(" AND accession_id ILIKE ").push_bind(format!("%{}%", term));
        }

        let (offset, limit) = page_bounds(filter.offset, filter.limit);
        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = query
            .build_query_as::<DbReport>()
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_error)?;

        rows.into_iter().map(Report::try_from).collect()
    }

    // ========== 审计版本相关操作 ==========

    /// 报告的完整审计历史
    pub async fn get_versions(&self, report_id: Uuid) -> Result<Vec<ReportVersion>> {
        let rows = sqlx::query_as::<_, DbReportVersion>(
            "SELECT * FROM report_versions WHERE report_id = $1 ORDER BY version_number",
        )
        .bind(report_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)?;

        rows.into_iter().map(ReportVersion::try_from).collect()
    }
}
