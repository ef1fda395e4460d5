//! 数据库模型

use chrono::{DateTime, NaiveDate, Utc};
use histo_core::{
    Demographics, HistoError, Patient, ReferringDoctor, Report, ReportContent, ReportSnapshot,
    ReportVersion, Result,
};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

// 数据库表模型 - 使用FromRow trait用于SQL查询
// 枚举统一以 snake_case 文本存储，与API中的表示一致

/// 数据库患者表
#[derive(Debug, FromRow)]
pub struct DbPatient {
    pub id: Uuid,
    pub accession_id: String,
    pub patient_name: String,
    pub age: i32,
    pub age_unit: String,
    pub sex: String,
    pub receive_date: NaiveDate,
    pub reporting_date: Option<NaiveDate>,
    pub consultant_name: Option<String>,
    pub consultant_designation: Option<String>,
    pub referring_doctor_id: Option<Uuid>,
    pub investigation_type: String,
    pub clinical_information: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub verification_status: String,
    pub verified_by: Option<Uuid>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verification_notes: Option<String>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbPatient> for Patient {
    type Error = HistoError;

    fn try_from(row: DbPatient) -> Result<Self> {
        let age = u16::try_from(row.age)
            .map_err(|_| HistoError::Database(format!("invalid age {} for patient {}", row.age, row.id)))?;

        Ok(Patient {
            id: row.id,
            accession_id: row.accession_id,
            demographics: Demographics {
                patient_name: row.patient_name,
                age,
                age_unit: enum_from_text("age_unit", &row.age_unit)?,
                sex: enum_from_text("sex", &row.sex)?,
                receive_date: row.receive_date,
                reporting_date: row.reporting_date,
                consultant_name: row.consultant_name,
                consultant_designation: row.consultant_designation,
                referring_doctor_id: row.referring_doctor_id,
                investigation_type: enum_from_text("investigation_type", &row.investigation_type)?,
                clinical_information: row.clinical_information,
                phone: row.phone,
                email: row.email,
                address: row.address,
            },
            verification_status: row.verification_status.parse()?,
            verified_by: row.verified_by,
            verified_at: row.verified_at,
            verification_notes: row.verification_notes,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// 数据库送检医生表
#[derive(Debug, FromRow)]
pub struct DbReferringDoctor {
    pub id: Uuid,
    pub name: String,
    pub designation: Option<String>,
    pub hospital: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DbReferringDoctor> for ReferringDoctor {
    fn from(row: DbReferringDoctor) -> Self {
        ReferringDoctor {
            id: row.id,
            name: row.name,
            designation: row.designation,
            hospital: row.hospital,
            phone: row.phone,
            email: row.email,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// 数据库报告表
///
/// `report_type` 列冗余保存内容中的报告类型，仅用于过滤。
#[derive(Debug, FromRow)]
pub struct DbReport {
    pub id: Uuid,
    pub accession_id: String,
    pub report_type: String,
    pub content: Json<ReportContent>,
    pub status: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub verified_by: Option<Uuid>,
    pub verified_at: Option<DateTime<Utc>>,
    pub signed_by: Option<Uuid>,
    pub signed_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub is_amended: bool,
    pub amendment_reason: Option<String>,
    pub original_report_id: Option<Uuid>,
    pub revision: i32,
}

impl TryFrom<DbReport> for Report {
    type Error = HistoError;

    fn try_from(row: DbReport) -> Result<Self> {
        Ok(Report {
            id: row.id,
            accession_id: row.accession_id,
            content: row.content.0,
            status: row.status.parse()?,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
            verified_by: row.verified_by,
            verified_at: row.verified_at,
            signed_by: row.signed_by,
            signed_at: row.signed_at,
            published_at: row.published_at,
            is_amended: row.is_amended,
            amendment_reason: row.amendment_reason,
            original_report_id: row.original_report_id,
            revision: to_u32("revision", row.revision)?,
        })
    }
}

/// 数据库审计版本表
#[derive(Debug, FromRow)]
pub struct DbReportVersion {
    pub report_id: Uuid,
    pub version_number: i32,
    pub snapshot: Json<ReportSnapshot>,
    pub changed_by: Uuid,
    pub change_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbReportVersion> for ReportVersion {
    type Error = HistoError;

    fn try_from(row: DbReportVersion) -> Result<Self> {
        Ok(ReportVersion {
            report_id: row.report_id,
            version_number: to_u32("version_number", row.version_number)?,
            snapshot: row.snapshot.0,
            changed_by: row.changed_by,
            change_reason: row.change_reason,
            created_at: row.created_at,
        })
    }
}

/// 枚举转为存储文本
pub fn enum_to_text<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(text) => Ok(text),
        other => Err(HistoError::Internal(format!("expected a unit variant, got {}", other))),
    }
}

/// 存储文本转为枚举
pub fn enum_from_text<T: DeserializeOwned>(column: &str, text: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(text.to_string()))
        .map_err(|_| HistoError::Database(format!("unexpected value '{}' in column {}", text, column)))
}

/// 计数类字段以 INTEGER 存储
pub(crate) fn to_i32(column: &str, value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| HistoError::Database(format!("{} {} out of range", column, value)))
}

fn to_u32(column: &str, value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|_| HistoError::Database(format!("negative {} {}", column, value)))
}
