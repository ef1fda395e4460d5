//! 核心数据模型定义

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::HistoError;

// ========== 操作者与角色 ==========

/// 用户角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    /// 管理员 - 负责核对患者信息与审核报告
    Admin,
    /// 病理医生 - 撰写、签署、发布报告
    Doctor,
}

impl UserRole {
    /// 角色是否具备某项能力
    pub fn has(&self, capability: Capability) -> bool {
        capability.roles().contains(self)
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRole::Admin => write!(f, "admin"),
            UserRole::Doctor => write!(f, "doctor"),
        }
    }
}

impl FromStr for UserRole {
    type Err = HistoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(UserRole::Admin),
            "doctor" => Ok(UserRole::Doctor),
            other => Err(HistoError::Validation(format!("unknown role '{}'", other))),
        }
    }
}

/// 工作流能力
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// 登记患者
    Intake,
    /// 核对/审核 (患者核对、报告审核与退回)
    Verifier,
    /// 报告撰写者 (创建、提交、丢弃草稿)
    Creator,
    /// 编辑报告内容
    Editor,
    /// 签署人 (签署、发布、修订)
    Signer,
}

impl Capability {
    /// 拥有该能力的角色
    pub fn roles(&self) -> &'static [UserRole] {
        match self {
            Capability::Intake | Capability::Editor => &[UserRole::Admin, UserRole::Doctor],
            Capability::Verifier => &[UserRole::Admin],
            Capability::Creator | Capability::Signer => &[UserRole::Doctor],
        }
    }
}

/// 已认证的操作者，每次引擎调用都显式传入
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: UserRole,
}

impl Actor {
    pub fn new(user_id: Uuid, role: UserRole) -> Self {
        Self { user_id, role }
    }

    pub fn admin(user_id: Uuid) -> Self {
        Self::new(user_id, UserRole::Admin)
    }

    pub fn doctor(user_id: Uuid) -> Self {
        Self::new(user_id, UserRole::Doctor)
    }

    /// 检查能力，不满足时返回 Forbidden
    pub fn require(&self, capability: Capability, action: &str) -> Result<(), HistoError> {
        if self.role.has(capability) {
            Ok(())
        } else {
            Err(HistoError::Forbidden {
                role: self.role,
                action: action.to_string(),
                required: capability.roles().to_vec(),
            })
        }
    }
}

// ========== 患者 ==========

/// 性别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Sex {
    Male,
    Female,
    Other,
}

/// 年龄单位
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgeUnit {
    #[default]
    Years,
    Months,
    Days,
}

/// 检查类型 (组织病理 / 细胞病理)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationType {
    #[default]
    Histopathology,
    Cytopathology,
}

/// 患者核对状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,  // 待核对
    Verified, // 已核对
    Rejected, // 已驳回
}

/// 患者登记记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Patient {
    pub id: Uuid,
    pub accession_id: String, // 登记编号 PREFIX-YYYY-NNNN，不可变
    pub demographics: Demographics,
    pub verification_status: VerificationStatus,
    pub verified_by: Option<Uuid>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verification_notes: Option<String>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 患者人口学与送检信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Demographics {
    pub patient_name: String,
    pub age: u16,
    #[serde(default)]
    pub age_unit: AgeUnit,
    pub sex: Sex,
    pub receive_date: NaiveDate,
    pub reporting_date: Option<NaiveDate>,
    pub consultant_name: Option<String>,
    pub consultant_designation: Option<String>,
    /// 从送检医生目录选择时记录其ID，登记时补全医生姓名与职称
    #[serde(default)]
    pub referring_doctor_id: Option<Uuid>,
    #[serde(default)]
    pub investigation_type: InvestigationType,
    pub clinical_information: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
}

impl Demographics {
    pub const MAX_NAME_LEN: usize = 255;
    pub const MAX_AGE: u16 = 150;

    /// 登记信息校验
    pub fn validate(&self) -> Result<(), HistoError> {
        let name = self.patient_name.trim();
        if name.is_empty() {
            return Err(HistoError::Validation("patient name is required".to_string()));
        }
        if name.chars().count() > Self::MAX_NAME_LEN {
            return Err(HistoError::Validation(format!(
                "patient name exceeds {} characters",
                Self::MAX_NAME_LEN
            )));
        }
        if self.age > Self::MAX_AGE {
            return Err(HistoError::Validation(format!(
                "age {} exceeds {}",
                self.age,
                Self::MAX_AGE
            )));
        }
        Ok(())
    }
}

/// 患者查询过滤器
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientFilter {
    pub verification_status: Option<VerificationStatus>,
    pub investigation_type: Option<InvestigationType>,
    pub search: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl Default for PatientFilter {
    fn default() -> Self {
        Self {
            verification_status: None,
            investigation_type: None,
            search: None,
            offset: Some(0),
            limit: Some(50),
        }
    }
}

impl PatientFilter {
    /// 内存过滤使用的匹配规则，与数据库查询保持一致
    pub fn matches(&self, patient: &Patient) -> bool {
        if let Some(status) = self.verification_status {
            if patient.verification_status != status {
                return false;
            }
        }
        if let Some(kind) = self.investigation_type {
            if patient.demographics.investigation_type != kind {
                return false;
            }
        }
        if let Some(term) = self.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let term = term.to_lowercase();
            let hit = patient.demographics.patient_name.to_lowercase().contains(&term)
                || patient.accession_id.to_lowercase().contains(&term)
                || patient
                    .demographics
                    .consultant_name
                    .as_deref()
                    .map(|c| c.to_lowercase().contains(&term))
                    .unwrap_or(false);
            if !hit {
                return false;
            }
        }
        true
    }
}

// ========== 送检医生 ==========

/// 送检医生目录条目，登记患者时可直接选用
///
/// 删除只是停用 (`is_active = false`)，历史登记仍保留医生姓名。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReferringDoctor {
    pub id: Uuid,
    pub name: String,
    pub designation: Option<String>, // MBBS, FCPS 等
    pub hospital: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 新增送检医生
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewReferringDoctor {
    pub name: String,
    pub designation: Option<String>,
    pub hospital: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl NewReferringDoctor {
    pub fn validate(&self) -> Result<(), HistoError> {
        validate_doctor_name(&self.name)
    }
}

/// 送检医生的部分更新
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ReferringDoctorPatch {
    pub name: Option<String>,
    pub designation: Option<String>,
    pub hospital: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub is_active: Option<bool>,
}

impl ReferringDoctorPatch {
    pub fn is_empty(&self) -> bool {
        self == &ReferringDoctorPatch::default()
    }

    pub fn apply_to(&self, doctor: &mut ReferringDoctor) -> Result<(), HistoError> {
        if let Some(name) = &self.name {
            validate_doctor_name(name)?;
            doctor.name = name.trim().to_string();
        }
        for (target, value) in [
            (&mut doctor.designation, &self.designation),
            (&mut doctor.hospital, &self.hospital),
            (&mut doctor.phone, &self.phone),
            (&mut doctor.email, &self.email),
        ] {
            if let Some(v) = value {
                *target = Some(v.clone());
            }
        }
        if let Some(active) = self.is_active {
            doctor.is_active = active;
        }
        Ok(())
    }
}

fn validate_doctor_name(name: &str) -> Result<(), HistoError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(HistoError::Validation("referring doctor name is required".to_string()));
    }
    if name.chars().count() > Demographics::MAX_NAME_LEN {
        return Err(HistoError::Validation(format!(
            "referring doctor name exceeds {} characters",
            Demographics::MAX_NAME_LEN
        )));
    }
    Ok(())
}

/// 送检医生查询过滤器，`is_active` 为空时返回全部
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferringDoctorFilter {
    pub is_active: Option<bool>,
}

impl ReferringDoctorFilter {
    pub fn active() -> Self {
        Self { is_active: Some(true) }
    }

    pub fn matches(&self, doctor: &ReferringDoctor) -> bool {
        self.is_active.map_or(true, |active| doctor.is_active == active)
    }
}

// ========== 报告 ==========

/// 报告状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Draft,               // 草稿
    PendingVerification, // 待审核
    Verified,            // 已审核
    Signed,              // 已签署
    Published,           // 已发布
    Amended,             // 已修订 (历史数据保留)
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Draft => "draft",
            ReportStatus::PendingVerification => "pending_verification",
            ReportStatus::Verified => "verified",
            ReportStatus::Signed => "signed",
            ReportStatus::Published => "published",
            ReportStatus::Amended => "amended",
        }
    }

    /// 内容字段仅在草稿和待审核状态下可编辑
    pub fn is_editable(&self) -> bool {
        matches!(self, ReportStatus::Draft | ReportStatus::PendingVerification)
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportStatus {
    type Err = HistoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(ReportStatus::Draft),
            "pending_verification" => Ok(ReportStatus::PendingVerification),
            "verified" => Ok(ReportStatus::Verified),
            "signed" => Ok(ReportStatus::Signed),
            "published" => Ok(ReportStatus::Published),
            "amended" => Ok(ReportStatus::Amended),
            other => Err(HistoError::Validation(format!("unknown report status '{}'", other))),
        }
    }
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationStatus {
    type Err = HistoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VerificationStatus::Pending),
            "verified" => Ok(VerificationStatus::Verified),
            "rejected" => Ok(VerificationStatus::Rejected),
            other => Err(HistoError::Validation(format!(
                "unknown verification status '{}'",
                other
            ))),
        }
    }
}

/// 报告临床内容，工作流引擎不解释其含义
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ReportContent {
    #[serde(default)]
    pub report_type: InvestigationType,
    pub specimen: Option<String>,
    pub gross_examination: Option<String>,
    pub microscopic_examination: Option<String>,
    pub diagnosis: Option<String>,
    pub icd_code: Option<String>,
    pub special_stains: Option<String>,
    pub immunohistochemistry: Option<String>,
    pub comments: Option<String>,
    #[serde(default)]
    pub ai_assisted: bool,
}

/// 报告内容的部分更新
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContentPatch {
    pub report_type: Option<InvestigationType>,
    pub specimen: Option<String>,
    pub gross_examination: Option<String>,
    pub microscopic_examination: Option<String>,
    pub diagnosis: Option<String>,
    pub icd_code: Option<String>,
    pub special_stains: Option<String>,
    pub immunohistochemistry: Option<String>,
    pub comments: Option<String>,
    pub ai_assisted: Option<bool>,
}

impl ContentPatch {
    pub fn is_empty(&self) -> bool {
        self == &ContentPatch::default()
    }

    /// 将补丁应用到内容上
    pub fn apply_to(&self, content: &mut ReportContent) {
        fn set(target: &mut Option<String>, value: &Option<String>) {
            if let Some(v) = value {
                *target = Some(v.clone());
            }
        }

        if let Some(kind) = self.report_type {
            content.report_type = kind;
        }
        set(&mut content.specimen, &self.specimen);
        set(&mut content.gross_examination, &self.gross_examination);
        set(&mut content.microscopic_examination, &self.microscopic_examination);
        set(&mut content.diagnosis, &self.diagnosis);
        set(&mut content.icd_code, &self.icd_code);
        set(&mut content.special_stains, &self.special_stains);
        set(&mut content.immunohistochemistry, &self.immunohistochemistry);
        set(&mut content.comments, &self.comments);
        if let Some(flag) = self.ai_assisted {
            content.ai_assisted = flag;
        }
    }
}

/// 病理报告记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub id: Uuid,
    pub accession_id: String, // 患者登记编号，创建后不可变
    pub content: ReportContent,
    pub status: ReportStatus,
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
    pub original_report_id: Option<Uuid>, // 仅修订报告指向其直接前驱
    pub revision: u32,                    // 当前版本号，等于审计记录条数
}

/// 报告查询过滤器
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportFilter {
    pub status: Option<ReportStatus>,
    pub report_type: Option<InvestigationType>,
    pub accession_id: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl Default for ReportFilter {
    fn default() -> Self {
        Self {
            status: None,
            report_type: None,
            accession_id: None,
            offset: Some(0),
            limit: Some(50),
        }
    }
}

impl ReportFilter {
    pub fn matches(&self, report: &Report) -> bool {
        if let Some(status) = self.status {
            if report.status != status {
                return false;
            }
        }
        if let Some(kind) = self.report_type {
            if report.content.report_type != kind {
                return false;
            }
        }
        if let Some(term) = self.accession_id.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            if !report.accession_id.to_lowercase().contains(&term.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

// ========== 审计版本 ==========

/// 变更后的报告完整快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportSnapshot {
    pub status: ReportStatus,
    pub content: ReportContent,
    pub verified_by: Option<Uuid>,
    pub signed_by: Option<Uuid>,
    pub published_at: Option<DateTime<Utc>>,
}

impl From<&Report> for ReportSnapshot {
    fn from(report: &Report) -> Self {
        Self {
            status: report.status,
            content: report.content.clone(),
            verified_by: report.verified_by,
            signed_by: report.signed_by,
            published_at: report.published_at,
        }
    }
}

/// 审计版本记录，写入后不可修改
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportVersion {
    pub report_id: Uuid,
    pub version_number: u32,
    pub snapshot: ReportSnapshot,
    pub changed_by: Uuid,
    pub change_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}
