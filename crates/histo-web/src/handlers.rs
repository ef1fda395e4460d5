//! HTTP处理器

use crate::error::ApiError;
use crate::extract::{ApiJson, ApiPath, ApiQuery, OptionalJson};
use crate::server::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use histo_core::{
    Actor, ContentPatch, Demographics, InvestigationType, NewReferringDoctor, PatientFilter,
    ReferringDoctorFilter, ReferringDoctorPatch, ReportContent, ReportFilter, ReportStatus,
    VerificationStatus,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

type ApiResult<T> = Result<T, ApiError>;

/// API根路径处理器
pub async fn api_root() -> impl IntoResponse {
    Json(json!({
        "service": "Histopathology Report API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "/health",
            "api": "/api/v1"
        }
    }))
}

/// 健康检查处理器
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

// ========== 请求参数 ==========

/// 患者查询参数
#[derive(Debug, Deserialize)]
pub struct PatientQueryParams {
    pub verification_status: Option<VerificationStatus>,
    pub investigation_type: Option<InvestigationType>,
    pub search: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// 报告查询参数
#[derive(Debug, Deserialize)]
pub struct ReportQueryParams {
    pub status: Option<ReportStatus>,
    pub report_type: Option<InvestigationType>,
    pub accession_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// 送检医生查询参数，默认只返回在用的医生
#[derive(Debug, Deserialize)]
pub struct ReferringDoctorQueryParams {
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct VerifyRequest {
    pub notes: Option<String>,
}

/// 驳回、退回、修订都需要原因
#[derive(Debug, Default, Deserialize)]
pub struct ReasonRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateReportRequest {
    pub accession_id: String,
    #[serde(default)]
    pub content: ReportContent,
}

#[derive(Debug, Deserialize)]
pub struct EditReportRequest {
    #[serde(default)]
    pub content: ContentPatch,
    pub reason: Option<String>,
}

// ========== 患者 ==========

/// 登记患者
pub async fn register_patient(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ApiJson(demographics): ApiJson<Demographics>,
) -> ApiResult<impl IntoResponse> {
    let patient = state.engine.register_patient(&actor, demographics).await?;
    Ok((StatusCode::CREATED, Json(patient)))
}

/// 患者查询处理器
pub async fn list_patients(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<PatientQueryParams>,
) -> ApiResult<impl IntoResponse> {
    info!("Getting patients with query: {:?}", params);

    let (offset, limit) = state.engine.settings().page(params.offset, params.limit);
    let filter = PatientFilter {
        verification_status: params.verification_status,
        investigation_type: params.investigation_type,
        search: params.search,
        offset: Some(offset),
        limit: Some(limit),
    };
    let patients = state.engine.list_patients(&filter).await?;

    Ok(Json(json!({
        "count": patients.len(),
        "patients": patients,
        "offset": offset,
        "limit": limit
    })))
}

pub async fn get_patient(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.get_patient(id).await?))
}

pub async fn get_patient_by_accession(
    State(state): State<AppState>,
    ApiPath(accession_id): ApiPath<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.get_patient_by_accession(&accession_id).await?))
}

pub async fn verify_patient(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ApiPath(id): ApiPath<Uuid>,
    OptionalJson(body): OptionalJson<VerifyRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.verify_patient(id, &actor, body.notes).await?))
}

pub async fn reject_patient(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ApiPath(id): ApiPath<Uuid>,
    OptionalJson(body): OptionalJson<ReasonRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.reject_patient(id, &actor, &body.reason).await?))
}

// ========== 送检医生 ==========

pub async fn add_referring_doctor(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ApiJson(input): ApiJson<NewReferringDoctor>,
) -> ApiResult<impl IntoResponse> {
    let doctor = state.engine.add_referring_doctor(&actor, input).await?;
    Ok((StatusCode::CREATED, Json(doctor)))
}

pub async fn list_referring_doctors(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<ReferringDoctorQueryParams>,
) -> ApiResult<impl IntoResponse> {
    let filter = ReferringDoctorFilter {
        is_active: Some(params.is_active.unwrap_or(true)),
    };
    Ok(Json(state.engine.list_referring_doctors(&filter).await?))
}

pub async fn update_referring_doctor(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(patch): ApiJson<ReferringDoctorPatch>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.update_referring_doctor(id, &actor, &patch).await?))
}

/// 软删除
pub async fn remove_referring_doctor(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.engine.deactivate_referring_doctor(id, &actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ========== 报告 ==========

pub async fn create_report(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ApiJson(body): ApiJson<CreateReportRequest>,
) -> ApiResult<impl IntoResponse> {
    let report = state
        .engine
        .create_report(&actor, &body.accession_id, body.content)
        .await?;
    Ok((StatusCode::CREATED, Json(report)))
}

/// 报告查询处理器
pub async fn list_reports(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<ReportQueryParams>,
) -> ApiResult<impl IntoResponse> {
    info!("Getting reports with query: {:?}", params);

    let (offset, limit) = state.engine.settings().page(params.offset, params.limit);
    let filter = ReportFilter {
        status: params.status,
        report_type: params.report_type,
        accession_id: params.accession_id,
        offset: Some(offset),
        limit: Some(limit),
    };
    let reports = state.engine.list_reports(&filter).await?;

    Ok(Json(json!({
        "count": reports.len(),
        "reports": reports,
        "offset": offset,
        "limit": limit
    })))
}

pub async fn list_patient_reports(
    State(state): State<AppState>,
    ApiPath(accession_id): ApiPath<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_patient_reports(&accession_id).await?))
}

pub async fn get_report(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.get_report(id).await?))
}

pub async fn edit_report(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<EditReportRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .engine
            .edit_report(id, &actor, &body.content, body.reason)
            .await?,
    ))
}

pub async fn discard_report(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.engine.discard_report(id, &actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn submit_report(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.submit_report(id, &actor).await?))
}

pub async fn approve_report(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.approve_report(id, &actor).await?))
}

pub async fn reject_report(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ApiPath(id): ApiPath<Uuid>,
    OptionalJson(body): OptionalJson<ReasonRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.reject_report(id, &actor, &body.reason).await?))
}

pub async fn sign_report(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.sign_report(id, &actor).await?))
}

pub async fn publish_report(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.publish_report(id, &actor).await?))
}

pub async fn amend_report(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    ApiPath(id): ApiPath<Uuid>,
    OptionalJson(body): OptionalJson<ReasonRequest>,
) -> ApiResult<impl IntoResponse> {
    let report = state.engine.amend_report(id, &actor, &body.reason).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

pub async fn list_versions(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_versions(id).await?))
}

pub async fn amendment_chain(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.amendment_chain(id).await?))
}
