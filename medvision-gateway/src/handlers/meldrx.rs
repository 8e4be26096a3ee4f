//! MeldRx façade. Each handler fetches a broker token and makes one
//! Resource Client call.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use service_core::error::AppError;

use crate::error::Error;
use crate::AppState;

/// Query key that is lifted into the `MipsReportId-Context` header.
const MIPS_REPORT_ID_PARAM: &str = "mipsReportId";

pub async fn get_token(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let token = state
        .broker
        .get_valid_token()
        .await
        .map_err(|e| Error::from(e).into_app_error("Failed to get token"))?;

    Ok(Json(json!({ "success": true, "token": token })))
}

pub async fn list_workspaces(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let workspaces = async {
        let token = state.broker.get_valid_token().await?;
        state.meldrx.list_workspaces(&token).await
    }
    .await
    .map_err(|e| e.into_app_error("Failed to get workspaces"))?;

    Ok(Json(json!({ "success": true, "workspaces": workspaces })))
}

/// `GET /api/meldrx/patients`. All query parameters except `mipsReportId`
/// are forwarded to MeldRx unchanged.
pub async fn list_patients(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Value>, AppError> {
    let (mips, query): (Vec<_>, Vec<_>) = params
        .into_iter()
        .partition(|(key, _)| key == MIPS_REPORT_ID_PARAM);
    let mips_report_id = mips
        .into_iter()
        .map(|(_, value)| value)
        .find(|value| !value.is_empty());

    let patients = async {
        let token = state.broker.get_valid_token().await?;
        state
            .meldrx
            .list_patients(&token, mips_report_id.as_deref(), &query)
            .await
    }
    .await
    .map_err(|e| e.into_app_error("Failed to get patients"))?;

    Ok(Json(json!({ "success": true, "patients": patients })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientQuery {
    pub mips_report_id: Option<String>,
}

pub async fn get_patient(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
    Query(query): Query<PatientQuery>,
) -> Result<Json<Value>, AppError> {
    let mips_report_id = query.mips_report_id.filter(|id| !id.is_empty());

    let patient = async {
        let token = state.broker.get_valid_token().await?;
        state
            .meldrx
            .get_patient_by_id(&token, &patient_id, mips_report_id.as_deref())
            .await
    }
    .await
    .map_err(|e| e.into_app_error("Failed to get patient"))?;

    Ok(Json(json!({ "success": true, "patient": patient })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReportRequest {
    pub ws_identifier: Option<String>,
    pub report_data: Option<Value>,
}

impl SubmitReportRequest {
    /// Workspace identifier and payload, or the 400 the route answers with.
    pub fn validate(self) -> Result<(String, Value), AppError> {
        let ws_identifier = self
            .ws_identifier
            .filter(|ws| !ws.trim().is_empty())
            .ok_or_else(|| AppError::bad_request("Workspace identifier is required"))?;

        let report_data = self
            .report_data
            .filter(|data| !data.is_null())
            .ok_or_else(|| AppError::bad_request("Report data is required"))?;

        Ok((ws_identifier, report_data))
    }
}

pub async fn submit_report(
    State(state): State<AppState>,
    Json(payload): Json<SubmitReportRequest>,
) -> Result<Json<Value>, AppError> {
    let (ws_identifier, report_data) = payload.validate()?;

    let receipt = async {
        let token = state.broker.get_valid_token().await?;
        state
            .meldrx
            .submit_clinical_report(&token, &ws_identifier, &report_data)
            .await
    }
    .await
    .map_err(|e| e.into_app_error("Failed to submit clinical report"))?;

    Ok(Json(json!({
        "success": true,
        "result": {
            "reportId": receipt.report_id,
            "timestamp": receipt.timestamp,
            "status": receipt.status,
            "workspace": ws_identifier,
            "summary": "Report successfully submitted"
        }
    })))
}
