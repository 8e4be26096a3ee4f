//! MeldRx resource API client.
//!
//! Every call takes a bearer token from [`TokenBroker`] and issues exactly one
//! request. Workspace lookups fetch the full collection and filter locally;
//! MeldRx has no lookup-by-field endpoint.

use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use service_core::observability::TracedClientExt;

use crate::config::MeldRxSettings;
use crate::error::Error;
use crate::models::{Patient, ReportReceipt, Workspace, WorkspaceKey};
use crate::services::token_broker::TokenBroker;

/// Header carrying the optional MIPS report scope on patient queries.
pub const MIPS_REPORT_CONTEXT_HEADER: &str = "MipsReportId-Context";

#[derive(Clone)]
pub struct MeldRxClient {
    client: Client,
    base_url: String,
}

impl MeldRxClient {
    pub fn new(settings: &MeldRxSettings) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(settings.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Base URL plus `segments`, each percent-encoded as a single path
    /// segment so caller-supplied ids cannot change the route or query.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, Error> {
        let invalid = || Error::Network(format!("Invalid MeldRx base URL: {}", self.base_url));

        let mut url = Url::parse(&self.base_url).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn list_workspaces(&self, token: &str) -> Result<Vec<Workspace>, Error> {
        let url = self.endpoint(&["api", "workspaces", "records"])?;

        let response = self
            .client
            .traced_get(url.as_str())
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Error getting workspace details");
                Error::from_reqwest(e)
            })?;

        read_json(response, "Failed to get workspace details").await
    }

    pub async fn find_workspace_by(
        &self,
        key: WorkspaceKey<'_>,
        token: &str,
    ) -> Result<Workspace, Error> {
        let workspaces = self.list_workspaces(token).await?;

        workspaces
            .into_iter()
            .find(|ws| key.matches(ws))
            .ok_or_else(|| {
                let msg = format!("Workspace with {} not found", key.describe());
                tracing::warn!("{}", msg);
                Error::NotFound(msg)
            })
    }

    /// `query` is forwarded verbatim; `mips_report_id` travels only in the
    /// context header.
    pub async fn list_patients(
        &self,
        token: &str,
        mips_report_id: Option<&str>,
        query: &[(String, String)],
    ) -> Result<Vec<Patient>, Error> {
        let url = self.endpoint(&["patients"])?;

        let mut request = self
            .client
            .traced_get(url.as_str())
            .bearer_auth(token)
            .query(query);
        if let Some(id) = mips_report_id {
            request = request.header(MIPS_REPORT_CONTEXT_HEADER, id);
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "Error getting patients");
            Error::from_reqwest(e)
        })?;

        read_json(response, "Failed to get patients").await
    }

    pub async fn get_patient_by_id(
        &self,
        token: &str,
        patient_id: &str,
        mips_report_id: Option<&str>,
    ) -> Result<Patient, Error> {
        let patient_id = path_segment(patient_id, "Patient ID")?;
        let url = self.endpoint(&["patients", patient_id])?;

        let mut request = self.client.traced_get(url.as_str()).bearer_auth(token);
        if let Some(id) = mips_report_id {
            request = request.header(MIPS_REPORT_CONTEXT_HEADER, id);
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(patient_id = %patient_id, error = %e, "Error getting patient by ID");
            Error::from_reqwest(e)
        })?;

        read_json(response, "Failed to get patient by ID").await
    }

    /// Submit an opaque report payload to a workspace. An empty workspace
    /// identifier or a null payload is rejected before any request is made.
    pub async fn submit_clinical_report(
        &self,
        token: &str,
        ws_identifier: &str,
        report: &Value,
    ) -> Result<ReportReceipt, Error> {
        let ws_identifier = path_segment(ws_identifier, "Workspace identifier")?;
        if report.is_null() {
            return Err(Error::Validation("Report data is required".to_string()));
        }

        let url = self.endpoint(&["api", "workspaces", ws_identifier, "reports"])?;

        let response = self
            .client
            .traced_post(url.as_str())
            .bearer_auth(token)
            .json(report)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(ws_identifier = %ws_identifier, error = %e, "Error submitting clinical report");
                Error::from_reqwest(e)
            })?;

        let receipt: ReportReceipt = read_json(response, "Failed to submit clinical report").await?;
        tracing::info!(
            ws_identifier = %ws_identifier,
            report_id = %receipt.report_id,
            status = %receipt.status,
            "Clinical report submitted"
        );
        Ok(receipt)
    }

    /// Check that credentials work end to end and log which workspaces are
    /// visible. Identifiers and names only; full records stay out of the logs.
    pub async fn verify_connection(&self, broker: &TokenBroker) -> bool {
        tracing::info!("Initializing MeldRx connection...");

        let result = async {
            let token = broker.get_valid_token().await?;
            self.list_workspaces(&token).await
        }
        .await;

        match result {
            Ok(workspaces) => {
                tracing::info!(
                    count = workspaces.len(),
                    "Successfully connected to MeldRx"
                );
                for (index, ws) in workspaces.iter().enumerate() {
                    tracing::info!(
                        index = index + 1,
                        ws_identifier = %ws.ws_identifier,
                        name = %ws.name,
                        "Workspace"
                    );
                }
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to initialize MeldRx connection");
                false
            }
        }
    }
}

/// An id that will become one path segment. Dot segments would be
/// normalized away by URL parsing, so they are rejected along with blanks.
fn path_segment<'a>(value: &'a str, what: &str) -> Result<&'a str, Error> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation(format!("{} is required", what)));
    }
    if trimmed == "." || trimmed == ".." {
        return Err(Error::Validation(format!("Invalid {}: {}", what, value)));
    }
    Ok(value)
}

async fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, Error> {
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = %status, body = %body, "{}", what);
        return Err(Error::Resource {
            status: status.as_u16(),
            body,
        });
    }

    let body = response.text().await.map_err(Error::from_reqwest)?;
    serde_json::from_str(&body).map_err(|e| {
        tracing::error!(error = %e, "{}: unexpected response body", what);
        Error::Decode(e.to_string())
    })
}
