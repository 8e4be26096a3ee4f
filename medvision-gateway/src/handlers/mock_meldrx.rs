//! Canned MeldRx responses for front-end work without credentials.
//! Mounted under `/api/mock-meldrx` when `meldrx.mock_routes` is set.

use axum::{extract::Path, Json};
use chrono::{SecondsFormat, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Map, Value};
use service_core::error::AppError;

use super::meldrx::SubmitReportRequest;
use crate::models::{Address, MedicalCondition, Patient};

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

fn summary(id: &str, first_name: &str, last_name: &str, date_of_birth: &str) -> Patient {
    Patient {
        id: id.to_string(),
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
        date_of_birth: date_of_birth.to_string(),
        gender: None,
        address: None,
        phone_number: None,
        email: None,
        insurance_provider: None,
        insurance_id: None,
        medical_history: Vec::new(),
        extra: Map::new(),
    }
}

fn condition(name: &str, diagnosed_date: &str) -> MedicalCondition {
    MedicalCondition {
        condition: Some(name.to_string()),
        diagnosed_date: Some(diagnosed_date.to_string()),
        status: Some("Ongoing".to_string()),
        extra: Map::new(),
    }
}

fn mock_patients() -> Vec<Patient> {
    vec![
        summary("pat_12345", "John", "Doe", "1980-05-15"),
        summary("pat_67890", "Jane", "Smith", "1992-11-23"),
        summary("pat_24680", "Robert", "Johnson", "1975-08-30"),
    ]
}

/// Synthetic detail record. Unknown ids fall back to the third patient's
/// demographics.
pub fn mock_patient_detail(patient_id: &str) -> Patient {
    let (first_name, last_name, date_of_birth, gender) = match patient_id {
        "pat_12345" => ("John", "Doe", "1980-05-15", "Male"),
        "pat_67890" => ("Jane", "Smith", "1992-11-23", "Female"),
        _ => ("Robert", "Johnson", "1975-08-30", "Male"),
    };

    Patient {
        gender: Some(gender.to_string()),
        address: Some(Address {
            street: Some("123 Main St".to_string()),
            city: Some("Anytown".to_string()),
            state: Some("CA".to_string()),
            zip_code: Some("12345".to_string()),
            extra: Map::new(),
        }),
        phone_number: Some("555-123-4567".to_string()),
        email: Some(format!("{}@example.com", patient_id)),
        insurance_provider: Some("Health Insurance Co.".to_string()),
        insurance_id: Some(format!(
            "INS-{}",
            patient_id.get(4..).unwrap_or_default()
        )),
        medical_history: vec![
            condition("Hypertension", "2018-03-12"),
            condition("Seasonal Allergies", "2015-05-22"),
        ],
        ..summary(patient_id, first_name, last_name, date_of_birth)
    }
}

pub async fn get_token() -> Json<Value> {
    Json(json!({
        "success": true,
        "token": format!("mock_token_{}", random_suffix(13))
    }))
}

pub async fn list_workspaces() -> Json<Value> {
    Json(json!({
        "success": true,
        "workspaces": [
            { "wsIdentifier": "ws_123456", "name": "Test Clinic", "tin": "12-3456789" },
            { "wsIdentifier": "ws_789012", "name": "Demo Hospital", "tin": "98-7654321" }
        ]
    }))
}

pub async fn list_patients() -> Json<Value> {
    Json(json!({ "success": true, "patients": mock_patients() }))
}

pub async fn get_patient(Path(patient_id): Path<String>) -> Json<Value> {
    Json(json!({ "success": true, "patient": mock_patient_detail(&patient_id) }))
}

pub async fn submit_report(
    Json(payload): Json<SubmitReportRequest>,
) -> Result<Json<Value>, AppError> {
    let (ws_identifier, _) = payload.validate()?;

    Ok(Json(json!({
        "success": true,
        "result": {
            "reportId": format!("rep_{}", random_suffix(8)),
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "status": "submitted",
            "workspace": ws_identifier,
            "summary": "Report successfully submitted"
        }
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patient_detail_is_derived_from_id() {
        let jane = mock_patient_detail("pat_67890");
        assert_eq!(jane.first_name, "Jane");
        assert_eq!(jane.gender.as_deref(), Some("Female"));
        assert_eq!(jane.email.as_deref(), Some("pat_67890@example.com"));
        assert_eq!(jane.insurance_id.as_deref(), Some("INS-67890"));
        assert_eq!(jane.medical_history.len(), 2);

        let unknown = mock_patient_detail("x");
        assert_eq!(unknown.last_name, "Johnson");
        assert_eq!(unknown.insurance_id.as_deref(), Some("INS-"));
    }

    #[test]
    fn tokens_are_random() {
        assert_eq!(random_suffix(13).len(), 13);
        assert_ne!(random_suffix(13), random_suffix(13));
    }
}
