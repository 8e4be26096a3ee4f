use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A MeldRx workspace record. Fields beyond the three the gateway relies on
/// are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    #[serde(rename = "wsIdentifier")]
    pub ws_identifier: String,
    /// Tax Identification Number.
    #[serde(default)]
    pub tin: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// How to pick a workspace out of the full list.
#[derive(Debug, Clone, Copy)]
pub enum WorkspaceKey<'a> {
    Identifier(&'a str),
    TaxId(&'a str),
}

impl WorkspaceKey<'_> {
    pub fn matches(&self, workspace: &Workspace) -> bool {
        match self {
            WorkspaceKey::Identifier(id) => workspace.ws_identifier == *id,
            WorkspaceKey::TaxId(tin) => workspace.tin == *tin,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            WorkspaceKey::Identifier(id) => format!("identifier {}", id),
            WorkspaceKey::TaxId(tin) => format!("TIN {}", tin),
        }
    }
}

/// A MeldRx patient record. Unknown fields pass through to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub date_of_birth: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insurance_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insurance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub medical_history: Vec<MedicalCondition>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Any part may be missing from a MeldRx record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_code: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicalCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosed_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What MeldRx hands back after accepting a clinical report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportReceipt {
    pub report_id: String,
    pub timestamp: String,
    pub status: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
