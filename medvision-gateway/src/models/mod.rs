pub mod meldrx;
pub mod triage;

pub use meldrx::{Address, MedicalCondition, Patient, ReportReceipt, Workspace, WorkspaceKey};
pub use triage::{SessionState, TriageMode};
