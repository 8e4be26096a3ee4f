mod common;

use common::{meldrx_settings, mount_meldrx_token, workspaces_body, TEST_TOKEN};
use medvision_gateway::error::{Error, TIMEOUT_MESSAGE};
use medvision_gateway::models::WorkspaceKey;
use medvision_gateway::services::meldrx::MIPS_REPORT_CONTEXT_HEADER;
use medvision_gateway::services::{MeldRxClient, TokenBroker};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> MeldRxClient {
    MeldRxClient::new(&meldrx_settings(&server.uri())).unwrap()
}

async fn mount_workspaces(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/workspaces/records"))
        .and(header("authorization", format!("Bearer {}", TEST_TOKEN).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(workspaces_body()))
        .mount(server)
        .await;
}

#[tokio::test]
async fn finds_workspace_by_identifier_and_tin() {
    let server = MockServer::start().await;
    mount_workspaces(&server).await;
    let client = client_for(&server);

    let by_id = client
        .find_workspace_by(WorkspaceKey::Identifier("ws_2"), TEST_TOKEN)
        .await
        .unwrap();
    assert_eq!(by_id.name, "Demo Hospital");

    let by_tin = client
        .find_workspace_by(WorkspaceKey::TaxId("12-3456789"), TEST_TOKEN)
        .await
        .unwrap();
    assert_eq!(by_tin.ws_identifier, "ws_1");
}

#[tokio::test]
async fn unknown_workspace_is_not_found() {
    let server = MockServer::start().await;
    mount_workspaces(&server).await;
    let client = client_for(&server);

    let err = client
        .find_workspace_by(WorkspaceKey::Identifier("ws_9"), TEST_TOKEN)
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert_eq!(err.to_string(), "Workspace with identifier ws_9 not found");
}

#[tokio::test]
async fn workspace_listing_failure_carries_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/workspaces/records"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .list_workspaces(TEST_TOKEN)
        .await
        .unwrap_err();

    match err {
        Error::Resource { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "maintenance");
        }
        other => panic!("expected resource error, got {:?}", other),
    }
}

#[tokio::test]
async fn mips_report_id_travels_only_as_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/patients"))
        .and(header(MIPS_REPORT_CONTEXT_HEADER, "mips-42"))
        .and(query_param("lastName", "Doe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "pat_12345", "firstName": "John", "lastName": "Doe", "dateOfBirth": "1980-05-15" }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let query = vec![("lastName".to_string(), "Doe".to_string())];
    let patients = client_for(&server)
        .list_patients(TEST_TOKEN, Some("mips-42"), &query)
        .await
        .unwrap();

    assert_eq!(patients.len(), 1);
    assert_eq!(patients[0].id, "pat_12345");

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0]
        .url
        .query_pairs()
        .all(|(key, _)| key != "mipsReportId"));
}

#[tokio::test]
async fn missing_patient_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/patients/pat_missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such patient"))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .get_patient_by_id(TEST_TOKEN, "pat_missing", None)
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert!(matches!(err, Error::Resource { status: 404, .. }));
}

#[tokio::test]
async fn patient_id_stays_inside_its_path_segment() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/workspaces/records"))
        .respond_with(ResponseTemplate::new(200).set_body_json(workspaces_body()))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/patients/..%2Fapi%2Fworkspaces%2Frecords"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such patient"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/patients/pat_1%3Fadmin=true"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such patient"))
        .expect(1)
        .mount(&server)
        .await;
    let client = client_for(&server);

    let traversal = client
        .get_patient_by_id(TEST_TOKEN, "../api/workspaces/records", None)
        .await
        .unwrap_err();
    assert!(traversal.is_not_found());

    let smuggled_query = client
        .get_patient_by_id(TEST_TOKEN, "pat_1?admin=true", None)
        .await
        .unwrap_err();
    assert!(smuggled_query.is_not_found());

    let requests = server.received_requests().await.unwrap();
    assert!(requests.iter().all(|r| r.url.query().is_none()));
}

#[tokio::test]
async fn dot_segment_ids_are_rejected_without_a_request() {
    let server = MockServer::start().await;
    Mock::given(wiremock::matchers::any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let client = client_for(&server);

    for id in ["..", ".", " "] {
        let err = client.get_patient_by_id(TEST_TOKEN, id, None).await;
        assert!(matches!(err, Err(Error::Validation(_))), "id {:?}", id);
    }

    let err = client
        .submit_clinical_report(TEST_TOKEN, "..", &json!({ "a": 1 }))
        .await;
    assert!(matches!(err, Err(Error::Validation(_))));
}

#[tokio::test]
async fn workspace_identifier_is_encoded_as_one_segment() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/workspaces/ws_1%2F..%2F..%2Fpatients/reports"))
        .respond_with(ResponseTemplate::new(404).set_body_string("unknown workspace"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client_for(&server)
        .submit_clinical_report(TEST_TOKEN, "ws_1/../../patients", &json!({ "a": 1 }))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Resource { status: 404, .. }));
}

#[tokio::test]
async fn partial_patient_records_are_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/patients"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "id": "pat_1",
                "firstName": "Ada",
                "address": { "city": "Springfield" },
                "mrn": "MRN-0001"
            }
        ])))
        .mount(&server)
        .await;

    let patients = client_for(&server)
        .list_patients(TEST_TOKEN, None, &[])
        .await
        .unwrap();

    let address = patients[0].address.as_ref().unwrap();
    assert_eq!(address.city.as_deref(), Some("Springfield"));
    assert!(address.zip_code.is_none());
    assert_eq!(patients[0].extra["mrn"], "MRN-0001");
}

#[tokio::test]
async fn resource_calls_honor_the_configured_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/patients/pat_slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "id": "pat_slow" }))
                .set_delay(std::time::Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let mut settings = meldrx_settings(&server.uri());
    settings.request_timeout_secs = 1;
    let client = MeldRxClient::new(&settings).unwrap();

    match client.get_patient_by_id(TEST_TOKEN, "pat_slow", None).await {
        Err(Error::Network(message)) => assert_eq!(message, TIMEOUT_MESSAGE),
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn submits_report_payload_verbatim() {
    let server = MockServer::start().await;
    let payload = json!({ "measure": "CMS165", "numerator": 12, "denominator": 40 });

    Mock::given(method("POST"))
        .and(path("/api/workspaces/ws_1/reports"))
        .and(body_json(payload.clone()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "reportId": "rep_1",
            "timestamp": "2026-03-01T09:00:00.000Z",
            "status": "submitted",
            "reviewer": "auto"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let receipt = client_for(&server)
        .submit_clinical_report(TEST_TOKEN, "ws_1", &payload)
        .await
        .unwrap();

    assert_eq!(receipt.report_id, "rep_1");
    assert_eq!(receipt.status, "submitted");
    assert_eq!(receipt.extra["reviewer"], "auto");
}

#[tokio::test]
async fn invalid_submission_makes_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    let client = client_for(&server);

    let empty_ws = client
        .submit_clinical_report(TEST_TOKEN, "", &json!({ "a": 1 }))
        .await;
    assert!(matches!(empty_ws, Err(Error::Validation(_))));

    let null_payload = client
        .submit_clinical_report(TEST_TOKEN, "ws_1", &serde_json::Value::Null)
        .await;
    assert!(matches!(null_payload, Err(Error::Validation(_))));
}

#[tokio::test]
async fn verify_connection_reports_success_and_failure() {
    let server = MockServer::start().await;
    mount_meldrx_token(&server, TEST_TOKEN, 3600).await;
    mount_workspaces(&server).await;

    let settings = meldrx_settings(&server.uri());
    let broker = TokenBroker::new(settings.clone()).unwrap();
    assert!(MeldRxClient::new(&settings).unwrap().verify_connection(&broker).await);

    let unreachable = meldrx_settings("http://127.0.0.1:9");
    let broker = TokenBroker::new(unreachable.clone()).unwrap();
    assert!(!MeldRxClient::new(&unreachable).unwrap().verify_connection(&broker).await);
}
