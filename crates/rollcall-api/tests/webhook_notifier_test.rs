//! Absence webhook delivery against a mock HTTP receiver.

use std::time::Duration;

use chrono::{NaiveDate, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rollcall_api::notify::{WebhookConfig, WebhookNotifier, ABSENCE_EVENT, SIGNATURE_HEADER};
use rollcall_core::{AbsenceNotifier, AttendanceStatus, Record, RecordSource};

type HmacSha256 = Hmac<Sha256>;

fn record() -> Record {
    let now = Utc::now();
    Record {
        id: Uuid::now_v7(),
        school_id: 7,
        class_id: 3,
        student_id: 12,
        date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
        status: AttendanceStatus::Absent,
        source: RecordSource::Recognized,
        upload_id: Some(Uuid::now_v7()),
        notification_sent: false,
        notified_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn notifier(server: &MockServer, secret: Option<&str>) -> WebhookNotifier {
    WebhookNotifier::new(WebhookConfig {
        url: format!("{}/hooks/absence", server.uri()),
        secret: secret.map(str::to_string),
        timeout: Duration::from_secs(2),
    })
}

#[tokio::test]
async fn test_signed_delivery_verifies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/absence"))
        .and(header("X-Rollcall-Event", ABSENCE_EVENT))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let record = record();
    notifier(&server, Some("shared-secret"))
        .notify_absence(&record)
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let signature = request
        .headers
        .get(SIGNATURE_HEADER)
        .unwrap()
        .to_str()
        .unwrap();
    let hex_part = signature.strip_prefix("sha256=").unwrap();

    let mut verifier = HmacSha256::new_from_slice(b"shared-secret").unwrap();
    verifier.update(&request.body);
    verifier
        .verify_slice(&hex::decode(hex_part).unwrap())
        .expect("signature should verify");

    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["event"], ABSENCE_EVENT);
    assert_eq!(body["record"]["student_id"], 12);
    assert_eq!(body["record"]["status"], "ABSENT");
}

#[tokio::test]
async fn test_unsigned_delivery_has_no_signature() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    notifier(&server, None).notify_absence(&record()).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get(SIGNATURE_HEADER).is_none());
}

#[tokio::test]
async fn test_receiver_error_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = notifier(&server, Some("s"))
        .notify_absence(&record())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("503"));
}
