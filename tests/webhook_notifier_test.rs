use std::time::Duration;

use remitflow::adapters::{NotificationEvent, Notifier, Recipient, WebhookNotifier};
use remitflow::adapters::notifications::SignatureGenerator;
use remitflow::errors::{Locale, ServiceError};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn posts_signed_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/notify"))
        .and(header_exists("X-Signature"))
        .and(header_exists("X-Timestamp"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = WebhookNotifier::new(
        format!("{}/notify", server.uri()),
        Some("relay-secret".into()),
        Duration::from_secs(2),
    )
    .unwrap();
    notifier
        .notify(
            NotificationEvent::RemittanceDelivered,
            json!({ "remittance_number": "REM-20240315-00042" }),
            &Recipient::user(Uuid::new_v4()),
            Locale::Es,
        )
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["event"], "remittance_delivered");
    assert_eq!(body["locale"], "es");
    assert_eq!(body["payload"]["remittance_number"], "REM-20240315-00042");

    let timestamp = request.headers.get("X-Timestamp").unwrap().to_str().unwrap();
    let signature = request.headers.get("X-Signature").unwrap().to_str().unwrap();
    let expected = SignatureGenerator::new("relay-secret".into())
        .sign_payload(timestamp, std::str::from_utf8(&request.body).unwrap())
        .unwrap();
    assert_eq!(signature, expected);
}

#[tokio::test]
async fn retries_then_reports_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let notifier = WebhookNotifier::new(server.uri(), None, Duration::from_secs(2))
        .unwrap()
        .with_retries(3, Duration::from_millis(10));
    let err = notifier
        .notify(
            NotificationEvent::OrderCreated,
            json!({}),
            &Recipient::user(Uuid::new_v4()),
            Locale::En,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ExternalServiceError(_)));
}

#[tokio::test]
async fn recovers_after_a_transient_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let notifier = WebhookNotifier::new(server.uri(), None, Duration::from_secs(2))
        .unwrap()
        .with_retries(3, Duration::from_millis(10));
    notifier
        .notify(
            NotificationEvent::OrderDispatched,
            json!({ "order_number": "ORD-20240315-00001" }),
            &Recipient::user(Uuid::new_v4()),
            Locale::Es,
        )
        .await
        .unwrap();
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}
