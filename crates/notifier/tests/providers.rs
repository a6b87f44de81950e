//! Provider calls against a local stub HTTP server.

use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};

use herald_common::config::{EmailProvider, EmailSettings, PushSettings, TwilioSettings};
use herald_notifier::email::EmailChannel;
use herald_notifier::push::PushChannel;
use herald_notifier::sms::SmsChannel;
use herald_notifier::whatsapp::WhatsAppChannel;
use herald_notifier::{Channel, ChannelError};

#[derive(Debug, Clone)]
struct Captured {
    path: String,
    authorization: Option<String>,
    body: String,
}

#[derive(Clone)]
struct StubState {
    status: StatusCode,
    response: &'static str,
    captured: Arc<Mutex<Vec<Captured>>>,
}

async fn capture(
    State(state): State<StubState>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, [(&'static str, &'static str); 1], &'static str) {
    state.captured.lock().unwrap().push(Captured {
        path: uri.path().to_string(),
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });
    (
        state.status,
        [("content-type", "application/json")],
        state.response,
    )
}

/// Start a stub provider and return its base URL plus the captured requests.
async fn stub(status: StatusCode, response: &'static str) -> (String, Arc<Mutex<Vec<Captured>>>) {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new().fallback(capture).with_state(StubState {
        status,
        response,
        captured: captured.clone(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), captured)
}

fn twilio_settings(base: &str, from: &str) -> TwilioSettings {
    TwilioSettings {
        account_sid: "AC123".to_string(),
        auth_token: "secret".to_string(),
        from_number: from.to_string(),
        api_base: Some(base.to_string()),
    }
}

#[tokio::test]
async fn test_sendgrid_email_request() {
    let (base, captured) = stub(StatusCode::ACCEPTED, "{}").await;
    let email = EmailChannel::new(
        reqwest::Client::new(),
        EmailSettings {
            provider: EmailProvider::SendGrid,
            api_key: "sg-key".to_string(),
            from_email: "noreply@example.com".to_string(),
            from_name: "Herald".to_string(),
            api_base: Some(base),
        },
    );

    email.send("a@b.com", "hi", None).await.unwrap();

    let captured = captured.lock().unwrap();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].path, "/v3/mail/send");
    assert_eq!(captured[0].authorization.as_deref(), Some("Bearer sg-key"));
    let body: serde_json::Value = serde_json::from_str(&captured[0].body).unwrap();
    assert_eq!(body["subject"], "Notification");
    assert_eq!(body["personalizations"][0]["to"][0]["email"], "a@b.com");
}

#[tokio::test]
async fn test_invalid_email_makes_no_request() {
    let (base, captured) = stub(StatusCode::OK, "{}").await;
    let email = EmailChannel::new(
        reqwest::Client::new(),
        EmailSettings {
            provider: EmailProvider::Resend,
            api_key: "re-key".to_string(),
            from_email: "noreply@example.com".to_string(),
            from_name: "Herald".to_string(),
            api_base: Some(base),
        },
    );

    let result = email.send("not-an-email", "hi", Some("Hello")).await;
    assert!(matches!(result, Err(ChannelError::Validation(_))));
    assert!(captured.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_twilio_sms_request() {
    let (base, captured) = stub(StatusCode::CREATED, r#"{"sid":"SM1"}"#).await;
    let sms = SmsChannel::new(reqwest::Client::new(), twilio_settings(&base, "+15550001111"));

    sms.send("+1 (555) 010-9999", "code 1234", None).await.unwrap();

    let captured = captured.lock().unwrap();
    assert_eq!(captured[0].path, "/2010-04-01/Accounts/AC123/Messages.json");
    assert!(captured[0].authorization.as_deref().unwrap().starts_with("Basic "));
    assert!(captured[0].body.contains("To=%2B15550109999"));
    assert!(captured[0].body.contains("Body=code+1234"));
}

#[tokio::test]
async fn test_twilio_whatsapp_addressing() {
    let (base, captured) = stub(StatusCode::CREATED, r#"{"sid":"SM2"}"#).await;
    let whatsapp = WhatsAppChannel::new(
        reqwest::Client::new(),
        twilio_settings(&base, "whatsapp:+14155238886"),
    )
    .unwrap();

    whatsapp.send("34600111222", "hola", None).await.unwrap();

    let body = captured.lock().unwrap()[0].body.clone();
    assert!(body.contains("To=whatsapp%3A%2B34600111222"));
    assert!(body.contains("From=whatsapp%3A%2B14155238886"));
}

#[tokio::test]
async fn test_fcm_push_request() {
    let (base, captured) = stub(StatusCode::OK, r#"{"name":"projects/p/messages/1"}"#).await;
    let push = PushChannel::new(
        reqwest::Client::new(),
        PushSettings {
            project_id: "p".to_string(),
            access_token: "fcm-token".to_string(),
            api_base: Some(base),
        },
    );

    push.send("device-token-0123456789", "Your order shipped", Some("Order"))
        .await
        .unwrap();

    let captured = captured.lock().unwrap();
    assert_eq!(captured[0].path, "/v1/projects/p/messages:send");
    let body: serde_json::Value = serde_json::from_str(&captured[0].body).unwrap();
    assert_eq!(body["message"]["token"], "device-token-0123456789");
    assert_eq!(body["message"]["notification"]["title"], "Order");
}

#[tokio::test]
async fn test_provider_error_status_is_transport_error() {
    let (base, _captured) = stub(StatusCode::SERVICE_UNAVAILABLE, r#"{"error":"down"}"#).await;
    let sms = SmsChannel::new(reqwest::Client::new(), twilio_settings(&base, "+15550001111"));

    let err = sms.send("+15550109999", "hi", None).await.unwrap_err();
    match &err {
        ChannelError::Transport {
            provider,
            status,
            message,
        } => {
            assert_eq!(*provider, "twilio");
            assert_eq!(*status, Some(503));
            assert!(message.contains("down"));
        }
        other => panic!("expected transport error, got {:?}", other),
    }
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_unreachable_provider_is_transport_error() {
    let sms = SmsChannel::new(
        reqwest::Client::new(),
        twilio_settings("http://127.0.0.1:9", "+15550001111"),
    );
    let result = sms.send("+15550109999", "hi", None).await;
    assert!(matches!(result, Err(ChannelError::Transport { .. })));
}
