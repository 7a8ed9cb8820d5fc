//! Remote authority client and callback reader tests.
//!
//! Upstream answers are stubbed with wiremock; one test runs the client against the
//! real router bound to a local port.

use phone_handoff::AppResources;
use phone_handoff::api::app;
use phone_handoff::authority::LogOtpSender;
use phone_handoff::callback::response::{CallbackReader, UpstreamVerdict};
use phone_handoff::client::{AuthorityApi, HttpAuthorityClient};
use phone_handoff::clock::ManualClock;
use phone_handoff::config::load_config_str;
use phone_handoff::error::{ClientError, VerificationError};
use phone_handoff::protocol::{ConfirmRequest, InitRequest, OtpRequest};
use phone_handoff::session::{TokenId, VerificationStatus};
use serde_json::json;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};
use url::Url;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn client_for(server: &MockServer) -> HttpAuthorityClient {
    let base = Url::parse(&format!("{}/api/v1/auth", server.uri())).unwrap();
    HttpAuthorityClient::new(base).unwrap()
}

fn init_request() -> InitRequest {
    InitRequest {
        name: "Hong Gildong".into(),
        phone_number: "01012345678".into(),
        carrier: None,
        auth_request_id: Some("req-7".into()),
        return_url: None,
    }
}

// =============================================================================
// HttpAuthorityClient against stubs
// =============================================================================

#[tokio::test]
async fn init_posts_claims_and_returns_token() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/init"))
        .and(body_partial_json(json!({ "phoneNumber": "01012345678", "authRequestId": "req-7" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "tokenId": "tok-1" })))
        .expect(1)
        .mount(&upstream)
        .await;

    let token = client_for(&upstream).await.init(init_request()).await.unwrap();

    assert_eq!(token, TokenId::new("tok-1"));
}

#[tokio::test]
async fn business_rejections_are_rebuilt() {
    let upstream = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/v1/auth/confirm"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "error": "otp_mismatch",
            "message": "one-time code does not match (2 attempts remaining)",
            "attemptsRemaining": 2,
            "restart": false
        })))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/auth/status/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": "not_found",
            "message": "verification session not found",
            "restart": true
        })))
        .mount(&upstream)
        .await;
    let client = client_for(&upstream).await;

    let err = client
        .confirm_otp(ConfirmRequest {
            token_id: TokenId::new("tok-1"),
            otp: "123456".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Rejected(VerificationError::OtpMismatch {
            attempts_remaining: 2
        })
    ));

    let err = client.status(&TokenId::new("gone")).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected(VerificationError::NotFound)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn confirm_accepts_no_content() {
    let upstream = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/v1/auth/confirm"))
        .and(body_partial_json(json!({ "tokenId": "tok-1", "otp": "654321" })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&upstream)
        .await;

    let client = client_for(&upstream).await;
    assert_ok!(
        client
            .confirm_otp(ConfirmRequest {
                token_id: TokenId::new("tok-1"),
                otp: "654321".into(),
            })
            .await
    );
}

#[tokio::test]
async fn server_errors_are_retryable_transport_failures() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/request-otp"))
        .respond_with(ResponseTemplate::new(503).set_body_string("<html>maintenance</html>"))
        .mount(&upstream)
        .await;

    let err = client_for(&upstream)
        .await
        .request_otp(OtpRequest {
            token_id: TokenId::new("tok-1"),
            name: "Hong Gildong".into(),
            phone_number: "01012345678".into(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Transport(_)));
    assert!(err.is_retryable());
    assert!(!err.public_message().contains("maintenance"));
}

#[tokio::test]
async fn unreadable_success_is_malformed() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/auth/status/tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("CONFIRMED"))
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/init"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "error": "teapot" })))
        .mount(&upstream)
        .await;
    let client = client_for(&upstream).await;

    let err = client.status(&TokenId::new("tok-1")).await.unwrap_err();
    assert!(matches!(err, ClientError::MalformedUpstreamResponse(_)));

    let err = client.init(init_request()).await.unwrap_err();
    assert!(matches!(err, ClientError::MalformedUpstreamResponse(_)));
}

#[tokio::test]
async fn unreachable_authority_is_transport() {
    // nothing listens on the discard port
    let client = HttpAuthorityClient::new(Url::parse("http://127.0.0.1:9/api/v1/auth/").unwrap())
        .unwrap();

    let err = assert_err!(client.status(&TokenId::new("tok-1")).await);

    assert!(matches!(err, ClientError::Transport(_)));
}

// =============================================================================
// HttpAuthorityClient against the real router
// =============================================================================

#[tokio::test]
async fn client_drives_a_live_authority() {
    let config = load_config_str(
        r#"
public_base_url: "https://bank.example"
provider_entry_url: "https://provider.example/verify"
demo:
  expose_otp: true
"#,
    )
    .unwrap();
    let resources = AppResources::with_parts(
        config,
        Arc::new(ManualClock::default()),
        Arc::new(LogOtpSender),
    )
    .unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(resources)).await.unwrap();
    });

    let client =
        HttpAuthorityClient::new(Url::parse(&format!("http://{addr}/api/v1/auth")).unwrap())
            .unwrap();

    let token = client.init(init_request()).await.unwrap();
    let issued = client
        .request_otp(OtpRequest {
            token_id: token.clone(),
            name: "Hong Gildong".into(),
            phone_number: "010-1234-5678".into(),
        })
        .await
        .unwrap();
    let code = issued.otp.expect("demo mode echoes the code");

    client
        .confirm_otp(ConfirmRequest {
            token_id: token.clone(),
            otp: code.clone(),
        })
        .await
        .unwrap();
    let view = client.status(&token).await.unwrap();
    assert_eq!(view.status, VerificationStatus::Confirmed);
    assert_eq!(view.phone_number.as_deref(), Some("01012345678"));

    let err = client
        .confirm_otp(ConfirmRequest {
            token_id: token,
            otp: code,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Rejected(VerificationError::NotPending(VerificationStatus::Confirmed))
    ));
}

// =============================================================================
// CallbackReader
// =============================================================================

async fn read_with(
    status: u16,
    body: &str,
    accept_legacy_text: bool,
) -> Result<UpstreamVerdict, ClientError> {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/callback"))
        .and(header("cookie", "ph_ctx=abc"))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .expect(1)
        .mount(&upstream)
        .await;
    let url = Url::parse(&format!("{}/callback?tokenId=t1", upstream.uri())).unwrap();
    CallbackReader::new(reqwest::Client::new(), accept_legacy_text)
        .read(&url, Some("ph_ctx=abc"))
        .await
}

#[tokio::test]
async fn reader_settles_json_answers() {
    assert_eq!(
        read_with(200, r#"{"status":"SUCCESS"}"#, true).await.unwrap(),
        UpstreamVerdict::Success
    );
    assert_eq!(
        read_with(200, r#"{"status":"error","message":"success later"}"#, true)
            .await
            .unwrap(),
        UpstreamVerdict::Failure
    );
    assert_eq!(
        read_with(200, r#"{"message":"Verification successful"}"#, true)
            .await
            .unwrap(),
        UpstreamVerdict::Success
    );
}

#[tokio::test]
async fn reader_never_trusts_error_statuses() {
    assert_eq!(
        read_with(500, r#"{"status":"success"}"#, true).await.unwrap(),
        UpstreamVerdict::Failure
    );
}

#[tokio::test]
async fn reader_handles_legacy_text() {
    assert_eq!(
        read_with(200, "Verification success", true).await.unwrap(),
        UpstreamVerdict::Success
    );
    assert!(matches!(
        read_with(200, "Verification success", false).await,
        Err(ClientError::MalformedUpstreamResponse(_))
    ));
    assert!(matches!(
        read_with(200, "   ", true).await,
        Err(ClientError::MalformedUpstreamResponse(_))
    ));
}
