//! End-to-end tests for the OAuth 1.0a engine against a mock provider.

mod common;

use keyward_core::service::endpoints;
use keyward_core::{
    Credential, DispatchOutcome, Endpoint, Flow, KeywardError, ResourceRequest, ServiceConfig,
    TokenKind, TokenSelector,
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{header_exists, header_regex, method, path},
};

use common::{count, from_callback, query, request_input};

fn tweeter(server: &MockServer) -> ServiceConfig {
    ServiceConfig::new("tweeter", Flow::OAuth1)
        .with_label("Tweeter")
        .with_credentials("ck", "cs")
        .with_endpoint(
            endpoints::REQUEST_TOKEN,
            Endpoint::post(format!("{}/oauth/request_token", server.uri())),
        )
        .with_endpoint(
            endpoints::AUTHORIZE,
            Endpoint::get(format!("{}/oauth/authorize", server.uri())),
        )
        .with_endpoint(
            endpoints::ACCESS_TOKEN,
            Endpoint::post(format!("{}/oauth/access_token", server.uri())),
        )
}

async fn mount_request_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/oauth/request_token"))
        .and(header_regex("authorization", r#"^OAuth .*oauth_callback=""#))
        .and(header_regex("authorization", r#"oauth_consumer_key="ck""#))
        .and(header_regex("authorization", r#"oauth_signature_method="HMAC-SHA1""#))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("oauth_token=rt1&oauth_token_secret=rs1&oauth_callback_confirmed=true"),
        )
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_happy_path() {
    let server = MockServer::start().await;
    let orchestrator = common::orchestrator(vec![tweeter(&server)]);
    mount_request_token(&server).await;

    let dispatch = orchestrator.dispatch(&request_input(&orchestrator, "tweeter")).await;
    let Some(DispatchOutcome::Redirect { location }) = dispatch.outcome else {
        panic!("expected redirect, got {:?}", dispatch.errors);
    };
    assert!(location.starts_with(&format!("{}/oauth/authorize?", server.uri())));

    let params = query(&location);
    assert_eq!(params["oauth_token"], "rt1");
    let callback_url = params["oauth_callback"].clone();
    let callback_params = query(&callback_url);
    assert_eq!(callback_params["action"], "verify");

    // The pending request token now holds the provider's pair.
    let pending = orchestrator
        .store()
        .get_token(&TokenSelector::by_id(callback_params["state"].as_str()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        pending.credential,
        Some(Credential::pair("rt1", "rs1"))
    );

    Mock::given(method("POST"))
        .and(path("/oauth/access_token"))
        .and(header_regex("authorization", r#"oauth_token="rt1""#))
        .and(header_regex("authorization", r#"oauth_verifier="v1""#))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("oauth_token=at1&oauth_token_secret=as1&screen_name=ada&user_id=7"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let callback = from_callback(&callback_url)
        .with_param("oauth_token", "rt1")
        .with_param("oauth_verifier", "v1");
    let dispatch = orchestrator.dispatch(&callback).await;
    assert!(!dispatch.has_errors(), "{:?}", dispatch.errors);
    assert_eq!(dispatch.messages, vec!["Connected Tweeter as @ada"]);
    let Some(DispatchOutcome::Verified { id, .. }) = dispatch.outcome else {
        panic!("expected verified outcome");
    };

    let token = orchestrator
        .store()
        .get_token(&TokenSelector::by_id(id.clone()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(token.kind, TokenKind::Access);
    assert_eq!(token.credential, Some(Credential::pair("at1", "as1")));
    assert_eq!(token.get_meta("screen_name"), Some("ada"));
    assert_eq!(token.get_meta("user_id"), Some("7"));
    assert_eq!(count(&orchestrator, TokenKind::Request).await, 0);

    // Resource calls are signed with the access pair.
    Mock::given(method("GET"))
        .and(path("/1.1/me.json"))
        .and(header_regex("authorization", r#"oauth_token="at1""#))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"id\":7}"))
        .expect(1)
        .mount(&server)
        .await;

    let mut session = orchestrator.connection(id).await.unwrap();
    let response = session
        .request(ResourceRequest::get(format!("{}/1.1/me.json", server.uri())).with_param("x", "1"))
        .await
        .unwrap();
    assert_eq!(response.body["id"], 7);
}

#[tokio::test]
async fn test_request_token_failure_prunes_row() {
    let server = MockServer::start().await;
    let orchestrator = common::orchestrator(vec![tweeter(&server)]);
    Mock::given(method("POST"))
        .and(path("/oauth/request_token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Invalid consumer"))
        .expect(1)
        .mount(&server)
        .await;

    let dispatch = orchestrator.dispatch(&request_input(&orchestrator, "tweeter")).await;

    match dispatch.errors.as_slice() {
        [KeywardError::AuthorizationFailed { message, .. }] => assert!(message.contains("401")),
        other => panic!("unexpected errors: {other:?}"),
    }
    assert_eq!(count(&orchestrator, TokenKind::Request).await, 0);
}

#[tokio::test]
async fn test_mismatched_oauth_token() {
    let server = MockServer::start().await;
    let orchestrator = common::orchestrator(vec![tweeter(&server)]);
    mount_request_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/oauth/access_token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dispatch = orchestrator.dispatch(&request_input(&orchestrator, "tweeter")).await;
    let Some(DispatchOutcome::Redirect { location }) = dispatch.outcome else {
        panic!("expected redirect");
    };
    let callback = from_callback(&query(&location)["oauth_callback"])
        .with_param("oauth_token", "someone-elses")
        .with_param("oauth_verifier", "v1");

    let dispatch = orchestrator.dispatch(&callback).await;
    assert!(matches!(
        dispatch.errors.as_slice(),
        [KeywardError::AuthorizationFailed { .. }]
    ));
    assert_eq!(count(&orchestrator, TokenKind::Access).await, 0);
}

#[tokio::test]
async fn test_authorize_failure_prunes_row() {
    let server = MockServer::start().await;
    let config = tweeter(&server).with_endpoint(endpoints::AUTHORIZE, Endpoint::get("not a url"));
    let orchestrator = common::orchestrator(vec![config]);
    mount_request_token(&server).await;

    let dispatch = orchestrator.dispatch(&request_input(&orchestrator, "tweeter")).await;

    assert!(matches!(
        dispatch.errors.as_slice(),
        [KeywardError::Config { .. }]
    ));
    assert!(dispatch.outcome.is_none());
    assert_eq!(count(&orchestrator, TokenKind::Request).await, 0);
}

#[tokio::test]
async fn test_state_is_single_use() {
    let server = MockServer::start().await;
    let orchestrator = common::orchestrator(vec![tweeter(&server)]);
    mount_request_token(&server).await;
    Mock::given(method("POST"))
        .and(path("/oauth/access_token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("oauth_token=at1&oauth_token_secret=as1"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dispatch = orchestrator.dispatch(&request_input(&orchestrator, "tweeter")).await;
    let Some(DispatchOutcome::Redirect { location }) = dispatch.outcome else {
        panic!("expected redirect, got {:?}", dispatch.errors);
    };
    let callback = from_callback(&query(&location)["oauth_callback"])
        .with_param("oauth_token", "rt1")
        .with_param("oauth_verifier", "v1");

    let first = orchestrator.dispatch(&callback).await;
    assert!(!first.has_errors(), "{:?}", first.errors);

    let replay = orchestrator.dispatch(&callback).await;
    assert!(matches!(
        replay.errors.as_slice(),
        [KeywardError::AuthorizationFailed { .. }]
    ));
    assert_eq!(count(&orchestrator, TokenKind::Access).await, 1);
}
