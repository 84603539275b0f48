mod common;

use axum::http::StatusCode;
use common::{JWT_SECRET, generate, generate_as, spawn_app, test_config};
use guardrail::{clock::Clock, config::Config, database::ProfileEntity, utils::generate_token};

#[tokio::test]
async fn identical_requests_hit_the_cache() {
    let app = spawn_app(test_config());

    let first = app.send(generate("fp-cache", "same prompt")).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.body["resp_data"]["cached"], false);
    assert_eq!(first.body["resp_data"]["result"]["output"]["echo"], "same prompt");

    let second = app.send(generate("fp-cache", "same prompt")).await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.body["resp_data"]["cached"], true);
    assert_eq!(second.body["resp_data"]["result"], first.body["resp_data"]["result"]);

    assert_eq!(app.upstream.calls(), 1);
}

#[tokio::test]
async fn guest_is_denied_after_daily_limit() {
    let app = spawn_app(test_config());

    for remaining in [2, 1, 0] {
        let res = app.send(generate("fp-guest", "p")).await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.body["resp_data"]["quota"]["remaining"], remaining);
    }

    let denied = app.send(generate("fp-guest", "p")).await;
    assert_eq!(denied.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied.body["code"], 1006);
    assert_eq!(denied.body["resp_data"]["plan"], "guest");
    assert_eq!(denied.body["resp_data"]["remaining"], 0);
    assert_eq!(denied.body["resp_data"]["used"], 3);

    // 另一个访客独立计数
    assert_eq!(app.send(generate("fp-guest-2", "p")).await.status, StatusCode::OK);
}

#[tokio::test]
async fn registered_user_gets_the_user_limit() {
    let app = spawn_app(Config {
        user_daily_limit: 2,
        ..test_config()
    });
    let token = generate_token("user-42", JWT_SECRET, 3600).unwrap();

    for _ in 0..2 {
        let res = app.send(generate_as(&token, "q")).await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.body["resp_data"]["quota"]["plan"], "user");
    }
    let denied = app.send(generate_as(&token, "q")).await;
    assert_eq!(denied.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied.body["resp_data"]["limit"], 2);
}

#[tokio::test]
async fn pro_user_is_unlimited() {
    let app = spawn_app(Config {
        user_daily_limit: 1,
        ..test_config()
    });
    let mut profile = ProfileEntity::new("pro-1", app.clock.now());
    profile.is_pro = true;
    app.profiles.upsert(profile);
    let token = generate_token("pro-1", JWT_SECRET, 3600).unwrap();

    for _ in 0..5 {
        let res = app.send(generate_as(&token, "unlimited")).await;
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.body["resp_data"]["quota"]["plan"], "pro");
        assert_eq!(res.body["resp_data"]["quota"]["remaining"], serde_json::Value::Null);
    }
}

#[tokio::test]
async fn invalid_token_falls_back_to_guest() {
    let app = spawn_app(test_config());
    let res = app.send(generate_as("not-a-jwt", "p")).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["resp_data"]["quota"]["plan"], "guest");
}

#[tokio::test]
async fn circuit_opens_after_repeated_upstream_failures() {
    let app = spawn_app(Config {
        guest_daily_limit: 100,
        ..test_config()
    });
    app.upstream.fail_with(Some(503));

    for _ in 0..5 {
        let res = app.send(generate("fp-breaker", "p")).await;
        assert_eq!(res.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(res.body["code"], 3001);
    }

    let rejected = app.send(generate("fp-breaker", "p")).await;
    assert_eq!(rejected.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(rejected.body["code"], 3002);
    assert_eq!(rejected.headers["retry-after"], "60");
    assert_eq!(app.upstream.calls(), 5);

    // 超时后半开试探成功
    app.upstream.fail_with(None);
    app.clock.advance(chrono::Duration::seconds(61));
    let recovered = app.send(generate("fp-breaker", "p")).await;
    assert_eq!(recovered.status, StatusCode::OK);
    assert_eq!(app.upstream.calls(), 6);
}

#[tokio::test]
async fn client_errors_do_not_trip_the_circuit() {
    let app = spawn_app(Config {
        guest_daily_limit: 100,
        ..test_config()
    });
    app.upstream.fail_with(Some(400));

    for _ in 0..8 {
        let res = app.send(generate("fp-400", "p")).await;
        assert_eq!(res.status, StatusCode::BAD_REQUEST);
        assert_eq!(res.body["code"], 3001);
    }
    assert_eq!(app.upstream.calls(), 8);
}

#[tokio::test]
async fn empty_prompt_is_rejected_without_consuming_quota() {
    let app = spawn_app(test_config());

    let res = app.send(generate("fp-empty", "   ")).await;
    assert_eq!(res.status, StatusCode::BAD_REQUEST);
    assert_eq!(res.body["code"], 1001);

    let quota = app.send(common::get("/quota", "fp-empty")).await;
    assert_eq!(quota.body["resp_data"]["used"], 0);
}

#[tokio::test]
async fn large_upstream_error_keeps_the_envelope() {
    let app = spawn_app(test_config());
    app.upstream
        .fail_with_message(502, format!("<html>{}</html>", "x".repeat(4000)));

    let res = app.send(generate("fp-large-error", "p")).await;
    assert_eq!(res.status, StatusCode::BAD_GATEWAY);
    assert_eq!(res.body["code"], 3001);
    assert!(res.body["msg"].as_str().unwrap().contains("<html>"));
}
