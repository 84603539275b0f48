mod common;

use axum::http::StatusCode;
use common::{generate, get, spawn_app, test_config};

#[tokio::test]
async fn health_reports_components() {
    let app = spawn_app(test_config());
    app.send(generate("fp-health", "hello")).await;

    let res = app.send(get("/health", "fp-health")).await;
    assert_eq!(res.status, StatusCode::OK);

    let data = &res.body["resp_data"];
    assert_eq!(data["status"], "ok");
    assert_eq!(data["store"]["enabled"], true);
    assert_eq!(data["cache"]["misses"], 1);
    assert_eq!(data["cache"]["sets"], 1);
    assert_eq!(data["in_flight"], 0);
    assert_eq!(data["max_in_flight"], 10);
    assert_eq!(data["circuits"][0]["operation"], "generate");
    assert_eq!(data["circuits"][0]["is_open"], false);

    let operations: Vec<&str> = data["metrics"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["operation"].as_str().unwrap())
        .collect();
    assert!(operations.contains(&"generate"));
    assert!(operations.contains(&"rate_limit.check"));
}

#[tokio::test]
async fn health_is_degraded_while_store_is_suspended() {
    let app = spawn_app(test_config());
    app.remote.set_available(false);

    // 每个请求都会产生存储错误，累计到阈值后停用
    for _ in 0..3 {
        app.send(get("/quota", "fp-degraded")).await;
    }

    let res = app.send(get("/health", "fp-degraded")).await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["resp_data"]["status"], "degraded");
    assert_eq!(res.body["resp_data"]["store"]["enabled"], false);
}
