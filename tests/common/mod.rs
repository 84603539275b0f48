//! 集成测试共用的应用装配

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderMap, Request, StatusCode},
};
use chrono::{TimeZone, Utc};
use guardrail::{
    AppState,
    clock::{Clock, ManualClock},
    config::Config,
    database::MemoryProfileRepository,
    error::AppError,
    router,
    store::{MemoryStore, StoreClient, StoreSettings},
    upstream::{GenerateRequest, GenerateResponse, Generator},
};
use parking_lot::Mutex;
use tower::ServiceExt;

#[allow(dead_code)]
pub const JWT_SECRET: &str = "integration-secret";

/// 可编程的上游替身
#[derive(Default)]
pub struct FakeGenerator {
    calls: AtomicUsize,
    fail_with: Mutex<Option<(u16, String)>>,
}

#[allow(dead_code)]
impl FakeGenerator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_with(&self, status: Option<u16>) {
        *self.fail_with.lock() = status.map(|status| (status, "injected failure".to_string()));
    }

    pub fn fail_with_message(&self, status: u16, message: String) {
        *self.fail_with.lock() = Some((status, message));
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.fail_with.lock().clone();
        if let Some((status, message)) = failure {
            return Err(AppError::Upstream { status, message });
        }
        Ok(GenerateResponse {
            output: serde_json::json!({ "echo": request.prompt }),
        })
    }
}

#[allow(dead_code)]
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub remote: Arc<MemoryStore>,
    pub profiles: Arc<MemoryProfileRepository>,
    pub upstream: Arc<FakeGenerator>,
    pub clock: ManualClock,
}

pub fn test_config() -> Config {
    Config {
        jwt_secret: Some(JWT_SECRET.into()),
        ..Config::default()
    }
}

/// 用内存存储替代 Redis 和 Postgres 装配完整应用
pub fn spawn_app(config: Config) -> TestApp {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());

    let remote = Arc::new(MemoryStore::new(clock_arc.clone()));
    let store = StoreClient::new(remote.clone(), StoreSettings::from_config(&config), clock_arc.clone());
    let profiles = Arc::new(MemoryProfileRepository::default());
    let upstream = Arc::new(FakeGenerator::default());

    let state = AppState::new(
        config,
        store,
        profiles.clone(),
        upstream.clone(),
        clock_arc,
    );

    TestApp {
        router: router(state.clone()),
        state,
        remote,
        profiles,
        upstream,
        clock,
    }
}

#[allow(dead_code)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
}

impl TestApp {
    pub async fn send(&self, req: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        TestResponse {
            status,
            headers,
            body,
        }
    }
}

#[allow(dead_code)]
pub fn get(uri: &str, fingerprint: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-fingerprint", fingerprint)
        .body(Body::empty())
        .unwrap()
}

#[allow(dead_code)]
pub fn generate(fingerprint: &str, prompt: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/generate")
        .header("content-type", "application/json")
        .header("x-fingerprint", fingerprint)
        .body(Body::from(
            serde_json::json!({ "prompt": prompt }).to_string(),
        ))
        .unwrap()
}

#[allow(dead_code)]
pub fn generate_as(token: &str, prompt: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/generate")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", token))
        .body(Body::from(
            serde_json::json!({ "prompt": prompt }).to_string(),
        ))
        .unwrap()
}
