use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use guardrail::{
    AppState,
    clock::{Clock, SystemClock},
    config::Config,
    database::{MemoryProfileRepository, PgProfileRepository, ProfileStore},
    router,
    store::StoreClient,
    upstream::GenerationClient,
};
use sqlx::Executor;
use sqlx::postgres::PgPoolOptions;
#[cfg(debug_assertions)]
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 加载配置
    let config = Config::from_env();

    #[cfg(debug_assertions)]
    tracing::info!("Running in debug mode with CORS enabled");

    #[cfg(not(debug_assertions))]
    tracing::info!("Running in production mode with CORS disabled");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // 设置数据库连接池，未配置时注册用户的档案只保存在进程内
    let profiles: Arc<dyn ProfileStore> = match config.database_url.as_deref() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .after_connect(|conn, _meta| {
                    Box::pin(async move {
                        conn.execute("SET application_name = 'guardrail';").await?;
                        Ok(())
                    })
                })
                .connect(url)
                .await
                .expect("Failed to connect to Postgres");
            Arc::new(PgProfileRepository::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, registered profiles are kept in memory");
            Arc::new(MemoryProfileRepository::default())
        }
    };

    // 协调存储，未配置或故障时各组件退回进程内实现
    let store = StoreClient::from_config(&config, clock.clone());

    let upstream = GenerationClient::from_config(&config).expect("Failed to build upstream client");
    if config.upstream_url.is_none() {
        tracing::warn!("UPSTREAM_URL not set, /generate will answer 503");
    }

    let state = AppState::new(config, store, profiles, Arc::new(upstream), clock);
    let router = router(state.clone());

    // 根据编译模式决定是否添加CORS
    #[cfg(debug_assertions)]
    let router = {
        tracing::debug!("Adding CORS layer for development mode");
        router.layer(CorsLayer::permissive())
    };

    // 启动服务器
    let addr = SocketAddr::new(
        state.config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        state.config.server_port,
    );
    tracing::info!("Server listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind"),
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Failed to start server");
}
