use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    Router,
    http::HeaderValue,
    routing::{delete, get, post, put},
};
use sqlx::Executor;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wayfarer_backend::{
    AppState,
    config::{Config, FanoutBackend},
    middleware::{RateLimiter, auth_middleware, log_errors, rate_limit},
    realtime::{
        self, RealtimeHub,
        fanout::{Fanout, LocalFanout, RedisFanout},
        store::PgRealtimeStore,
    },
    routes,
};

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
    let config = Config::from_env().expect("Failed to load configuration");

    // 设置数据库连接池
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("SET application_name = 'wayfarer_backend';")
                    .await?;
                Ok(())
            })
        })
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to Postgres");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run database migrations");

    // 设置 Redis 客户端
    let redis_client =
        redis::Client::open(config.redis_url.clone()).expect("Failed to create Redis client");
    let redis_arc = Arc::new(redis_client);

    // 广播通道：多实例部署走 Redis，单实例可直接本地投递
    let fanout: Arc<dyn Fanout> = match config.fanout_backend {
        FanoutBackend::Redis => {
            let fanout = RedisFanout::new(redis_arc.clone(), config.fanout_channel.clone());
            fanout.spawn_listener();
            Arc::new(fanout)
        }
        FanoutBackend::Local => Arc::new(LocalFanout::new()),
    };
    tracing::info!(backend = ?config.fanout_backend, "Realtime fanout ready");

    let hub = RealtimeHub::new(
        Arc::new(PgRealtimeStore::new(pool.clone())),
        fanout,
        config.jwt_secret.clone(),
        config.location_flush_interval(),
    );

    // 设置应用状态
    let state = AppState {
        pool,
        config: config.clone(),
        redis: redis_arc.clone(),
    };

    // 设置限流器
    let rate_limiter = Arc::new(RateLimiter::new(redis_arc, config.clone()));

    // 将路由分为公开路由和受保护路由
    let public_routes = Router::new()
        .route("/auth/register", post(routes::user::register))
        .route("/auth/login", post(routes::user::login))
        .route("/auth/refresh", post(routes::user::refresh_token));

    let protected_routes = Router::new()
        // 用户路由
        .route("/auth/logout", post(routes::user::logout))
        .route("/users/me", get(routes::user::me))
        .route("/users/me/picture", put(routes::user::update_picture))
        .route("/users/search", get(routes::user::search))
        // 好友路由
        .route("/users/friends", get(routes::friend::list_friends))
        .route("/users/friends/request", post(routes::friend::send_request))
        .route("/users/friends/requests", get(routes::friend::list_requests))
        .route(
            "/users/friends/request/{userId}",
            put(routes::friend::respond_request),
        )
        .route("/users/friends/{userId}", delete(routes::friend::remove_friend))
        // 群组路由
        .route(
            "/groups",
            post(routes::group::create_group).get(routes::group::list_groups),
        )
        .route(
            "/groups/{groupId}",
            get(routes::group::get_group)
                .put(routes::group::update_group)
                .delete(routes::group::delete_group),
        )
        .route("/groups/{groupId}/members", post(routes::group::add_member))
        .route(
            "/groups/{groupId}/members/{userId}",
            delete(routes::group::remove_member),
        )
        // 行程路由
        .route(
            "/groups/{groupId}/trips",
            post(routes::trip::create_trip).get(routes::trip::list_trips),
        )
        .route(
            "/groups/{groupId}/trips/{tripId}",
            put(routes::trip::update_trip),
        )
        // 消息路由
        .route("/groups/{groupId}/messages", get(routes::message::get_messages))
        // 应用认证中间件
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // 创建基础路由
    let api = Router::new()
        .nest(
            &config.api_base_uri,
            Router::new().merge(public_routes).merge(protected_routes),
        )
        // 添加日志中间件和限流中间件
        .layer(axum::middleware::from_fn(log_errors))
        .layer(axum::middleware::from_fn_with_state(rate_limiter, rate_limit))
        .with_state(state.clone());

    // 实时连接不经过限流
    let router = api.merge(realtime::router(hub));

    let app = router.layer(cors_layer(&config));

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
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Failed to start server");
}

/// 开发模式允许所有来源；发布模式按 `CORS_ORIGIN` 配置
fn cors_layer(config: &Config) -> CorsLayer {
    if cfg!(debug_assertions) {
        tracing::debug!("Adding permissive CORS layer for development mode");
        return CorsLayer::permissive();
    }

    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if config.cors_origin == "*" {
        return base.allow_origin(Any);
    }
    match config.cors_origin.parse::<HeaderValue>() {
        Ok(origin) => base.allow_origin(origin),
        Err(_) => {
            tracing::warn!(origin = %config.cors_origin, "Invalid CORS_ORIGIN, allowing any origin");
            base.allow_origin(Any)
        }
    }
}
