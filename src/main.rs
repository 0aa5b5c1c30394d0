/*
 * ScanFarm - Cluster Image Scan Orchestration
 * Copyright (c) 2024 ScanFarm Project
 *
 * This work is licensed under CC BY-NC-SA 4.0
 * https://creativecommons.org/licenses/by-nc-sa/4.0/
 */

use axum::response::Html;
use axum::{
    Router,
    extract::{Query, State},
    http::Method,
    response::Json,
    routing::get,
};
use scanfarm_backend::{
    config::Config,
    docs::ApiDoc,
    error::AppResult,
    handlers::AppState,
    response::ApiResponse,
    routes::create_api_routes,
    services::{
        Coordinator, HttpHubClient, HubClient, HubClientFactory, HubManager, MetricsRegistry,
        spawn_reducer, CentralModel, ModelSnapshot,
    },
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;

#[derive(Deserialize)]
struct HealthQuery {
    #[serde(default)]
    detail: bool,
}

/// 健康检查处理器
async fn health_check(Query(params): Query<HealthQuery>) -> Json<ApiResponse<serde_json::Value>> {
    if params.detail {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let mut details = HashMap::new();
        details.insert("status", "healthy");
        details.insert("version", "0.1.0");
        details.insert("timestamp", timestamp.as_str());

        Json(ApiResponse::success(serde_json::json!(details)))
    } else {
        Json(ApiResponse::success(serde_json::json!({"status": "ok"})))
    }
}

/// 系统信息处理器
async fn system_info() -> Json<ApiResponse<HashMap<&'static str, serde_json::Value>>> {
    let mut info = HashMap::new();
    info.insert("name", serde_json::json!("ScanFarm Backend"));
    info.insert("version", serde_json::json!("0.1.0"));
    info.insert(
        "build_time",
        serde_json::json!(chrono::Utc::now().to_rfc3339()),
    );

    Json(ApiResponse::success(info))
}

/// Hub连通状态处理器
async fn hub_health_check(State(app_state): State<AppState>) -> Json<ApiResponse<serde_json::Value>> {
    let hubs = app_state.hub_manager.models().await;
    let up = hubs
        .iter()
        .filter(|h| h.status == scanfarm_backend::models::ClientStatus::Up)
        .count();
    // 中央模型概况直接读快照流的最新值
    let model = app_state.snapshots.borrow().clone();
    Json(ApiResponse::success(serde_json::json!({
        "hubs_total": hubs.len(),
        "hubs_up": up,
        "images": model.images.len(),
        "scan_queue": model.scan_queue.len(),
    })))
}

#[tokio::main]
async fn main() -> AppResult<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scanfarm_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 加载配置
    let config = match Config::from_file("config.toml") {
        Ok(config) => {
            tracing::info!("已加载配置文件: config.toml");
            config
        }
        Err(_) => {
            tracing::warn!("未找到配置文件，使用默认配置");
            let default_config = Config::default();
            // 保存默认配置到文件
            if let Err(e) = default_config.save_to_file("config.toml") {
                tracing::warn!("保存默认配置失败: {}", e);
            }
            default_config
        }
    };

    tracing::info!("服务器配置: {}", config.server_addr());

    let cancel = CancellationToken::new();
    let metrics = Arc::new(MetricsRegistry::new());

    // 启动reducer
    let (action_tx, action_rx) = tokio::sync::mpsc::channel(256);
    let (snapshot_tx, snapshot_rx) = tokio::sync::watch::channel(ModelSnapshot::default());
    let _reducer = spawn_reducer(
        CentralModel::new(config.scan.concurrent_scan_limit),
        action_rx,
        snapshot_tx,
        metrics.clone(),
        cancel.clone(),
    );

    // 启动Hub管理器并对齐到配置的Hub集合
    let hub_port = config.hub.port;
    let client_factory: HubClientFactory =
        Arc::new(move |host| Arc::new(HttpHubClient::new(host, hub_port)) as Arc<dyn HubClient>);
    let hub_manager = Arc::new(HubManager::new(
        config.hub.user.clone(),
        config.hub.password.clone(),
        config.hub.timings(),
        metrics.clone(),
        client_factory,
    ));
    hub_manager.set_hubs(&config.hub.hosts).await;
    tracing::info!("已配置 {} 个Hub", config.hub.hosts.len());

    // 协调器轮询用的主Hub客户端
    let primary_hub = config.hub.hosts.first().cloned();
    let polling_host = primary_hub.clone().unwrap_or_else(|| {
        tracing::warn!("未配置任何Hub，轮询将持续失败直到配置生效");
        "localhost".to_string()
    });
    let polling_client: Arc<dyn HubClient> =
        Arc::new(HttpHubClient::new(&polling_host, config.hub.port));

    // 启动协调器的三个常驻循环
    let coordinator = Coordinator::new(
        action_tx.clone(),
        hub_manager.clone(),
        polling_client,
        config.scan.clone(),
        cancel.clone(),
    );
    coordinator.start();

    // 创建应用状态
    let app_state = AppState {
        actions: action_tx,
        snapshots: snapshot_rx,
        hub_manager,
        metrics,
        primary_hub,
    };

    // 创建CORS中间件
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    // Swagger UI 页面（访问路径：/swagger-ui）
    // OpenAPI JSON 路径：/api-docs/openapi.json
    async fn swagger_ui_page() -> Html<String> {
        let html = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset=UTF-8>
  <title>ScanFarm API 文档</title>
  <link rel=stylesheet href=https://cdn.jsdelivr.net/npm/swagger-ui-dist@5.11.0/swagger-ui.css>
</head>
<body>
  <div id=swagger-ui>
    <div style="padding: 50px; text-align: center;">正在加载 API 文档...</div>
  </div>
  <script src=https://cdn.jsdelivr.net/npm/swagger-ui-dist@5.11.0/swagger-ui-bundle.js></script>
  <script src=https://cdn.jsdelivr.net/npm/swagger-ui-dist@5.11.0/swagger-ui-standalone-preset.js></script>
  <script>
    window.onload = function() {
      window.ui = SwaggerUIBundle({
        url: '/api-docs/openapi.json',
        dom_id: '#swagger-ui',
        deepLinking: true,
        presets: [SwaggerUIBundle.presets.apis, SwaggerUIStandalonePreset],
        layout: 'StandaloneLayout',
        validatorUrl: null
      });
    };
  </script>
</body>
</html>"#
            .to_string();
        Html(html)
    }

    // 创建主路由
    let app = Router::new()
        // 健康检查和系统信息
        .route("/health", get(health_check))
        .route("/api/system/info", get(system_info))
        .route("/api/health/hubs", get(hub_health_check))
        // OpenAPI JSON 路由
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        // Swagger UI 页面
        .route("/swagger-ui", get(swagger_ui_page))
        .route("/swagger-ui/", get(swagger_ui_page))
        // 业务API路由
        .merge(create_api_routes())
        .with_state(app_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // 启动服务器
    let listener = tokio::net::TcpListener::bind(&config.server_addr()).await?;
    tracing::info!("🚀 服务器启动成功，监听地址: {}", config.server_addr());

    axum::serve(listener, app).await?;

    Ok(())
}
