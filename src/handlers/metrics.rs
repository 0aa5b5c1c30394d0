use crate::handlers::AppState;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;

/// Prometheus指标导出
///
/// 这是唯一不走统一响应包装的接口，按Prometheus文本格式输出。
#[utoipa::path(
    get,
    path = "/metrics",
    responses(
        (status = 200, description = "Prometheus文本格式指标", body = String, content_type = "text/plain")
    ),
    tag = "指标"
)]
pub async fn export_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
