use crate::error::AppResult;
use crate::handlers::AppState;
use crate::models::{Image, Pod};
use crate::response::ApiResponse;
use crate::services::reducer::Action;
use axum::{
    extract::{Path, State},
    response::Json,
};
use tracing::debug;

/// 集群上报新Pod
#[utoipa::path(
    post,
    path = "/pod",
    request_body = Pod,
    responses(
        (status = 200, description = "Pod已接收"),
        (status = 500, description = "服务器内部错误")
    ),
    tag = "集群事件"
)]
pub async fn add_pod(
    State(state): State<AppState>,
    Json(pod): Json<Pod>,
) -> AppResult<Json<ApiResponse<()>>> {
    debug!("收到新Pod: {}", pod.name);
    state.send_action(Action::AddPod(pod)).await?;
    Ok(Json(ApiResponse::<()>::success_empty()))
}

/// 集群上报Pod变更
#[utoipa::path(
    put,
    path = "/pod",
    request_body = Pod,
    responses(
        (status = 200, description = "Pod已更新"),
        (status = 500, description = "服务器内部错误")
    ),
    tag = "集群事件"
)]
pub async fn update_pod(
    State(state): State<AppState>,
    Json(pod): Json<Pod>,
) -> AppResult<Json<ApiResponse<()>>> {
    debug!("收到Pod更新: {}", pod.name);
    state.send_action(Action::UpdatePod(pod)).await?;
    Ok(Json(ApiResponse::<()>::success_empty()))
}

/// 集群上报Pod删除
#[utoipa::path(
    delete,
    path = "/pod/{name}",
    params(("name" = String, Path, description = "Pod限定名")),
    responses(
        (status = 200, description = "Pod已删除"),
        (status = 500, description = "服务器内部错误")
    ),
    tag = "集群事件"
)]
pub async fn delete_pod(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<ApiResponse<()>>> {
    debug!("收到Pod删除: {}", name);
    state.send_action(Action::DeletePod(name)).await?;
    Ok(Json(ApiResponse::<()>::success_empty()))
}

/// 集群上报新镜像
#[utoipa::path(
    post,
    path = "/image",
    request_body = Image,
    responses(
        (status = 200, description = "镜像已接收"),
        (status = 500, description = "服务器内部错误")
    ),
    tag = "集群事件"
)]
pub async fn add_image(
    State(state): State<AppState>,
    Json(image): Json<Image>,
) -> AppResult<Json<ApiResponse<()>>> {
    debug!("收到新镜像: {}", image.sha);
    state.send_action(Action::AddImage(image)).await?;
    Ok(Json(ApiResponse::<()>::success_empty()))
}

/// 集群全量Pod同步
#[utoipa::path(
    put,
    path = "/pods",
    request_body = Vec<Pod>,
    responses(
        (status = 200, description = "Pod列表已同步"),
        (status = 500, description = "服务器内部错误")
    ),
    tag = "集群事件"
)]
pub async fn update_all_pods(
    State(state): State<AppState>,
    Json(pods): Json<Vec<Pod>>,
) -> AppResult<Json<ApiResponse<()>>> {
    debug!("收到全量Pod同步，共 {} 个", pods.len());
    state.send_action(Action::AllPods(pods)).await?;
    Ok(Json(ApiResponse::<()>::success_empty()))
}
