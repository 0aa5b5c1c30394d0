use crate::error::AppResult;
use crate::handlers::AppState;
use crate::models::HubSnapshot;
use crate::response::ApiResponse;
use crate::services::reducer::{Action, ModelSnapshot};
use axum::{extract::State, response::Json};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{info, warn};
use utoipa::ToSchema;

/// 下一个待扫描镜像的响应
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NextImageResponse {
    /// 待扫描镜像的Sha；队列为空或并发已满时为空
    pub image_sha: Option<String>,
    /// Hub侧项目名，扫描客户端以此上报
    pub hub_project_name: Option<String>,
}

/// 扫描客户端结束上报
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FinishedScanRequest {
    pub sha: String,
    /// 客户端错误信息；为空表示成功
    pub err: Option<String>,
}

/// 聚合模型快照响应
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ScanResultsResponse {
    pub model: ModelSnapshot,
    pub hubs: Vec<HubSnapshot>,
}

/// 取下一个待扫描镜像
///
/// 并发上限之内从队列头取出一个镜像并标记为扫描客户端执行中，
/// 同时把Hub侧的扫描期望预置到主Hub。
#[utoipa::path(
    get,
    path = "/nextimage",
    responses(
        (status = 200, description = "下一个待扫描镜像", body = ApiResponse<NextImageResponse>),
        (status = 500, description = "服务器内部错误")
    ),
    tag = "扫描队列"
)]
pub async fn next_image(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<NextImageResponse>>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    state.send_action(Action::GetNextImage(reply_tx)).await?;
    let image = reply_rx
        .await
        .map_err(|_| crate::error::AppError::Internal(anyhow::anyhow!("reducer不可用")))?;

    let response = match image {
        Some(image) => {
            let project = image.hub_project_name();
            info!("指派镜像 {} 给扫描客户端", image.sha);
            // 预置Hub侧期望；失败只记录，不影响指派
            if let Some(hub) = &state.primary_hub {
                if let Err(e) = state.hub_manager.start_scan_client(hub, &project).await {
                    warn!("预置Hub {} 的扫描期望失败: {}", hub, e);
                }
            }
            NextImageResponse {
                image_sha: Some(image.sha.to_string()),
                hub_project_name: Some(project),
            }
        }
        None => NextImageResponse {
            image_sha: None,
            hub_project_name: None,
        },
    };
    Ok(Json(ApiResponse::success(response)))
}

/// 扫描客户端结束上报
#[utoipa::path(
    post,
    path = "/finishedscan",
    request_body = FinishedScanRequest,
    responses(
        (status = 200, description = "已记录"),
        (status = 500, description = "服务器内部错误")
    ),
    tag = "扫描队列"
)]
pub async fn finished_scan(
    State(state): State<AppState>,
    Json(request): Json<FinishedScanRequest>,
) -> AppResult<Json<ApiResponse<()>>> {
    info!(
        "扫描客户端结束: {} ({})",
        request.sha,
        request.err.as_deref().unwrap_or("成功")
    );

    // 通知主Hub开始等待该扫描完成
    if let Some(hub) = &state.primary_hub {
        let snapshot = state.fetch_model().await?;
        let project = snapshot
            .images
            .iter()
            .find(|i| i.sha.as_str() == request.sha)
            .map(|i| i.hub_project_name.clone());
        if let Some(project) = project {
            if let Err(e) = state
                .hub_manager
                .finish_scan_client(hub, &project, request.err.clone())
                .await
            {
                warn!("通知Hub {} 扫描客户端结束失败: {}", hub, e);
            }
        }
    }

    state
        .send_action(Action::FinishScanClient {
            sha: request.sha.as_str().into(),
            error: request.err,
        })
        .await?;
    Ok(Json(ApiResponse::<()>::success_empty()))
}

/// 聚合模型快照
///
/// 返回中央模型与每个Hub的快照；读取是快照语义，不提供事务一致性。
#[utoipa::path(
    get,
    path = "/scanresults",
    responses(
        (status = 200, description = "聚合模型快照", body = ApiResponse<ScanResultsResponse>),
        (status = 500, description = "服务器内部错误")
    ),
    tag = "订阅方查询"
)]
pub async fn scan_results(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<ScanResultsResponse>>> {
    let model = state.fetch_model().await?;
    let hubs = state.hub_manager.models().await;
    Ok(Json(ApiResponse::success(ScanResultsResponse {
        model,
        hubs,
    })))
}
