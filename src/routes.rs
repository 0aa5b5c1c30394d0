use crate::handlers::AppState;
use crate::handlers::{
    add_image, add_pod, delete_pod, export_metrics, finished_scan, next_image, scan_results,
    update_all_pods, update_pod,
};
use axum::{
    Router,
    routing::{delete as axum_delete, get, post, put},
};

/// 创建API路由
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        // 集群事件上报
        .route("/pod", post(add_pod)) // 新Pod
        .route("/pod", put(update_pod)) // Pod变更
        .route("/pod/{name}", axum_delete(delete_pod)) // Pod删除
        .route("/image", post(add_image)) // 新镜像
        .route("/pods", put(update_all_pods)) // 全量Pod同步
        // 扫描队列
        .route("/nextimage", get(next_image)) // 取下一个待扫描镜像
        .route("/finishedscan", post(finished_scan)) // 扫描客户端结束上报
        // 订阅方查询
        .route("/scanresults", get(scan_results)) // 聚合模型快照
        // 指标导出
        .route("/metrics", get(export_metrics))
}
