pub mod cluster;
pub mod metrics;
pub mod scan_queue;

use crate::error::{AppError, AppResult};
use crate::services::hub_manager::HubManager;
use crate::services::metrics::MetricsRegistry;
use crate::services::reducer::{Action, ModelSnapshot};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

pub use cluster::{add_image, add_pod, delete_pod, update_all_pods, update_pod};
pub use metrics::export_metrics;
pub use scan_queue::{finished_scan, next_image, scan_results};

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    /// reducer动作通道
    pub actions: mpsc::Sender<Action>,
    /// 中央模型快照流
    pub snapshots: watch::Receiver<ModelSnapshot>,
    /// Hub管理器
    pub hub_manager: Arc<HubManager>,
    /// 指标注册表
    pub metrics: Arc<MetricsRegistry>,
    /// 扫描客户端指派结果上报的主Hub
    pub primary_hub: Option<String>,
}

impl AppState {
    /// 投递动作给reducer
    pub async fn send_action(&self, action: Action) -> AppResult<()> {
        self.actions
            .send(action)
            .await
            .map_err(|_| AppError::Internal(anyhow::anyhow!("reducer不可用")))
    }

    /// 从reducer取一份新鲜快照
    pub async fn fetch_model(&self) -> AppResult<ModelSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_action(Action::GetModel(reply_tx)).await?;
        reply_rx
            .await
            .map_err(|_| AppError::Internal(anyhow::anyhow!("reducer不可用")))
    }
}
