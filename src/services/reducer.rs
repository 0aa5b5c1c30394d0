use crate::models::{
    Image, ImageInfo, ImageInfoSnapshot, ImageSha, Pod, ScanStatus, ScanSummary,
};
use crate::services::metrics::MetricsRegistry;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

/// 中央模型折叠的动作集合
///
/// 动作严格按到达顺序处理；携带回复通道的动作由调用方负责接收。
pub enum Action {
    AddPod(Pod),
    UpdatePod(Pod),
    DeletePod(String),
    AllPods(Vec<Pod>),
    AddImage(Image),
    GetNextImage(oneshot::Sender<Option<Image>>),
    FinishScanClient {
        sha: ImageSha,
        error: Option<String>,
    },
    GetNextImageForHubPolling(oneshot::Sender<Option<Image>>),
    HubCheckResults {
        sha: ImageSha,
        scan: Option<ScanSummary>,
    },
    HubScanResults {
        sha: ImageSha,
        scan: Option<ScanSummary>,
    },
    RequeueStalledScan(ImageSha),
    RescanImage(ImageSha),
    GetModel(oneshot::Sender<ModelSnapshot>),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::AddPod(_) => "addPod",
            Action::UpdatePod(_) => "updatePod",
            Action::DeletePod(_) => "deletePod",
            Action::AllPods(_) => "allPods",
            Action::AddImage(_) => "addImage",
            Action::GetNextImage(_) => "getNextImage",
            Action::FinishScanClient { .. } => "finishScanClient",
            Action::GetNextImageForHubPolling(_) => "getNextImageForHubPolling",
            Action::HubCheckResults { .. } => "hubCheckResults",
            Action::HubScanResults { .. } => "hubScanResults",
            Action::RequeueStalledScan(_) => "requeueStalledScan",
            Action::RescanImage(_) => "rescanImage",
            Action::GetModel(_) => "getModel",
        }
    }
}

/// 扫描客户端在途记录（含在当前状态的停留时长，供僵死检测）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ScanClientScan {
    pub sha: ImageSha,
    pub in_status_secs: u64,
}

/// 中央模型快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ModelSnapshot {
    pub pods: Vec<Pod>,
    pub images: Vec<ImageInfoSnapshot>,
    pub scan_queue: Vec<ImageSha>,
    pub in_progress_scan_client: Vec<ScanClientScan>,
    pub in_progress_hub_scans: Vec<Image>,
    pub concurrent_scan_limit: usize,
}

/// 集群级中央模型，只在reducer任务上被修改
///
/// 不变量：
/// - 任何Pod引用的镜像都有ImageInfo记录；
/// - 处于RunningScanClient状态的镜像数不超过并发上限；
/// - 到达Complete后除显式重扫外不回退；
/// - 扫描队列里只有Unscanned状态的镜像。
pub struct CentralModel {
    pods: HashMap<String, Pod>,
    images: HashMap<ImageSha, ImageInfo>,
    scan_queue: VecDeque<ImageSha>,
    concurrent_scan_limit: usize,
}

impl CentralModel {
    pub fn new(concurrent_scan_limit: usize) -> Self {
        Self {
            pods: HashMap::new(),
            images: HashMap::new(),
            scan_queue: VecDeque::new(),
            concurrent_scan_limit,
        }
    }

    /// 添加或更新Pod；完全相同的输入是无操作
    fn add_pod(&mut self, pod: Pod) {
        if self.pods.get(&pod.name) == Some(&pod) {
            debug!("Pod {} 未变化，跳过", pod.name);
            return;
        }
        for image in pod.images().cloned().collect::<Vec<_>>() {
            self.add_image(image);
        }
        self.pods.insert(pod.name.clone(), pod);
    }

    fn delete_pod(&mut self, name: &str) {
        // 镜像记录保留到进程退出
        if self.pods.remove(name).is_none() {
            warn!("删除不存在的Pod: {}", name);
        }
    }

    fn all_pods(&mut self, pods: Vec<Pod>) {
        self.pods.clear();
        for pod in pods {
            self.add_pod(pod);
        }
    }

    fn add_image(&mut self, image: Image) {
        if self.images.contains_key(&image.sha) {
            return;
        }
        info!("发现新镜像 {}，加入扫描队列", image.sha);
        let sha = image.sha.clone();
        self.images.insert(sha.clone(), ImageInfo::new(image));
        self.scan_queue.push_back(sha);
    }

    fn running_scan_client_count(&self) -> usize {
        self.images
            .values()
            .filter(|info| info.scan_status == ScanStatus::RunningScanClient)
            .count()
    }

    /// 取下一个待扫描镜像并迁移到RunningScanClient
    ///
    /// 并发上限就在这里执行：达到上限时返回None。
    fn get_next_image(&mut self) -> Option<Image> {
        if self.running_scan_client_count() >= self.concurrent_scan_limit {
            debug!("扫描客户端并发已达上限 {}", self.concurrent_scan_limit);
            return None;
        }
        let sha = self.scan_queue.pop_front()?;
        let info = self.images.get_mut(&sha)?;
        info.set_scan_status(ScanStatus::RunningScanClient);
        Some(info.image.clone())
    }

    fn finish_scan_client(&mut self, sha: &ImageSha, error: Option<String>) {
        let Some(info) = self.images.get_mut(sha) else {
            warn!("finishScanClient: 未知镜像 {}", sha);
            return;
        };
        if info.scan_status != ScanStatus::RunningScanClient {
            warn!(
                "finishScanClient: 镜像 {} 不在RunningScanClient状态，忽略",
                sha
            );
            return;
        }
        match error {
            None => info.set_scan_status(ScanStatus::RunningHubScan),
            Some(e) => {
                info!("镜像 {} 扫描客户端失败，重新排队: {}", sha, e);
                info.set_scan_status(ScanStatus::Unscanned);
                self.scan_queue.push_back(sha.clone());
            }
        }
    }

    /// 轮转扫描队列，取下一个要去Hub上核对的镜像（不改状态）
    fn next_image_for_hub_polling(&mut self) -> Option<Image> {
        let sha = self.scan_queue.pop_front()?;
        self.scan_queue.push_back(sha.clone());
        self.images.get(&sha).map(|info| info.image.clone())
    }

    /// Hub核对结果：发现已有终态扫描时直接判完成，省掉一次扫描
    fn hub_check_results(&mut self, sha: &ImageSha, scan: Option<ScanSummary>) {
        let Some(summary) = scan else { return };
        let Some(info) = self.images.get_mut(sha) else {
            warn!("hubCheckResults: 未知镜像 {}", sha);
            return;
        };
        if !summary.is_done() {
            return;
        }
        match info.scan_status {
            ScanStatus::Unscanned | ScanStatus::RunningHubScan => {
                info!("镜像 {} 在Hub上已有完成的扫描", sha);
                info.scan_summary = Some(summary);
                info.set_scan_status(ScanStatus::Complete);
                self.scan_queue.retain(|queued| queued != sha);
            }
            ScanStatus::RunningScanClient | ScanStatus::Complete => {}
        }
    }

    /// Hub完成轮询结果：在途Hub扫描到达终态时迁移到Complete
    fn hub_scan_results(&mut self, sha: &ImageSha, scan: Option<ScanSummary>) {
        let Some(summary) = scan else { return };
        let Some(info) = self.images.get_mut(sha) else {
            warn!("hubScanResults: 未知镜像 {}", sha);
            return;
        };
        if info.scan_status != ScanStatus::RunningHubScan {
            return;
        }
        if summary.is_done() {
            info!("镜像 {} 的Hub扫描完成", sha);
            info.scan_summary = Some(summary);
            info.set_scan_status(ScanStatus::Complete);
        } else {
            info.scan_summary = Some(summary);
        }
    }

    /// 僵死扫描重新排队
    fn requeue_stalled_scan(&mut self, sha: &ImageSha) {
        let Some(info) = self.images.get_mut(sha) else {
            return;
        };
        if info.scan_status == ScanStatus::RunningScanClient {
            warn!("镜像 {} 的扫描客户端疑似僵死，重新排队", sha);
            info.set_scan_status(ScanStatus::Unscanned);
            self.scan_queue.push_back(sha.clone());
        }
    }

    /// 显式重扫：Complete状态唯一允许的回退
    fn rescan_image(&mut self, sha: &ImageSha) {
        let Some(info) = self.images.get_mut(sha) else {
            warn!("rescanImage: 未知镜像 {}", sha);
            return;
        };
        if info.scan_status == ScanStatus::Complete {
            info!("镜像 {} 被要求重扫", sha);
            info.set_scan_status(ScanStatus::Unscanned);
            self.scan_queue.push_back(sha.clone());
        }
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        let mut pods: Vec<Pod> = self.pods.values().cloned().collect();
        pods.sort_by(|a, b| a.name.cmp(&b.name));

        let mut images: Vec<ImageInfoSnapshot> =
            self.images.values().map(|info| info.snapshot()).collect();
        images.sort_by(|a, b| a.sha.cmp(&b.sha));

        let mut in_progress_scan_client: Vec<ScanClientScan> = self
            .images
            .values()
            .filter(|info| info.scan_status == ScanStatus::RunningScanClient)
            .map(|info| ScanClientScan {
                sha: info.sha().clone(),
                in_status_secs: info.time_in_current_status().as_secs(),
            })
            .collect();
        in_progress_scan_client.sort_by(|a, b| a.sha.cmp(&b.sha));

        let mut in_progress_hub_scans: Vec<Image> = self
            .images
            .values()
            .filter(|info| info.scan_status == ScanStatus::RunningHubScan)
            .map(|info| info.image.clone())
            .collect();
        in_progress_hub_scans.sort_by(|a, b| a.sha.cmp(&b.sha));

        ModelSnapshot {
            pods,
            images,
            scan_queue: self.scan_queue.iter().cloned().collect(),
            in_progress_scan_client,
            in_progress_hub_scans,
            concurrent_scan_limit: self.concurrent_scan_limit,
        }
    }

    /// 处理单个动作；回复通道上的发送不等待接收方
    pub fn apply(&mut self, action: Action) {
        match action {
            Action::AddPod(pod) | Action::UpdatePod(pod) => self.add_pod(pod),
            Action::DeletePod(name) => self.delete_pod(&name),
            Action::AllPods(pods) => self.all_pods(pods),
            Action::AddImage(image) => self.add_image(image),
            Action::GetNextImage(reply) => {
                let _ = reply.send(self.get_next_image());
            }
            Action::FinishScanClient { sha, error } => self.finish_scan_client(&sha, error),
            Action::GetNextImageForHubPolling(reply) => {
                let _ = reply.send(self.next_image_for_hub_polling());
            }
            Action::HubCheckResults { sha, scan } => self.hub_check_results(&sha, scan),
            Action::HubScanResults { sha, scan } => self.hub_scan_results(&sha, scan),
            Action::RequeueStalledScan(sha) => self.requeue_stalled_scan(&sha),
            Action::RescanImage(sha) => self.rescan_image(&sha),
            Action::GetModel(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }
}

/// 启动reducer任务
///
/// 单任务串行消费动作流，每处理完一个动作发布一份新快照。
/// reducer自身永不睡眠，也不在回复之外阻塞。
pub fn spawn_reducer(
    mut model: CentralModel,
    mut actions: mpsc::Receiver<Action>,
    snapshots: watch::Sender<ModelSnapshot>,
    metrics: Arc<MetricsRegistry>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("reducer启动");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                action = actions.recv() => {
                    match action {
                        None => break,
                        Some(action) => {
                            metrics.record_reducer_action(action.name());
                            model.apply(action);
                            let snapshot = model.snapshot();
                            metrics.set_model_gauges(&snapshot);
                            let _ = snapshots.send(snapshot);
                        }
                    }
                }
            }
        }
        info!("reducer退出");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Container, PolicySummary, ScanCompletionStatus, VulnerabilitySummary,
    };
    use std::time::Duration;

    fn image(sha: &str) -> Image {
        Image::new(sha, "registry.example.com", "app/web", "1.0")
    }

    fn complete_scan() -> ScanSummary {
        ScanSummary {
            status: ScanCompletionStatus::Complete,
            vulnerabilities: VulnerabilitySummary {
                critical: 0,
                high: 2,
                medium: 1,
                low: 0,
            },
            policy: PolicySummary { violation_count: 1 },
        }
    }

    fn status_of(model: &CentralModel, sha: &str) -> ScanStatus {
        model.images[&ImageSha::from(sha)].scan_status
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_image_happy_path() {
        let mut model = CentralModel::new(2);

        model.apply(Action::AddImage(image("aaa")));

        let (tx, mut rx) = oneshot::channel();
        model.apply(Action::GetNextImage(tx));
        let next = rx.try_recv().unwrap().unwrap();
        assert_eq!(next.sha, ImageSha::from("aaa"));
        assert_eq!(status_of(&model, "aaa"), ScanStatus::RunningScanClient);

        model.apply(Action::FinishScanClient {
            sha: ImageSha::from("aaa"),
            error: None,
        });
        assert_eq!(status_of(&model, "aaa"), ScanStatus::RunningHubScan);
        assert_eq!(model.snapshot().in_progress_hub_scans.len(), 1);

        model.apply(Action::HubScanResults {
            sha: ImageSha::from("aaa"),
            scan: Some(complete_scan()),
        });

        let snapshot = model.snapshot();
        assert_eq!(status_of(&model, "aaa"), ScanStatus::Complete);
        assert!(snapshot.in_progress_scan_client.is_empty());
        assert!(snapshot.in_progress_hub_scans.is_empty());
        assert_eq!(
            snapshot.images[0].scan_summary.as_ref().unwrap(),
            &complete_scan()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_clamp() {
        let mut model = CentralModel::new(2);
        for sha in ["a", "b", "c"] {
            model.apply(Action::AddImage(image(sha)));
        }

        let mut next = Vec::new();
        for _ in 0..3 {
            let (tx, mut rx) = oneshot::channel();
            model.apply(Action::GetNextImage(tx));
            next.push(rx.try_recv().unwrap().map(|i| i.sha.to_string()));
        }
        assert_eq!(
            next,
            vec![Some("a".to_string()), Some("b".to_string()), None]
        );

        model.apply(Action::FinishScanClient {
            sha: ImageSha::from("a"),
            error: None,
        });

        let (tx, mut rx) = oneshot::channel();
        model.apply(Action::GetNextImage(tx));
        assert_eq!(
            rx.try_recv().unwrap().map(|i| i.sha.to_string()),
            Some("c".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_scan_client_never_exceeds_limit() {
        let mut model = CentralModel::new(3);
        for i in 0..10 {
            model.apply(Action::AddImage(image(&format!("sha{}", i))));
        }
        for _ in 0..10 {
            let (tx, _rx) = oneshot::channel();
            model.apply(Action::GetNextImage(tx));
            assert!(model.running_scan_client_count() <= 3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_pod_is_idempotent() {
        let mut model = CentralModel::new(2);
        let pod = Pod::new(
            "default/web-0",
            vec![Container::new("web", image("aaa"))],
        );

        model.apply(Action::AddPod(pod.clone()));
        let first = model.snapshot();

        model.apply(Action::AddPod(pod));
        let second = model.snapshot();

        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_pod_image_gets_image_info() {
        let mut model = CentralModel::new(2);
        let pod = Pod::new(
            "default/web-0",
            vec![
                Container::new("web", image("aaa")),
                Container::new("sidecar", image("bbb")),
            ],
        );
        model.apply(Action::AddPod(pod));

        for pod in model.snapshot().pods {
            for container in &pod.containers {
                assert!(model.images.contains_key(&container.image.sha));
            }
        }
        assert_eq!(model.snapshot().images.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_image_never_returned_by_get_next_image() {
        let mut model = CentralModel::new(2);
        model.apply(Action::AddImage(image("aaa")));

        let (tx, _rx) = oneshot::channel();
        model.apply(Action::GetNextImage(tx));
        model.apply(Action::FinishScanClient {
            sha: ImageSha::from("aaa"),
            error: None,
        });
        model.apply(Action::HubScanResults {
            sha: ImageSha::from("aaa"),
            scan: Some(complete_scan()),
        });

        let (tx, mut rx) = oneshot::channel();
        model.apply(Action::GetNextImage(tx));
        assert!(rx.try_recv().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_scan_client_requeues() {
        let mut model = CentralModel::new(2);
        model.apply(Action::AddImage(image("aaa")));

        let (tx, _rx) = oneshot::channel();
        model.apply(Action::GetNextImage(tx));
        model.apply(Action::FinishScanClient {
            sha: ImageSha::from("aaa"),
            error: Some("磁盘已满".to_string()),
        });

        assert_eq!(status_of(&model, "aaa"), ScanStatus::Unscanned);
        let (tx, mut rx) = oneshot::channel();
        model.apply(Action::GetNextImage(tx));
        assert!(rx.try_recv().unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_stalled_scan() {
        let mut model = CentralModel::new(2);
        model.apply(Action::AddImage(image("x")));

        let (tx, _rx) = oneshot::channel();
        model.apply(Action::GetNextImage(tx));
        assert_eq!(status_of(&model, "x"), ScanStatus::RunningScanClient);

        model.apply(Action::RequeueStalledScan(ImageSha::from("x")));
        assert_eq!(status_of(&model, "x"), ScanStatus::Unscanned);

        let (tx, mut rx) = oneshot::channel();
        model.apply(Action::GetNextImage(tx));
        assert_eq!(
            rx.try_recv().unwrap().map(|i| i.sha.to_string()),
            Some("x".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hub_check_results_short_circuits_queued_image() {
        let mut model = CentralModel::new(2);
        model.apply(Action::AddImage(image("aaa")));

        // Hub上已有完成的扫描：镜像直接判完成并离开队列
        model.apply(Action::HubCheckResults {
            sha: ImageSha::from("aaa"),
            scan: Some(complete_scan()),
        });

        assert_eq!(status_of(&model, "aaa"), ScanStatus::Complete);
        assert!(model.snapshot().scan_queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hub_polling_rotates_queue() {
        let mut model = CentralModel::new(2);
        model.apply(Action::AddImage(image("a")));
        model.apply(Action::AddImage(image("b")));

        let mut seen = Vec::new();
        for _ in 0..4 {
            let (tx, mut rx) = oneshot::channel();
            model.apply(Action::GetNextImageForHubPolling(tx));
            seen.push(rx.try_recv().unwrap().unwrap().sha.to_string());
        }
        assert_eq!(seen, vec!["a", "b", "a", "b"]);
        // 轮询不改变扫描状态
        assert_eq!(status_of(&model, "a"), ScanStatus::Unscanned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_is_only_regression_from_complete() {
        let mut model = CentralModel::new(2);
        model.apply(Action::AddImage(image("aaa")));
        model.apply(Action::HubCheckResults {
            sha: ImageSha::from("aaa"),
            scan: Some(complete_scan()),
        });
        assert_eq!(status_of(&model, "aaa"), ScanStatus::Complete);

        // 完成态不受常规动作影响
        model.apply(Action::FinishScanClient {
            sha: ImageSha::from("aaa"),
            error: None,
        });
        model.apply(Action::RequeueStalledScan(ImageSha::from("aaa")));
        assert_eq!(status_of(&model, "aaa"), ScanStatus::Complete);

        model.apply(Action::RescanImage(ImageSha::from("aaa")));
        assert_eq!(status_of(&model, "aaa"), ScanStatus::Unscanned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_pod_keeps_images() {
        let mut model = CentralModel::new(2);
        let pod = Pod::new("default/web-0", vec![Container::new("web", image("aaa"))]);
        model.apply(Action::AddPod(pod));
        model.apply(Action::DeletePod("default/web-0".to_string()));

        let snapshot = model.snapshot();
        assert!(snapshot.pods.is_empty());
        assert_eq!(snapshot.images.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_pods_replaces_pod_set() {
        let mut model = CentralModel::new(2);
        model.apply(Action::AddPod(Pod::new(
            "default/old",
            vec![Container::new("c", image("aaa"))],
        )));

        model.apply(Action::AllPods(vec![Pod::new(
            "default/new",
            vec![Container::new("c", image("bbb"))],
        )]));

        let snapshot = model.snapshot();
        assert_eq!(snapshot.pods.len(), 1);
        assert_eq!(snapshot.pods[0].name, "default/new");
        // 旧镜像记录保留
        assert_eq!(snapshot.images.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reducer_task_publishes_snapshots() {
        let (action_tx, action_rx) = mpsc::channel(16);
        let (snapshot_tx, mut snapshot_rx) = watch::channel(ModelSnapshot::default());
        let cancel = CancellationToken::new();
        let handle = spawn_reducer(
            CentralModel::new(2),
            action_rx,
            snapshot_tx,
            Arc::new(MetricsRegistry::new()),
            cancel.clone(),
        );

        action_tx.send(Action::AddImage(image("aaa"))).await.unwrap();
        snapshot_rx.changed().await.unwrap();
        {
            let snapshot = snapshot_rx.borrow();
            assert_eq!(snapshot.images.len(), 1);
            assert_eq!(snapshot.scan_queue.len(), 1);
        }

        // 回复通道按RPC语义使用
        let (tx, rx) = oneshot::channel();
        action_tx.send(Action::GetNextImage(tx)).await.unwrap();
        let next = rx.await.unwrap().unwrap();
        assert_eq!(next.sha, ImageSha::from("aaa"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
