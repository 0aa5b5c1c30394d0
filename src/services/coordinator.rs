use crate::config::ScanConfig;
use crate::services::hub_client::HubClient;
use crate::services::hub_manager::HubManager;
use crate::services::reducer::{Action, ModelSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 扫描编排协调器
///
/// 把HTTP responder、reducer和Hub管理器接在一起，运行三个常驻
/// 循环：镜像指派轮询、Hub完成轮询、僵死扫描检测。循环只记录
/// 错误并继续，在取消令牌关闭后的一个间隔内退出。
pub struct Coordinator {
    actions: mpsc::Sender<Action>,
    hub_manager: Arc<HubManager>,
    hub_client: Arc<dyn HubClient>,
    scan_config: ScanConfig,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        actions: mpsc::Sender<Action>,
        hub_manager: Arc<HubManager>,
        hub_client: Arc<dyn HubClient>,
        scan_config: ScanConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            actions,
            hub_manager,
            hub_client,
            scan_config,
            cancel,
        }
    }

    pub fn hub_manager(&self) -> &Arc<HubManager> {
        &self.hub_manager
    }

    /// 启动三个常驻循环
    pub fn start(&self) {
        info!("协调器启动");
        tokio::spawn(image_assignment_loop(
            self.actions.clone(),
            self.hub_client.clone(),
            self.scan_config.clone(),
            self.cancel.clone(),
        ));
        tokio::spawn(completion_polling_loop(
            self.actions.clone(),
            self.hub_client.clone(),
            self.scan_config.clone(),
            self.cancel.clone(),
        ));
        tokio::spawn(stalled_scan_detector(
            self.actions.clone(),
            self.scan_config.clone(),
            self.cancel.clone(),
        ));
    }
}

/// 从reducer取一份新鲜快照
async fn fetch_model(actions: &mpsc::Sender<Action>) -> Option<ModelSnapshot> {
    let (reply_tx, reply_rx) = oneshot::channel();
    actions.send(Action::GetModel(reply_tx)).await.ok()?;
    reply_rx.await.ok()
}

/// 可被取消的睡眠；返回false表示已取消
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// 镜像指派轮询
///
/// 轮转取下一个待查镜像，去Hub上核对是否已有扫描结果；命中后
/// 节流一拍，队列为空时退避更久。
async fn image_assignment_loop(
    actions: mpsc::Sender<Action>,
    hub_client: Arc<dyn HubClient>,
    config: ScanConfig,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if actions
            .send(Action::GetNextImageForHubPolling(reply_tx))
            .await
            .is_err()
        {
            break;
        }
        let image = match reply_rx.await {
            Ok(image) => image,
            Err(_) => break,
        };

        match image {
            Some(image) => {
                let project = image.hub_project_name();
                match hub_client.fetch_scan(&project).await {
                    Ok(scan) => {
                        if scan.is_none() {
                            debug!("Hub上尚无镜像 {} 的扫描", project);
                        }
                        let _ = actions
                            .send(Action::HubCheckResults {
                                sha: image.sha.clone(),
                                scan,
                            })
                            .await;
                    }
                    Err(e) => warn!("核对镜像 {} 的Hub扫描失败: {}", project, e),
                }
                if !sleep_or_cancel(&cancel, config.hub_check_throttle()).await {
                    break;
                }
            }
            None => {
                // 没有待查镜像，放慢节奏
                if !sleep_or_cancel(&cancel, config.hub_check_pause()).await {
                    break;
                }
            }
        }
    }
    info!("镜像指派轮询退出");
}

/// Hub完成轮询
///
/// 周期性遍历在途的Hub扫描，逐个拉取结果回投reducer。
async fn completion_polling_loop(
    actions: mpsc::Sender<Action>,
    hub_client: Arc<dyn HubClient>,
    config: ScanConfig,
    cancel: CancellationToken,
) {
    let mut ticker = interval(config.hub_check_pause());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(snapshot) = fetch_model(&actions).await else {
            break;
        };
        for image in snapshot.in_progress_hub_scans {
            let project = image.hub_project_name();
            match hub_client.fetch_scan(&project).await {
                Ok(scan) => {
                    let _ = actions
                        .send(Action::HubScanResults {
                            sha: image.sha.clone(),
                            scan,
                        })
                        .await;
                }
                Err(e) => warn!("拉取镜像 {} 的Hub扫描失败: {}", project, e),
            }
            if !sleep_or_cancel(&cancel, config.hub_check_throttle()).await {
                return;
            }
        }
    }
    info!("Hub完成轮询退出");
}

/// 僵死扫描检测
///
/// 在RunningScanClient状态停留超过阈值的镜像被重新排队。
async fn stalled_scan_detector(
    actions: mpsc::Sender<Action>,
    config: ScanConfig,
    cancel: CancellationToken,
) {
    let timeout_secs = config.stalled_scan_timeout().as_secs();
    let mut ticker = interval(config.stalled_scan_check_pause());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(snapshot) = fetch_model(&actions).await else {
            break;
        };
        for scan in snapshot.in_progress_scan_client {
            if scan.in_status_secs > timeout_secs {
                warn!(
                    "镜像 {} 在扫描客户端停留 {}秒，判定僵死",
                    scan.sha, scan.in_status_secs
                );
                let _ = actions
                    .send(Action::RequeueStalledScan(scan.sha.clone()))
                    .await;
            }
        }
    }
    info!("僵死扫描检测退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubTimings;
    use crate::models::{
        Image, ImageSha, PolicySummary, ScanCompletionStatus, ScanStatus, ScanSummary,
        VulnerabilitySummary,
    };
    use crate::services::hub_client::mock::MockHubClient;
    use crate::services::hub_manager::{HubClientFactory, HubManager};
    use crate::services::metrics::MetricsRegistry;
    use crate::services::reducer::{spawn_reducer, CentralModel, ModelSnapshot};
    use tokio::sync::watch;

    fn timings() -> HubTimings {
        HubTimings {
            login_pause: Duration::from_secs(30),
            get_metrics_pause: Duration::from_secs(15),
            fetch_all_scans_pause: Duration::from_secs(1800),
            fetch_unknown_scans_pause: Duration::from_secs(60),
            scan_completion_pause: Duration::from_secs(60),
            refresh_scans_pause: Duration::from_secs(3600),
            refresh_threshold: Duration::from_secs(3600),
        }
    }

    fn complete_scan() -> ScanSummary {
        ScanSummary {
            status: ScanCompletionStatus::Complete,
            vulnerabilities: VulnerabilitySummary::default(),
            policy: PolicySummary { violation_count: 0 },
        }
    }

    struct Harness {
        actions: mpsc::Sender<Action>,
        hub_client: Arc<MockHubClient>,
        cancel: CancellationToken,
    }

    async fn setup(concurrent_scan_limit: usize) -> Harness {
        let cancel = CancellationToken::new();
        let metrics = Arc::new(MetricsRegistry::new());
        let (action_tx, action_rx) = mpsc::channel(256);
        let (snapshot_tx, _snapshot_rx) = watch::channel(ModelSnapshot::default());
        let _reducer = spawn_reducer(
            CentralModel::new(concurrent_scan_limit),
            action_rx,
            snapshot_tx,
            metrics.clone(),
            cancel.clone(),
        );

        let hub_client = Arc::new(MockHubClient::new());
        let factory: HubClientFactory = {
            let hub_client = hub_client.clone();
            Arc::new(move |_host| hub_client.clone())
        };
        let hub_manager = Arc::new(HubManager::new(
            "user",
            "pass",
            timings(),
            metrics,
            factory,
        ));
        hub_manager.set_hubs(&["h1".to_string()]).await;

        let coordinator = Coordinator::new(
            action_tx.clone(),
            hub_manager,
            hub_client.clone(),
            ScanConfig::default(),
            cancel.clone(),
        );
        coordinator.start();

        Harness {
            actions: action_tx,
            hub_client,
            cancel,
        }
    }

    async fn get_model(actions: &mpsc::Sender<Action>) -> ModelSnapshot {
        fetch_model(actions).await.expect("reducer应存活")
    }

    async fn get_next_image(actions: &mpsc::Sender<Action>) -> Option<Image> {
        let (tx, rx) = oneshot::channel();
        actions.send(Action::GetNextImage(tx)).await.unwrap();
        rx.await.unwrap()
    }

    fn status_of(snapshot: &ModelSnapshot, sha: &str) -> ScanStatus {
        snapshot
            .images
            .iter()
            .find(|i| i.sha == ImageSha::from(sha))
            .unwrap()
            .scan_status
    }

    async fn settle() {
        tokio::time::advance(Duration::from_millis(10)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_scan_requeued_after_timeout() {
        let h = setup(2).await;

        h.actions
            .send(Action::AddImage(Image::new("x", "reg", "app/web", "1.0")))
            .await
            .unwrap();

        let image = get_next_image(&h.actions).await.unwrap();
        assert_eq!(image.sha, ImageSha::from("x"));

        // 并发上限之内没有其他镜像可取
        assert!(get_next_image(&h.actions).await.is_none());

        // 31分钟后僵死检测触发，镜像回到队列
        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        settle().await;

        let snapshot = get_model(&h.actions).await;
        assert_eq!(status_of(&snapshot, "x"), ScanStatus::Unscanned);

        let image = get_next_image(&h.actions).await.unwrap();
        assert_eq!(image.sha, ImageSha::from("x"));

        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_not_requeued_before_timeout() {
        let h = setup(2).await;

        h.actions
            .send(Action::AddImage(Image::new("x", "reg", "app/web", "1.0")))
            .await
            .unwrap();
        get_next_image(&h.actions).await.unwrap();

        // 29分钟还不到阈值
        tokio::time::advance(Duration::from_secs(29 * 60)).await;
        settle().await;

        let snapshot = get_model(&h.actions).await;
        assert_eq!(status_of(&snapshot, "x"), ScanStatus::RunningScanClient);

        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_polling_drives_hub_scan_to_complete() {
        let h = setup(2).await;

        let image = Image::new("aaa", "reg", "app/web", "1.0");
        let project = image.hub_project_name();
        h.actions.send(Action::AddImage(image)).await.unwrap();

        get_next_image(&h.actions).await.unwrap();
        h.actions
            .send(Action::FinishScanClient {
                sha: ImageSha::from("aaa"),
                error: None,
            })
            .await
            .unwrap();
        settle().await;

        // Hub侧完成后，完成轮询把结果带回来
        h.hub_client.set_scan(&project, complete_scan());
        tokio::time::advance(Duration::from_secs(25)).await;
        settle().await;

        let snapshot = get_model(&h.actions).await;
        assert_eq!(status_of(&snapshot, "aaa"), ScanStatus::Complete);
        assert!(snapshot.in_progress_hub_scans.is_empty());

        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_assignment_loop_discovers_preexisting_scan() {
        let h = setup(2).await;

        let image = Image::new("bbb", "reg", "app/db", "2.0");
        let project = image.hub_project_name();
        h.hub_client.set_scan(&project, complete_scan());

        h.actions.send(Action::AddImage(image)).await.unwrap();

        // 指派轮询发现Hub上已有完成的扫描，免去一次扫描
        tokio::time::advance(Duration::from_secs(25)).await;
        settle().await;

        let snapshot = get_model(&h.actions).await;
        assert_eq!(status_of(&snapshot, "bbb"), ScanStatus::Complete);
        assert!(snapshot.scan_queue.is_empty());

        h.cancel.cancel();
    }
}
