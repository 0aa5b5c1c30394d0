use crate::error::{AppError, AppResult};
use crate::models::{ClientStatus, CodeLocation, HubSnapshot, ScanSummary, Update};
use crate::services::circuit_breaker::CircuitBreaker;
use crate::services::hub_client::HubClient;
use crate::services::hub_model::HubModel;
use crate::services::metrics::MetricsRegistry;
use crate::services::timer::{Timer, TimerTask};
use crate::config::HubTimings;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 错误环上限；超出后丢弃最旧的一半
const MAX_ERRORS: usize = 1000;
const ERRORS_DROP: usize = 500;

/// Update广播通道容量；消费慢的订阅方会丢事件，不阻塞actor
const UPDATES_CAPACITY: usize = 64;

/// actor动作通道容量
const ACTIONS_CAPACITY: usize = 256;

/// Hub actor的内部动作，全部在actor任务上串行执行
enum HubAction {
    DidLogin(AppResult<()>),
    DidFetchCodeLocations(AppResult<Vec<CodeLocation>>),
    DidFetchScan {
        name: String,
        result: AppResult<Option<ScanSummary>>,
    },
    DidRefreshScan {
        name: String,
        result: AppResult<Option<ScanSummary>>,
    },
    UnfetchedScanNames(oneshot::Sender<Vec<String>>),
    InProgressScanNames(oneshot::Sender<Vec<String>>),
    StaleCompletedScanNames(oneshot::Sender<Vec<String>>),
    RecordStateMetrics,
    StartScanClient(String),
    FinishScanClient {
        name: String,
        error: Option<String>,
    },
    ScansCount(oneshot::Sender<usize>),
    InProgressScans(oneshot::Sender<Vec<String>>),
    ScanResults(oneshot::Sender<HashMap<String, ScanSummary>>),
    HasFetchedScans(oneshot::Sender<bool>),
    Model(oneshot::Sender<HubSnapshot>),
    ResetCircuitBreaker,
}

impl HubAction {
    fn name(&self) -> &'static str {
        match self {
            HubAction::DidLogin(_) => "didLogin",
            HubAction::DidFetchCodeLocations(_) => "didFetchCodeLocations",
            HubAction::DidFetchScan { .. } => "didFetchScan",
            HubAction::DidRefreshScan { .. } => "didRefreshScan",
            HubAction::UnfetchedScanNames(_) => "unfetchedScanNames",
            HubAction::InProgressScanNames(_) => "inProgressScanNames",
            HubAction::StaleCompletedScanNames(_) => "staleCompletedScanNames",
            HubAction::RecordStateMetrics => "recordStateMetrics",
            HubAction::StartScanClient(_) => "startScanClient",
            HubAction::FinishScanClient { .. } => "finishScanClient",
            HubAction::ScansCount(_) => "scansCount",
            HubAction::InProgressScans(_) => "inProgressScans",
            HubAction::ScanResults(_) => "scanResults",
            HubAction::HasFetchedScans(_) => "hasFetchedScans",
            HubAction::Model(_) => "getModel",
            HubAction::ResetCircuitBreaker => "resetCircuitBreaker",
        }
    }
}

/// Hub actor的外部句柄
///
/// 所有操作都封装成动作消息投递给actor任务；快照类查询通过一次性
/// 回复通道返回。句柄可以随意克隆。
#[derive(Clone)]
pub struct HubActorHandle {
    host: String,
    action_tx: mpsc::Sender<HubAction>,
    updates_tx: broadcast::Sender<Update>,
    cancel: CancellationToken,
}

impl HubActorHandle {
    pub fn host(&self) -> &str {
        &self.host
    }

    async fn send(&self, action: HubAction) -> AppResult<()> {
        self.action_tx
            .send(action)
            .await
            .map_err(|_| AppError::hub(format!("Hub {} 的actor已停止", self.host)))
    }

    async fn query<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> HubAction,
    ) -> AppResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(make(reply_tx)).await?;
        reply_rx
            .await
            .map_err(|_| AppError::hub(format!("Hub {} 的actor已停止", self.host)))
    }

    /// 记录扫描客户端开始，预置Hub侧扫描期望
    pub async fn start_scan_client(&self, scan_name: &str) -> AppResult<()> {
        self.send(HubAction::StartScanClient(scan_name.to_string()))
            .await
    }

    /// 记录扫描客户端结束；`scan_error` 非空表示客户端失败
    pub async fn finish_scan_client(
        &self,
        scan_name: &str,
        scan_error: Option<String>,
    ) -> AppResult<()> {
        self.send(HubAction::FinishScanClient {
            name: scan_name.to_string(),
            error: scan_error,
        })
        .await
    }

    pub async fn scans_count(&self) -> AppResult<usize> {
        self.query(HubAction::ScansCount).await
    }

    pub async fn in_progress_scans(&self) -> AppResult<Vec<String>> {
        self.query(HubAction::InProgressScans).await
    }

    pub async fn scan_results(&self) -> AppResult<HashMap<String, ScanSummary>> {
        self.query(HubAction::ScanResults).await
    }

    pub async fn has_fetched_scans(&self) -> AppResult<bool> {
        self.query(HubAction::HasFetchedScans).await
    }

    pub async fn model(&self) -> AppResult<HubSnapshot> {
        self.query(HubAction::Model).await
    }

    /// 订阅扫描事件流
    ///
    /// 新订阅方不会收到历史事件；消费不及时会丢事件而不是阻塞actor。
    pub fn updates(&self) -> broadcast::Receiver<Update> {
        self.updates_tx.subscribe()
    }

    /// 强制熔断器回到closed
    pub async fn reset_circuit_breaker(&self) -> AppResult<()> {
        self.send(HubAction::ResetCircuitBreaker).await
    }

    /// 停止actor；全部定时器在一个间隔内退出。可重复调用。
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// actor任务内部状态
struct HubActor {
    host: String,
    status: ClientStatus,
    model: HubModel,
    errors: Vec<String>,
    breaker: Arc<CircuitBreaker>,
    client: Arc<dyn HubClient>,
    updates_tx: broadcast::Sender<Update>,
    metrics: Arc<MetricsRegistry>,
    // 登录与指标定时器始终运行，句柄保活即可
    #[allow(dead_code)]
    login_timer: Timer,
    #[allow(dead_code)]
    get_metrics_timer: Timer,
    // 四个数据定时器随客户端状态暂停/恢复
    fetch_all_scans_timer: Timer,
    fetch_unknown_scans_timer: Timer,
    check_completion_timer: Timer,
    refresh_scans_timer: Timer,
}

/// 启动一个Hub actor，返回外部句柄
///
/// 数据定时器初始为暂停，首次登录成功后恢复并立即触发一轮。
pub fn start_hub_actor(
    host: &str,
    username: &str,
    password: &str,
    client: Arc<dyn HubClient>,
    timings: HubTimings,
    metrics: Arc<MetricsRegistry>,
) -> HubActorHandle {
    let cancel = CancellationToken::new();
    let (action_tx, mut action_rx) = mpsc::channel(ACTIONS_CAPACITY);
    let (updates_tx, _) = broadcast::channel(UPDATES_CAPACITY);
    let breaker = Arc::new(CircuitBreaker::new(host, metrics.clone()));

    let login_timer = Timer::start(
        format!("login-{}", host),
        timings.login_pause,
        cancel.clone(),
        true,
        true,
        login_task(
            host,
            username,
            password,
            client.clone(),
            breaker.clone(),
            action_tx.clone(),
        ),
    );
    let get_metrics_timer = Timer::start(
        format!("getMetrics-{}", host),
        timings.get_metrics_pause,
        cancel.clone(),
        true,
        true,
        send_only_task(action_tx.clone(), || HubAction::RecordStateMetrics),
    );
    let fetch_all_scans_timer = Timer::start(
        format!("fetchAllScans-{}", host),
        timings.fetch_all_scans_pause,
        cancel.clone(),
        false,
        false,
        fetch_all_task(host, client.clone(), breaker.clone(), action_tx.clone()),
    );
    let fetch_unknown_scans_timer = Timer::start(
        format!("fetchUnknownScans-{}", host),
        timings.fetch_unknown_scans_pause,
        cancel.clone(),
        false,
        false,
        fetch_by_names_task(
            client.clone(),
            breaker.clone(),
            action_tx.clone(),
            HubAction::UnfetchedScanNames,
            |name, result| HubAction::DidFetchScan { name, result },
        ),
    );
    let check_completion_timer = Timer::start(
        format!("checkScansForCompletion-{}", host),
        timings.scan_completion_pause,
        cancel.clone(),
        false,
        false,
        fetch_by_names_task(
            client.clone(),
            breaker.clone(),
            action_tx.clone(),
            HubAction::InProgressScanNames,
            |name, result| HubAction::DidFetchScan { name, result },
        ),
    );
    let refresh_scans_timer = Timer::start(
        format!("refreshScans-{}", host),
        timings.refresh_scans_pause,
        cancel.clone(),
        false,
        false,
        fetch_by_names_task(
            client.clone(),
            breaker.clone(),
            action_tx.clone(),
            HubAction::StaleCompletedScanNames,
            |name, result| HubAction::DidRefreshScan { name, result },
        ),
    );

    let handle = HubActorHandle {
        host: host.to_string(),
        action_tx,
        updates_tx: updates_tx.clone(),
        cancel: cancel.clone(),
    };

    let mut actor = HubActor {
        host: host.to_string(),
        status: ClientStatus::Down,
        model: HubModel::new(host),
        errors: Vec::new(),
        breaker,
        client,
        updates_tx,
        metrics,
        login_timer,
        get_metrics_timer,
        fetch_all_scans_timer,
        fetch_unknown_scans_timer,
        check_completion_timer,
        refresh_scans_timer,
    };
    let refresh_threshold = timings.refresh_threshold;

    tokio::spawn(async move {
        info!("Hub actor {} 启动", actor.host);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                action = action_rx.recv() => {
                    match action {
                        None => break,
                        Some(action) => actor.handle(action, refresh_threshold).await,
                    }
                }
            }
        }
        info!("Hub actor {} 退出", actor.host);
    });

    handle
}

fn login_task(
    host: &str,
    username: &str,
    password: &str,
    client: Arc<dyn HubClient>,
    breaker: Arc<CircuitBreaker>,
    action_tx: mpsc::Sender<HubAction>,
) -> TimerTask {
    let host = host.to_string();
    let username = username.to_string();
    let password = password.to_string();
    Arc::new(move || {
        let host = host.clone();
        let username = username.clone();
        let password = password.clone();
        let client = client.clone();
        let breaker = breaker.clone();
        let action_tx = action_tx.clone();
        Box::pin(async move {
            debug!("开始登录Hub {}", host);
            let result = breaker
                .call("login", || client.login(&username, &password))
                .await;
            let _ = action_tx.send(HubAction::DidLogin(result)).await;
        })
    })
}

fn fetch_all_task(
    host: &str,
    client: Arc<dyn HubClient>,
    breaker: Arc<CircuitBreaker>,
    action_tx: mpsc::Sender<HubAction>,
) -> TimerTask {
    let host = host.to_string();
    Arc::new(move || {
        let host = host.clone();
        let client = client.clone();
        let breaker = breaker.clone();
        let action_tx = action_tx.clone();
        Box::pin(async move {
            debug!("开始拉取Hub {} 的全量扫描列表", host);
            let result = breaker
                .call("fetchAllScans", || client.list_all_code_locations())
                .await;
            let _ = action_tx
                .send(HubAction::DidFetchCodeLocations(result))
                .await;
        })
    })
}

/// 构造"查名单、逐个拉取、回投结果"形态的定时器任务
fn fetch_by_names_task(
    client: Arc<dyn HubClient>,
    breaker: Arc<CircuitBreaker>,
    action_tx: mpsc::Sender<HubAction>,
    names_query: fn(oneshot::Sender<Vec<String>>) -> HubAction,
    make_result: fn(String, AppResult<Option<ScanSummary>>) -> HubAction,
) -> TimerTask {
    Arc::new(move || {
        let client = client.clone();
        let breaker = breaker.clone();
        let action_tx = action_tx.clone();
        Box::pin(async move {
            let (reply_tx, reply_rx) = oneshot::channel();
            if action_tx.send(names_query(reply_tx)).await.is_err() {
                return;
            }
            let Ok(names) = reply_rx.await else {
                return;
            };
            for name in names {
                let result = breaker.call("fetchScan", || client.fetch_scan(&name)).await;
                let _ = action_tx.send(make_result(name, result)).await;
            }
        })
    })
}

fn send_only_task(
    action_tx: mpsc::Sender<HubAction>,
    make: fn() -> HubAction,
) -> TimerTask {
    Arc::new(move || {
        let action_tx = action_tx.clone();
        Box::pin(async move {
            let _ = action_tx.send(make()).await;
        })
    })
}

/// 把错误追加进有界错误环
fn push_error(errors: &mut Vec<String>, message: String) {
    errors.push(message);
    if errors.len() > MAX_ERRORS {
        errors.drain(..ERRORS_DROP);
    }
}

impl HubActor {
    async fn handle(&mut self, action: HubAction, refresh_threshold: Duration) {
        self.metrics.record_hub_event(&self.host, action.name());
        match action {
            HubAction::DidLogin(result) => self.did_login(result),
            HubAction::DidFetchCodeLocations(result) => match result {
                Ok(locations) => {
                    for update in self.model.did_fetch_code_locations(locations) {
                        self.publish(update);
                    }
                }
                Err(e) => self.record_error("didFetchCodeLocations", e.to_string()),
            },
            HubAction::DidFetchScan { name, result } => match result {
                Ok(summary) => {
                    if let Some(update) = self.model.did_fetch_scan(&name, summary) {
                        self.publish(update);
                    }
                }
                Err(e) => self.record_error("didFetchScan", e.to_string()),
            },
            HubAction::DidRefreshScan { name, result } => match result {
                Ok(summary) => {
                    if let Some(update) = self.model.did_refresh_scan(&name, summary) {
                        self.publish(update);
                    }
                }
                Err(e) => self.record_error("didRefreshScan", e.to_string()),
            },
            HubAction::UnfetchedScanNames(reply) => {
                let _ = reply.send(self.model.unfetched_scan_names());
            }
            HubAction::InProgressScanNames(reply) => {
                let _ = reply.send(self.model.in_progress_scan_names());
            }
            HubAction::StaleCompletedScanNames(reply) => {
                let _ = reply.send(self.model.stale_completed_scan_names(refresh_threshold));
            }
            HubAction::RecordStateMetrics => {
                let gauges = self.model.state_gauges(self.errors.len());
                self.metrics.set_hub_state(&self.host, self.status, gauges);
                debug!(
                    "Hub {} 客户端请求统计: {:?}",
                    self.host,
                    self.client.metrics()
                );
            }
            HubAction::StartScanClient(name) => {
                if let Some(update) = self.model.start_scan_client(&name) {
                    self.publish(update);
                }
            }
            HubAction::FinishScanClient { name, error } => match error {
                None => self.model.finish_scan_client(&name, true),
                Some(e) => {
                    self.record_error("finishScanClient", e);
                    self.model.finish_scan_client(&name, false);
                }
            },
            HubAction::ScansCount(reply) => {
                let _ = reply.send(self.model.scans_count());
            }
            HubAction::InProgressScans(reply) => {
                let _ = reply.send(self.model.in_progress_scan_names());
            }
            HubAction::ScanResults(reply) => {
                let _ = reply.send(self.model.scan_results());
            }
            HubAction::HasFetchedScans(reply) => {
                let _ = reply.send(self.model.has_fetched_scans());
            }
            HubAction::Model(reply) => {
                let snapshot = self.model.snapshot(
                    self.status,
                    self.errors.clone(),
                    self.breaker.snapshot(),
                );
                let _ = reply.send(snapshot);
            }
            HubAction::ResetCircuitBreaker => {
                self.breaker.reset();
            }
        }
    }

    /// 登录结果驱动客户端状态机，并联动数据定时器
    fn did_login(&mut self, result: AppResult<()>) {
        match result {
            Err(e) => {
                self.record_error("didLogin", e.to_string());
                if self.status == ClientStatus::Up {
                    info!("Hub {} 登录失败，状态 Up → Down，暂停数据定时器", self.host);
                    self.status = ClientStatus::Down;
                    let results = [
                        self.check_completion_timer.pause(),
                        self.fetch_unknown_scans_timer.pause(),
                        self.fetch_all_scans_timer.pause(),
                        self.refresh_scans_timer.pause(),
                    ];
                    for r in results {
                        if let Err(e) = r {
                            self.record_error("didLogin", e.to_string());
                        }
                    }
                }
            }
            Ok(()) => {
                if self.status == ClientStatus::Down {
                    info!("Hub {} 登录成功，状态 Down → Up，恢复数据定时器", self.host);
                    self.status = ClientStatus::Up;
                    let results = [
                        self.check_completion_timer.resume(true),
                        self.fetch_unknown_scans_timer.resume(true),
                        self.fetch_all_scans_timer.resume(true),
                        self.refresh_scans_timer.resume(true),
                    ];
                    for r in results {
                        if let Err(e) = r {
                            self.record_error("didLogin", e.to_string());
                        }
                    }
                }
            }
        }
    }

    fn record_error(&mut self, action: &str, message: String) {
        warn!("Hub {} 动作 {} 出错: {}", self.host, action, message);
        self.metrics.record_hub_error(&self.host, action);
        push_error(&mut self.errors, message);
    }

    /// 发布事件；没有订阅方或订阅方积压时不会阻塞actor
    fn publish(&self, update: Update) {
        let _ = self.updates_tx.send(update);
    }
}
