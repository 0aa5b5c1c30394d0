use crate::config::HubTimings;
use crate::error::{AppError, AppResult};
use crate::models::{HubSnapshot, ScanSummary};
use crate::services::hub_actor::{start_hub_actor, HubActorHandle};
use crate::services::hub_client::HubClient;
use crate::services::metrics::MetricsRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// 按主机名构造Hub客户端的工厂，测试时可注入mock
pub type HubClientFactory = Arc<dyn Fn(&str) -> Arc<dyn HubClient> + Send + Sync>;

/// Hub管理器
///
/// 维护配置的Hub主机集合与存活actor的对应关系。actor表由一把读写
/// 锁保护，`set_hubs` 可以被并发地重复调用。
pub struct HubManager {
    username: String,
    password: String,
    timings: HubTimings,
    metrics: Arc<MetricsRegistry>,
    client_factory: HubClientFactory,
    hubs: RwLock<HashMap<String, HubActorHandle>>,
}

impl HubManager {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        timings: HubTimings,
        metrics: Arc<MetricsRegistry>,
        client_factory: HubClientFactory,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            timings,
            metrics,
            client_factory,
            hubs: RwLock::new(HashMap::new()),
        }
    }

    /// 把存活actor集合对齐到给定的主机列表
    ///
    /// 新增主机逐个创建actor，单个失败只记录日志不阻塞其余；
    /// 移除的主机调用其 `stop()`。
    pub async fn set_hubs(&self, hosts: &[String]) {
        let mut hubs = self.hubs.write().await;

        // 1. 创建新增的Hub
        for host in hosts {
            if !hubs.contains_key(host) {
                match self.create_locked(&mut hubs, host) {
                    Ok(()) => info!("已创建Hub actor: {}", host),
                    Err(e) => warn!("创建Hub actor {} 失败: {}", host, e),
                }
            }
        }

        // 2. 停掉被移除的Hub
        let removed: Vec<String> = hubs
            .keys()
            .filter(|host| !hosts.contains(host))
            .cloned()
            .collect();
        for host in removed {
            if let Some(handle) = hubs.remove(&host) {
                info!("停止Hub actor: {}", host);
                handle.stop();
            }
        }
    }

    /// 创建单个Hub actor；已存在时返回错误（调用方bug，不重试）
    fn create_locked(
        &self,
        hubs: &mut HashMap<String, HubActorHandle>,
        host: &str,
    ) -> AppResult<()> {
        if hubs.contains_key(host) {
            return Err(AppError::bad_request(format!(
                "无法创建Hub {}: 已存在",
                host
            )));
        }
        let client = (self.client_factory)(host);
        let handle = start_hub_actor(
            host,
            &self.username,
            &self.password,
            client,
            self.timings,
            self.metrics.clone(),
        );
        hubs.insert(host.to_string(), handle);
        Ok(())
    }

    /// 当前存活的Hub主机列表
    pub async fn hub_hosts(&self) -> Vec<String> {
        let hubs = self.hubs.read().await;
        let mut hosts: Vec<String> = hubs.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// 按主机取actor句柄
    pub async fn hub_client(&self, host: &str) -> Option<HubActorHandle> {
        self.hubs.read().await.get(host).cloned()
    }

    /// 通知指定Hub：扫描客户端已开始
    pub async fn start_scan_client(&self, host: &str, scan_name: &str) -> AppResult<()> {
        let handle = self
            .hub_client(host)
            .await
            .ok_or_else(|| AppError::hub_not_found(host))?;
        handle.start_scan_client(scan_name).await
    }

    /// 通知指定Hub：扫描客户端已结束，开始等待Hub侧完成
    pub async fn finish_scan_client(
        &self,
        host: &str,
        scan_name: &str,
        scan_error: Option<String>,
    ) -> AppResult<()> {
        let handle = self
            .hub_client(host)
            .await
            .ok_or_else(|| AppError::hub_not_found(host))?;
        handle.finish_scan_client(scan_name, scan_error).await
    }

    /// 逐个Hub串行聚合扫描结果快照
    ///
    /// 慢的Hub会拖慢整体，但不会破坏聚合结果。
    pub async fn scan_results(&self) -> HashMap<String, HashMap<String, ScanSummary>> {
        let handles: Vec<HubActorHandle> = {
            let hubs = self.hubs.read().await;
            hubs.values().cloned().collect()
        };

        let mut results = HashMap::new();
        for handle in handles {
            match handle.scan_results().await {
                Ok(scans) => {
                    results.insert(handle.host().to_string(), scans);
                }
                Err(e) => warn!("聚合Hub {} 扫描结果失败: {}", handle.host(), e),
            }
        }
        results
    }

    /// 逐个Hub聚合完整快照，供状态接口使用
    pub async fn models(&self) -> Vec<HubSnapshot> {
        let handles: Vec<HubActorHandle> = {
            let hubs = self.hubs.read().await;
            hubs.values().cloned().collect()
        };

        let mut snapshots = Vec::new();
        for handle in handles {
            match handle.model().await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!("获取Hub {} 快照失败: {}", handle.host(), e),
            }
        }
        snapshots.sort_by(|a, b| a.host.cmp(&b.host));
        snapshots
    }

    /// 停止全部actor
    pub async fn stop_all(&self) {
        let mut hubs = self.hubs.write().await;
        for (host, handle) in hubs.drain() {
            info!("停止Hub actor: {}", host);
            handle.stop();
        }
    }
}
