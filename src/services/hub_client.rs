use crate::error::{AppError, AppResult};
use crate::models::{CodeLocation, ScanSummary};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// 客户端请求统计快照
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ClientMetricsSnapshot {
    pub requests: u64,
    pub failures: u64,
}

/// Hub原始客户端接口
///
/// 实现只需保证同一实例被单个任务串行调用时安全；核心不会对同一
/// 客户端并发调用。每次请求自带超时，上层不再包一层超时。
#[async_trait]
pub trait HubClient: Send + Sync {
    /// 登录Hub，成功后会话在服务端保持
    async fn login(&self, username: &str, password: &str) -> AppResult<()>;

    /// 列出Hub上全部code location
    async fn list_all_code_locations(&self) -> AppResult<Vec<CodeLocation>>;

    /// 按项目名拉取扫描结果；Hub上不存在时返回None
    async fn fetch_scan(&self, project: &str) -> AppResult<Option<ScanSummary>>;

    /// 请求统计快照，不做I/O
    fn metrics(&self) -> ClientMetricsSnapshot;
}

/// 登录请求体
#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// code location列表响应
#[derive(Debug, Deserialize)]
struct CodeLocationListResponse {
    items: Vec<CodeLocation>,
}

/// 基于reqwest的Hub HTTP客户端
#[derive(Debug)]
pub struct HttpHubClient {
    client: reqwest::Client,
    base_url: String,
    requests: AtomicU64,
    failures: AtomicU64,
}

impl HttpHubClient {
    /// 创建客户端，单请求超时10秒
    pub fn new(host: &str, port: u16) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("构造reqwest客户端失败");
        Self {
            client,
            base_url: format!("https://{}:{}", host, port),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    fn record_result<T>(&self, result: &AppResult<T>) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if result.is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl HubClient for HttpHubClient {
    async fn login(&self, username: &str, password: &str) -> AppResult<()> {
        let result = async {
            let response = self
                .client
                .post(self.api_url("/api/login"))
                .json(&LoginRequest { username, password })
                .send()
                .await
                .map_err(|e| AppError::hub(format!("登录请求失败: {}", e)))?;

            if !response.status().is_success() {
                return Err(AppError::hub(format!(
                    "登录被拒绝: HTTP {}",
                    response.status()
                )));
            }
            Ok(())
        }
        .await;

        self.record_result(&result);
        result
    }

    async fn list_all_code_locations(&self) -> AppResult<Vec<CodeLocation>> {
        let result = async {
            let response = self
                .client
                .get(self.api_url("/api/codelocations"))
                .send()
                .await
                .map_err(|e| AppError::hub(format!("拉取code location列表失败: {}", e)))?;

            if !response.status().is_success() {
                return Err(AppError::hub(format!(
                    "拉取code location列表失败: HTTP {}",
                    response.status()
                )));
            }

            let body: CodeLocationListResponse = response
                .json()
                .await
                .map_err(|e| AppError::protocol(format!("code location响应解析失败: {}", e)))?;
            Ok(body.items)
        }
        .await;

        self.record_result(&result);
        result
    }

    async fn fetch_scan(&self, project: &str) -> AppResult<Option<ScanSummary>> {
        let result = async {
            let response = self
                .client
                .get(self.api_url(&format!("/api/scans/{}", project)))
                .send()
                .await
                .map_err(|e| AppError::hub(format!("拉取扫描结果失败: {}", e)))?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                debug!("Hub上不存在扫描 {}", project);
                return Ok(None);
            }

            if !response.status().is_success() {
                return Err(AppError::hub(format!(
                    "拉取扫描 {} 失败: HTTP {}",
                    project,
                    response.status()
                )));
            }

            let summary: ScanSummary = response
                .json()
                .await
                .map_err(|e| AppError::protocol(format!("扫描响应解析失败: {}", e)))?;
            Ok(Some(summary))
        }
        .await;

        self.record_result(&result);
        result
    }

    fn metrics(&self) -> ClientMetricsSnapshot {
        ClientMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// 测试用可编程Hub客户端
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// 行为可编程的mock客户端
    ///
    /// 默认所有操作成功、Hub为空。`push_login_result` 可注入失败序列，
    /// `set_scan` 预置扫描结果。
    #[derive(Default)]
    pub struct MockHubClient {
        login_results: Mutex<VecDeque<AppResult<()>>>,
        code_locations: Mutex<Vec<CodeLocation>>,
        scans: Mutex<HashMap<String, ScanSummary>>,
        login_calls: AtomicU64,
        fetch_calls: AtomicU64,
    }

    impl MockHubClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_login_result(&self, result: AppResult<()>) {
            self.login_results.lock().unwrap().push_back(result);
        }

        pub fn set_code_locations(&self, locations: Vec<CodeLocation>) {
            *self.code_locations.lock().unwrap() = locations;
        }

        pub fn set_scan(&self, name: &str, summary: ScanSummary) {
            self.scans.lock().unwrap().insert(name.to_string(), summary);
        }

        pub fn remove_scan(&self, name: &str) {
            self.scans.lock().unwrap().remove(name);
        }

        pub fn login_calls(&self) -> u64 {
            self.login_calls.load(Ordering::SeqCst)
        }

        pub fn fetch_calls(&self) -> u64 {
            self.fetch_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HubClient for MockHubClient {
        async fn login(&self, _username: &str, _password: &str) -> AppResult<()> {
            self.login_calls.fetch_add(1, Ordering::SeqCst);
            match self.login_results.lock().unwrap().pop_front() {
                Some(result) => result,
                None => Ok(()),
            }
        }

        async fn list_all_code_locations(&self) -> AppResult<Vec<CodeLocation>> {
            Ok(self.code_locations.lock().unwrap().clone())
        }

        async fn fetch_scan(&self, project: &str) -> AppResult<Option<ScanSummary>> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.scans.lock().unwrap().get(project).cloned())
        }

        fn metrics(&self) -> ClientMetricsSnapshot {
            ClientMetricsSnapshot {
                requests: self.login_calls.load(Ordering::SeqCst)
                    + self.fetch_calls.load(Ordering::SeqCst),
                failures: 0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url_joining() {
        let client = HttpHubClient::new("hub1.example.com", 443);
        assert_eq!(
            client.api_url("/api/scans/app-web-aaa"),
            "https://hub1.example.com:443/api/scans/app-web-aaa"
        );
        assert_eq!(
            client.api_url("api/login"),
            "https://hub1.example.com:443/api/login"
        );
    }

    #[tokio::test]
    async fn test_mock_login_sequence() {
        use mock::MockHubClient;

        let client = MockHubClient::new();
        client.push_login_result(Err(AppError::hub("登录失败")));

        assert!(client.login("u", "p").await.is_err());
        // 队列耗尽后默认成功
        assert!(client.login("u", "p").await.is_ok());
        assert_eq!(client.login_calls(), 2);
    }
}
