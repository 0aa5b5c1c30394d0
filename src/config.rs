use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 应用程序配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub hub: HubConfig,
    pub scan: ScanConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Hub连接与定时器配置
///
/// 六个定时器的默认间隔与扫描编排引擎保持一致：
/// login 30秒、metrics 15秒、全量拉取 30分钟、未知扫描拉取 1分钟、
/// 完成检查 1分钟、刷新 1小时。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Hub登录用户名
    pub user: String,
    /// Hub登录密码（建议通过环境变量 SCANFARM_HUB_PASSWORD 覆盖）
    #[serde(default)]
    pub password: String,
    /// 受管Hub主机列表
    pub hosts: Vec<String>,
    /// Hub服务端口
    pub port: u16,
    /// 登录定时器间隔（秒）
    pub login_pause_secs: u64,
    /// 指标采样定时器间隔（秒）
    pub get_metrics_pause_secs: u64,
    /// 全量扫描列表拉取间隔（秒）
    pub fetch_all_scans_pause_secs: u64,
    /// 未知扫描拉取间隔（秒）
    pub fetch_unknown_scans_pause_secs: u64,
    /// 扫描完成检查间隔（秒）
    pub scan_completion_pause_secs: u64,
    /// 已完成扫描刷新间隔（秒）
    pub refresh_scans_pause_secs: u64,
    /// 已完成扫描刷新阈值（秒），早于该时间的结果会被重新拉取
    pub refresh_threshold_secs: u64,
}

/// 扫描编排配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// 扫描客户端全局并发上限
    pub concurrent_scan_limit: usize,
    /// 僵死扫描判定阈值（秒）
    pub stalled_scan_timeout_secs: u64,
    /// 僵死扫描检查间隔（秒）
    pub stalled_scan_check_pause_secs: u64,
    /// Hub完成轮询间隔（秒）
    pub hub_check_pause_secs: u64,
    /// Hub轮询节流间隔（秒）
    pub hub_check_throttle_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3001,
            },
            hub: HubConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            user: "sysadmin".to_string(),
            password: String::new(),
            hosts: Vec::new(),
            port: 443,
            login_pause_secs: 30,
            get_metrics_pause_secs: 15,
            fetch_all_scans_pause_secs: 30 * 60,
            fetch_unknown_scans_pause_secs: 60,
            scan_completion_pause_secs: 60,
            refresh_scans_pause_secs: 60 * 60,
            refresh_threshold_secs: 60 * 60,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrent_scan_limit: 2,
            stalled_scan_timeout_secs: 30 * 60,
            stalled_scan_check_pause_secs: 60,
            hub_check_pause_secs: 20,
            hub_check_throttle_secs: 1,
        }
    }
}

/// Hub定时器间隔集合，按秒数换算为Duration供Hub actor使用
#[derive(Debug, Clone, Copy)]
pub struct HubTimings {
    pub login_pause: Duration,
    pub get_metrics_pause: Duration,
    pub fetch_all_scans_pause: Duration,
    pub fetch_unknown_scans_pause: Duration,
    pub scan_completion_pause: Duration,
    pub refresh_scans_pause: Duration,
    pub refresh_threshold: Duration,
}

impl HubConfig {
    pub fn timings(&self) -> HubTimings {
        HubTimings {
            login_pause: Duration::from_secs(self.login_pause_secs),
            get_metrics_pause: Duration::from_secs(self.get_metrics_pause_secs),
            fetch_all_scans_pause: Duration::from_secs(self.fetch_all_scans_pause_secs),
            fetch_unknown_scans_pause: Duration::from_secs(self.fetch_unknown_scans_pause_secs),
            scan_completion_pause: Duration::from_secs(self.scan_completion_pause_secs),
            refresh_scans_pause: Duration::from_secs(self.refresh_scans_pause_secs),
            refresh_threshold: Duration::from_secs(self.refresh_threshold_secs),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.user.is_empty() {
            return Err("Hub用户名不能为空".into());
        }
        if self.port == 0 {
            return Err("Hub端口不能为0".into());
        }
        let pauses = [
            self.login_pause_secs,
            self.get_metrics_pause_secs,
            self.fetch_all_scans_pause_secs,
            self.fetch_unknown_scans_pause_secs,
            self.scan_completion_pause_secs,
            self.refresh_scans_pause_secs,
        ];
        if pauses.iter().any(|p| *p == 0) {
            return Err("定时器间隔必须大于0".into());
        }
        Ok(())
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrent_scan_limit == 0 {
            return Err("扫描并发上限必须大于0".into());
        }
        if self.stalled_scan_timeout_secs < self.stalled_scan_check_pause_secs {
            return Err("僵死判定阈值不应小于检查间隔".into());
        }
        if self.hub_check_pause_secs == 0 {
            return Err("Hub完成轮询间隔必须大于0".into());
        }
        Ok(())
    }

    pub fn stalled_scan_timeout(&self) -> Duration {
        Duration::from_secs(self.stalled_scan_timeout_secs)
    }

    pub fn stalled_scan_check_pause(&self) -> Duration {
        Duration::from_secs(self.stalled_scan_check_pause_secs)
    }

    pub fn hub_check_pause(&self) -> Duration {
        Duration::from_secs(self.hub_check_pause_secs)
    }

    pub fn hub_check_throttle(&self) -> Duration {
        Duration::from_secs(self.hub_check_throttle_secs)
    }
}

impl Config {
    /// 从配置文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| AppError::config(format!("解析配置文件失败: {}", e)))?;

        // 密码优先从环境变量读取，避免写入配置文件
        if let Ok(password) = std::env::var("SCANFARM_HUB_PASSWORD") {
            config.hub.password = password;
        }

        config.validate()?;

        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> AppResult<()> {
        if self.server.port == 0 {
            return Err(AppError::config("服务器端口不能为0"));
        }

        if let Err(e) = self.hub.validate() {
            return Err(AppError::config(format!("Hub配置无效: {}", e)));
        }

        if let Err(e) = self.scan.validate() {
            return Err(AppError::config(format!("扫描配置无效: {}", e)));
        }

        Ok(())
    }

    /// 获取服务器监听地址
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::config(format!("序列化配置失败: {}", e)))?;

        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}
