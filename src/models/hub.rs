use super::ScanSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

/// Hub客户端连接状态
///
/// 初始为Down；登录成功迁移到Up并恢复数据定时器，
/// 登录失败迁移回Down并暂停数据定时器。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Down,
    Up,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Down => "down",
            ClientStatus::Up => "up",
        }
    }
}

/// Hub侧单个扫描在本地模型中的阶段
///
/// 三个派生集合（未拉取/进行中/已到终态）按阶段划分，
/// 一个扫描任意时刻只属于其中一个。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum ScanStage {
    /// 已知但尚未拉取过详情
    Unfetched,
    /// Hub侧进行中
    InProgress,
    /// 已完成
    Complete,
    /// 已失败
    Failed,
}

/// Hub本地模型里的扫描记录
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ScanRecord {
    pub stage: ScanStage,
    /// 最近一次拉取到的结果
    pub summary: Option<ScanSummary>,
    /// 最近一次成功拉取的时间
    pub last_fetched: Option<DateTime<Utc>>,
}

/// Hub的code location（可扫描工件），作为扫描的键
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CodeLocation {
    pub name: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// 扫描事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// 第一次观察到该扫描
    FirstTime,
    /// 扫描迁移到终态
    Completion,
    /// 已完成扫描的结果刷新
    Refresh,
}

/// Hub actor对外发布的扫描事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Update {
    pub host: String,
    pub scan_name: String,
    pub kind: UpdateKind,
}

/// 熔断器状态快照
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CircuitBreakerSnapshot {
    /// closed / open / half_open
    pub state: String,
    pub consecutive_failures: u32,
    pub reopen_delay_secs: u64,
}

/// 单个Hub的完整API快照
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HubSnapshot {
    pub host: String,
    pub status: ClientStatus,
    pub has_fetched_scans: bool,
    pub scans: HashMap<String, ScanRecord>,
    pub errors: Vec<String>,
    pub circuit_breaker: CircuitBreakerSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_status_str() {
        assert_eq!(ClientStatus::Down.as_str(), "down");
        assert_eq!(ClientStatus::Up.as_str(), "up");
    }

    #[test]
    fn test_update_serialization() {
        let update = Update {
            host: "hub1".to_string(),
            scan_name: "app-web-aaa".to_string(),
            kind: UpdateKind::Completion,
        };
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"completion\""));
    }
}
