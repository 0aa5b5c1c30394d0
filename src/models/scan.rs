use super::{Image, ImageSha};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use utoipa::ToSchema;

/// Hub侧扫描完成状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanCompletionStatus {
    /// 扫描进行中
    InProgress,
    /// 扫描完成
    Complete,
    /// 扫描失败
    Failed,
}

/// 漏洞统计摘要
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct VulnerabilitySummary {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

/// 策略违规摘要
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PolicySummary {
    /// 违规组件数
    pub violation_count: u32,
}

/// Hub返回的单次扫描结果
///
/// 核心只关心完成谓词，漏洞与策略摘要原样转发给订阅方。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ScanSummary {
    pub status: ScanCompletionStatus,
    pub vulnerabilities: VulnerabilitySummary,
    pub policy: PolicySummary,
}

impl ScanSummary {
    /// 扫描是否已驱动到终态（完成或失败）
    pub fn is_done(&self) -> bool {
        matches!(
            self.status,
            ScanCompletionStatus::Complete | ScanCompletionStatus::Failed
        )
    }
}

/// 镜像扫描生命周期状态
///
/// 状态机的全部合法迁移：
/// Unscanned → RunningScanClient（GetNextImage，未超并发上限）
/// RunningScanClient → RunningHubScan（FinishScanClient成功）
/// RunningScanClient → Unscanned（FinishScanClient失败 / 僵死重排）
/// RunningHubScan → Complete（HubScanResults/HubCheckResults到达终态）
/// Complete → Unscanned（仅显式重扫）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum ScanStatus {
    /// 未扫描，排队中
    Unscanned,
    /// 扫描客户端执行中
    RunningScanClient,
    /// Hub侧扫描进行中
    RunningHubScan,
    /// 已完成
    Complete,
}

/// 镜像生命周期记录，由中央reducer独占持有
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub image: Image,
    pub scan_status: ScanStatus,
    /// 进入当前状态的单调时钟时刻，用于僵死检测
    status_since: Instant,
    /// 进入当前状态的墙钟时间，用于API快照
    pub status_changed_at: DateTime<Utc>,
    /// 最近一次扫描结果
    pub scan_summary: Option<ScanSummary>,
}

impl ImageInfo {
    pub fn new(image: Image) -> Self {
        Self {
            image,
            scan_status: ScanStatus::Unscanned,
            status_since: Instant::now(),
            status_changed_at: Utc::now(),
            scan_summary: None,
        }
    }

    pub fn sha(&self) -> &ImageSha {
        &self.image.sha
    }

    /// 迁移到新状态并刷新两个时间戳
    pub fn set_scan_status(&mut self, status: ScanStatus) {
        self.scan_status = status;
        self.status_since = Instant::now();
        self.status_changed_at = Utc::now();
    }

    /// 当前状态持续时长（按tokio时钟，测试可控）
    pub fn time_in_current_status(&self) -> std::time::Duration {
        self.status_since.elapsed()
    }

    pub fn snapshot(&self) -> ImageInfoSnapshot {
        ImageInfoSnapshot {
            sha: self.image.sha.clone(),
            repository: self.image.repository.clone(),
            tag: self.image.tag.clone(),
            hub_project_name: self.image.hub_project_name(),
            scan_status: self.scan_status,
            status_changed_at: self.status_changed_at,
            scan_summary: self.scan_summary.clone(),
        }
    }
}

/// 镜像生命周期的API快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ImageInfoSnapshot {
    pub sha: ImageSha,
    pub repository: String,
    pub tag: String,
    pub hub_project_name: String,
    pub scan_status: ScanStatus,
    pub status_changed_at: DateTime<Utc>,
    pub scan_summary: Option<ScanSummary>,
}
