use crate::models::{
    CircuitBreakerSnapshot, ClientStatus, CodeLocation, HubSnapshot, ScanRecord, ScanStage,
    ScanSummary, Update, UpdateKind,
};
use crate::services::metrics::HubStateGauges;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// 单个Hub的本地数据模型
///
/// 只在该Hub的actor任务上被修改。`scans` 按code location名索引；
/// 三个派生集合（未拉取/进行中/已到终态）是阶段字段的划分，互不
/// 重叠。
#[derive(Debug)]
pub struct HubModel {
    host: String,
    scans: HashMap<String, ScanRecord>,
    has_fetched_scans: bool,
}

impl HubModel {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            scans: HashMap::new(),
            has_fetched_scans: false,
        }
    }

    fn stage_of(summary: &ScanSummary) -> ScanStage {
        match summary.status {
            crate::models::ScanCompletionStatus::InProgress => ScanStage::InProgress,
            crate::models::ScanCompletionStatus::Complete => ScanStage::Complete,
            crate::models::ScanCompletionStatus::Failed => ScanStage::Failed,
        }
    }

    fn update(&self, scan_name: &str, kind: UpdateKind) -> Update {
        Update {
            host: self.host.clone(),
            scan_name: scan_name.to_string(),
            kind,
        }
    }

    /// 记录扫描客户端开始：预置Hub侧扫描的期望
    pub fn start_scan_client(&mut self, scan_name: &str) -> Option<Update> {
        if self.scans.contains_key(scan_name) {
            return None;
        }
        self.scans.insert(
            scan_name.to_string(),
            ScanRecord {
                stage: ScanStage::Unfetched,
                summary: None,
                last_fetched: None,
            },
        );
        Some(self.update(scan_name, UpdateKind::FirstTime))
    }

    /// 记录扫描客户端结束
    ///
    /// 成功意味着Hub侧扫描即将开始，进入进行中集合等待完成轮询；
    /// 失败则撤掉期望，等客户端重试时重新预置。
    pub fn finish_scan_client(&mut self, scan_name: &str, success: bool) {
        if success {
            if let Some(record) = self.scans.get_mut(scan_name) {
                if !matches!(record.stage, ScanStage::Complete | ScanStage::Failed) {
                    record.stage = ScanStage::InProgress;
                }
            }
        } else {
            self.scans.remove(scan_name);
        }
    }

    /// 合并一次全量code location列表
    pub fn did_fetch_code_locations(&mut self, locations: Vec<CodeLocation>) -> Vec<Update> {
        let mut updates = Vec::new();
        for location in locations {
            if !self.scans.contains_key(&location.name) {
                self.scans.insert(
                    location.name.clone(),
                    ScanRecord {
                        stage: ScanStage::Unfetched,
                        summary: None,
                        last_fetched: None,
                    },
                );
                updates.push(self.update(&location.name, UpdateKind::FirstTime));
            }
        }
        self.has_fetched_scans = true;
        updates
    }

    /// 记录一次扫描详情拉取结果
    ///
    /// None表示Hub上还没有该扫描，保持现状等下次轮询。
    pub fn did_fetch_scan(&mut self, scan_name: &str, summary: Option<ScanSummary>) -> Option<Update> {
        let summary = summary?;
        let mut first_time = false;
        let record = self.scans.entry(scan_name.to_string()).or_insert_with(|| {
            first_time = true;
            ScanRecord {
                stage: ScanStage::Unfetched,
                summary: None,
                last_fetched: None,
            }
        });

        let was_done = matches!(record.stage, ScanStage::Complete | ScanStage::Failed);
        let new_stage = Self::stage_of(&summary);
        let now_done = matches!(new_stage, ScanStage::Complete | ScanStage::Failed);

        record.stage = new_stage;
        record.summary = Some(summary);
        record.last_fetched = Some(Utc::now());

        if first_time {
            Some(self.update(scan_name, UpdateKind::FirstTime))
        } else if !was_done && now_done {
            Some(self.update(scan_name, UpdateKind::Completion))
        } else {
            None
        }
    }

    /// 记录一次已完成扫描的刷新；结果有变化时产生Refresh事件
    pub fn did_refresh_scan(
        &mut self,
        scan_name: &str,
        summary: Option<ScanSummary>,
    ) -> Option<Update> {
        let summary = summary?;
        let record = self.scans.get_mut(scan_name)?;

        let changed = record.summary.as_ref() != Some(&summary);
        record.stage = Self::stage_of(&summary);
        record.summary = Some(summary);
        record.last_fetched = Some(Utc::now());

        if changed {
            Some(self.update(scan_name, UpdateKind::Refresh))
        } else {
            None
        }
    }

    pub fn unfetched_scan_names(&self) -> Vec<String> {
        self.names_in_stage(|s| matches!(s, ScanStage::Unfetched))
    }

    pub fn in_progress_scan_names(&self) -> Vec<String> {
        self.names_in_stage(|s| matches!(s, ScanStage::InProgress))
    }

    /// 拉取时间早于阈值的终态扫描，供刷新定时器重拉
    pub fn stale_completed_scan_names(&self, threshold: Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(threshold).unwrap_or_else(|_| ChronoDuration::hours(1));
        let mut names: Vec<String> = self
            .scans
            .iter()
            .filter(|(_, record)| {
                matches!(record.stage, ScanStage::Complete | ScanStage::Failed)
                    && record.last_fetched.map(|at| at < cutoff).unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn names_in_stage(&self, predicate: impl Fn(&ScanStage) -> bool) -> Vec<String> {
        let mut names: Vec<String> = self
            .scans
            .iter()
            .filter(|(_, record)| predicate(&record.stage))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn scans_count(&self) -> usize {
        self.scans.len()
    }

    pub fn has_fetched_scans(&self) -> bool {
        self.has_fetched_scans
    }

    /// 已拉取到结果的扫描集合
    pub fn scan_results(&self) -> HashMap<String, ScanSummary> {
        self.scans
            .iter()
            .filter_map(|(name, record)| {
                record.summary.clone().map(|summary| (name.clone(), summary))
            })
            .collect()
    }

    pub fn state_gauges(&self, error_count: usize) -> HubStateGauges {
        HubStateGauges {
            status_up: false,
            scans_total: self.scans.len(),
            scans_unfetched: self.unfetched_scan_names().len(),
            scans_in_progress: self.in_progress_scan_names().len(),
            scans_done: self
                .scans
                .values()
                .filter(|r| matches!(r.stage, ScanStage::Complete | ScanStage::Failed))
                .count(),
            error_count,
        }
    }

    pub fn snapshot(
        &self,
        status: ClientStatus,
        errors: Vec<String>,
        circuit_breaker: CircuitBreakerSnapshot,
    ) -> HubSnapshot {
        HubSnapshot {
            host: self.host.clone(),
            status,
            has_fetched_scans: self.has_fetched_scans,
            scans: self.scans.clone(),
            errors,
            circuit_breaker,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_last_fetched(&mut self, scan_name: &str, at: chrono::DateTime<Utc>) {
        if let Some(record) = self.scans.get_mut(scan_name) {
            record.last_fetched = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PolicySummary, ScanCompletionStatus, VulnerabilitySummary};

    fn summary(status: ScanCompletionStatus) -> ScanSummary {
        ScanSummary {
            status,
            vulnerabilities: VulnerabilitySummary::default(),
            policy: PolicySummary::default(),
        }
    }

    fn location(name: &str) -> CodeLocation {
        CodeLocation {
            name: name.to_string(),
            updated_at: None,
        }
    }

    #[test]
    fn test_merge_publishes_first_time_once() {
        let mut model = HubModel::new("hub1");

        let updates = model.did_fetch_code_locations(vec![location("a"), location("b")]);
        assert_eq!(updates.len(), 2);
        assert!(updates.iter().all(|u| u.kind == UpdateKind::FirstTime));
        assert!(model.has_fetched_scans());

        // 重复合并不再产生事件
        let updates = model.did_fetch_code_locations(vec![location("a"), location("b")]);
        assert!(updates.is_empty());
    }

    #[test]
    fn test_stage_partition() {
        let mut model = HubModel::new("hub1");
        model.did_fetch_code_locations(vec![location("a"), location("b"), location("c")]);
        model.did_fetch_scan("a", Some(summary(ScanCompletionStatus::InProgress)));
        model.did_fetch_scan("b", Some(summary(ScanCompletionStatus::Complete)));

        assert_eq!(model.unfetched_scan_names(), vec!["c"]);
        assert_eq!(model.in_progress_scan_names(), vec!["a"]);
        // 每个扫描恰好属于一个派生集合
        assert_eq!(model.scans_count(), 3);
        let gauges = model.state_gauges(0);
        assert_eq!(
            gauges.scans_unfetched + gauges.scans_in_progress + gauges.scans_done,
            gauges.scans_total
        );
    }

    #[test]
    fn test_completion_transition() {
        let mut model = HubModel::new("hub1");
        model.did_fetch_code_locations(vec![location("a")]);

        let update = model.did_fetch_scan("a", Some(summary(ScanCompletionStatus::InProgress)));
        assert!(update.is_none());

        let update = model.did_fetch_scan("a", Some(summary(ScanCompletionStatus::Complete)));
        assert_eq!(update.unwrap().kind, UpdateKind::Completion);

        // 终态之后重复拉取不再产生完成事件
        let update = model.did_fetch_scan("a", Some(summary(ScanCompletionStatus::Complete)));
        assert!(update.is_none());
    }

    #[test]
    fn test_fetch_absent_scan_keeps_state() {
        let mut model = HubModel::new("hub1");
        model.start_scan_client("a");

        let update = model.did_fetch_scan("a", None);
        assert!(update.is_none());
        assert_eq!(model.unfetched_scan_names(), vec!["a"]);
    }

    #[test]
    fn test_scan_client_lifecycle() {
        let mut model = HubModel::new("hub1");

        let update = model.start_scan_client("a");
        assert_eq!(update.unwrap().kind, UpdateKind::FirstTime);
        assert!(model.start_scan_client("a").is_none());

        model.finish_scan_client("a", true);
        assert_eq!(model.in_progress_scan_names(), vec!["a"]);

        // 失败的客户端扫描撤掉期望
        model.start_scan_client("b");
        model.finish_scan_client("b", false);
        assert_eq!(model.scans_count(), 1);
    }

    #[test]
    fn test_refresh_detects_changes() {
        let mut model = HubModel::new("hub1");
        model.did_fetch_scan("a", Some(summary(ScanCompletionStatus::Complete)));

        // 相同结果不产生事件
        let update = model.did_refresh_scan("a", Some(summary(ScanCompletionStatus::Complete)));
        assert!(update.is_none());

        // 漏洞计数变化产生Refresh事件
        let mut changed = summary(ScanCompletionStatus::Complete);
        changed.vulnerabilities.high = 3;
        let update = model.did_refresh_scan("a", Some(changed));
        assert_eq!(update.unwrap().kind, UpdateKind::Refresh);
    }

    #[test]
    fn test_stale_completed_selection() {
        let mut model = HubModel::new("hub1");
        model.did_fetch_scan("old", Some(summary(ScanCompletionStatus::Complete)));
        model.did_fetch_scan("fresh", Some(summary(ScanCompletionStatus::Complete)));
        model.did_fetch_scan("running", Some(summary(ScanCompletionStatus::InProgress)));

        model.set_last_fetched("old", Utc::now() - ChronoDuration::hours(2));

        let stale = model.stale_completed_scan_names(Duration::from_secs(3600));
        assert_eq!(stale, vec!["old"]);
    }
}
