use crate::models::ClientStatus;
use crate::services::reducer::ModelSnapshot;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// 熔断器调用结果，用于指标记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerOutcome {
    Success,
    Failure,
    /// 熔断器打开时被快速拒绝
    Rejected,
}

impl BreakerOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            BreakerOutcome::Success => "success",
            BreakerOutcome::Failure => "failure",
            BreakerOutcome::Rejected => "rejected",
        }
    }
}

/// 熔断器调用的累计统计
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CallStats {
    pub count: u64,
    pub total_latency_ms: u64,
}

/// 单个Hub的状态仪表
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HubStateGauges {
    pub status_up: bool,
    pub scans_total: usize,
    pub scans_unfetched: usize,
    pub scans_in_progress: usize,
    pub scans_done: usize,
    pub error_count: usize,
}

/// 中央模型仪表
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ModelGauges {
    pub pods: usize,
    pub images: usize,
    pub scan_queue: usize,
    pub in_progress_scan_client: usize,
    pub in_progress_hub_scans: usize,
}

/// 进程级指标注册表
///
/// Hub actor的metrics定时器、熔断器和reducer把计数写进来，
/// `GET /metrics` 按Prometheus文本格式导出。
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// (host, action) -> 次数
    hub_events: Mutex<HashMap<(String, String), u64>>,
    /// (host, action) -> 错误次数
    hub_errors: Mutex<HashMap<(String, String), u64>>,
    /// (host, outcome) -> 调用统计
    breaker_calls: Mutex<HashMap<(String, &'static str), CallStats>>,
    /// action名 -> 处理次数
    reducer_actions: Mutex<HashMap<&'static str, u64>>,
    model_gauges: Mutex<ModelGauges>,
    hub_states: Mutex<HashMap<String, HubStateGauges>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hub_event(&self, host: &str, action: &str) {
        let mut events = self.hub_events.lock().unwrap();
        *events
            .entry((host.to_string(), action.to_string()))
            .or_insert(0) += 1;
    }

    pub fn record_hub_error(&self, host: &str, action: &str) {
        let mut errors = self.hub_errors.lock().unwrap();
        *errors
            .entry((host.to_string(), action.to_string()))
            .or_insert(0) += 1;
    }

    pub fn record_breaker_call(&self, host: &str, outcome: BreakerOutcome, latency: Duration) {
        let mut calls = self.breaker_calls.lock().unwrap();
        let stats = calls
            .entry((host.to_string(), outcome.as_str()))
            .or_default();
        stats.count += 1;
        stats.total_latency_ms += latency.as_millis() as u64;
    }

    pub fn record_reducer_action(&self, action: &'static str) {
        let mut actions = self.reducer_actions.lock().unwrap();
        *actions.entry(action).or_insert(0) += 1;
    }

    pub fn set_model_gauges(&self, snapshot: &ModelSnapshot) {
        let mut gauges = self.model_gauges.lock().unwrap();
        *gauges = ModelGauges {
            pods: snapshot.pods.len(),
            images: snapshot.images.len(),
            scan_queue: snapshot.scan_queue.len(),
            in_progress_scan_client: snapshot.in_progress_scan_client.len(),
            in_progress_hub_scans: snapshot.in_progress_hub_scans.len(),
        };
    }

    pub fn set_hub_state(&self, host: &str, status: ClientStatus, gauges: HubStateGauges) {
        let mut states = self.hub_states.lock().unwrap();
        states.insert(
            host.to_string(),
            HubStateGauges {
                status_up: status == ClientStatus::Up,
                ..gauges
            },
        );
    }

    /// 按Prometheus文本格式导出全部指标
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# TYPE scanfarm_hub_events_total counter\n");
        let mut events: Vec<_> = {
            let guard = self.hub_events.lock().unwrap();
            guard.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };
        events.sort();
        for ((host, action), count) in events {
            out.push_str(&format!(
                "scanfarm_hub_events_total{{host=\"{}\",action=\"{}\"}} {}\n",
                host, action, count
            ));
        }

        out.push_str("# TYPE scanfarm_hub_errors_total counter\n");
        let mut errors: Vec<_> = {
            let guard = self.hub_errors.lock().unwrap();
            guard.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };
        errors.sort();
        for ((host, action), count) in errors {
            out.push_str(&format!(
                "scanfarm_hub_errors_total{{host=\"{}\",action=\"{}\"}} {}\n",
                host, action, count
            ));
        }

        out.push_str("# TYPE scanfarm_breaker_calls_total counter\n");
        out.push_str("# TYPE scanfarm_breaker_latency_ms_total counter\n");
        let mut calls: Vec<_> = {
            let guard = self.breaker_calls.lock().unwrap();
            guard.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };
        calls.sort_by(|a, b| a.0.cmp(&b.0));
        for ((host, outcome), stats) in calls {
            out.push_str(&format!(
                "scanfarm_breaker_calls_total{{host=\"{}\",outcome=\"{}\"}} {}\n",
                host, outcome, stats.count
            ));
            out.push_str(&format!(
                "scanfarm_breaker_latency_ms_total{{host=\"{}\",outcome=\"{}\"}} {}\n",
                host, outcome, stats.total_latency_ms
            ));
        }

        out.push_str("# TYPE scanfarm_reducer_actions_total counter\n");
        let mut actions: Vec<_> = {
            let guard = self.reducer_actions.lock().unwrap();
            guard.iter().map(|(k, v)| (*k, *v)).collect()
        };
        actions.sort();
        for (action, count) in actions {
            out.push_str(&format!(
                "scanfarm_reducer_actions_total{{action=\"{}\"}} {}\n",
                action, count
            ));
        }

        {
            let gauges = self.model_gauges.lock().unwrap();
            out.push_str("# TYPE scanfarm_model_pods gauge\n");
            out.push_str(&format!("scanfarm_model_pods {}\n", gauges.pods));
            out.push_str("# TYPE scanfarm_model_images gauge\n");
            out.push_str(&format!("scanfarm_model_images {}\n", gauges.images));
            out.push_str("# TYPE scanfarm_model_scan_queue gauge\n");
            out.push_str(&format!("scanfarm_model_scan_queue {}\n", gauges.scan_queue));
            out.push_str("# TYPE scanfarm_model_in_progress_scan_client gauge\n");
            out.push_str(&format!(
                "scanfarm_model_in_progress_scan_client {}\n",
                gauges.in_progress_scan_client
            ));
            out.push_str("# TYPE scanfarm_model_in_progress_hub_scans gauge\n");
            out.push_str(&format!(
                "scanfarm_model_in_progress_hub_scans {}\n",
                gauges.in_progress_hub_scans
            ));
        }

        out.push_str("# TYPE scanfarm_hub_status_up gauge\n");
        out.push_str("# TYPE scanfarm_hub_scans_total gauge\n");
        let mut states: Vec<_> = {
            let guard = self.hub_states.lock().unwrap();
            guard.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };
        states.sort_by(|a, b| a.0.cmp(&b.0));
        for (host, state) in states {
            out.push_str(&format!(
                "scanfarm_hub_status_up{{host=\"{}\"}} {}\n",
                host,
                if state.status_up { 1 } else { 0 }
            ));
            out.push_str(&format!(
                "scanfarm_hub_scans_total{{host=\"{}\"}} {}\n",
                host, state.scans_total
            ));
        }

        out
    }
}
