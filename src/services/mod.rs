// 服务层模块
pub mod circuit_breaker;
pub mod coordinator;
pub mod hub_actor;
pub mod hub_client;
pub mod hub_manager;
pub mod hub_model;
pub mod metrics;
pub mod reducer;
pub mod timer;

pub use circuit_breaker::CircuitBreaker;
pub use coordinator::Coordinator;
pub use hub_actor::{start_hub_actor, HubActorHandle};
pub use hub_client::{ClientMetricsSnapshot, HttpHubClient, HubClient};
pub use hub_manager::{HubClientFactory, HubManager};
pub use hub_model::HubModel;
pub use metrics::{BreakerOutcome, MetricsRegistry};
pub use reducer::{spawn_reducer, Action, CentralModel, ModelSnapshot, ScanClientScan};
pub use timer::{Timer, TimerTask};
