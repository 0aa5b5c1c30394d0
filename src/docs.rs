use crate::{
    handlers::scan_queue::{FinishedScanRequest, NextImageResponse, ScanResultsResponse},
    models::{
        CircuitBreakerSnapshot, ClientStatus, CodeLocation, Container, HubSnapshot, Image,
        ImageInfoSnapshot, ImageSha, Pod, PolicySummary, ScanCompletionStatus, ScanRecord,
        ScanStage, ScanStatus, ScanSummary, Update, UpdateKind, VulnerabilitySummary,
    },
    services::reducer::{ModelSnapshot, ScanClientScan},
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        // 集群事件上报
        crate::handlers::cluster::add_pod,
        crate::handlers::cluster::update_pod,
        crate::handlers::cluster::delete_pod,
        crate::handlers::cluster::add_image,
        crate::handlers::cluster::update_all_pods,
        // 扫描队列
        crate::handlers::scan_queue::next_image,
        crate::handlers::scan_queue::finished_scan,
        crate::handlers::scan_queue::scan_results,
        // 指标
        crate::handlers::metrics::export_metrics,
    ),
    components(schemas(
        Pod,
        Container,
        Image,
        ImageSha,
        ImageInfoSnapshot,
        ScanStatus,
        ScanSummary,
        ScanCompletionStatus,
        VulnerabilitySummary,
        PolicySummary,
        ModelSnapshot,
        ScanClientScan,
        HubSnapshot,
        ScanRecord,
        ScanStage,
        ClientStatus,
        CodeLocation,
        CircuitBreakerSnapshot,
        Update,
        UpdateKind,
        NextImageResponse,
        FinishedScanRequest,
        ScanResultsResponse,
    )),
    info(
        title = "ScanFarm API",
        description = "集群容器镜像漏洞扫描编排控制器",
        version = "0.1.0"
    )
)]
pub struct ApiDoc;
