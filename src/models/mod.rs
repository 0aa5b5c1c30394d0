pub mod hub;
pub mod image;
pub mod pod;
pub mod scan;

pub use hub::{
    CircuitBreakerSnapshot, ClientStatus, CodeLocation, HubSnapshot, ScanRecord, ScanStage,
    Update, UpdateKind,
};
pub use image::{Image, ImageSha};
pub use pod::{Container, Pod};
pub use scan::{
    ImageInfo, ImageInfoSnapshot, PolicySummary, ScanCompletionStatus, ScanStatus, ScanSummary,
    VulnerabilitySummary,
};
