pub mod device;
pub mod event;
pub mod job;
pub mod scan_result;

pub use device::DeviceDescriptor;
pub use event::{Event, EventType};
pub use job::{JobType, ScanJob};
pub use scan_result::{
    AnomalyReport, NlpReport, OfflineSignatureHit, PolicyAction, PolicyOutcome, ReputationReport,
    ScanResult, SignatureReport, Severity, ThreatCategory, ThreatCategoryVote,
};
