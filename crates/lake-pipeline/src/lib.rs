//! Collect, extract and convert stages plus the orchestrator that runs them.

pub mod collector;
pub mod config;
pub mod context;
pub mod converter;
pub mod extractor;
pub mod orchestrator;

pub use collector::{
    malformed_response, parse_json_array, parse_json_field_array, ApiCollector, ApiCollectorArgs, Collectible,
    CollectSummary, RequestData,
};
pub use config::{
    load_pipelines, parse_pipelines, ConnectionConfig, LakeConfig, RateLimitConfig, TaskInvocation,
};
pub use context::{SubTaskContext, SubTaskEntryPoint, SubTaskMeta, TaskContext};
pub use converter::{BindValue, ConvertSummary, Convertible, DataConverter, DataConverterArgs};
pub use extractor::{
    malformed, parse_raw, ApiExtractor, ApiExtractorArgs, ExtractFailurePolicy, ExtractSummary,
    Extractable,
};
pub use orchestrator::{
    Orchestrator, PlannedSubTask, Plugin, RunPlan, RunReport, RunStatus, SubTaskReport,
    SubTaskStatus,
};

pub const CRATE_NAME: &str = "lake-pipeline";
