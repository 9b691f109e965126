pub mod cache;
pub mod category;
pub mod config;
pub mod error;
pub mod geometry;
pub mod package;
pub mod pipeline;
pub mod status;
pub mod storage;

pub use cache::{CacheKey, UnionCache};
pub use category::Category;
pub use config::{load_config, Config};
pub use error::{CacheError, ConfigError, GeometryError, PackageError, StorageError};
pub use pipeline::{EvaluationPipeline, IntersectionReport, OverlayScorer, PipelineOutcome};
pub use status::{Stage, StageRecord, StageStatus, StatusReport, StatusTracker, TimedMessage};
pub use storage::Workspace;
