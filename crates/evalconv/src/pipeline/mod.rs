//! The seven-stage evaluation pipeline and its overlay scorer.

pub mod runner;
pub mod scorer;

pub use runner::{EvaluationPipeline, PipelineOutcome};
pub use scorer::{IntersectionReport, OverlayScorer, ScoreSummary};
