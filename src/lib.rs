pub mod analysis;
pub mod config;
pub mod decision;
pub mod delivery;
pub mod message;
pub mod pipeline;
pub mod privacy;
pub mod sessions;
pub mod statistics;
pub mod store;
pub mod sweeper;

pub use analysis::{AnalysisResult, MultiPhaseAnalyzer, ThreatLevel};
pub use config::Config;
pub use decision::{GraduatedDecisionMaker, ProtectionAction, ProtectionDecision, Thresholds};
pub use delivery::{DeliveryManager, DeliveryOutcome};
pub use message::{EphemeralMessage, InboundMessage};
pub use pipeline::{PipelineError, ProcessingReport, ProtectionPipeline};
pub use statistics::{StatEvent, StatisticsCollector};
pub use store::{BoundedStore, StoreError};
pub use sweeper::Sweeper;
