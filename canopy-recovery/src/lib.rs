//! Failure analysis and recovery orchestration
//!
//! The analysis engine classifies each cluster into a closed set of failure
//! scenarios from recent probe data; the recovery orchestrator filters,
//! debounces, locks and executes recoveries through the regroup engine,
//! gated by a store-backed leader election, with pre/post failover hooks
//! and durable acknowledgeable recovery records.

pub mod analysis;
pub mod election;
pub mod hooks;
pub mod orchestrator;

pub use analysis::{AnalysisCode, AnalysisEntry, Analyzer};
pub use election::{ElectionConfig, LeaderElector};
pub use hooks::{HookContext, HookRunner};
pub use orchestrator::{OrchestratorConfig, RecoveryFilters, RecoveryOrchestrator};
