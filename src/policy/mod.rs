// =============================================================================
// Policy subsystem — decision engine, stores, explain collaborator
// =============================================================================

pub mod engine;
pub mod explain;
pub mod insights;
pub mod store;
pub mod thresholds;

pub use engine::{PolicyDelta, PolicyEngine};
pub use explain::{Explain, Explanation, ExplainInput, HeuristicExplainer, HttpExplainer};
pub use insights::{Insight, InsightStore, InsightType};
pub use store::{Policy, PolicyStore};
pub use thresholds::{Threshold, ThresholdStore};
