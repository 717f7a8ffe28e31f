// =============================================================================
// Aggregation engine — reservoirs, RPM rings, per-endpoint rolling stats
// =============================================================================

pub mod aggregator;
pub mod reservoir;
pub mod rpm;

pub use aggregator::{
    hour_bucket_of, AggregateSnapshot, Aggregator, HourlyRollup, LatencyEwma, MIN_WINDOW_SAMPLES,
};
pub use reservoir::{percentiles_of, Percentiles, Reservoir, RESERVOIR_CAPACITY};
pub use rpm::RpmRing;
