//! Small numeric and timing helpers used by measurements and the executor.

pub mod benchmark;
pub mod estimate;
pub mod filters;
pub mod ramp;

pub use benchmark::Benchmark;
pub use estimate::Estimate;
pub use filters::std_mean_filter;
pub use ramp::LinearRange;
