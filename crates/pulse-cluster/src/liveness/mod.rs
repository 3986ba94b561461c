//! Liveness tracking.
//!
//! A TTL-indexed registry of peers that recently proved they are alive
//! by heartbeat. `LivenessFilter::peers()` is the authoritative local
//! view of the cluster.

pub mod filter;

pub use filter::LivenessFilter;
