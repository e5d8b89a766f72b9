//! Types library for the stratum job propagation monitor
//!
//! This library provides the shared data model read and written by the
//! normalization, correlation and propagation pipeline and by every consumer
//! that queries it.
//!
//! # Modules
//! - `ids`: Identifiers (SourceId, MatchId, JobKey, ServicePair)
//! - `job`: Normalized job observations and the unified field set
//! - `correlation`: Match groups
//! - `propagation`: Propagation samples and summary statistics
//! - `errors`: Error taxonomy

// Public modules
pub mod ids;
pub mod job;
pub mod correlation;
pub mod propagation;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::job::*;
    pub use crate::correlation::*;
    pub use crate::propagation::*;
    pub use crate::errors::*;
}
