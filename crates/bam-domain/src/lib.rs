//! Abstract-domain contracts consumed by the BAM engine.
//!
//! The engine is generic over an [`AbstractDomain`] (transfer, merge, stop,
//! precision adjustment) and a [`Reducer`] (block-local state abstraction).
//! The `explicit` module provides one concrete domain — an explicit-value
//! map with a tracked-variable-set precision — used throughout the test
//! suites; the engine never depends on it.

pub mod domain;
pub mod explicit;
pub mod reducer;

pub use domain::{AbstractDomain, PrecisionAdjustment, PrecisionAdjustmentAction};
pub use explicit::{ExplicitDomain, ExplicitError, ExplicitPrecision, ExplicitReducer, ExplicitState};
pub use reducer::Reducer;
