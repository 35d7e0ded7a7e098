//! Configuration of the factorization.

pub mod options;
pub use options::{Backends, CompressionThresholds, CompressionType, FactorOptions};
