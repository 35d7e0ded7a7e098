//! Direct solver interfaces.

pub mod multifrontal;
pub use multifrontal::{FactorStats, MultifrontalSolver};
