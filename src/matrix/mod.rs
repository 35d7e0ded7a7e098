//! Matrix module: sparse input, dense front kernels and distributed blocks.

pub mod dense;
pub use dense::{DenseLu, FrontFactors};
pub mod distributed;
pub use distributed::{DistributedMatrix, Layout, Transfer, exchange};
pub mod sparse;
pub use sparse::{CsrMatrix, SparseMatrix};
