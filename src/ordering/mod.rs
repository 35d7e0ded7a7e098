//! Fill-reducing orderings producing a separator tree.

pub mod geometric;
pub use geometric::{GridOrdering, nested_dissection};
