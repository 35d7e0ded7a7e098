//! multifront: distributed multifrontal sparse direct factorization over Faer
//!
//! This crate factors sparse matrices by the multifrontal method on a tree of
//! frontal matrices that live either on a single rank or on a 2D
//! block-cyclic process grid, and moves contribution blocks between parent
//! and child fronts with an extend-add protocol over any [`parallel::Comm`]
//! (single rank, threads, or MPI behind the `mpi` feature).

pub mod parallel;

pub mod config;
pub mod error;
pub mod front;
pub mod matrix;
pub mod ordering;
pub mod solver;
pub mod tree;

// Re-exports for convenience
pub use config::*;
pub use error::*;
pub use front::{FrontCounter, FrontKind, FrontNode, FrontState};
pub use matrix::*;
pub use ordering::*;
pub use parallel::{Comm, SerialComm, ThreadComm};
pub use solver::*;
pub use tree::*;
