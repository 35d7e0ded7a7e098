//! Distributed multifrontal solver.
//!
//! Ties the pieces together: the separator tree is mapped onto the ranks of
//! a communicator (proportionally to subtree work, or with explicit
//! per-node counts), turned into a tree of sequential and distributed
//! fronts, factored, and used for forward/backward solves.
//!
//! Matrices and right-hand sides are replicated: every rank passes the same
//! `A` and `b`, and receives the full solution.
//!
//! # Example
//! ```
//! use multifront::config::FactorOptions;
//! use multifront::matrix::CsrMatrix;
//! use multifront::ordering::nested_dissection;
//! use multifront::parallel::ThreadComm;
//! use multifront::solver::MultifrontalSolver;
//! use multifront::tree::EliminationTree;
//!
//! // 1D Laplacian on 9 points
//! let n = 9;
//! let mut t = Vec::new();
//! for i in 0..n {
//!     t.push((i, i, 2.0));
//!     if i + 1 < n {
//!         t.push((i, i + 1, -1.0));
//!         t.push((i + 1, i, -1.0));
//!     }
//! }
//! let nd = nested_dissection(n, 1, 1, 2);
//! let a = CsrMatrix::from_triplets(n, n, &t).unwrap().permute_symmetric(&nd.perm);
//! let tree = EliminationTree::symbolic(&a, &nd.seps).unwrap();
//! let xs = ThreadComm::run(2, |comm| {
//!     let mut s = MultifrontalSolver::new(tree.clone(), FactorOptions::new(), comm).unwrap();
//!     s.factor(&a).unwrap();
//!     s.solve(&vec![1.0; n]).unwrap()
//! });
//! assert_eq!(xs[0], xs[1]);
//! ```

use faer::Mat;
use log::debug;

use crate::config::FactorOptions;
use crate::error::MfError;
use crate::front::{FrontCounter, FrontNode, build_front_tree};
use crate::matrix::{CsrMatrix, SparseMatrix};
use crate::parallel::Comm;
use crate::tree::EliminationTree;

/// Diagnostics of a factorization, reduced over all ranks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactorStats {
    pub fronts: FrontCounter,
    pub factor_nonzeros: u64,
}

pub struct MultifrontalSolver<C: Comm> {
    comm: C,
    opts: FactorOptions,
    tree: EliminationTree,
    procs: Vec<usize>,
    root: FrontNode<C>,
    counter: FrontCounter,
    factored: bool,
}

impl<C: Comm> MultifrontalSolver<C> {
    /// Map `tree` proportionally onto the ranks of `comm` and build the front
    /// tree (collective).
    pub fn new(tree: EliminationTree, opts: FactorOptions, comm: C) -> Result<Self, MfError> {
        let procs = tree.proportional_split(comm.size());
        Self::build(tree, opts, comm, procs)
    }

    /// Rebuild the front tree with explicit processes per node (collective).
    pub fn with_process_counts(self, procs: Vec<usize>) -> Result<Self, MfError> {
        let MultifrontalSolver { comm, opts, tree, root, .. } = self;
        drop(root);
        Self::build(tree, opts, comm, procs)
    }

    fn build(tree: EliminationTree, opts: FactorOptions, comm: C, procs: Vec<usize>) -> Result<Self, MfError> {
        let front_comm = comm
            .sub_comm(0, comm.size())?
            .ok_or_else(|| MfError::Comm("rank missing from its own communicator".to_string()))?;
        let mut counter = FrontCounter::default();
        let root = build_front_tree(&tree, &procs, &opts, front_comm, &mut counter)?;
        if comm.rank() == 0 {
            debug!(
                "front tree of {} nodes on {} ranks, compression {}",
                tree.len(),
                comm.size(),
                opts.compression
            );
        }
        Ok(MultifrontalSolver {
            comm,
            opts,
            tree,
            procs,
            root,
            counter,
            factored: false,
        })
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn options(&self) -> &FactorOptions {
        &self.opts
    }

    pub fn tree(&self) -> &EliminationTree {
        &self.tree
    }

    /// Processes assigned to every tree node.
    pub fn process_counts(&self) -> &[usize] {
        &self.procs
    }

    pub fn root(&self) -> &FrontNode<C> {
        &self.root
    }

    /// Numerical factorization of the (already permuted) matrix `a`
    /// (collective).
    pub fn factor(&mut self, a: &CsrMatrix<f64>) -> Result<FactorStats, MfError> {
        let n = self.tree.n();
        if a.nrows() != n || a.ncols() != n {
            return Err(MfError::DimensionMismatch {
                expected: n,
                found: a.nrows(),
            });
        }
        self.factored = false;
        if self.comm.rank() == 0 {
            debug!("factoring {} x {} matrix with {} nonzeros", n, n, a.nnz());
        }
        self.root.factor(a, &self.opts)?;
        self.factored = true;
        let stats = self.diagnostics()?;
        if self.comm.rank() == 0 {
            debug!("factorization done: {:?}", stats);
        }
        Ok(stats)
    }

    /// Solve `A x = b` for one right-hand side (collective).
    pub fn solve(&mut self, b: &[f64]) -> Result<Vec<f64>, MfError> {
        let bm = Mat::from_fn(b.len(), 1, |i, _| b[i]);
        let x = self.solve_multi(&bm)?;
        Ok((0..x.nrows()).map(|i| x[(i, 0)]).collect())
    }

    /// Solve for every column of `b` (collective).
    pub fn solve_multi(&mut self, b: &Mat<f64>) -> Result<Mat<f64>, MfError> {
        if !self.factored {
            return Err(MfError::NotFactored);
        }
        let n = self.tree.n();
        if b.nrows() != n {
            return Err(MfError::DimensionMismatch {
                expected: n,
                found: b.nrows(),
            });
        }
        let nrhs = b.ncols();
        self.root.forward(b)?;
        let mut x = Mat::<f64>::zeros(n, nrhs);
        self.root.backward(&mut x)?;
        // every entry was written by exactly one rank
        let mut flat: Vec<f64> = (0..nrhs).flat_map(|j| (0..n).map(move |i| (i, j))).map(|(i, j)| x[(i, j)]).collect();
        self.comm.all_reduce_vec(&mut flat)?;
        Ok(Mat::from_fn(n, nrhs, |i, j| flat[j * n + i]))
    }

    /// Front kinds and factor nonzeros, summed over all ranks (collective).
    pub fn diagnostics(&self) -> Result<FactorStats, MfError> {
        let fronts = self.counter.reduce(&self.comm)?;
        let nnz = self.comm.all_reduce(self.root.factor_nonzeros() as f64)?;
        Ok(FactorStats {
            fronts,
            factor_nonzeros: nnz.round() as u64,
        })
    }
}
