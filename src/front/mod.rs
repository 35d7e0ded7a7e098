//! Frontal matrices of the multifrontal method.
//!
//! Every node of the elimination tree becomes a front: the dense (or
//! compressed) matrix coupling its separator variables to its update
//! variables. A front lives either on a single rank ([`SeqFront`]) or on a
//! 2D process grid ([`DistFront`]); [`FrontNode`] is the placement-tagged
//! union of both. The tree skeleton exists on every rank of the factorizing
//! communicator, numeric data only where a rank takes part in a front.

use faer::Mat;
use log::debug;

use crate::config::FactorOptions;
use crate::error::MfError;
use crate::matrix::CsrMatrix;
use crate::parallel::{Comm, ProcessGrid};
use crate::tree::EliminationTree;

pub mod factory;
pub mod sequential;
pub mod distributed;

pub use distributed::DistFront;
pub use sequential::SeqFront;

/// Representation of a front, fixed when the front is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontKind {
    Dense,
    Hss,
    Blr,
    Hodlr,
    H2,
    /// Dense, GPU resident.
    Gpu,
    /// Dense Cholesky-style GPU variant for SPD problems.
    GpuSpd,
    Lossy,
}

impl FrontKind {
    /// Compressed kinds never see their full frontal matrix assembled by
    /// extend-add; they sample it through element extraction.
    pub fn assembles_by_extraction(self) -> bool {
        matches!(self, FrontKind::Hss | FrontKind::Blr | FrontKind::Hodlr | FrontKind::H2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontState {
    Unfactored,
    Factoring,
    Factored,
    /// Factored, contribution block handed to the parent.
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Sequential,
    Distributed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Side {
    Left,
    Right,
}

/// Index sets and state shared by both placements.
#[derive(Debug, Clone)]
pub struct FrontHeader {
    pub sep_begin: usize,
    pub sep_end: usize,
    pub upd: Vec<usize>,
    pub kind: FrontKind,
    pub state: FrontState,
}

impl FrontHeader {
    pub fn new(sep_begin: usize, sep_end: usize, upd: Vec<usize>, kind: FrontKind) -> Self {
        FrontHeader {
            sep_begin,
            sep_end,
            upd,
            kind,
            state: FrontState::Unfactored,
        }
    }

    pub fn dim_sep(&self) -> usize {
        self.sep_end - self.sep_begin
    }

    pub fn dim_upd(&self) -> usize {
        self.upd.len()
    }

    pub fn dim(&self) -> usize {
        self.dim_sep() + self.dim_upd()
    }

    /// Row of global variable `var` in this front: separator rows first,
    /// then update rows.
    pub fn front_index(&self, var: usize) -> Option<usize> {
        if (self.sep_begin..self.sep_end).contains(&var) {
            Some(var - self.sep_begin)
        } else {
            self.upd.binary_search(&var).ok().map(|k| self.dim_sep() + k)
        }
    }

    /// Global variables of the front rows.
    pub fn front_vars(&self) -> Vec<usize> {
        (self.sep_begin..self.sep_end).chain(self.upd.iter().copied()).collect()
    }

    /// Front rows of a child's update variables.
    pub fn child_map(&self, child_upd: &[usize]) -> Vec<Option<usize>> {
        child_upd.iter().map(|&v| self.front_index(v)).collect()
    }

    pub fn is_solvable(&self) -> Result<(), MfError> {
        match self.state {
            FrontState::Factored | FrontState::Released => Ok(()),
            _ => Err(MfError::NotFactored),
        }
    }

    pub(crate) fn singular(&self, err: MfError) -> MfError {
        match err {
            MfError::ZeroPivot(pivot) => MfError::Singular {
                begin: self.sep_begin,
                end: self.sep_end,
                pivot,
            },
            other => other,
        }
    }
}

/// Number of fronts of every kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrontCounter {
    pub dense: usize,
    pub hss: usize,
    pub blr: usize,
    pub hodlr: usize,
    pub h2: usize,
    pub gpu: usize,
    pub lossy: usize,
}

impl FrontCounter {
    pub fn record(&mut self, kind: FrontKind) {
        match kind {
            FrontKind::Dense => self.dense += 1,
            FrontKind::Hss => self.hss += 1,
            FrontKind::Blr => self.blr += 1,
            FrontKind::Hodlr => self.hodlr += 1,
            FrontKind::H2 => self.h2 += 1,
            FrontKind::Gpu | FrontKind::GpuSpd => self.gpu += 1,
            FrontKind::Lossy => self.lossy += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.dense + self.hss + self.blr + self.hodlr + self.h2 + self.gpu + self.lossy
    }

    pub(crate) fn to_vec(self) -> Vec<f64> {
        [self.dense, self.hss, self.blr, self.hodlr, self.h2, self.gpu, self.lossy]
            .iter()
            .map(|&c| c as f64)
            .collect()
    }

    pub(crate) fn from_slice(v: &[f64]) -> Self {
        let c = |k: usize| v.get(k).map_or(0, |&x| x.round() as usize);
        FrontCounter {
            dense: c(0),
            hss: c(1),
            blr: c(2),
            hodlr: c(3),
            h2: c(4),
            gpu: c(5),
            lossy: c(6),
        }
    }

    /// Sum over all ranks of `comm`.
    pub fn reduce<C: Comm>(&self, comm: &C) -> Result<Self, MfError> {
        let mut v = self.to_vec();
        comm.all_reduce_vec(&mut v)?;
        Ok(Self::from_slice(&v))
    }
}

/// A child's contribution to a local front: its update variables and a
/// block whose rows (and columns, for contribution blocks) follow them.
pub struct Contribution<'a> {
    pub side: Side,
    pub upd: &'a [usize],
    pub block: &'a Mat<f64>,
}

/// Scatter-add contribution blocks into a local frontal matrix, rows and
/// columns. Blocks are applied left child first, whatever order they are
/// passed in.
pub fn extend_add_local(header: &FrontHeader, front: &mut Mat<f64>, contribs: &mut [Contribution<'_>]) {
    contribs.sort_by_key(|c| c.side);
    for c in contribs.iter() {
        let map = header.child_map(c.upd);
        for (cj, fj) in map.iter().enumerate() {
            let Some(fj) = *fj else { continue };
            for (ci, fi) in map.iter().enumerate() {
                if let Some(fi) = *fi {
                    front[(fi, fj)] += c.block[(ci, cj)];
                }
            }
        }
    }
}

/// Row-only variant of [`extend_add_local`] for right-hand sides.
pub fn extend_add_rows(header: &FrontHeader, bf: &mut Mat<f64>, contribs: &mut [Contribution<'_>]) {
    contribs.sort_by_key(|c| c.side);
    for c in contribs.iter() {
        let map = header.child_map(c.upd);
        for j in 0..c.block.ncols() {
            for (ci, fi) in map.iter().enumerate() {
                if let Some(fi) = *fi {
                    bf[(fi, j)] += c.block[(ci, j)];
                }
            }
        }
    }
}

/// Placement-tagged front.
pub enum FrontNode<C: Comm> {
    Sequential(SeqFront),
    Distributed(DistFront<C>),
}

impl<C: Comm> FrontNode<C> {
    pub fn header(&self) -> &FrontHeader {
        match self {
            FrontNode::Sequential(f) => &f.header,
            FrontNode::Distributed(f) => &f.header,
        }
    }

    pub fn placement(&self) -> Placement {
        match self {
            FrontNode::Sequential(_) => Placement::Sequential,
            FrontNode::Distributed(_) => Placement::Distributed,
        }
    }

    /// Processes of the subtree.
    pub fn total_procs(&self) -> usize {
        match self {
            FrontNode::Sequential(_) => 1,
            FrontNode::Distributed(f) => f.grid().total_procs(),
        }
    }

    pub fn factor(&mut self, a: &CsrMatrix<f64>, opts: &FactorOptions) -> Result<(), MfError> {
        match self {
            FrontNode::Sequential(f) => f.factor(a, opts),
            FrontNode::Distributed(f) => f.factor(a, opts),
        }
    }

    pub fn forward(&mut self, b: &Mat<f64>) -> Result<(), MfError> {
        match self {
            FrontNode::Sequential(f) => f.forward(b),
            FrontNode::Distributed(f) => f.forward(b),
        }
    }

    pub fn backward(&mut self, x: &mut Mat<f64>) -> Result<(), MfError> {
        match self {
            FrontNode::Sequential(f) => f.backward(x),
            FrontNode::Distributed(f) => f.backward(x),
        }
    }

    /// Factor nonzeros of the fronts counted on this rank.
    pub fn factor_nonzeros(&self) -> u64 {
        match self {
            FrontNode::Sequential(f) => f.factor_nonzeros(),
            FrontNode::Distributed(f) => f.factor_nonzeros(),
        }
    }

    /// This rank's block of the contribution block.
    pub(crate) fn cb_local(&self) -> Option<&Mat<f64>> {
        match self {
            FrontNode::Sequential(f) => f.cb(),
            FrontNode::Distributed(f) => f.cb_local(),
        }
    }

    pub(crate) fn release(&mut self) {
        match self {
            FrontNode::Sequential(f) => f.release(),
            FrontNode::Distributed(f) => f.release(),
        }
    }

    /// Right-hand-side update left by the forward pass, on the front's first rank.
    pub(crate) fn bupd_local(&self) -> Option<&Mat<f64>> {
        match self {
            FrontNode::Sequential(f) => f.bupd(),
            FrontNode::Distributed(f) => f.bupd(),
        }
    }

    pub(crate) fn take_bupd(&mut self) -> Option<Mat<f64>> {
        match self {
            FrontNode::Sequential(f) => f.take_bupd(),
            FrontNode::Distributed(f) => f.take_bupd(),
        }
    }

    pub(crate) fn set_xupd(&mut self, xupd: Mat<f64>) {
        match self {
            FrontNode::Sequential(f) => f.set_xupd(xupd),
            FrontNode::Distributed(f) => f.set_xupd(xupd),
        }
    }
}

/// Build the front tree of `tree` (collective over `comm`).
///
/// Nodes with one process become sequential fronts, all others get a
/// process grid. `comm` must have `procs[root]` ranks. Kinds are tallied in
/// `counter` on the rank that owns each front (grid rank 0 or the
/// sequential owner).
pub fn build_front_tree<C: Comm>(
    tree: &EliminationTree,
    procs: &[usize],
    opts: &FactorOptions,
    comm: C,
    counter: &mut FrontCounter,
) -> Result<FrontNode<C>, MfError> {
    tree.validate_process_counts(procs, comm.size())?;
    let owner = comm.rank() == 0;
    build_node(tree, procs, opts, tree.root(), Some(comm), owner, counter)
}

fn build_node<C: Comm>(
    tree: &EliminationTree,
    procs: &[usize],
    opts: &FactorOptions,
    k: usize,
    comm: Option<C>,
    owner: bool,
    counter: &mut FrontCounter,
) -> Result<FrontNode<C>, MfError> {
    if procs[k] == 1 {
        return Ok(FrontNode::Sequential(build_sequential(tree, opts, k, owner, counter)));
    }
    let node = tree.node(k);
    let p = procs[k];
    let kind = factory::select_distributed(node.dim_sep(), node.upd.len(), opts);
    let grid = ProcessGrid::new(comm, p)?;
    let me = grid.rank_all();
    if me == Some(0) {
        counter.record(kind);
        debug!(
            "distributed front [{}, {}) dupd={} kind={:?} on {}x{} grid of {} ranks",
            node.sep_begin,
            node.sep_end,
            node.upd.len(),
            kind,
            grid.np_rows(),
            grid.np_cols(),
            p
        );
    }
    let mut children = [None, None];
    for (side, child) in [(Side::Left, node.left), (Side::Right, node.right)] {
        let Some(c) = child else { continue };
        let pc = procs[c];
        let built = if pc > 1 {
            let (begin, end) = match side {
                Side::Left => (0, pc),
                Side::Right => (p - pc, p),
            };
            let sub = match grid.ctxt_all() {
                Some(all) => all.sub_comm(begin, end)?,
                None => None,
            };
            build_node(tree, procs, opts, c, sub, false, counter)?
        } else {
            let master = match side {
                Side::Left => 0,
                Side::Right => p - 1,
            };
            build_node(tree, procs, opts, c, None, me == Some(master), counter)?
        };
        children[side as usize] = Some(Box::new(built));
    }
    let [left, right] = children;
    let header = FrontHeader::new(node.sep_begin, node.sep_end, node.upd.clone(), kind);
    Ok(FrontNode::Distributed(DistFront::new(header, grid, opts.block_size, left, right)))
}

fn build_sequential(
    tree: &EliminationTree,
    opts: &FactorOptions,
    k: usize,
    owner: bool,
    counter: &mut FrontCounter,
) -> SeqFront {
    let node = tree.node(k);
    let kind = factory::select(node.dim_sep(), node.upd.len(), opts);
    if owner {
        counter.record(kind);
    }
    let mut child = |c: Option<usize>| c.map(|c| Box::new(build_sequential(tree, opts, c, owner, counter)));
    let left = child(node.left);
    let right = child(node.right);
    SeqFront::new(FrontHeader::new(node.sep_begin, node.sep_end, node.upd.clone(), kind), left, right)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> FrontHeader {
        FrontHeader::new(4, 6, vec![7, 9, 12], FrontKind::Dense)
    }

    #[test]
    fn front_index_stacks_separator_then_update() {
        let h = header();
        assert_eq!(h.dim(), 5);
        assert_eq!(h.front_index(5), Some(1));
        assert_eq!(h.front_index(9), Some(3));
        assert_eq!(h.front_index(8), None);
        assert_eq!(h.front_vars(), vec![4, 5, 7, 9, 12]);
        assert_eq!(h.child_map(&[5, 12, 13]), vec![Some(1), Some(4), None]);
    }

    #[test]
    fn extend_add_applies_left_first() {
        let h = header();
        let l = Mat::from_fn(2, 2, |i, j| 0.1 + (i + j) as f64 / 3.0);
        let r = Mat::from_fn(2, 2, |i, j| 1e16 * (1 + i + j) as f64);
        let lu = [5, 9];
        let ru = [9, 12];
        let base = Mat::from_fn(5, 5, |i, j| (i * 5 + j) as f64 * 0.7);
        let mut a = base.clone();
        let mut b = base.clone();
        extend_add_local(
            &h,
            &mut a,
            &mut [
                Contribution { side: Side::Left, upd: &lu, block: &l },
                Contribution { side: Side::Right, upd: &ru, block: &r },
            ],
        );
        extend_add_local(
            &h,
            &mut b,
            &mut [
                Contribution { side: Side::Right, upd: &ru, block: &r },
                Contribution { side: Side::Left, upd: &lu, block: &l },
            ],
        );
        for i in 0..5 {
            for j in 0..5 {
                assert_eq!(a[(i, j)].to_bits(), b[(i, j)].to_bits());
            }
        }
        assert_eq!(a[(1, 1)], base[(1, 1)] + l[(0, 0)]);
    }

    #[test]
    fn counter_reduction_round_trip() {
        let mut c = FrontCounter::default();
        c.record(FrontKind::Dense);
        c.record(FrontKind::GpuSpd);
        c.record(FrontKind::Blr);
        assert_eq!(FrontCounter::from_slice(&c.to_vec()), c);
        assert_eq!(c.total(), 3);
        let r = c.reduce(&crate::parallel::SerialComm::new()).unwrap();
        assert_eq!(r, c);
    }

    #[test]
    fn kinds_that_sample_their_front() {
        assert!(FrontKind::Hss.assembles_by_extraction());
        assert!(!FrontKind::Lossy.assembles_by_extraction());
        assert!(!FrontKind::Gpu.assembles_by_extraction());
    }
}
