//! Fronts resident on a 2D process grid.
//!
//! A distributed front keeps its contribution block block-cyclically over
//! its grid. All data movement between a front and its children goes
//! through [`exchange`] over the front's subtree communicator (`ctxt_all`),
//! where the children's layouts sit at the ranks their subtrees own:
//!
//! - the left child's ranks are `[0, P_left)`, the right child's
//!   `[P - P_right, P)`;
//! - a single-rank left child lives on rank 0, a single-rank right child on
//!   rank `P - 1`.
//!
//! The separator block is gathered over the active grid (`ctxt`) and
//! eliminated on the grid root (rank 0), which also keeps the factors and
//! the right-hand-side pieces of the solve phase. Every rank of `ctxt_all`
//! takes part in every exchange round between the front and its children,
//! also when it holds nothing for it.

use std::collections::HashMap;

use faer::Mat;
use log::{debug, trace};

use crate::config::FactorOptions;
use crate::error::MfError;
use crate::matrix::{CsrMatrix, DistributedMatrix, FrontFactors, Layout, Transfer, exchange};
use crate::parallel::{Comm, ProcessGrid};

use super::{FrontHeader, FrontNode, FrontState, Side};

pub struct DistFront<C: Comm> {
    pub header: FrontHeader,
    grid: ProcessGrid<C>,
    nb: usize,
    left: Option<Box<FrontNode<C>>>,
    right: Option<Box<FrontNode<C>>>,
    /// Grid root only.
    factors: Option<FrontFactors>,
    cb: Option<DistributedMatrix>,
    w: Option<Mat<f64>>,
    bupd: Option<Mat<f64>>,
    xupd: Option<Mat<f64>>,
}

/// Make a failure on any rank a failure on all ranks of `comm`
/// (collective). Ranks that did not fail report the error of the lowest
/// failing rank.
fn agree<C: Comm>(comm: &C, local: Result<(), MfError>) -> Result<(), MfError> {
    let p = comm.size();
    let me = comm.rank();
    let mut status = vec![0.0; 4 * p];
    match &local {
        Ok(()) => {}
        Err(MfError::Singular { begin, end, pivot }) => {
            status[4 * me..4 * me + 4].copy_from_slice(&[1.0, *begin as f64, *end as f64, *pivot as f64]);
        }
        Err(_) => status[4 * me] = 2.0,
    }
    comm.all_reduce_vec(&mut status)?;
    local?;
    for r in 0..p {
        let s = &status[4 * r..4 * r + 4];
        if s[0] == 1.0 {
            return Err(MfError::Singular {
                begin: s[1] as usize,
                end: s[2] as usize,
                pivot: s[3] as usize,
            });
        }
        if s[0] != 0.0 {
            return Err(MfError::Comm(format!("factorization failed on rank {}", r)));
        }
    }
    Ok(())
}

fn position_map(vars: &[usize]) -> HashMap<usize, usize> {
    vars.iter().enumerate().map(|(k, &v)| (v, k)).collect()
}

impl<C: Comm> DistFront<C> {
    pub fn new(
        header: FrontHeader,
        grid: ProcessGrid<C>,
        nb: usize,
        left: Option<Box<FrontNode<C>>>,
        right: Option<Box<FrontNode<C>>>,
    ) -> Self {
        DistFront {
            header,
            grid,
            nb: nb.max(1),
            left,
            right,
            factors: None,
            cb: None,
            w: None,
            bupd: None,
            xupd: None,
        }
    }

    pub fn grid(&self) -> &ProcessGrid<C> {
        &self.grid
    }

    pub fn child(&self, side: Side) -> Option<&FrontNode<C>> {
        match side {
            Side::Left => self.left.as_deref(),
            Side::Right => self.right.as_deref(),
        }
    }

    fn child_mut(&mut self, side: Side) -> Option<&mut FrontNode<C>> {
        match side {
            Side::Left => self.left.as_deref_mut(),
            Side::Right => self.right.as_deref_mut(),
        }
    }

    fn comm(&self) -> Result<&C, MfError> {
        self.grid
            .ctxt_all()
            .ok_or_else(|| MfError::Comm("rank is not part of this front".to_string()))
    }

    fn me(&self) -> Option<usize> {
        self.grid.rank_all()
    }

    fn is_grid_root(&self) -> bool {
        self.me() == Some(0)
    }

    /// Block-cyclic layout of a `rows × cols` matrix on this front's grid.
    pub fn layout(&self, rows: usize, cols: usize) -> Layout {
        Layout::block_cyclic(rows, cols, self.nb, self.grid.shape(), 0)
    }

    /// The distributed contribution block.
    pub fn cb(&self) -> Option<&DistributedMatrix> {
        self.cb.as_ref()
    }

    /// Rank (in this front's communicator) of the first process of a child.
    pub fn child_master(&self, side: Side) -> usize {
        let p = self.grid.total_procs();
        match (side, self.child(side)) {
            (Side::Left, _) | (_, None) => 0,
            (Side::Right, Some(FrontNode::Distributed(d))) => p - d.grid.total_procs(),
            (Side::Right, Some(FrontNode::Sequential(_))) => p - 1,
        }
    }

    /// Does this rank take part in the child's subtree?
    pub fn visit(&self, side: Side) -> bool {
        match self.child(side) {
            None => false,
            Some(FrontNode::Distributed(d)) => d.grid.is_valid(),
            Some(FrontNode::Sequential(_)) => self.me() == Some(self.child_master(side)),
        }
    }

    /// Layout, in this front's communicator, of a `rows × cols` matrix
    /// distributed the way the child distributes its own data.
    fn child_layout(&self, side: Side, rows: usize, cols: usize) -> Layout {
        let master = self.child_master(side);
        match self.child(side) {
            Some(FrontNode::Distributed(d)) => d.layout(rows, cols).with_offset(master),
            _ => Layout::single(rows, cols, master),
        }
    }

    fn sides(&self) -> impl Iterator<Item = (Side, &FrontNode<C>)> {
        [Side::Left, Side::Right]
            .into_iter()
            .filter_map(|s| self.child(s).map(|c| (s, c)))
    }

    /// Factor the subtree rooted here (collective over the front's
    /// communicator).
    pub fn factor(&mut self, a: &CsrMatrix<f64>, opts: &FactorOptions) -> Result<(), MfError> {
        self.header.state = FrontState::Unfactored;
        self.factors = None;
        self.cb = None;
        let local = self.factor_children(a, opts);
        agree(self.comm()?, local)?;
        self.header.state = FrontState::Factoring;
        let front = self.assemble(a, opts)?;
        for side in [Side::Left, Side::Right] {
            if let Some(child) = self.child_mut(side) {
                child.release();
            }
        }
        self.eliminate(front)?;
        self.header.state = FrontState::Factored;
        Ok(())
    }

    /// Factor the children this rank takes part in.
    pub fn factor_children(&mut self, a: &CsrMatrix<f64>, opts: &FactorOptions) -> Result<(), MfError> {
        for side in [Side::Left, Side::Right] {
            if self.visit(side) {
                if let Some(child) = self.child_mut(side) {
                    child.factor(a, opts)?;
                }
            }
        }
        Ok(())
    }

    /// The distributed frontal matrix: sparse entries plus the children's
    /// contribution blocks (collective). Compressed kinds sample it through
    /// element extraction in column panels.
    pub fn assemble(&self, a: &CsrMatrix<f64>, opts: &FactorOptions) -> Result<DistributedMatrix, MfError> {
        let comm = self.comm()?;
        let vars = self.header.front_vars();
        let d = vars.len();
        let mut front = DistributedMatrix::new(self.layout(d, d), self.me());
        if !self.header.kind.assembles_by_extraction() {
            self.add_sparse(a, &vars, &vars, &mut front);
            self.extend_add(&mut front)?;
            return Ok(front);
        }
        let panels: Vec<Vec<usize>> = vars.chunks(opts.leaf_size.max(1)).map(|c| c.to_vec()).collect();
        let rows = vec![vars.clone(); panels.len()];
        let parts = self.extract_2d_batch(a, &rows, &panels)?;
        let mut transfers = Vec::with_capacity(parts.len());
        let mut c0 = 0;
        for (k, part) in parts.iter().enumerate() {
            transfers.push(Transfer {
                src: *part.layout(),
                dst: *front.layout(),
                rows: (0..d).map(Some).collect(),
                cols: (c0..c0 + part.cols()).map(Some).collect(),
                src_slot: k,
                dst_slot: 0,
            });
            c0 += part.cols();
        }
        let srcs: Vec<Option<&Mat<f64>>> = parts.iter().map(|p| p.local()).collect();
        exchange(comm, &transfers, &srcs, &mut [front.local_mut()])?;
        Ok(front)
    }

    /// Add `A(rows, cols)` restricted to this front's separator into the
    /// local block of `out`, whose global rows/cols index `rows`/`cols`.
    fn add_sparse(&self, a: &CsrMatrix<f64>, rows: &[usize], cols: &[usize], out: &mut DistributedMatrix) {
        if !out.is_local() {
            return;
        }
        let lr: Vec<usize> = out.local_rows().into_iter().map(|i| rows[i]).collect();
        let lc: Vec<usize> = out.local_cols().into_iter().map(|j| cols[j]).collect();
        let block = a.extract_separator(self.header.sep_end, &lr, &lc);
        out.add_local(&block);
    }

    /// Add the children's contribution blocks into the distributed frontal
    /// matrix (one exchange round).
    pub fn extend_add(&self, front: &mut DistributedMatrix) -> Result<(), MfError> {
        let comm = self.comm()?;
        let mut transfers = Vec::with_capacity(2);
        let mut srcs: [Option<&Mat<f64>>; 2] = [None, None];
        for (side, child) in self.sides() {
            let upd = &child.header().upd;
            if upd.is_empty() {
                continue;
            }
            if self.visit(side) {
                if child.header().state != FrontState::Factored {
                    return Err(MfError::NotFactored);
                }
                srcs[side as usize] = child.cb_local();
            }
            let map = self.header.child_map(upd);
            transfers.push(Transfer {
                src: self.child_layout(side, upd.len(), upd.len()),
                dst: *front.layout(),
                rows: map.clone(),
                cols: map,
                src_slot: side as usize,
                dst_slot: 0,
            });
        }
        trace!(
            "extend-add into front [{}, {}): {} children",
            self.header.sep_begin,
            self.header.sep_end,
            transfers.len()
        );
        exchange(comm, &transfers, &srcs, &mut [front.local_mut()])
    }

    /// Partial elimination on the grid root; the Schur complement comes back
    /// as the distributed contribution block. The gather and the scatter run
    /// over the active grid (`ctxt`); ranks idle in the grid only take part
    /// in the error agreement over `ctxt_all`.
    fn eliminate(&mut self, front: DistributedMatrix) -> Result<(), MfError> {
        let (ds, du) = (self.header.dim_sep(), self.header.dim_upd());
        let all = self.comm()?;
        let Some(grid) = self.grid.ctxt() else {
            trace!(
                "rank {:?} idle in the elimination of front [{}, {})",
                self.me(),
                self.header.sep_begin,
                self.header.sep_end
            );
            agree(all, Ok(()))?;
            self.factors = None;
            self.cb = Some(DistributedMatrix::new(self.layout(du, du), self.me()));
            return Ok(());
        };
        let result = front
            .redistribute(grid, Layout::single(ds + du, ds + du, 0))
            .and_then(|on_root| match on_root.into_local() {
                Some(f) => FrontFactors::eliminate(&f, ds)
                    .map(Some)
                    .map_err(|e| self.header.singular(e)),
                None => Ok(None),
            });
        let (status, eliminated) = match result {
            Ok(e) => (Ok(()), e),
            Err(e) => (Err(e), None),
        };
        agree(all, status)?;
        let mut schur = DistributedMatrix::new(Layout::single(du, du, 0), Some(grid.rank()));
        let factors = match (eliminated, schur.local_mut()) {
            (Some((factors, s)), Some(local)) => {
                *local = s;
                Some(factors)
            }
            _ => None,
        };
        let cb = schur.redistribute(grid, self.layout(du, du))?;
        if factors.is_some() {
            debug!(
                "factored distributed front [{}, {}) dupd={} on {} of {} ranks",
                self.header.sep_begin,
                self.header.sep_end,
                du,
                self.grid.active_procs(),
                self.grid.total_procs()
            );
        }
        self.factors = factors;
        self.cb = Some(cb);
        Ok(())
    }

    pub(crate) fn release(&mut self) {
        self.cb = None;
        self.header.state = FrontState::Released;
    }

    pub(crate) fn cb_local(&self) -> Option<&Mat<f64>> {
        self.cb.as_ref().and_then(|m| m.local())
    }

    pub(crate) fn bupd(&self) -> Option<&Mat<f64>> {
        self.bupd.as_ref()
    }

    pub(crate) fn take_bupd(&mut self) -> Option<Mat<f64>> {
        self.bupd.take()
    }

    pub(crate) fn set_xupd(&mut self, xupd: Mat<f64>) {
        self.xupd = Some(xupd);
    }

    /// Forward elimination (collective); `b` is the global right-hand side,
    /// replicated on every rank.
    pub fn forward(&mut self, b: &Mat<f64>) -> Result<(), MfError> {
        self.header.is_solvable()?;
        for side in [Side::Left, Side::Right] {
            if self.visit(side) {
                if let Some(child) = self.child_mut(side) {
                    child.forward(b)?;
                }
            }
        }
        let nrhs = b.ncols();
        let (ds, d) = (self.header.dim_sep(), self.header.dim());
        let sb = self.header.sep_begin;
        let mut bf = DistributedMatrix::from_fn(Layout::single(d, nrhs, 0), self.me(), |i, j| {
            if i < ds { b[(sb + i, j)] } else { 0.0 }
        });
        self.extend_add_b(&mut bf)?;
        if let Some(f) = bf.into_local() {
            let factors = self.factors.as_ref().ok_or(MfError::NotFactored)?;
            let (w, bupd) = factors.forward(&f);
            self.w = Some(w);
            self.bupd = Some(bupd);
        }
        Ok(())
    }

    /// Add the children's right-hand-side updates into the stacked
    /// right-hand side `bf` held by the grid root (one exchange round).
    pub fn extend_add_b(&mut self, bf: &mut DistributedMatrix) -> Result<(), MfError> {
        let nrhs = bf.cols();
        {
            let comm = self.comm()?;
            let mut transfers = Vec::with_capacity(2);
            let mut srcs: [Option<&Mat<f64>>; 2] = [None, None];
            for (side, child) in self.sides() {
                let upd = &child.header().upd;
                if upd.is_empty() {
                    continue;
                }
                if self.visit(side) {
                    srcs[side as usize] = child.bupd_local();
                }
                transfers.push(Transfer {
                    src: Layout::single(upd.len(), nrhs, self.child_master(side)),
                    dst: *bf.layout(),
                    rows: self.header.child_map(upd),
                    cols: (0..nrhs).map(Some).collect(),
                    src_slot: side as usize,
                    dst_slot: 0,
                });
            }
            exchange(comm, &transfers, &srcs, &mut [bf.local_mut()])?;
        }
        for side in [Side::Left, Side::Right] {
            if let Some(child) = self.child_mut(side) {
                child.take_bupd();
            }
        }
        Ok(())
    }

    /// Backward substitution (collective). Separator rows of `x` are written
    /// on the grid root only.
    pub fn backward(&mut self, x: &mut Mat<f64>) -> Result<(), MfError> {
        self.header.is_solvable()?;
        let nrhs = x.ncols();
        let (ds, du, d) = (self.header.dim_sep(), self.header.dim_upd(), self.header.dim());
        let mut sol = DistributedMatrix::new(Layout::single(d, nrhs, 0), self.me());
        if let Some(local) = sol.local_mut() {
            let factors = self.factors.as_ref().ok_or(MfError::NotFactored)?;
            let w = self
                .w
                .take()
                .ok_or(MfError::Unsupported("backward solve before forward solve"))?;
            let xupd = match self.xupd.take() {
                Some(xu) => xu,
                None if du == 0 => Mat::zeros(0, nrhs),
                None => return Err(MfError::Unsupported("backward solve before forward solve")),
            };
            let xs = factors.backward(&w, &xupd);
            for j in 0..nrhs {
                for i in 0..ds {
                    x[(self.header.sep_begin + i, j)] = xs[(i, j)];
                    local[(i, j)] = xs[(i, j)];
                }
                for i in 0..du {
                    local[(ds + i, j)] = xupd[(i, j)];
                }
            }
        }
        self.extract_b(&sol)?;
        for side in [Side::Left, Side::Right] {
            if self.visit(side) {
                if let Some(child) = self.child_mut(side) {
                    child.backward(x)?;
                }
            }
        }
        Ok(())
    }

    /// Hand every child the rows of this front's solution at its update
    /// variables (one exchange round).
    pub fn extract_b(&mut self, sol: &DistributedMatrix) -> Result<(), MfError> {
        let nrhs = sol.cols();
        let vars = self.header.front_vars();
        let me = self.me();
        let mut dsts: [Option<Mat<f64>>; 2] = [None, None];
        {
            let comm = self.comm()?;
            let mut transfers = Vec::with_capacity(2);
            for (side, child) in self.sides() {
                let upd = &child.header().upd;
                if upd.is_empty() {
                    continue;
                }
                let master = self.child_master(side);
                if self.visit(side) && me == Some(master) {
                    dsts[side as usize] = Some(Mat::zeros(upd.len(), nrhs));
                }
                let pos = position_map(upd);
                transfers.push(Transfer {
                    src: *sol.layout(),
                    dst: Layout::single(upd.len(), nrhs, master),
                    rows: vars.iter().map(|v| pos.get(v).copied()).collect(),
                    cols: (0..nrhs).map(Some).collect(),
                    src_slot: 0,
                    dst_slot: side as usize,
                });
            }
            let mut dst_refs: Vec<Option<&mut Mat<f64>>> = dsts.iter_mut().map(|m| m.as_mut()).collect();
            exchange(comm, &transfers, &[sol.local()], &mut dst_refs)?;
        }
        for (side, xu) in [Side::Left, Side::Right].into_iter().zip(dsts) {
            if let (Some(xu), Some(child)) = (xu, self.child_mut(side)) {
                child.set_xupd(xu);
            }
        }
        Ok(())
    }

    /// `(I, J)` entries of this front's frontal matrix, distributed over its
    /// grid (collective). Children must still hold their contribution blocks.
    pub fn extract_2d(&self, a: &CsrMatrix<f64>, rows: &[usize], cols: &[usize]) -> Result<DistributedMatrix, MfError> {
        let mut out = self.extract_2d_batch(a, &[rows.to_vec()], &[cols.to_vec()])?;
        out.pop()
            .ok_or_else(|| MfError::Comm("empty extraction batch".to_string()))
    }

    /// Batched [`extract_2d`](Self::extract_2d): one copy round for all
    /// requests, and one round in each child.
    pub fn extract_2d_batch(
        &self,
        a: &CsrMatrix<f64>,
        rows: &[Vec<usize>],
        cols: &[Vec<usize>],
    ) -> Result<Vec<DistributedMatrix>, MfError> {
        if rows.len() != cols.len() {
            return Err(MfError::DimensionMismatch {
                expected: rows.len(),
                found: cols.len(),
            });
        }
        let comm = self.comm()?;
        let nreq = rows.len();
        let mut out: Vec<DistributedMatrix> = rows
            .iter()
            .zip(cols)
            .map(|(i, j)| {
                let mut b = DistributedMatrix::new(self.layout(i.len(), j.len()), self.me());
                self.add_sparse(a, i, j, &mut b);
                b
            })
            .collect();

        let mut child_parts: [Vec<Option<Mat<f64>>>; 2] = [Vec::new(), Vec::new()];
        for (side, child) in self.sides() {
            if !self.visit(side) {
                continue;
            }
            child_parts[side as usize] = match child {
                FrontNode::Distributed(d) => d
                    .get_submatrix_2d_batch(rows, cols)?
                    .into_iter()
                    .map(|m| m.into_local())
                    .collect(),
                FrontNode::Sequential(s) => rows
                    .iter()
                    .zip(cols)
                    .map(|(i, j)| s.get_submatrix(i, j).map(Some))
                    .collect::<Result<_, _>>()?,
            };
        }

        let mut transfers = Vec::with_capacity(2 * nreq);
        let mut srcs: Vec<Option<&Mat<f64>>> = vec![None; 2 * nreq];
        for (side, _) in self.sides() {
            for k in 0..nreq {
                let (m, n) = (rows[k].len(), cols[k].len());
                let slot = side as usize * nreq + k;
                srcs[slot] = child_parts[side as usize].get(k).and_then(|p| p.as_ref());
                transfers.push(
                    Transfer::identity(self.child_layout(side, m, n), *out[k].layout()).with_slots(slot, k),
                );
            }
        }
        let mut dsts: Vec<Option<&mut Mat<f64>>> = out.iter_mut().map(|b| b.local_mut()).collect();
        exchange(comm, &transfers, &srcs, &mut dsts)?;
        Ok(out)
    }

    /// `(I, J)` entries of the contribution block over this front's grid,
    /// zero where an index is not an update variable (collective).
    pub fn get_submatrix_2d(&self, rows: &[usize], cols: &[usize]) -> Result<DistributedMatrix, MfError> {
        let mut out = self.get_submatrix_2d_batch(&[rows.to_vec()], &[cols.to_vec()])?;
        out.pop()
            .ok_or_else(|| MfError::Comm("empty extraction batch".to_string()))
    }

    pub fn get_submatrix_2d_batch(
        &self,
        rows: &[Vec<usize>],
        cols: &[Vec<usize>],
    ) -> Result<Vec<DistributedMatrix>, MfError> {
        let comm = self.comm()?;
        let cb = self.cb.as_ref().ok_or(MfError::NotFactored)?;
        let upd = &self.header.upd;
        let mut out: Vec<DistributedMatrix> = rows
            .iter()
            .zip(cols)
            .map(|(i, j)| DistributedMatrix::new(self.layout(i.len(), j.len()), self.me()))
            .collect();
        let transfers: Vec<Transfer> = rows
            .iter()
            .zip(cols)
            .enumerate()
            .map(|(k, (i, j))| {
                let pi = position_map(i);
                let pj = position_map(j);
                Transfer {
                    src: *cb.layout(),
                    dst: *out[k].layout(),
                    rows: upd.iter().map(|v| pi.get(v).copied()).collect(),
                    cols: upd.iter().map(|v| pj.get(v).copied()).collect(),
                    src_slot: 0,
                    dst_slot: k,
                }
            })
            .collect();
        let mut dsts: Vec<Option<&mut Mat<f64>>> = out.iter_mut().map(|b| b.local_mut()).collect();
        exchange(comm, &transfers, &[cb.local()], &mut dsts)?;
        Ok(out)
    }

    /// Factor nonzeros counted on this rank: this front on the grid root,
    /// plus the children this rank visits.
    pub fn factor_nonzeros(&self) -> u64 {
        let own = if self.is_grid_root() {
            self.factors.as_ref().map_or(0, |f| f.nonzeros() as u64)
        } else {
            0
        };
        own + self
            .sides()
            .filter(|(s, _)| self.visit(*s))
            .map(|(_, c)| c.factor_nonzeros())
            .sum::<u64>()
    }
}
