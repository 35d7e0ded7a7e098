//! 2D block-cyclic matrices and the redistribution primitive between them.
//!
//! A [`Layout`] describes how a `rows × cols` matrix is spread over an
//! `nprow × npcol` process grid in blocks of `nb × nb`, the way ScaLAPACK
//! does it. The grid's ranks are `offset + p + q * nprow` of whichever
//! communicator the data is moved on, so layouts of a parent front and of
//! its children can live side by side in the parent's communicator.
//!
//! [`exchange`] moves and adds entries between any number of such layouts in
//! a single personalized all-to-all. It is the engine behind extend-add,
//! right-hand-side gathering and submatrix extraction.

use faer::Mat;
use log::trace;

use crate::error::MfError;
use crate::parallel::{Comm, GridShape};

/// Number of rows (or columns) of an `n`-long dimension stored by process
/// `iproc` out of `nprocs` with block size `nb`.
pub fn numroc(n: usize, nb: usize, iproc: usize, nprocs: usize) -> usize {
    let nblocks = n / nb;
    let mut num = (nblocks / nprocs) * nb;
    let extra = nblocks % nprocs;
    if iproc < extra {
        num += nb;
    } else if iproc == extra {
        num += n % nb;
    }
    num
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub rows: usize,
    pub cols: usize,
    pub nb: usize,
    pub nprow: usize,
    pub npcol: usize,
    /// Rank of grid process `(0, 0)`.
    pub offset: usize,
}

impl Layout {
    pub fn block_cyclic(rows: usize, cols: usize, nb: usize, shape: GridShape, offset: usize) -> Self {
        Layout {
            rows,
            cols,
            nb: nb.max(1),
            nprow: shape.rows.max(1),
            npcol: shape.cols.max(1),
            offset,
        }
    }

    /// Whole matrix on one rank.
    pub fn single(rows: usize, cols: usize, rank: usize) -> Self {
        Layout {
            rows,
            cols,
            nb: rows.max(cols).max(1),
            nprow: 1,
            npcol: 1,
            offset: rank,
        }
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn nprocs(&self) -> usize {
        self.nprow * self.npcol
    }

    pub fn row_owner(&self, i: usize) -> usize {
        (i / self.nb) % self.nprow
    }

    pub fn col_owner(&self, j: usize) -> usize {
        (j / self.nb) % self.npcol
    }

    /// Rank holding global entry `(i, j)`.
    pub fn owner(&self, i: usize, j: usize) -> usize {
        self.offset + self.row_owner(i) + self.col_owner(j) * self.nprow
    }

    /// Grid coordinates of `rank`, if it is part of this layout.
    pub fn coords(&self, rank: usize) -> Option<(usize, usize)> {
        if rank < self.offset || rank >= self.offset + self.nprocs() {
            return None;
        }
        let r = rank - self.offset;
        Some((r % self.nprow, r / self.nprow))
    }

    pub fn local_shape(&self, (p, q): (usize, usize)) -> (usize, usize) {
        (
            numroc(self.rows, self.nb, p, self.nprow),
            numroc(self.cols, self.nb, q, self.npcol),
        )
    }

    pub fn local_row(&self, i: usize) -> usize {
        (i / self.nb) / self.nprow * self.nb + i % self.nb
    }

    pub fn local_col(&self, j: usize) -> usize {
        (j / self.nb) / self.npcol * self.nb + j % self.nb
    }

    pub fn global_row(&self, li: usize, p: usize) -> usize {
        ((li / self.nb) * self.nprow + p) * self.nb + li % self.nb
    }

    pub fn global_col(&self, lj: usize, q: usize) -> usize {
        ((lj / self.nb) * self.npcol + q) * self.nb + lj % self.nb
    }
}

/// A block-cyclically distributed matrix, as seen from one rank.
#[derive(Debug, Clone)]
pub struct DistributedMatrix {
    layout: Layout,
    coords: Option<(usize, usize)>,
    local: Mat<f64>,
}

impl DistributedMatrix {
    /// Zero matrix; `rank` is this process' rank in the communicator the
    /// layout refers to (`None` outside of it).
    pub fn new(layout: Layout, rank: Option<usize>) -> Self {
        let coords = rank.and_then(|r| layout.coords(r));
        let (lr, lc) = coords.map_or((0, 0), |c| layout.local_shape(c));
        DistributedMatrix {
            layout,
            coords,
            local: Mat::zeros(lr, lc),
        }
    }

    /// Fill the local block from a function of the global indices.
    pub fn from_fn(layout: Layout, rank: Option<usize>, f: impl Fn(usize, usize) -> f64) -> Self {
        let mut m = Self::new(layout, rank);
        if let Some((p, q)) = m.coords {
            for lj in 0..m.local.ncols() {
                let j = layout.global_col(lj, q);
                for li in 0..m.local.nrows() {
                    m.local[(li, lj)] = f(layout.global_row(li, p), j);
                }
            }
        }
        m
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn rows(&self) -> usize {
        self.layout.rows
    }

    pub fn cols(&self) -> usize {
        self.layout.cols
    }

    pub fn coords(&self) -> Option<(usize, usize)> {
        self.coords
    }

    pub fn is_local(&self) -> bool {
        self.coords.is_some()
    }

    /// The local block, or `None` on ranks outside the grid.
    pub fn local(&self) -> Option<&Mat<f64>> {
        self.coords.map(|_| &self.local)
    }

    pub fn local_mut(&mut self) -> Option<&mut Mat<f64>> {
        match self.coords {
            Some(_) => Some(&mut self.local),
            None => None,
        }
    }

    /// Global row indices of the local rows.
    pub fn local_rows(&self) -> Vec<usize> {
        match self.coords {
            Some((p, _)) => (0..self.local.nrows())
                .map(|li| self.layout.global_row(li, p))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Global column indices of the local columns.
    pub fn local_cols(&self) -> Vec<usize> {
        match self.coords {
            Some((_, q)) => (0..self.local.ncols())
                .map(|lj| self.layout.global_col(lj, q))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Entry `(i, j)` if it is stored here.
    pub fn get(&self, i: usize, j: usize) -> Option<f64> {
        let (p, q) = self.coords?;
        if self.layout.row_owner(i) != p || self.layout.col_owner(j) != q {
            return None;
        }
        Some(self.local[(self.layout.local_row(i), self.layout.local_col(j))])
    }

    /// Add a locally held block with matching local shape.
    pub fn add_local(&mut self, block: &Mat<f64>) {
        assert_eq!(block.nrows(), self.local.nrows());
        assert_eq!(block.ncols(), self.local.ncols());
        for j in 0..block.ncols() {
            for i in 0..block.nrows() {
                self.local[(i, j)] += block[(i, j)];
            }
        }
    }

    /// Same matrix on another layout of the same communicator (collective).
    pub fn redistribute<C: Comm>(&self, comm: &C, layout: Layout) -> Result<DistributedMatrix, MfError> {
        if layout.rows != self.rows() || layout.cols != self.cols() {
            return Err(MfError::DimensionMismatch {
                expected: self.rows() * self.cols(),
                found: layout.rows * layout.cols,
            });
        }
        let mut out = DistributedMatrix::new(layout, Some(comm.rank()));
        let t = Transfer::identity(self.layout, layout);
        exchange(comm, &[t], &[self.local()], &mut [out.local_mut()])?;
        Ok(out)
    }

    /// Consume into the local block (the whole matrix for a single layout).
    pub fn into_local(self) -> Option<Mat<f64>> {
        self.coords.map(|_| self.local)
    }
}

/// One source-to-destination mapping inside an [`exchange`].
///
/// Entry `(i, j)` of the source goes to `(rows[i], cols[j])` of the
/// destination; a `None` on either side drops it.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub src: Layout,
    pub dst: Layout,
    pub rows: Vec<Option<usize>>,
    pub cols: Vec<Option<usize>>,
    pub src_slot: usize,
    pub dst_slot: usize,
}

impl Transfer {
    /// Same global position on both sides; slot 0 to slot 0.
    pub fn identity(src: Layout, dst: Layout) -> Self {
        Transfer {
            src,
            dst,
            rows: (0..src.rows).map(Some).collect(),
            cols: (0..src.cols).map(Some).collect(),
            src_slot: 0,
            dst_slot: 0,
        }
    }

    pub fn with_slots(mut self, src_slot: usize, dst_slot: usize) -> Self {
        self.src_slot = src_slot;
        self.dst_slot = dst_slot;
        self
    }

    fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.cols.is_empty()
    }
}

fn slot_error(what: &str, slot: usize, rank: usize) -> MfError {
    MfError::Comm(format!("rank {}: missing local {} block in slot {}", rank, what, slot))
}

/// Move entries between distributed blocks and add them into the
/// destinations, in one `all_to_all_v` over `comm` (collective).
///
/// `src[t.src_slot]` must hold this rank's local block of `t.src` whenever
/// this rank is part of `t.src`, likewise for destinations. Within each
/// source rank, values travel column-major over its local block and
/// transfers in the order given; the receiving side replays that order, so
/// contributions to one destination entry are added in source rank order.
pub fn exchange<C: Comm>(
    comm: &C,
    transfers: &[Transfer],
    src: &[Option<&Mat<f64>>],
    dst: &mut [Option<&mut Mat<f64>>],
) -> Result<(), MfError> {
    let me = comm.rank();
    let p = comm.size();
    for t in transfers {
        if t.rows.len() != t.src.rows || t.cols.len() != t.src.cols {
            return Err(MfError::DimensionMismatch {
                expected: t.src.rows * t.src.cols,
                found: t.rows.len() * t.cols.len(),
            });
        }
        if t.src.offset + t.src.nprocs() > p || t.dst.offset + t.dst.nprocs() > p {
            return Err(MfError::Comm(format!(
                "layout exceeds communicator of {} ranks",
                p
            )));
        }
    }

    let mut sbuf: Vec<Vec<f64>> = vec![Vec::new(); p];
    for t in transfers.iter().filter(|t| !t.is_empty()) {
        let Some((sp, sq)) = t.src.coords(me) else {
            continue;
        };
        let block = src
            .get(t.src_slot)
            .and_then(|b| *b)
            .ok_or_else(|| slot_error("source", t.src_slot, me))?;
        let (lr, lc) = t.src.local_shape((sp, sq));
        if block.nrows() != lr || block.ncols() != lc {
            return Err(MfError::DimensionMismatch {
                expected: lr * lc,
                found: block.nrows() * block.ncols(),
            });
        }
        let rows: Vec<Option<usize>> = (0..lr).map(|li| t.rows[t.src.global_row(li, sp)]).collect();
        for lj in 0..lc {
            let Some(dj) = t.cols[t.src.global_col(lj, sq)] else {
                continue;
            };
            for (li, di) in rows.iter().enumerate() {
                if let Some(di) = *di {
                    sbuf[t.dst.owner(di, dj)].push(block[(li, lj)]);
                }
            }
        }
    }
    if log::log_enabled!(log::Level::Trace) {
        let sizes: Vec<usize> = sbuf.iter().map(|b| b.len() * std::mem::size_of::<f64>()).collect();
        trace!("exchange on rank {}: sending bytes {:?}", me, sizes);
    }

    let rbuf = comm.all_to_all_v(sbuf)?;

    for (s, buf) in rbuf.iter().enumerate() {
        let mut pos = 0;
        for t in transfers.iter().filter(|t| !t.is_empty()) {
            let Some((dp, dq)) = t.dst.coords(me) else {
                continue;
            };
            let Some((sp, sq)) = t.src.coords(s) else {
                continue;
            };
            let (lr, lc) = t.src.local_shape((sp, sq));
            // source-local rows/cols whose destination falls on this rank
            let rows: Vec<usize> = (0..lr)
                .filter_map(|li| t.rows[t.src.global_row(li, sp)])
                .filter(|di| t.dst.row_owner(*di) == dp)
                .map(|di| t.dst.local_row(di))
                .collect();
            if rows.is_empty() {
                continue;
            }
            let cols: Vec<usize> = (0..lc)
                .filter_map(|lj| t.cols[t.src.global_col(lj, sq)])
                .filter(|dj| t.dst.col_owner(*dj) == dq)
                .map(|dj| t.dst.local_col(dj))
                .collect();
            if cols.is_empty() {
                continue;
            }
            let count = rows.len() * cols.len();
            if pos + count > buf.len() {
                return Err(MfError::Comm(format!(
                    "rank {}: short buffer from rank {} ({} values, expected at least {})",
                    me,
                    s,
                    buf.len(),
                    pos + count
                )));
            }
            let block = dst
                .get_mut(t.dst_slot)
                .and_then(|b| b.as_deref_mut())
                .ok_or_else(|| slot_error("destination", t.dst_slot, me))?;
            for &lj in &cols {
                for &li in &rows {
                    block[(li, lj)] += buf[pos];
                    pos += 1;
                }
            }
        }
        if pos != buf.len() {
            return Err(MfError::Comm(format!(
                "rank {}: received {} values from rank {}, expected {}",
                me,
                buf.len(),
                s,
                pos
            )));
        }
    }
    Ok(())
}
