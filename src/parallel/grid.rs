//! 2D process grids of distributed fronts.
//!
//! A distributed front owns a `ProcessGrid`: the subtree communicator
//! (`ctxt_all`, a `1 × total_procs` row context used only to move data
//! between differently shaped grids) and the communicator of the
//! `rows × cols` active ranks (`ctxt`) on which the front's dense algebra
//! runs. Ranks beyond `rows * cols` stay in `ctxt_all` but idle in `ctxt`.

use log::trace;

use super::Comm;
use crate::error::MfError;

/// Shape of a 2D process grid. Ranks are numbered column-major: rank `r`
/// sits at `(r % rows, r / rows)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridShape {
    pub rows: usize,
    pub cols: usize,
}

impl GridShape {
    /// Near-square grid: `cols = floor(sqrt(p))`, `rows = p / cols`.
    pub fn for_procs(total_procs: usize) -> Self {
        let p = total_procs.max(1);
        let mut cols = (p as f64).sqrt().floor() as usize;
        // guard the float estimate at perfect squares
        while (cols + 1) * (cols + 1) <= p {
            cols += 1;
        }
        while cols * cols > p {
            cols -= 1;
        }
        let cols = cols.max(1);
        GridShape { rows: p / cols, cols }
    }

    pub fn procs(&self) -> usize {
        self.rows * self.cols
    }

    pub fn coords(&self, rank: usize) -> (usize, usize) {
        (rank % self.rows, rank / self.rows)
    }
}

pub struct ProcessGrid<C: Comm> {
    shape: GridShape,
    total_procs: usize,
    /// Active ranks only; `None` on inactive ranks and outside the subtree.
    ctxt: Option<C>,
    /// Every rank of the subtree; `None` outside the subtree.
    ctxt_all: Option<C>,
}

impl<C: Comm> ProcessGrid<C> {
    /// Collective over `front_comm`: every rank of the subtree communicator
    /// must call this, including ranks that end up inactive. Ranks outside
    /// the subtree pass `None` and take part in no collective.
    pub fn new(front_comm: Option<C>, total_procs: usize) -> Result<Self, MfError> {
        let shape = GridShape::for_procs(total_procs);
        let Some(all) = front_comm else {
            return Ok(ProcessGrid {
                shape,
                total_procs,
                ctxt: None,
                ctxt_all: None,
            });
        };
        if all.size() != total_procs {
            return Err(MfError::ProcessCount {
                expected: all.size(),
                found: total_procs,
            });
        }
        let ctxt = all.sub_comm(0, shape.procs())?;
        Ok(ProcessGrid {
            shape,
            total_procs,
            ctxt,
            ctxt_all: Some(all),
        })
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    pub fn np_rows(&self) -> usize {
        self.shape.rows
    }

    pub fn np_cols(&self) -> usize {
        self.shape.cols
    }

    pub fn total_procs(&self) -> usize {
        self.total_procs
    }

    pub fn active_procs(&self) -> usize {
        self.shape.procs()
    }

    /// This rank belongs to the subtree.
    pub fn is_valid(&self) -> bool {
        self.ctxt_all.is_some()
    }

    /// This rank is part of the 2D grid.
    pub fn is_active(&self) -> bool {
        self.ctxt.is_some()
    }

    pub fn is_active_rank(&self, rank: usize) -> bool {
        rank < self.active_procs()
    }

    /// Rank in the subtree communicator.
    pub fn rank_all(&self) -> Option<usize> {
        self.ctxt_all.as_ref().map(|c| c.rank())
    }

    /// Rank in the active grid.
    pub fn rank_active(&self) -> Option<usize> {
        self.ctxt.as_ref().map(|c| c.rank())
    }

    pub fn ctxt(&self) -> Option<&C> {
        self.ctxt.as_ref()
    }

    pub fn ctxt_all(&self) -> Option<&C> {
        self.ctxt_all.as_ref()
    }
}

impl<C: Comm> Drop for ProcessGrid<C> {
    fn drop(&mut self) {
        if let Some(all) = &self.ctxt_all {
            trace!(
                "releasing {}x{} grid contexts (rank {} of {})",
                self.shape.rows,
                self.shape.cols,
                all.rank(),
                self.total_procs
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::ThreadComm;

    #[test]
    fn grid_sizes_up_to_4096() {
        for p in 1..=4096usize {
            let g = GridShape::for_procs(p);
            assert!(g.rows * g.cols <= p);
            assert_eq!(g.cols, (p as f64).sqrt().floor() as usize);
            assert!(g.rows >= g.cols);
        }
    }

    #[test]
    fn five_ranks_idle_one() {
        let out = ThreadComm::run(5, |comm| {
            let grid = ProcessGrid::new(Some(comm), 5).unwrap();
            (grid.np_rows(), grid.np_cols(), grid.is_active(), grid.rank_active())
        });
        for (r, (rows, cols, active, ra)) in out.into_iter().enumerate() {
            assert_eq!((rows, cols), (2, 2));
            assert_eq!(active, r < 4);
            assert_eq!(ra, if r < 4 { Some(r) } else { None });
        }
    }

    #[test]
    fn null_communicator_gives_invalid_contexts() {
        let grid = ProcessGrid::<ThreadComm>::new(None, 4).unwrap();
        assert!(!grid.is_valid());
        assert!(!grid.is_active());
        assert!(grid.is_active_rank(3));
        assert!(!grid.is_active_rank(4));
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let comms = ThreadComm::universe(1);
        let err = ProcessGrid::new(comms.into_iter().next(), 3);
        assert!(matches!(err, Err(MfError::ProcessCount { .. })));
    }
}
