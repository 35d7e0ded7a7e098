//! Fronts of a sequential subtree, owned by a single rank.

use faer::Mat;

use crate::config::FactorOptions;
use crate::error::MfError;
use crate::matrix::{CsrMatrix, FrontFactors};

use super::{Contribution, FrontHeader, FrontState, Side, extend_add_local, extend_add_rows};

pub struct SeqFront {
    pub header: FrontHeader,
    left: Option<Box<SeqFront>>,
    right: Option<Box<SeqFront>>,
    factors: Option<FrontFactors>,
    /// Contribution block, alive between factorization and assembly of the parent.
    cb: Option<Mat<f64>>,
    w: Option<Mat<f64>>,
    bupd: Option<Mat<f64>>,
    xupd: Option<Mat<f64>>,
}

/// Positions of `vars` in a sorted index set.
fn positions(set: &[usize], vars: &[usize]) -> Vec<Option<usize>> {
    vars.iter().map(|v| set.binary_search(v).ok()).collect()
}

impl SeqFront {
    pub fn new(header: FrontHeader, left: Option<Box<SeqFront>>, right: Option<Box<SeqFront>>) -> Self {
        SeqFront {
            header,
            left,
            right,
            factors: None,
            cb: None,
            w: None,
            bupd: None,
            xupd: None,
        }
    }

    pub fn left(&self) -> Option<&SeqFront> {
        self.left.as_deref()
    }

    pub fn right(&self) -> Option<&SeqFront> {
        self.right.as_deref()
    }

    fn children(&self) -> impl Iterator<Item = (Side, &SeqFront)> {
        self.left
            .as_deref()
            .map(|f| (Side::Left, f))
            .into_iter()
            .chain(self.right.as_deref().map(|f| (Side::Right, f)))
    }

    /// The contribution block, once factored and until the parent consumed it.
    pub fn cb(&self) -> Option<&Mat<f64>> {
        self.cb.as_ref()
    }

    pub(crate) fn take_bupd(&mut self) -> Option<Mat<f64>> {
        self.bupd.take()
    }

    pub(crate) fn bupd(&self) -> Option<&Mat<f64>> {
        self.bupd.as_ref()
    }

    pub(crate) fn set_xupd(&mut self, xupd: Mat<f64>) {
        self.xupd = Some(xupd);
    }

    pub(crate) fn release(&mut self) {
        self.cb = None;
        self.header.state = FrontState::Released;
    }

    /// Factor the subtree rooted here.
    pub fn factor(&mut self, a: &CsrMatrix<f64>, opts: &FactorOptions) -> Result<(), MfError> {
        self.header.state = FrontState::Unfactored;
        self.factors = None;
        self.cb = None;
        self.factor_children(a, opts)?;
        self.header.state = FrontState::Factoring;
        let front = self.assemble(a, opts)?;
        for child in [self.left.as_deref_mut(), self.right.as_deref_mut()].into_iter().flatten() {
            child.release();
        }
        let (factors, schur) =
            FrontFactors::eliminate(&front, self.header.dim_sep()).map_err(|e| self.header.singular(e))?;
        self.factors = Some(factors);
        self.cb = Some(schur);
        self.header.state = FrontState::Factored;
        Ok(())
    }

    /// Factor both subtrees below this front, concurrently when allowed.
    pub fn factor_children(&mut self, a: &CsrMatrix<f64>, opts: &FactorOptions) -> Result<(), MfError> {
        match (self.left.as_deref_mut(), self.right.as_deref_mut()) {
            (Some(l), Some(r)) if opts.parallel_subtrees => factor_pair(l, r, a, opts),
            (l, r) => {
                for child in [l, r].into_iter().flatten() {
                    child.factor(a, opts)?;
                }
                Ok(())
            }
        }
    }

    /// Frontal matrix of this front from `A` and the children's contribution
    /// blocks. Compressed kinds sample it panel by panel.
    pub fn assemble(&self, a: &CsrMatrix<f64>, opts: &FactorOptions) -> Result<Mat<f64>, MfError> {
        let vars = self.header.front_vars();
        if !self.header.kind.assembles_by_extraction() {
            let mut front = a.extract_separator(self.header.sep_end, &vars, &vars);
            self.extend_add(&mut front)?;
            return Ok(front);
        }
        let d = vars.len();
        let mut front = Mat::<f64>::zeros(d, d);
        let mut c0 = 0;
        for panel in vars.chunks(opts.leaf_size.max(1)) {
            let b = self.extract(a, &vars, panel)?;
            for j in 0..panel.len() {
                for i in 0..d {
                    front[(i, c0 + j)] = b[(i, j)];
                }
            }
            c0 += panel.len();
        }
        Ok(front)
    }

    /// Add the children's contribution blocks into `front`.
    pub fn extend_add(&self, front: &mut Mat<f64>) -> Result<(), MfError> {
        let mut contribs = Vec::with_capacity(2);
        for (side, child) in self.children() {
            let block = child.cb.as_ref().ok_or(MfError::NotFactored)?;
            contribs.push(Contribution {
                side,
                upd: &child.header.upd,
                block,
            });
        }
        extend_add_local(&self.header, front, &mut contribs);
        Ok(())
    }

    /// Entries `(I[i], J[j])` of this front's frontal matrix: the sparse part
    /// plus the children's contribution blocks.
    pub fn extract(&self, a: &CsrMatrix<f64>, rows: &[usize], cols: &[usize]) -> Result<Mat<f64>, MfError> {
        let mut b = a.extract_separator(self.header.sep_end, rows, cols);
        for (_, child) in self.children() {
            let s = child.get_submatrix(rows, cols)?;
            for j in 0..cols.len() {
                for i in 0..rows.len() {
                    b[(i, j)] += s[(i, j)];
                }
            }
        }
        Ok(b)
    }

    /// Entries `(I[i], J[j])` of the contribution block, zero where an index
    /// is not an update variable.
    pub fn get_submatrix(&self, rows: &[usize], cols: &[usize]) -> Result<Mat<f64>, MfError> {
        let cb = self.cb.as_ref().ok_or(MfError::NotFactored)?;
        let pr = positions(&self.header.upd, rows);
        let pc = positions(&self.header.upd, cols);
        let mut b = Mat::<f64>::zeros(rows.len(), cols.len());
        for (j, cj) in pc.iter().enumerate() {
            let Some(cj) = *cj else { continue };
            for (i, ci) in pr.iter().enumerate() {
                if let Some(ci) = *ci {
                    b[(i, j)] = cb[(ci, cj)];
                }
            }
        }
        Ok(b)
    }

    /// Forward elimination on the replicated global right-hand side `b`;
    /// leaves `w` and the update part for the parent.
    pub fn forward(&mut self, b: &Mat<f64>) -> Result<(), MfError> {
        self.header.is_solvable()?;
        for child in [self.left.as_deref_mut(), self.right.as_deref_mut()].into_iter().flatten() {
            child.forward(b)?;
        }
        let ds = self.header.dim_sep();
        let nrhs = b.ncols();
        let mut bf = Mat::<f64>::zeros(self.header.dim(), nrhs);
        for j in 0..nrhs {
            for i in 0..ds {
                bf[(i, j)] = b[(self.header.sep_begin + i, j)];
            }
        }
        let lb = self.left.as_deref_mut().and_then(|c| c.take_bupd());
        let rb = self.right.as_deref_mut().and_then(|c| c.take_bupd());
        let mut contribs = Vec::with_capacity(2);
        if let (Some(block), Some(l)) = (lb.as_ref(), self.left.as_deref()) {
            contribs.push(Contribution { side: Side::Left, upd: &l.header.upd, block });
        }
        if let (Some(block), Some(r)) = (rb.as_ref(), self.right.as_deref()) {
            contribs.push(Contribution { side: Side::Right, upd: &r.header.upd, block });
        }
        extend_add_rows(&self.header, &mut bf, &mut contribs);
        let factors = self.factors.as_ref().ok_or(MfError::NotFactored)?;
        let (w, bupd) = factors.forward(&bf);
        self.w = Some(w);
        self.bupd = Some(bupd);
        Ok(())
    }

    /// Backward substitution; writes this subtree's separator rows of `x`.
    pub fn backward(&mut self, x: &mut Mat<f64>) -> Result<(), MfError> {
        self.header.is_solvable()?;
        let nrhs = x.ncols();
        let factors = self.factors.as_ref().ok_or(MfError::NotFactored)?;
        let w = self
            .w
            .take()
            .ok_or(MfError::Unsupported("backward solve before forward solve"))?;
        let xupd = match self.xupd.take() {
            Some(xu) => xu,
            None if self.header.dim_upd() == 0 => Mat::zeros(0, nrhs),
            None => return Err(MfError::Unsupported("backward solve before forward solve")),
        };
        let xs = factors.backward(&w, &xupd);
        let ds = self.header.dim_sep();
        for j in 0..nrhs {
            for i in 0..ds {
                x[(self.header.sep_begin + i, j)] = xs[(i, j)];
            }
        }
        let header = &self.header;
        let front_row = |k: usize, j: usize| if k < ds { xs[(k, j)] } else { xupd[(k - ds, j)] };
        for child in [self.left.as_deref_mut(), self.right.as_deref_mut()].into_iter().flatten() {
            let map = header.child_map(&child.header.upd);
            let xu = Mat::from_fn(map.len(), nrhs, |i, j| map[i].map_or(0.0, |k| front_row(k, j)));
            child.set_xupd(xu);
        }
        for child in [self.left.as_deref_mut(), self.right.as_deref_mut()].into_iter().flatten() {
            child.backward(x)?;
        }
        Ok(())
    }

    /// Factor nonzeros of the factored fronts of this subtree.
    pub fn factor_nonzeros(&self) -> u64 {
        let own = self.factors.as_ref().map_or(0, |f| f.nonzeros() as u64);
        own + self.children().map(|(_, c)| c.factor_nonzeros()).sum::<u64>()
    }
}

#[cfg(feature = "rayon")]
fn factor_pair(l: &mut SeqFront, r: &mut SeqFront, a: &CsrMatrix<f64>, opts: &FactorOptions) -> Result<(), MfError> {
    let (rl, rr) = rayon::join(|| l.factor(a, opts), || r.factor(a, opts));
    rl?;
    rr
}

#[cfg(not(feature = "rayon"))]
fn factor_pair(l: &mut SeqFront, r: &mut SeqFront, a: &CsrMatrix<f64>, opts: &FactorOptions) -> Result<(), MfError> {
    l.factor(a, opts)?;
    r.factor(a, opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::FrontKind;
    use approx::assert_abs_diff_eq;

    // 1D Laplacian 0..5 ordered [0,1] [3,4] | 2 -> new order 0,1,3,4,2
    fn setup(kind: FrontKind) -> (CsrMatrix<f64>, SeqFront) {
        let n = 5;
        let mut t = Vec::new();
        for i in 0..n {
            t.push((i, i, 2.0 + i as f64 * 0.1));
            if i + 1 < n {
                t.push((i, i + 1, -1.0));
                t.push((i + 1, i, -0.5));
            }
        }
        let a = CsrMatrix::from_triplets(n, n, &t).unwrap().permute_symmetric(&[0, 1, 3, 4, 2]);
        let leaf = |b, e| Box::new(SeqFront::new(FrontHeader::new(b, e, vec![4], kind), None, None));
        let root = SeqFront::new(FrontHeader::new(4, 5, vec![], kind), Some(leaf(0, 2)), Some(leaf(2, 4)));
        (a, root)
    }

    fn solve(kind: FrontKind, opts: &FactorOptions) -> Mat<f64> {
        let (a, mut root) = setup(kind);
        root.factor(&a, opts).unwrap();
        let b = Mat::from_fn(5, 1, |i, _| 1.0 + i as f64);
        let mut x = Mat::zeros(5, 1);
        root.forward(&b).unwrap();
        root.backward(&mut x).unwrap();
        let ax = &a.to_dense() * &x;
        for i in 0..5 {
            assert_abs_diff_eq!(ax[(i, 0)], b[(i, 0)], epsilon = 1e-12);
        }
        x
    }

    #[test]
    fn factor_and_solve_small_tree() {
        let x = solve(FrontKind::Dense, &FactorOptions::new());
        let y = solve(FrontKind::Dense, &FactorOptions::new().with_parallel_subtrees(false));
        assert_eq!(x, y);
    }

    #[test]
    fn sampled_assembly_matches_extend_add() {
        let opts = FactorOptions::new().with_leaf_size(2);
        let x = solve(FrontKind::Dense, &opts);
        let y = solve(FrontKind::Blr, &opts);
        assert_eq!(x, y);

        let (a, mut root) = setup(FrontKind::Dense);
        root.factor_children(&a, &opts).unwrap();
        let vars = root.header.front_vars();
        let f = root.assemble(&a, &opts).unwrap();
        let g = root.extract(&a, &vars, &vars).unwrap();
        assert_eq!(f, g);
    }

    #[test]
    fn states_and_release() {
        let (a, mut root) = setup(FrontKind::Dense);
        let mut x = Mat::zeros(5, 1);
        assert!(matches!(root.backward(&mut x), Err(MfError::NotFactored)));
        root.factor(&a, &FactorOptions::new()).unwrap();
        assert_eq!(root.header.state, FrontState::Factored);
        assert_eq!(root.left().unwrap().header.state, FrontState::Released);
        assert!(root.left().unwrap().cb().is_none());
        assert_eq!(root.factor_nonzeros(), 2 * (2 + 2) * 2 + 1);
        // refactoring starts over
        root.factor(&a, &FactorOptions::new()).unwrap();
        assert_eq!(root.header.state, FrontState::Factored);
    }

    #[test]
    fn submatrix_of_contribution_block() {
        let (a, mut root) = setup(FrontKind::Dense);
        root.factor_children(&a, &FactorOptions::new()).unwrap();
        let left = root.left().unwrap();
        let s = left.get_submatrix(&[4, 1], &[4]).unwrap();
        assert_eq!(s[(0, 0)], left.cb().unwrap()[(0, 0)]);
        assert_eq!(s[(1, 0)], 0.0);
    }

    #[test]
    fn submatrix_maps_rows_and_columns_separately() {
        // one separator variable coupled to three update variables
        let t = [
            (0, 0, 4.0),
            (0, 1, 1.0),
            (0, 2, -2.0),
            (0, 3, 0.5),
            (1, 0, 3.0),
            (2, 0, -1.0),
            (3, 0, 2.0),
            (1, 1, 9.0),
            (3, 3, 9.0),
        ];
        let a = CsrMatrix::from_triplets(4, 4, &t).unwrap();
        let mut f = SeqFront::new(FrontHeader::new(0, 1, vec![1, 2, 3], FrontKind::Dense), None, None);
        f.factor(&a, &FactorOptions::new()).unwrap();
        let cb = f.cb().unwrap();
        // the update block itself is assembled by the parent
        for (p, &i) in [1usize, 2, 3].iter().enumerate() {
            for (q, &j) in [1usize, 2, 3].iter().enumerate() {
                assert_abs_diff_eq!(cb[(p, q)], -a.get(i, 0) * a.get(0, j) / 4.0, epsilon = 1e-15);
            }
        }
        let s = f.get_submatrix(&[3, 0, 1], &[2, 1]).unwrap();
        assert_eq!((s.nrows(), s.ncols()), (3, 2));
        assert_eq!(s[(0, 0)], cb[(2, 1)]);
        assert_eq!(s[(0, 1)], cb[(2, 0)]);
        assert_eq!(s[(1, 0)], 0.0);
        assert_eq!(s[(1, 1)], 0.0);
        assert_eq!(s[(2, 0)], cb[(0, 1)]);
        assert_eq!(s[(2, 1)], cb[(0, 0)]);
    }

    #[test]
    fn singular_front_reports_its_separator() {
        let a = CsrMatrix::from_triplets(2, 2, &[(0, 0, 1.0), (0, 1, 1.0), (1, 0, 1.0), (1, 1, 1.0)]).unwrap();
        let mut f = SeqFront::new(FrontHeader::new(0, 2, vec![], FrontKind::Dense), None, None);
        match f.factor(&a, &FactorOptions::new()) {
            Err(MfError::Singular { begin: 0, end: 2, pivot: 1 }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
