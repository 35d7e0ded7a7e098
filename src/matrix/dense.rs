//! Dense kernels of a frontal matrix on top of Faer.
//!
//! `DenseLu` wraps Faer's partial-pivoting LU and turns a vanishing pivot into
//! an error instead of letting infinities reach the triangular solves.
//! `FrontFactors` applies it to the separator block of a front and keeps what
//! the forward and backward steps need.

use faer::linalg::solvers::{PartialPivLu, SolveCore};
use faer::{Conj, Mat};

use crate::error::MfError;

/// LU factorization `P A = L U` of a square block.
pub struct DenseLu {
    factor: PartialPivLu<f64>,
    dim: usize,
}

impl DenseLu {
    /// Factor a square matrix; fails with `ZeroPivot(k)` when `U(k, k)` is the
    /// first zero or non-finite pivot.
    pub fn factor(a: Mat<f64>) -> Result<Self, MfError> {
        let n = a.nrows();
        if a.ncols() != n {
            return Err(MfError::DimensionMismatch {
                expected: n,
                found: a.ncols(),
            });
        }
        let factor = PartialPivLu::new(a.as_ref());
        let u = factor.U();
        if let Some(k) = (0..n).find(|&k| {
            let p = u[(k, k)];
            p == 0.0 || !p.is_finite()
        }) {
            return Err(MfError::ZeroPivot(k));
        }
        Ok(DenseLu { factor, dim: n })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Solve `A X = B` for every column of `B`.
    pub fn solve(&self, b: &Mat<f64>) -> Mat<f64> {
        assert_eq!(b.nrows(), self.dim);
        let mut x = b.clone();
        if self.dim > 0 && x.ncols() > 0 {
            self.factor.solve_in_place_with_conj(Conj::No, x.as_mut());
        }
        x
    }
}

/// Factors of one front after partial elimination of its separator.
///
/// With the front split as `[F11 F12; F21 F22]` (separator rows first),
/// keeps `LU(F11)`, `U12 = F11⁻¹ F12` and `F21`.
pub struct FrontFactors {
    lu: DenseLu,
    u12: Mat<f64>,
    f21: Mat<f64>,
}

impl FrontFactors {
    /// Eliminate the leading `dim_sep` rows and columns of `front`.
    /// Returns the factors and the Schur complement `F22 - F21 F11⁻¹ F12`.
    pub fn eliminate(front: &Mat<f64>, dim_sep: usize) -> Result<(Self, Mat<f64>), MfError> {
        let d = front.nrows();
        if front.ncols() != d || dim_sep > d {
            return Err(MfError::DimensionMismatch {
                expected: d,
                found: front.ncols(),
            });
        }
        let du = d - dim_sep;
        let f11 = Mat::from_fn(dim_sep, dim_sep, |i, j| front[(i, j)]);
        let f12 = Mat::from_fn(dim_sep, du, |i, j| front[(i, dim_sep + j)]);
        let f21 = Mat::from_fn(du, dim_sep, |i, j| front[(dim_sep + i, j)]);
        let f22 = Mat::from_fn(du, du, |i, j| front[(dim_sep + i, dim_sep + j)]);
        let lu = DenseLu::factor(f11)?;
        let u12 = lu.solve(&f12);
        let update = &f21 * &u12;
        let schur = &f22 - &update;
        Ok((FrontFactors { lu, u12, f21 }, schur))
    }

    pub fn dim_sep(&self) -> usize {
        self.lu.dim()
    }

    pub fn dim_upd(&self) -> usize {
        self.f21.nrows()
    }

    /// Forward step on a stacked right-hand side `[b_s; b_u]`:
    /// returns `w = F11⁻¹ b_s` and `b_u - F21 w`.
    pub fn forward(&self, bf: &Mat<f64>) -> (Mat<f64>, Mat<f64>) {
        let ds = self.dim_sep();
        let du = self.dim_upd();
        assert_eq!(bf.nrows(), ds + du);
        let nrhs = bf.ncols();
        let bs = Mat::from_fn(ds, nrhs, |i, j| bf[(i, j)]);
        let bu = Mat::from_fn(du, nrhs, |i, j| bf[(ds + i, j)]);
        let w = self.lu.solve(&bs);
        let fw = &self.f21 * &w;
        let bupd = &bu - &fw;
        (w, bupd)
    }

    /// Backward step: `x_s = w - U12 x_u`.
    pub fn backward(&self, w: &Mat<f64>, xupd: &Mat<f64>) -> Mat<f64> {
        assert_eq!(w.nrows(), self.dim_sep());
        assert_eq!(xupd.nrows(), self.dim_upd());
        let ux = &self.u12 * xupd;
        w - &ux
    }

    /// Stored entries of the front factors: `F11` plus both off-diagonal blocks.
    pub fn nonzeros(&self) -> usize {
        front_nonzeros(self.dim_sep(), self.dim_upd())
    }
}

pub fn front_nonzeros(dim_sep: usize, dim_upd: usize) -> usize {
    dim_sep * (dim_sep + 2 * dim_upd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample(n: usize) -> Mat<f64> {
        Mat::from_fn(n, n, |i, j| {
            if i == j {
                4.0 + i as f64
            } else {
                1.0 / (1.0 + i as f64 + 2.0 * j as f64)
            }
        })
    }

    #[test]
    fn lu_solves_with_pivoting() {
        // zero leading entry forces a row swap
        let mut a = sample(4);
        a[(0, 0)] = 0.0;
        let b = Mat::from_fn(4, 2, |i, j| (i + 3 * j) as f64);
        let lu = DenseLu::factor(a.clone()).unwrap();
        let x = lu.solve(&b);
        let r = &a * &x;
        for i in 0..4 {
            for j in 0..2 {
                assert_abs_diff_eq!(r[(i, j)], b[(i, j)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn pivots_past_tiny_leading_entries() {
        // a 40 x 40 diagonally dominant block with a near-zero corner; an
        // unpivoted elimination would lose every digit here
        let n = 40;
        let mut a = Mat::from_fn(n, n, |i, j| {
            if i == j {
                8.0 + (i % 7) as f64
            } else {
                ((i * 31 + j * 17) % 11) as f64 / 10.0 - 0.5
            }
        });
        a[(0, 0)] = 1e-14;
        let b = Mat::from_fn(n, 3, |i, j| 1.0 + ((i + 5 * j) % 9) as f64);
        let lu = DenseLu::factor(a.clone()).unwrap();
        assert_eq!(lu.dim(), n);
        let x = lu.solve(&b);
        let r = &a * &x - &b;
        for j in 0..3 {
            for i in 0..n {
                assert!(x[(i, j)].is_finite());
                assert_abs_diff_eq!(r[(i, j)], 0.0, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn non_square_block_is_rejected() {
        let a = Mat::<f64>::zeros(3, 2);
        assert!(matches!(DenseLu::factor(a), Err(MfError::DimensionMismatch { .. })));
    }

    #[test]
    fn singular_block_reports_pivot() {
        let a = Mat::from_fn(3, 3, |i, j| if j == 2 { 0.0 } else { (i + j + 1) as f64 });
        match DenseLu::factor(a) {
            Err(MfError::ZeroPivot(k)) => assert_eq!(k, 2),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn partial_elimination_matches_full_solve() {
        let n = 6;
        let ds = 4;
        let a = sample(n);
        let b = Mat::from_fn(n, 1, |i, _| 1.0 + i as f64);
        let (f, schur) = FrontFactors::eliminate(&a, ds).unwrap();
        assert_eq!(f.nonzeros(), 4 * (4 + 4));
        let (w, bupd) = f.forward(&b);
        let xu = DenseLu::factor(schur).unwrap().solve(&bupd);
        let xs = f.backward(&w, &xu);
        let full = DenseLu::factor(a).unwrap().solve(&b);
        for i in 0..ds {
            assert_abs_diff_eq!(xs[(i, 0)], full[(i, 0)], epsilon = 1e-12);
        }
        for i in 0..n - ds {
            assert_abs_diff_eq!(xu[(i, 0)], full[(ds + i, 0)], epsilon = 1e-12);
        }
    }

    #[test]
    fn empty_update_block() {
        let a = sample(3);
        let (f, schur) = FrontFactors::eliminate(&a, 3).unwrap();
        assert_eq!((schur.nrows(), schur.ncols()), (0, 0));
        assert_eq!(f.dim_upd(), 0);
    }
}
